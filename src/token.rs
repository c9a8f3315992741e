//! Resolution keys.
//!
//! A [`Token<T>`] is an identity: two tokens are equal only if one was cloned
//! from the other, regardless of their descriptions. Tokens may carry a
//! default factory and a [`HomeScope`], which lets an injector materialize a
//! value without any explicit provider ("limp mode").

use std::any::Any;
use std::cell::OnceCell;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::marker::PhantomData;
use std::rc::Rc;

use crate::context::InjectionContext;

pub(crate) type Value = Rc<dyn Any>;
pub(crate) type DefaultFactory = Rc<dyn Fn(&InjectionContext) -> anyhow::Result<Value>>;

/// Where a token's default factory value lives.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HomeScope {
    /// The distinguished root injector.
    Root,
    /// The platform injector above the root.
    Platform,
    /// Any environment injector.
    Environment,
    /// A custom scope contributed through [`injector_scope`](crate::injector_scope).
    Named(String),
}

impl HomeScope {
    /// The scope name matched against an injector's scope set.
    pub fn name(&self) -> &str {
        match self {
            HomeScope::Root => "root",
            HomeScope::Platform => "platform",
            HomeScope::Environment => "environment",
            HomeScope::Named(name) => name,
        }
    }
}

struct TokenInner {
    description: String,
    home: Option<HomeScope>,
    factory: Option<DefaultFactory>,
}

/// Type-erased token identity.
///
/// Equality and hashing use the address of the shared allocation.
#[derive(Clone)]
pub struct TokenId(Rc<TokenInner>);

impl TokenId {
    /// Human-readable description given at creation.
    pub fn description(&self) -> &str {
        &self.0.description
    }

    /// The scope hosting the default factory value, if any.
    pub fn home_scope(&self) -> Option<&HomeScope> {
        self.0.home.as_ref()
    }

    pub(crate) fn default_factory(&self) -> Option<&DefaultFactory> {
        self.0.factory.as_ref()
    }
}

impl PartialEq for TokenId {
    fn eq(&self, other: &Self) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for TokenId {}

impl Hash for TokenId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        (Rc::as_ptr(&self.0) as *const () as usize).hash(state);
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InjectionToken {}", self.0.description)
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TokenId({:?})", self.0.description)
    }
}

/// A typed resolution key.
///
/// # Example
///
/// ```ignore
/// let base_url: Token<String> = Token::new("BASE_URL");
/// let clock = Token::with_factory("CLOCK", |_ctx| Ok(SystemClock::default()));
///
/// let root = runtime.create_root_injector(vec![
///     Provider::value(&base_url, "https://example.test".to_string()),
/// ])?;
/// assert_eq!(*root.get(&base_url)?, "https://example.test");
/// let clock = root.get(&clock)?; // materialized in the root injector
/// ```
pub struct Token<T> {
    id: TokenId,
    _marker: PhantomData<fn() -> T>,
}

impl<T: 'static> Token<T> {
    /// Creates a token without a default factory.
    pub fn new(description: impl Into<String>) -> Self {
        Self::from_inner(TokenInner {
            description: description.into(),
            home: None,
            factory: None,
        })
    }

    /// Creates a root-scoped token whose value is produced by `factory` when
    /// no provider for it is found.
    pub fn with_factory<F>(description: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&InjectionContext) -> anyhow::Result<T> + 'static,
    {
        Self::with_scoped_factory(description, HomeScope::Root, factory)
    }

    /// Like [`Token::with_factory`], homing the value in `scope`.
    pub fn with_scoped_factory<F>(description: impl Into<String>, scope: HomeScope, factory: F) -> Self
    where
        F: Fn(&InjectionContext) -> anyhow::Result<T> + 'static,
    {
        let factory: DefaultFactory = Rc::new(move |ctx| Ok(Rc::new(factory(ctx)?) as Value));
        Self::from_inner(TokenInner {
            description: description.into(),
            home: Some(scope),
            factory: Some(factory),
        })
    }

    fn from_inner(inner: TokenInner) -> Self {
        Self {
            id: TokenId(Rc::new(inner)),
            _marker: PhantomData,
        }
    }
}

impl<T> Token<T> {
    /// The erased identity of this token.
    pub fn id(&self) -> &TokenId {
        &self.id
    }

    /// Human-readable description given at creation.
    pub fn description(&self) -> &str {
        self.id.description()
    }
}

impl<T> Clone for Token<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T> PartialEq for Token<T> {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl<T> Eq for Token<T> {}

impl<T> fmt::Display for Token<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.id, f)
    }
}

impl<T> fmt::Debug for Token<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("description", &self.id.description())
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}

/// A token that is not known yet when a provider list is declared.
///
/// The resolver runs on first use and its result is memoized.
pub struct ForwardRef<T> {
    resolved: Rc<OnceCell<Token<T>>>,
    resolver: Rc<dyn Fn() -> Token<T>>,
}

impl<T: 'static> ForwardRef<T> {
    /// Wraps a closure returning the eventual token.
    pub fn new(resolver: impl Fn() -> Token<T> + 'static) -> Self {
        Self {
            resolved: Rc::new(OnceCell::new()),
            resolver: Rc::new(resolver),
        }
    }

    /// Resolves (once) and returns the token.
    pub fn resolve(&self) -> Token<T> {
        self.resolved.get_or_init(|| (self.resolver)()).clone()
    }

    pub(crate) fn erase(&self) -> TokenRef {
        let this = self.clone();
        TokenRef::Forward(Rc::new(move || this.resolve().id))
    }
}

impl<T> Clone for ForwardRef<T> {
    fn clone(&self) -> Self {
        Self {
            resolved: self.resolved.clone(),
            resolver: self.resolver.clone(),
        }
    }
}

/// A token reference stored in provider records: either known or forwarded.
#[derive(Clone)]
pub(crate) enum TokenRef {
    Resolved(TokenId),
    Forward(Rc<dyn Fn() -> TokenId>),
}

impl TokenRef {
    pub(crate) fn resolve(&self) -> TokenId {
        match self {
            TokenRef::Resolved(id) => id.clone(),
            TokenRef::Forward(resolver) => resolver(),
        }
    }
}
