//! Provider declarations and the per-injector record table.
//!
//! User code declares [`Provider`]s (possibly nested in lists). An injector
//! flattens them once, at construction, into a [`RecordTable`] holding exactly
//! one canonical [`Record`] per token.

use std::any::{type_name, Any};
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::ops::BitOr;
use std::rc::Rc;

use crate::context::InjectionContext;
use crate::destroy::OnDestroy;
use crate::error::{InjectError, Result};
use crate::token::{ForwardRef, Token, TokenId, TokenRef, Value};

/// Resolution flags for `get` and for dependency declarations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct InjectFlags(u8);

impl InjectFlags {
    /// Walk self then ancestors; fail when nothing is found.
    pub const DEFAULT: InjectFlags = InjectFlags(0);
    /// Return `None` instead of failing when nothing is found.
    pub const OPTIONAL: InjectFlags = InjectFlags(1);
    /// Only consult the requesting injector.
    pub const SELF: InjectFlags = InjectFlags(1 << 1);
    /// Start resolution at the parent injector.
    pub const SKIP_SELF: InjectFlags = InjectFlags(1 << 2);

    /// Returns `true` if every flag in `other` is set.
    pub fn contains(self, other: InjectFlags) -> bool {
        self.0 & other.0 == other.0
    }

    /// Returns `true` if no flag is set.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl BitOr for InjectFlags {
    type Output = InjectFlags;

    fn bitor(self, rhs: InjectFlags) -> InjectFlags {
        InjectFlags(self.0 | rhs.0)
    }
}

/// One element of an array-style dependency declaration such as
/// `[Optional, SkipSelf, token]`.
#[derive(Clone)]
pub enum DepPart {
    /// A resolution flag.
    Flag(InjectFlags),
    /// The token to resolve.
    Token(TokenId),
}

/// A declared constructor or factory argument.
#[derive(Clone)]
pub struct Dep {
    token: Option<TokenRef>,
    flags: InjectFlags,
}

impl Dep {
    /// A bare token dependency.
    pub fn new<T>(token: &Token<T>) -> Self {
        Self {
            token: Some(TokenRef::Resolved(token.id().clone())),
            flags: InjectFlags::DEFAULT,
        }
    }

    /// A dependency on a token that is resolved lazily.
    pub fn forward<T: 'static>(token: &ForwardRef<T>) -> Self {
        Self {
            token: Some(token.erase()),
            flags: InjectFlags::DEFAULT,
        }
    }

    /// Builds a dependency from array-style parts. The last token wins and
    /// flags accumulate; a part list without any token is rejected when the
    /// record table is built.
    pub fn from_parts(parts: impl IntoIterator<Item = DepPart>) -> Self {
        let mut dep = Self {
            token: None,
            flags: InjectFlags::DEFAULT,
        };
        for part in parts {
            match part {
                DepPart::Flag(flag) => dep.flags = dep.flags | flag,
                DepPart::Token(id) => dep.token = Some(TokenRef::Resolved(id)),
            }
        }
        dep
    }

    /// Adds `flags` to this dependency.
    pub fn flags(mut self, flags: InjectFlags) -> Self {
        self.flags = self.flags | flags;
        self
    }

    /// Marks this dependency optional.
    pub fn optional(self) -> Self {
        self.flags(InjectFlags::OPTIONAL)
    }

    /// Restricts resolution to the owning injector.
    pub fn self_only(self) -> Self {
        self.flags(InjectFlags::SELF)
    }

    /// Starts resolution at the owning injector's parent.
    pub fn skip_self(self) -> Self {
        self.flags(InjectFlags::SKIP_SELF)
    }

    pub(crate) fn token(&self) -> Option<TokenId> {
        self.token.as_ref().map(TokenRef::resolve)
    }

    pub(crate) fn inject_flags(&self) -> InjectFlags {
        self.flags
    }
}

/// Values marking the content of a multi-provider token.
pub(crate) struct MultiValue(pub(crate) Vec<Value>);

/// Resolved dependency values handed to factories, in declaration order.
pub struct Args {
    values: Vec<(TokenId, Option<Value>)>,
}

impl Args {
    pub(crate) fn new(values: Vec<(TokenId, Option<Value>)>) -> Self {
        Self { values }
    }

    /// Number of declared dependencies.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Returns `true` if the factory declared no dependencies.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// The required argument at `index`.
    pub fn get<T: 'static>(&self, index: usize) -> Result<Rc<T>> {
        let (token, value) = self.slot(index)?;
        match value {
            Some(value) => downcast(token, value.clone()),
            None => Err(InjectError::ProviderNotFound {
                token: token.to_string(),
                injector: "factory arguments".into(),
            }),
        }
    }

    /// The optional argument at `index`.
    pub fn optional<T: 'static>(&self, index: usize) -> Result<Option<Rc<T>>> {
        let (token, value) = self.slot(index)?;
        value.clone().map(|v| downcast(token, v)).transpose()
    }

    /// The multi-provider argument at `index`.
    pub fn multi<T: 'static>(&self, index: usize) -> Result<Vec<Rc<T>>> {
        let (token, value) = self.slot(index)?;
        match value {
            Some(value) => downcast_multi(token, value.clone()),
            None => Ok(Vec::new()),
        }
    }

    fn slot(&self, index: usize) -> Result<&(TokenId, Option<Value>)> {
        self.values.get(index).ok_or_else(|| InjectError::InvalidProvider {
            token: format!("argument #{index}"),
            reason: format!("only {} dependencies were declared", self.values.len()),
        })
    }
}

pub(crate) fn downcast<T: 'static>(token: &TokenId, value: Value) -> Result<Rc<T>> {
    value.downcast::<T>().map_err(|_| InjectError::TypeMismatch {
        token: token.to_string(),
        expected: type_name::<T>(),
    })
}

pub(crate) fn downcast_multi<T: 'static>(token: &TokenId, value: Value) -> Result<Vec<Rc<T>>> {
    let multi = value
        .downcast::<MultiValue>()
        .map_err(|_| InjectError::TypeMismatch {
            token: token.to_string(),
            expected: "multi provider list",
        })?;
    multi
        .0
        .iter()
        .map(|item| downcast(token, item.clone()))
        .collect()
}

pub(crate) type FactoryFn = Rc<dyn Fn(&InjectionContext, &Args) -> anyhow::Result<Value>>;
type ConstructorFn = Rc<dyn Fn(&Args) -> anyhow::Result<Instance>>;

/// A constructed class instance and its optional teardown hook.
pub(crate) struct Instance {
    pub(crate) value: Value,
    pub(crate) on_destroy: Option<Box<dyn FnOnce()>>,
}

/// A constructor descriptor: how to build an instance from resolved
/// constructor arguments.
#[derive(Clone)]
pub struct ClassFactory {
    name: &'static str,
    deps: Vec<Dep>,
    ctor: ConstructorFn,
}

impl ClassFactory {
    /// Describes a plain constructor.
    pub fn new<T, F>(deps: Vec<Dep>, ctor: F) -> Self
    where
        T: 'static,
        F: Fn(&Args) -> anyhow::Result<T> + 'static,
    {
        Self {
            name: type_name::<T>(),
            deps,
            ctor: Rc::new(move |args| {
                Ok(Instance {
                    value: Rc::new(ctor(args)?),
                    on_destroy: None,
                })
            }),
        }
    }

    /// Describes a constructor whose instances get [`OnDestroy::on_destroy`]
    /// called when the owning injector is destroyed.
    pub fn destroyable<T, F>(deps: Vec<Dep>, ctor: F) -> Self
    where
        T: OnDestroy + 'static,
        F: Fn(&Args) -> anyhow::Result<T> + 'static,
    {
        Self {
            name: type_name::<T>(),
            deps,
            ctor: Rc::new(move |args| {
                let instance = Rc::new(ctor(args)?);
                let hook = instance.clone();
                Ok(Instance {
                    value: instance,
                    on_destroy: Some(Box::new(move || hook.on_destroy())),
                })
            }),
        }
    }

    /// Type name of the constructed value.
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub(crate) fn deps(&self) -> &[Dep] {
        &self.deps
    }

    pub(crate) fn construct(&self, args: &Args) -> anyhow::Result<Instance> {
        (self.ctor)(args)
    }
}

/// The closed set of ways to produce a value for a token.
#[derive(Clone)]
pub(crate) enum ProviderKind {
    Value(Value),
    Class(ClassFactory),
    Factory(FactoryFn, Vec<Dep>),
    Existing(TokenRef),
}

/// A single provider declaration.
#[derive(Clone)]
pub struct Declaration {
    token: TokenId,
    kind: ProviderKind,
    multi: bool,
}

/// A provider declaration, or a nested list of them.
///
/// # Example
///
/// ```ignore
/// let providers = vec![
///     Provider::value(&PORT, 8080u16),
///     Provider::factory(&URL, vec![Dep::new(&PORT)], |_ctx, args| {
///         Ok(format!("http://localhost:{}", args.get::<u16>(0)?))
///     }),
///     Provider::list(vec![
///         Provider::value(&PLUGINS, "auth").multi(),
///         Provider::value(&PLUGINS, "metrics").multi(),
///     ]),
/// ];
/// ```
#[derive(Clone)]
pub enum Provider {
    /// One declaration.
    Single(Declaration),
    /// A nested list flattened depth-first.
    List(Vec<Provider>),
}

impl Provider {
    /// `useValue`: a ready-made value.
    pub fn value<T: 'static>(token: &Token<T>, value: T) -> Self {
        Self::declare(token.id(), ProviderKind::Value(Rc::new(value)))
    }

    /// `useClass`: construct through a [`ClassFactory`].
    pub fn class<T: 'static>(token: &Token<T>, class: ClassFactory) -> Self {
        Self::declare(token.id(), ProviderKind::Class(class))
    }

    /// `useFactory`: call `factory` with the resolved `deps`.
    pub fn factory<T, F>(token: &Token<T>, deps: Vec<Dep>, factory: F) -> Self
    where
        T: 'static,
        F: Fn(&InjectionContext, &Args) -> anyhow::Result<T> + 'static,
    {
        let factory: FactoryFn = Rc::new(move |ctx, args| Ok(Rc::new(factory(ctx, args)?) as Value));
        Self::declare(token.id(), ProviderKind::Factory(factory, deps))
    }

    /// `useExisting`: alias `token` to `existing`. The alias is resolved
    /// lazily, so it may point at a token provided later or further up.
    pub fn existing<T: 'static>(token: &Token<T>, existing: &Token<T>) -> Self {
        Self::declare(
            token.id(),
            ProviderKind::Existing(TokenRef::Resolved(existing.id().clone())),
        )
    }

    /// `useExisting` through a forward reference.
    pub fn existing_forward<T: 'static>(token: &Token<T>, existing: &ForwardRef<T>) -> Self {
        Self::declare(token.id(), ProviderKind::Existing(existing.erase()))
    }

    /// A nested provider list.
    pub fn list(providers: Vec<Provider>) -> Self {
        Provider::List(providers)
    }

    /// Marks the declaration as contributing to a multi-provider token.
    /// Has no effect on lists.
    pub fn multi(self) -> Self {
        match self {
            Provider::Single(mut decl) => {
                decl.multi = true;
                Provider::Single(decl)
            }
            list => list,
        }
    }

    fn declare(token: &TokenId, kind: ProviderKind) -> Self {
        Provider::Single(Declaration {
            token: token.clone(),
            kind,
            multi: false,
        })
    }
}

/// Canonical provider record for one token.
pub(crate) enum Record {
    Value(Value),
    Class(ClassFactory),
    Factory(FactoryFn, Vec<Dep>),
    Existing(TokenRef),
    Multi(Vec<Record>),
}

impl Record {
    fn from_kind(kind: ProviderKind) -> Self {
        match kind {
            ProviderKind::Value(value) => Record::Value(value),
            ProviderKind::Class(class) => Record::Class(class),
            ProviderKind::Factory(factory, deps) => Record::Factory(factory, deps),
            ProviderKind::Existing(alias) => Record::Existing(alias),
        }
    }
}

/// Flattened, immutable provider table of one injector.
#[derive(Default)]
pub(crate) struct RecordTable {
    records: HashMap<TokenId, Record>,
}

impl RecordTable {
    /// Flattens `providers` depth-first.
    ///
    /// Non-multi declarations shadow earlier ones for the same token; multi
    /// declarations append in order. Mixing both for one token, or declaring
    /// a dependency without a token, is rejected.
    pub(crate) fn build(providers: Vec<Provider>) -> Result<Self> {
        let mut table = RecordTable::default();
        let mut stack: Vec<Provider> = providers.into_iter().rev().collect();
        while let Some(provider) = stack.pop() {
            match provider {
                Provider::List(nested) => stack.extend(nested.into_iter().rev()),
                Provider::Single(decl) => table.insert(decl)?,
            }
        }
        Ok(table)
    }

    fn insert(&mut self, decl: Declaration) -> Result<()> {
        let deps = match &decl.kind {
            ProviderKind::Class(class) => class.deps(),
            ProviderKind::Factory(_, deps) => deps.as_slice(),
            _ => &[],
        };
        if let Some(index) = deps.iter().position(|dep| dep.token.is_none()) {
            return Err(InjectError::InvalidProvider {
                token: decl.token.to_string(),
                reason: format!("dependency #{index} is an empty array with no token"),
            });
        }

        let record = Record::from_kind(decl.kind);
        match (self.records.entry(decl.token), decl.multi) {
            (Entry::Vacant(slot), true) => {
                slot.insert(Record::Multi(vec![record]));
            }
            (Entry::Vacant(slot), false) => {
                slot.insert(record);
            }
            (Entry::Occupied(mut slot), true) => match slot.get_mut() {
                Record::Multi(items) => items.push(record),
                _ => return Err(mixed(slot.key())),
            },
            (Entry::Occupied(mut slot), false) => {
                if matches!(slot.get(), Record::Multi(_)) {
                    return Err(mixed(slot.key()));
                }
                slot.insert(record);
            }
        }
        Ok(())
    }

    pub(crate) fn get(&self, token: &TokenId) -> Option<&Record> {
        self.records.get(token)
    }

    pub(crate) fn contains(&self, token: &TokenId) -> bool {
        self.records.contains_key(token)
    }

    /// Plain value stored for `token`, if that is how it was provided.
    pub(crate) fn value_of<T: 'static>(&self, token: &TokenId) -> Option<&T> {
        match self.records.get(token)? {
            Record::Value(value) => value.downcast_ref::<T>(),
            _ => None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.records.len()
    }
}

fn mixed(token: &TokenId) -> InjectError {
    InjectError::InvalidProvider {
        token: token.to_string(),
        reason: "mixes multi and single providers".into(),
    }
}
