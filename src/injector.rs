//! Hierarchical injectors.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::rc::{Rc, Weak};

use tracing::{debug, trace};

use crate::context::{self, InjectionContext};
use crate::destroy::DestroyRef;
use crate::error::{InjectError, Result};
use crate::provider::{
    downcast, downcast_multi, Args, Dep, InjectFlags, MultiValue, Provider, Record, RecordTable,
};
use crate::reactive::untracked;
use crate::runtime::{DefaultPlacement, Runtime};
use crate::token::{Token, TokenId, Value};

// Thread-local stack of tokens under construction, used to report cycle paths.
thread_local! {
    static RESOLUTION_STACK: RefCell<Vec<TokenId>> = const { RefCell::new(Vec::new()) };
}

thread_local! {
    static ENVIRONMENT_INITIALIZER: Token<EnvironmentInitializer> =
        Token::new("ENVIRONMENT_INITIALIZER");
    static INJECTOR_SCOPE: Token<String> = Token::new("INJECTOR_SCOPE");
}

/// A callback run while its injector is being constructed.
pub struct EnvironmentInitializer(Box<dyn Fn(&InjectionContext) -> anyhow::Result<()>>);

impl EnvironmentInitializer {
    /// The multi-provider token collecting initializers.
    pub fn token() -> Token<EnvironmentInitializer> {
        ENVIRONMENT_INITIALIZER.with(Token::clone)
    }
}

/// Declares a callback to run, inside the injection context, when the
/// injector providing it is created. Initializers run in declaration order.
pub fn provide_environment_initializer(
    initializer: impl Fn(&InjectionContext) -> anyhow::Result<()> + 'static,
) -> Provider {
    Provider::value(
        &EnvironmentInitializer::token(),
        EnvironmentInitializer(Box::new(initializer)),
    )
    .multi()
}

/// Token whose value provider adds a named scope to the providing injector.
pub fn injector_scope() -> Token<String> {
    INJECTOR_SCOPE.with(Token::clone)
}

enum Slot {
    Resolved(Value),
    Pending,
    NotFound,
}

/// Options for [`Runtime::create_injector`].
#[derive(Default)]
pub struct InjectorOptions {
    providers: Vec<Provider>,
    parent: Option<Injector>,
    scopes: Vec<String>,
    name: Option<String>,
}

impl InjectorOptions {
    /// Options with the given providers and no parent.
    pub fn new(providers: Vec<Provider>) -> Self {
        Self {
            providers,
            ..Self::default()
        }
    }

    /// Sets the parent injector.
    pub fn parent(mut self, parent: &Injector) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    /// Adds a scope name.
    pub fn scope(mut self, scope: impl Into<String>) -> Self {
        self.scopes.push(scope.into());
        self
    }

    /// Names the injector in errors and logs.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

struct InjectorInner {
    name: String,
    runtime: Runtime,
    records: RecordTable,
    cache: RefCell<HashMap<TokenId, Slot>>,
    parent: RefCell<Option<Injector>>,
    scopes: HashSet<String>,
    destroyed: Cell<bool>,
    destroy_ref: DestroyRef,
}

/// A node in the injector tree.
///
/// An injector owns an immutable record table built from its providers and
/// a cache of constructed values. Values are created lazily on first `get`
/// and memoized in the injector whose record produced them.
///
/// This is cheap to clone - all data is behind `Rc`.
///
/// # Example
///
/// ```ignore
/// let runtime = Runtime::new();
/// let root = runtime.create_root_injector(vec![Provider::value(&LEVEL, 1)])?;
/// let child = root.create_child(vec![Provider::value(&LEVEL, 2)])?;
///
/// assert_eq!(*child.get(&LEVEL)?, 2);
/// assert_eq!(child.get_with(&LEVEL, InjectFlags::SKIP_SELF)?.as_deref(), Some(&1));
/// ```
#[derive(Clone)]
pub struct Injector {
    inner: Rc<InjectorInner>,
}

/// Non-owning injector reference.
#[derive(Clone)]
pub struct WeakInjector(Weak<InjectorInner>);

impl WeakInjector {
    /// Upgrades to a strong handle if the injector is still alive.
    pub fn upgrade(&self) -> Option<Injector> {
        self.0.upgrade().map(|inner| Injector { inner })
    }
}

impl Injector {
    pub(crate) fn create(runtime: &Runtime, options: InjectorOptions) -> Result<Injector> {
        let records = RecordTable::build(options.providers)?;
        let name = options
            .name
            .unwrap_or_else(|| format!("Injector#{}", runtime.next_injector_id()));

        let mut scopes: HashSet<String> = options.scopes.into_iter().collect();
        scopes.insert("environment".to_string());
        if let Some(scope) = records.value_of::<String>(injector_scope().id()) {
            scopes.insert(scope.clone());
        }

        debug!(injector = %name, records = records.len(), ?scopes, "created injector");

        let injector = Injector {
            inner: Rc::new(InjectorInner {
                destroy_ref: DestroyRef::new(name.clone()),
                name,
                runtime: runtime.clone(),
                records,
                cache: RefCell::new(HashMap::new()),
                parent: RefCell::new(options.parent),
                scopes,
                destroyed: Cell::new(false),
            }),
        };
        if let Err(err) = injector.run_initializers() {
            injector.destroy();
            return Err(err);
        }
        Ok(injector)
    }

    /// Creates a child environment injector.
    pub fn create_child(&self, providers: Vec<Provider>) -> Result<Injector> {
        Injector::create(&self.inner.runtime, InjectorOptions::new(providers).parent(self))
    }

    fn run_initializers(&self) -> Result<()> {
        let token = EnvironmentInitializer::token();
        if !self.inner.records.contains(token.id()) {
            return Ok(());
        }
        let initializers = self.get_multi(&token)?;
        context::run_in_injection_context(self, |ctx| {
            untracked(|| {
                initializers.iter().try_for_each(|init| {
                    (init.0)(ctx).map_err(|err| InjectError::from_user(token.to_string(), err))
                })
            })
        })
    }

    /// Injector name used in errors and logs.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Runtime this injector belongs to.
    pub fn runtime(&self) -> &Runtime {
        &self.inner.runtime
    }

    /// Parent injector, until this injector is destroyed.
    pub fn parent(&self) -> Option<Injector> {
        self.inner.parent.borrow().clone()
    }

    /// Returns `true` if `scope` is in this injector's scope set.
    pub fn has_scope(&self, scope: &str) -> bool {
        self.inner.scopes.contains(scope)
    }

    /// Teardown registry of this injector.
    pub fn destroy_ref(&self) -> DestroyRef {
        self.inner.destroy_ref.clone()
    }

    /// Returns `true` once [`Injector::destroy`] has run.
    pub fn destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }

    /// Non-owning handle to this injector.
    pub fn downgrade(&self) -> WeakInjector {
        WeakInjector(Rc::downgrade(&self.inner))
    }

    /// Returns `true` if both handles point at the same injector.
    pub fn ptr_eq(&self, other: &Injector) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Resolves a required token.
    ///
    /// # Errors
    ///
    /// - `InjectError::ProviderNotFound` - nothing on the chain provides the token
    /// - `InjectError::CyclicDependency` - the token is already under construction
    /// - `InjectError::InjectorDestroyed` - this injector or an ancestor was destroyed
    /// - `InjectError::Factory` - a factory failed; nothing is memoized
    pub fn get<T: 'static>(&self, token: &Token<T>) -> Result<Rc<T>> {
        match self.resolve(token.id(), InjectFlags::DEFAULT)? {
            Some(value) => downcast(token.id(), value),
            None => Err(self.not_found(token.id())),
        }
    }

    /// Resolves a token with explicit flags. With [`InjectFlags::OPTIONAL`]
    /// a missing provider yields `Ok(None)`.
    pub fn get_with<T: 'static>(&self, token: &Token<T>, flags: InjectFlags) -> Result<Option<Rc<T>>> {
        match self.resolve(token.id(), flags)? {
            Some(value) => downcast(token.id(), value).map(Some),
            None if flags.contains(InjectFlags::OPTIONAL) => Ok(None),
            None => Err(self.not_found(token.id())),
        }
    }

    /// Resolves a token, returning `not_found` when nothing provides it.
    pub fn get_or<T: 'static>(&self, token: &Token<T>, not_found: Rc<T>, flags: InjectFlags) -> Result<Rc<T>> {
        match self.resolve(token.id(), flags)? {
            Some(value) => downcast(token.id(), value),
            None => Ok(not_found),
        }
    }

    /// Resolves every contribution to a multi-provider token, in declaration
    /// order. A token nobody contributes to resolves to an empty list.
    pub fn get_multi<T: 'static>(&self, token: &Token<T>) -> Result<Vec<Rc<T>>> {
        self.get_multi_with(token, InjectFlags::DEFAULT)
    }

    /// Like [`Injector::get_multi`] with explicit flags.
    pub fn get_multi_with<T: 'static>(&self, token: &Token<T>, flags: InjectFlags) -> Result<Vec<Rc<T>>> {
        match self.resolve(token.id(), flags)? {
            Some(value) => downcast_multi(token.id(), value),
            None => Ok(Vec::new()),
        }
    }

    /// Destroys this injector.
    ///
    /// Idempotent. Runs every registered teardown callback in registration
    /// order (effects, resources and [`OnDestroy`](crate::OnDestroy) values
    /// created under this injector), drops cached values and unlinks from the
    /// parent. Any later `get` fails with `InjectError::InjectorDestroyed`.
    pub fn destroy(&self) {
        if self.inner.destroyed.replace(true) {
            return;
        }
        debug!(injector = %self.inner.name, callbacks = self.inner.destroy_ref.len(), "destroying injector");
        self.inner.destroy_ref.run();
        let cached = std::mem::take(&mut *self.inner.cache.borrow_mut());
        drop(cached);
        self.inner.parent.borrow_mut().take();
        self.inner.runtime.tracer().on_injector_destroyed(&self.inner.name);
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.inner.destroyed.get() {
            return Err(InjectError::InjectorDestroyed {
                injector: self.inner.name.clone(),
            });
        }
        Ok(())
    }

    fn not_found(&self, token: &TokenId) -> InjectError {
        NullInjector.not_found(token, self)
    }

    /// Walks the chain selected by `flags` and returns the value, or `None`
    /// when the chain is exhausted and no default factory applies.
    pub(crate) fn resolve(&self, token: &TokenId, flags: InjectFlags) -> Result<Option<Value>> {
        self.ensure_alive()?;
        if flags.is_empty() && matches!(self.inner.cache.borrow().get(token), Some(Slot::NotFound)) {
            return Ok(None);
        }

        let mut walked = Vec::new();
        let mut current = if flags.contains(InjectFlags::SKIP_SELF) {
            self.parent()
        } else {
            Some(self.clone())
        };
        while let Some(injector) = current {
            injector.ensure_alive()?;
            if let Some(value) = injector.lookup_local(token, self)? {
                return Ok(Some(value));
            }
            current = if flags.contains(InjectFlags::SELF) {
                None
            } else {
                injector.parent()
            };
            walked.push(injector);
        }

        if let Some(host) = self.default_host(token, &walked) {
            return host.hydrate_default(token).map(Some);
        }

        if flags.is_empty() {
            self.inner
                .cache
                .borrow_mut()
                .insert(token.clone(), Slot::NotFound);
        }
        Ok(None)
    }

    /// Picks the injector hosting `token`'s default factory value among the
    /// injectors actually walked, according to the runtime's placement policy.
    fn default_host(&self, token: &TokenId, walked: &[Injector]) -> Option<Injector> {
        token.default_factory()?;
        let scope = token.home_scope()?.name();
        let mut compatible = walked.iter().filter(|injector| injector.has_scope(scope));
        let host = match self.inner.runtime.default_placement() {
            DefaultPlacement::RootMost => compatible.last(),
            DefaultPlacement::Nearest => compatible.next(),
        }?;
        debug!(token = %token, injector = %host.name(), "placing default factory value");
        Some(host.clone())
    }

    /// Resolves `token` from this injector's own cache or records. `origin`
    /// is the injector the request started from.
    fn lookup_local(&self, token: &TokenId, origin: &Injector) -> Result<Option<Value>> {
        match self.inner.cache.borrow().get(token) {
            Some(Slot::Resolved(value)) => {
                self.inner.runtime.tracer().on_resolve(token.description(), &self.inner.name, true);
                return Ok(Some(value.clone()));
            }
            Some(Slot::Pending) => return Err(self.cycle_error(token)),
            Some(Slot::NotFound) | None => {}
        }
        let Some(record) = self.inner.records.get(token) else {
            return Ok(None);
        };
        self.hydrate(token, |injector| injector.instantiate(token, record, origin))
            .map(Some)
    }

    fn hydrate_default(&self, token: &TokenId) -> Result<Value> {
        self.hydrate(token, |injector| match token.default_factory() {
            Some(factory) => injector.call_user(token, |ctx| factory(ctx)),
            None => Err(injector.not_found(token)),
        })
    }

    /// Constructs `token` with a pending sentinel in place, memoizing the
    /// value on success and clearing the sentinel on failure.
    fn hydrate(&self, token: &TokenId, build: impl FnOnce(&Injector) -> Result<Value>) -> Result<Value> {
        let _frame = ResolutionFrame::enter(self, token);
        let value = build(self)?;
        self.inner
            .cache
            .borrow_mut()
            .insert(token.clone(), Slot::Resolved(value.clone()));
        self.inner.runtime.tracer().on_resolve(token.description(), &self.inner.name, false);
        Ok(value)
    }

    fn instantiate(&self, token: &TokenId, record: &Record, origin: &Injector) -> Result<Value> {
        match record {
            Record::Value(value) => Ok(value.clone()),
            Record::Existing(alias) => {
                let alias = alias.resolve();
                self.resolve(&alias, InjectFlags::DEFAULT)?
                    .ok_or_else(|| origin.not_found(&alias))
            }
            Record::Factory(factory, deps) => {
                let args = self.resolve_deps(deps)?;
                self.call_user(token, |ctx| factory(ctx, &args))
            }
            Record::Class(class) => {
                let args = self.resolve_deps(class.deps())?;
                let instance = self.call_user(token, |_| class.construct(&args))?;
                if let Some(hook) = instance.on_destroy {
                    self.inner.destroy_ref.on_destroy(hook)?;
                }
                Ok(instance.value)
            }
            Record::Multi(items) => {
                let values = items
                    .iter()
                    .map(|item| self.instantiate(token, item, origin))
                    .collect::<Result<Vec<_>>>()?;
                Ok(Rc::new(MultiValue(values)))
            }
        }
    }

    fn resolve_deps(&self, deps: &[Dep]) -> Result<Args> {
        let mut values = Vec::with_capacity(deps.len());
        for dep in deps {
            let Some(token) = dep.token() else {
                return Err(InjectError::InvalidProvider {
                    token: "dependency".into(),
                    reason: "empty dependency array".into(),
                });
            };
            let flags = dep.inject_flags();
            let value = self.resolve(&token, flags)?;
            if value.is_none() && !flags.contains(InjectFlags::OPTIONAL) {
                return Err(self.not_found(&token));
            }
            values.push((token, value));
        }
        Ok(Args::new(values))
    }

    /// Runs user code inside this injector's context, untracked by any
    /// active reactive consumer.
    fn call_user<R>(
        &self,
        token: &TokenId,
        f: impl FnOnce(&InjectionContext) -> anyhow::Result<R>,
    ) -> Result<R> {
        let ctx = InjectionContext::new(self.clone());
        let _guard = context::enter(self);
        untracked(|| f(&ctx)).map_err(|err| InjectError::from_user(token.to_string(), err))
    }

    fn cycle_error(&self, token: &TokenId) -> InjectError {
        let path: Vec<String> = RESOLUTION_STACK.with(|stack| {
            let stack = stack.borrow();
            let start = stack.iter().position(|t| t == token).unwrap_or(0);
            stack[start..]
                .iter()
                .chain(std::iter::once(token))
                .map(|t| t.description().to_string())
                .collect()
        });
        self.inner.runtime.tracer().on_cycle_detected(&path);
        InjectError::CyclicDependency { path }
    }
}

impl std::fmt::Debug for Injector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Injector")
            .field("name", &self.inner.name)
            .field("destroyed", &self.inner.destroyed.get())
            .finish()
    }
}

/// Marks a token pending in one injector for the duration of its
/// construction.
struct ResolutionFrame {
    injector: Injector,
    token: TokenId,
}

impl ResolutionFrame {
    fn enter(injector: &Injector, token: &TokenId) -> Self {
        trace!(token = %token, injector = %injector.name(), "constructing");
        injector
            .inner
            .cache
            .borrow_mut()
            .insert(token.clone(), Slot::Pending);
        RESOLUTION_STACK.with(|stack| stack.borrow_mut().push(token.clone()));
        Self {
            injector: injector.clone(),
            token: token.clone(),
        }
    }
}

impl Drop for ResolutionFrame {
    fn drop(&mut self) {
        RESOLUTION_STACK.with(|stack| {
            stack.borrow_mut().pop();
        });
        let mut cache = self.injector.inner.cache.borrow_mut();
        if matches!(cache.get(&self.token), Some(Slot::Pending)) {
            cache.remove(&self.token);
        }
    }
}

/// Terminal link of every injector chain: provides nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullInjector;

impl NullInjector {
    /// The error reported for a token that nothing provides, naming the
    /// injector the request originated from.
    pub fn not_found(&self, token: &TokenId, origin: &Injector) -> InjectError {
        InjectError::ProviderNotFound {
            token: token.to_string(),
            injector: origin.name().to_string(),
        }
    }
}
