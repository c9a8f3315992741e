//! Runtime: reactive graph, effect scheduler, local executor and
//! configuration shared by every injector created from it.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use futures::executor::{LocalPool, LocalSpawner};
use futures::task::{LocalSpawnExt, SpawnError};
use parking_lot::RwLock;
use tracing::{debug, error};

use crate::error::Result;
use crate::injector::{Injector, InjectorOptions};
use crate::provider::{InjectFlags, Provider};
use crate::reactive::graph::{Edge, Graph, NodeId, NodeKind, Refresh};
use crate::reactive::{
    active_consumer, Computed, EffectCleanup, EffectInner, EffectOptions, EffectRef, LinkedSignal,
    Previous, Signal,
};
use crate::resource::{Resource, ResourceOptions};
use crate::scheduler::{Scheduler, DEFAULT_MAX_FLUSH_ITERATIONS};
use crate::token::Token;
use crate::tracer::{NoopTracer, Tracer};

/// Per-runtime hook receiving errors raised by effects and background tasks.
pub type ErrorHook = Rc<dyn Fn(&anyhow::Error)>;

/// Process-wide hook used by runtimes without their own [`ErrorHook`].
pub type GlobalErrorHook = Arc<dyn Fn(&anyhow::Error) + Send + Sync>;

static GLOBAL_ERROR_HOOK: RwLock<Option<GlobalErrorHook>> = parking_lot::const_rwlock(None);

static NEXT_RUNTIME_ID: AtomicU64 = AtomicU64::new(1);

/// Installs the process-wide error hook.
///
/// Errors thrown by effect bodies and pending tasks that no
/// [`ErrorHandler`] claims are passed here. Without a hook they are logged
/// with `tracing::error!` and execution continues.
pub fn set_error_hook(hook: impl Fn(&anyhow::Error) + Send + Sync + 'static) {
    *GLOBAL_ERROR_HOOK.write() = Some(Arc::new(hook));
}

/// Removes the process-wide error hook, restoring log-and-continue.
pub fn reset_error_hook() {
    *GLOBAL_ERROR_HOOK.write() = None;
}

thread_local! {
    static ERROR_HANDLER: Token<ErrorHandler> = Token::new("ErrorHandler");
}

/// Injectable error sink.
///
/// When an injector (or one of its ancestors) provides an `ErrorHandler`,
/// errors from effects and pending tasks created under it are routed here
/// instead of the runtime's hooks.
///
/// # Example
///
/// ```ignore
/// let root = runtime.create_root_injector(vec![Provider::value(
///     &ErrorHandler::token(),
///     ErrorHandler::new(|err| eprintln!("effect failed: {err:#}")),
/// )])?;
/// ```
pub struct ErrorHandler {
    handler: Box<dyn Fn(&anyhow::Error)>,
}

impl ErrorHandler {
    /// Wraps a handler function.
    pub fn new(handler: impl Fn(&anyhow::Error) + 'static) -> Self {
        Self {
            handler: Box::new(handler),
        }
    }

    /// The token under which handlers are provided.
    pub fn token() -> Token<ErrorHandler> {
        ERROR_HANDLER.with(Token::clone)
    }

    /// Handles one error.
    pub fn handle_error(&self, error: &anyhow::Error) {
        (self.handler)(error)
    }
}

/// Where a token's default factory value is cached when several injectors
/// on the walked chain carry its home scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DefaultPlacement {
    /// The compatible injector closest to the root. A root-scoped default is
    /// then a single instance no matter which child asked first.
    #[default]
    RootMost,
    /// The compatible injector closest to the requester.
    Nearest,
}

/// Builder for a [`Runtime`] with custom configuration.
///
/// # Example
///
/// ```ignore
/// let runtime = Runtime::builder()
///     .max_flush_iterations(10)
///     .default_placement(DefaultPlacement::Nearest)
///     .error_hook(|err| eprintln!("{err:#}"))
///     .build();
/// ```
pub struct RuntimeBuilder {
    max_flush_iterations: usize,
    placement: DefaultPlacement,
    error_hook: Option<ErrorHook>,
    tracer: Box<dyn Tracer>,
    on_flush_requested: Option<Rc<dyn Fn()>>,
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            max_flush_iterations: DEFAULT_MAX_FLUSH_ITERATIONS,
            placement: DefaultPlacement::default(),
            error_hook: None,
            tracer: Box::new(NoopTracer),
            on_flush_requested: None,
        }
    }

    /// Caps the fixed-point iterations of one effect flush.
    pub fn max_flush_iterations(mut self, iterations: usize) -> Self {
        self.max_flush_iterations = iterations.max(1);
        self
    }

    /// Sets the placement policy for default factory values.
    pub fn default_placement(mut self, placement: DefaultPlacement) -> Self {
        self.placement = placement;
        self
    }

    /// Sets the error hook of this runtime, taking precedence over the
    /// process-wide hook.
    pub fn error_hook(mut self, hook: impl Fn(&anyhow::Error) + 'static) -> Self {
        self.error_hook = Some(Rc::new(hook));
        self
    }

    /// Sets the tracer.
    pub fn tracer(mut self, tracer: impl Tracer) -> Self {
        self.tracer = Box::new(tracer);
        self
    }

    /// Called once whenever the effect queue goes from idle to having a
    /// pending flush, so a host event loop can schedule
    /// [`Runtime::flush_effects`].
    pub fn on_flush_requested(mut self, notify: impl Fn() + 'static) -> Self {
        self.on_flush_requested = Some(Rc::new(notify));
        self
    }

    /// Build the runtime.
    pub fn build(self) -> Runtime {
        let executor = LocalPool::new();
        let spawner = executor.spawner();
        let id = NEXT_RUNTIME_ID.fetch_add(1, Ordering::Relaxed);
        debug!(runtime = id, max_flush_iterations = self.max_flush_iterations, placement = ?self.placement, "created runtime");
        Runtime {
            inner: Rc::new(RuntimeInner {
                id,
                graph: RefCell::new(Graph::default()),
                scheduler: Scheduler::new(self.max_flush_iterations, self.on_flush_requested),
                executor: RefCell::new(executor),
                spawner,
                tracer: self.tracer,
                error_hook: self.error_hook,
                placement: self.placement,
                next_seq: Cell::new(0),
                next_injector: Cell::new(0),
            }),
        }
    }
}

struct RuntimeInner {
    id: u64,
    graph: RefCell<Graph>,
    scheduler: Scheduler,
    executor: RefCell<LocalPool>,
    spawner: LocalSpawner,
    tracer: Box<dyn Tracer>,
    error_hook: Option<ErrorHook>,
    placement: DefaultPlacement,
    next_seq: Cell<u64>,
    next_injector: Cell<u64>,
}

/// Owner of the reactive graph, the effect scheduler and the executor that
/// drives resource loaders.
///
/// Everything is single-threaded: a runtime and every node, injector and
/// resource created from it must stay on one thread. Writes never run
/// effects synchronously; call [`Runtime::flush_effects`] (or
/// [`Runtime::run_until_stalled`], which also drives pending loaders) once
/// the current unit of work is done.
///
/// This is cheap to clone - all data is behind `Rc`.
///
/// # Example
///
/// ```ignore
/// let runtime = Runtime::new();
/// let root = runtime.create_root_injector(vec![])?;
/// let count = runtime.signal(0);
///
/// let seen = count.clone();
/// runtime.effect_with(move |_| {
///     println!("count = {}", seen.get());
///     Ok(())
/// }, EffectOptions::new().injector(&root))?;
///
/// count.set(1);
/// count.set(2);
/// runtime.flush_effects()?; // prints "count = 2" once
/// ```
#[derive(Clone)]
pub struct Runtime {
    inner: Rc<RuntimeInner>,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl Runtime {
    /// Create a new runtime with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for customizing the runtime.
    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    // =========================================================================
    // Injectors
    // =========================================================================

    /// Creates the root injector (scopes `root` and `environment`).
    pub fn create_root_injector(&self, providers: Vec<Provider>) -> Result<Injector> {
        self.create_injector(InjectorOptions::new(providers).scope("root").name("root"))
    }

    /// Creates a platform injector (scope `platform`), typically the parent
    /// of the root injector.
    pub fn create_platform_injector(&self, providers: Vec<Provider>) -> Result<Injector> {
        self.create_injector(
            InjectorOptions::new(providers)
                .scope("platform")
                .name("platform"),
        )
    }

    /// Creates an injector from explicit options.
    ///
    /// Nothing is instantiated eagerly except environment initializers.
    pub fn create_injector(&self, options: InjectorOptions) -> Result<Injector> {
        Injector::create(self, options)
    }

    // =========================================================================
    // Reactive primitives
    // =========================================================================

    /// Creates a signal compared with `PartialEq`.
    pub fn signal<T: PartialEq + 'static>(&self, value: T) -> Signal<T> {
        Signal::new(self, value, Rc::new(|a: &T, b: &T| a == b))
    }

    /// Creates a signal with a custom equality function.
    pub fn signal_with_equal<T: 'static>(
        &self,
        value: T,
        equal: impl Fn(&T, &T) -> bool + 'static,
    ) -> Signal<T> {
        Signal::new(self, value, Rc::new(equal))
    }

    /// Creates a computed value compared with `PartialEq`.
    pub fn computed<T: PartialEq + 'static>(&self, compute: impl Fn() -> T + 'static) -> Computed<T> {
        Computed::new(self, compute, Rc::new(|a: &T, b: &T| a == b))
    }

    /// Creates a computed value with a custom equality function.
    pub fn computed_with_equal<T: 'static>(
        &self,
        compute: impl Fn() -> T + 'static,
        equal: impl Fn(&T, &T) -> bool + 'static,
    ) -> Computed<T> {
        Computed::new(self, compute, Rc::new(equal))
    }

    /// Creates a linked signal compared with `PartialEq`.
    pub fn linked_signal<S, T>(
        &self,
        source: impl Fn() -> S + 'static,
        computation: impl Fn(S, Option<Previous<S, T>>) -> T + 'static,
    ) -> LinkedSignal<T>
    where
        S: Clone + 'static,
        T: Clone + PartialEq + 'static,
    {
        LinkedSignal::new(self, source, computation, Rc::new(|a: &T, b: &T| a == b))
    }

    /// Creates a linked signal with a custom equality function.
    pub fn linked_signal_with_equal<S, T>(
        &self,
        source: impl Fn() -> S + 'static,
        computation: impl Fn(S, Option<Previous<S, T>>) -> T + 'static,
        equal: impl Fn(&T, &T) -> bool + 'static,
    ) -> LinkedSignal<T>
    where
        S: Clone + 'static,
        T: Clone + 'static,
    {
        LinkedSignal::new(self, source, computation, Rc::new(equal))
    }

    /// Creates an effect owned by the current injection context.
    ///
    /// # Errors
    ///
    /// `InjectError::InjectionContext` outside an injection context.
    pub fn effect(
        &self,
        body: impl FnMut(&EffectCleanup) -> anyhow::Result<()> + 'static,
    ) -> Result<EffectRef> {
        self.effect_with(body, EffectOptions::new())
    }

    /// Creates an effect with explicit options. Its first run is queued for
    /// the next flush.
    pub fn effect_with(
        &self,
        body: impl FnMut(&EffectCleanup) -> anyhow::Result<()> + 'static,
        options: EffectOptions,
    ) -> Result<EffectRef> {
        EffectInner::create(self, Box::new(body), options)
    }

    /// Creates an async resource.
    pub fn resource<R, T>(&self, options: ResourceOptions<R, T>) -> Result<Resource<T>>
    where
        R: Clone + PartialEq + 'static,
        T: Clone + 'static,
    {
        Resource::create(self, options)
    }

    // =========================================================================
    // Driving
    // =========================================================================

    /// Runs every dirty effect, repeating until none is left.
    ///
    /// # Errors
    ///
    /// `InjectError::SchedulerRunaway` when the configured iteration cap is
    /// exceeded.
    pub fn flush_effects(&self) -> Result<()> {
        self.inner.scheduler.flush(self)
    }

    /// Alternates effect flushes and executor polling until neither has
    /// anything left to do. Loaders waiting on external events stay pending.
    pub fn run_until_stalled(&self) -> Result<()> {
        loop {
            self.flush_effects()?;
            match self.inner.executor.try_borrow_mut() {
                Ok(mut executor) => executor.run_until_stalled(),
                Err(_) => {
                    debug!("executor already running, skipping nested drive");
                    return Ok(());
                }
            }
            if !self.inner.scheduler.has_pending() {
                return Ok(());
            }
        }
    }

    /// Returns `true` if effects are waiting for a flush.
    pub fn has_pending_effects(&self) -> bool {
        self.inner.scheduler.has_pending()
    }

    /// Number of live effects.
    pub fn effect_count(&self) -> usize {
        self.inner.scheduler.len()
    }

    /// Number of live reactive nodes.
    pub fn node_count(&self) -> usize {
        self.inner.graph.borrow().len()
    }

    /// Reports an error through this runtime's hook, the process-wide hook,
    /// or `tracing::error!`, in that order.
    pub fn report_error(&self, err: &anyhow::Error) {
        if let Some(hook) = &self.inner.error_hook {
            hook(err);
            return;
        }
        let global = GLOBAL_ERROR_HOOK.read().clone();
        match global {
            Some(hook) => hook(err),
            None => error!("unhandled error in reactive context: {err:#}"),
        }
    }

    // =========================================================================
    // Crate internals
    // =========================================================================

    pub(crate) fn id(&self) -> u64 {
        self.inner.id
    }

    pub(crate) fn tracer(&self) -> &dyn Tracer {
        self.inner.tracer.as_ref()
    }

    pub(crate) fn default_placement(&self) -> DefaultPlacement {
        self.inner.placement
    }

    pub(crate) fn next_seq(&self) -> u64 {
        let seq = self.inner.next_seq.get();
        self.inner.next_seq.set(seq + 1);
        seq
    }

    pub(crate) fn next_injector_id(&self) -> u64 {
        let id = self.inner.next_injector.get();
        self.inner.next_injector.set(id + 1);
        id
    }

    /// Routes an error to the nearest provided [`ErrorHandler`], falling back
    /// to [`Runtime::report_error`].
    pub(crate) fn route_error(&self, injector: Option<&Injector>, err: &anyhow::Error) {
        let handler = injector.and_then(|injector| {
            injector
                .get_with(&ErrorHandler::token(), InjectFlags::OPTIONAL)
                .ok()
                .flatten()
        });
        match handler {
            Some(handler) => handler.handle_error(err),
            None => self.report_error(err),
        }
    }

    pub(crate) fn spawn_local(
        &self,
        future: impl Future<Output = ()> + 'static,
    ) -> std::result::Result<(), SpawnError> {
        self.inner.spawner.spawn_local(future)
    }

    pub(crate) fn insert_node(&self, kind: NodeKind) -> NodeId {
        self.inner.graph.borrow_mut().insert(kind)
    }

    pub(crate) fn remove_node(&self, id: NodeId) {
        if let Ok(mut graph) = self.inner.graph.try_borrow_mut() {
            graph.remove(id);
        }
    }

    pub(crate) fn set_refresh_hook(&self, id: NodeId, hook: Weak<dyn Refresh>) {
        self.inner.graph.borrow_mut().set_hook(id, hook);
    }

    pub(crate) fn set_effect_key(&self, id: NodeId, seq: u64) {
        self.inner.graph.borrow_mut().set_effect(id, seq);
    }

    pub(crate) fn register_effect(&self, seq: u64, effect: Rc<EffectInner>) {
        self.inner.scheduler.register(seq, effect);
    }

    pub(crate) fn unregister_effect(&self, seq: u64) {
        self.inner.scheduler.unregister(seq);
    }

    pub(crate) fn is_dirty(&self, id: NodeId) -> bool {
        self.inner.graph.borrow().is_dirty(id)
    }

    pub(crate) fn set_clean(&self, id: NodeId) {
        self.inner.graph.borrow_mut().set_clean(id);
    }

    pub(crate) fn bump_version(&self, id: NodeId) {
        self.inner.graph.borrow_mut().bump(id);
    }

    pub(crate) fn begin_evaluation(&self, id: NodeId) -> Vec<Edge> {
        self.inner.graph.borrow_mut().begin_evaluation(id)
    }

    pub(crate) fn end_evaluation(&self, id: NodeId, previous: Vec<Edge>) {
        self.inner.graph.borrow_mut().end_evaluation(id, previous);
    }

    /// Registers `producer` as a dependency of the active consumer, if that
    /// consumer belongs to this runtime.
    pub(crate) fn record_read(&self, producer: NodeId) {
        if let Some(consumer) = active_consumer() {
            if consumer.runtime == self.inner.id {
                self.inner.graph.borrow_mut().link(consumer.node, producer);
            }
        }
    }

    /// Bumps `id`'s version and queues every effect downstream of it.
    pub(crate) fn notify_changed(&self, id: NodeId) {
        let effects = {
            let mut graph = self.inner.graph.borrow_mut();
            graph.bump(id);
            graph.mark_consumers_dirty(id)
        };
        for seq in effects {
            self.inner.scheduler.enqueue(seq);
        }
    }

    /// Brings every derived producer of `id` up to date and accepts the
    /// resulting versions without re-running `id`, leaving it clean.
    ///
    /// Unlike [`Runtime::producers_changed`] this never stops early, so no
    /// producer is left dirty and later writes propagate through it again.
    pub(crate) fn settle(&self, id: NodeId) {
        let edges = self.inner.graph.borrow().producers(id);
        for edge in edges {
            let hook = {
                let graph = self.inner.graph.borrow();
                match graph.kind(edge.producer) {
                    Some(NodeKind::Computed) => graph.hook(edge.producer),
                    _ => None,
                }
            };
            if let Some(hook) = hook.and_then(|hook| hook.upgrade()) {
                hook.refresh();
            }
        }
        let mut graph = self.inner.graph.borrow_mut();
        graph.resync(id);
        graph.set_clean(id);
    }

    /// Refreshes `id`'s producers in read order and reports whether any of
    /// them now has a different version than last observed.
    pub(crate) fn producers_changed(&self, id: NodeId) -> bool {
        let edges = self.inner.graph.borrow().producers(id);
        for edge in edges {
            let hook = {
                let graph = self.inner.graph.borrow();
                match graph.kind(edge.producer) {
                    Some(NodeKind::Computed) => graph.hook(edge.producer),
                    _ => None,
                }
            };
            if let Some(hook) = hook.and_then(|hook| hook.upgrade()) {
                hook.refresh();
            }
            if self.inner.graph.borrow().version(edge.producer) != Some(edge.seen) {
                return true;
            }
        }
        false
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("id", &self.inner.id)
            .field("placement", &self.inner.placement)
            .finish()
    }
}
