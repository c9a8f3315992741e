//! Async resources.
//!
//! A [`Resource`] turns a reactive request into an asynchronously loaded
//! value. Every load gets a new generation number; a load whose generation is
//! no longer current when it settles (because the request changed, the value
//! was set locally, or the resource was destroyed) is dropped.
//!
//! # Example
//!
//! ```ignore
//! let user_id = runtime.signal(1u32);
//! let user: Resource<User> = runtime.resource(
//!     ResourceOptions::new(
//!         { let user_id = user_id.clone(); move || Some(user_id.get()) },
//!         |params: LoaderParams<u32>| async move { fetch_user(params.request).await },
//!     )
//!     .injector(&root),
//! )?;
//!
//! runtime.run_until_stalled()?;
//! assert_eq!(user.status(), ResourceStatus::Resolved);
//! ```

use std::cell::{Cell, RefCell};
use std::fmt;
use std::future::Future;
use std::rc::{Rc, Weak};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::{FutureExt, LocalBoxFuture};
use tracing::{debug, trace};

use crate::context::current_injector;
use crate::error::{InjectError, Result};
use crate::injector::Injector;
use crate::reactive::{untracked, EffectOptions, EffectRef, Signal};
use crate::runtime::Runtime;

/// Loading state of a [`Resource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceStatus {
    /// No request yet, or the resource was destroyed.
    Idle,
    /// A load is in flight.
    Loading,
    /// The last load produced a value.
    Resolved,
    /// The last load failed.
    Error,
    /// The value was set locally.
    Local,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ResourceStatus::Idle => "idle",
            ResourceStatus::Loading => "loading",
            ResourceStatus::Resolved => "resolved",
            ResourceStatus::Error => "error",
            ResourceStatus::Local => "local",
        };
        f.write_str(name)
    }
}

/// Cancellation flag handed to loaders.
///
/// Cancellation is cooperative: the loader may check the flag, but its result
/// is discarded regardless once it is superseded.
#[derive(Debug, Clone, Default)]
pub struct AbortSignal {
    aborted: Rc<Cell<bool>>,
}

impl AbortSignal {
    /// Returns `true` once the load has been superseded or cancelled.
    pub fn is_aborted(&self) -> bool {
        self.aborted.get()
    }

    fn abort(&self) {
        self.aborted.set(true);
    }
}

/// Arguments of one loader invocation.
#[derive(Debug, Clone)]
pub struct LoaderParams<R> {
    /// The request value that triggered the load.
    pub request: R,
    /// Generation number of this load.
    pub generation: u64,
    /// Status of the resource when the load started.
    pub previous: ResourceStatus,
    /// Set when this load is superseded.
    pub abort: AbortSignal,
}

/// Loads a value for a request.
///
/// Implemented for closures returning a future, so most callers never
/// implement it by hand.
#[async_trait(?Send)]
pub trait ResourceLoader<R, T>: 'static {
    /// Loads the value for `params.request`.
    async fn load(&self, params: LoaderParams<R>) -> anyhow::Result<T>;
}

#[async_trait(?Send)]
impl<R, T, F, Fut> ResourceLoader<R, T> for F
where
    R: 'static,
    T: 'static,
    F: Fn(LoaderParams<R>) -> Fut + 'static,
    Fut: Future<Output = anyhow::Result<T>> + 'static,
{
    async fn load(&self, params: LoaderParams<R>) -> anyhow::Result<T> {
        (self)(params).await
    }
}

/// Options for [`Runtime::resource`].
pub struct ResourceOptions<R, T> {
    request: Box<dyn Fn() -> Option<R>>,
    loader: Rc<dyn ResourceLoader<R, T>>,
    injector: Option<Injector>,
}

impl<R: 'static, T: 'static> ResourceOptions<R, T> {
    /// `request` is tracked: whenever a signal it reads changes and the
    /// returned request differs from the previous one, a new load starts.
    /// Returning `None` leaves the resource idle.
    pub fn new(
        request: impl Fn() -> Option<R> + 'static,
        loader: impl ResourceLoader<R, T>,
    ) -> Self {
        Self {
            request: Box::new(request),
            loader: Rc::new(loader),
            injector: None,
        }
    }

    /// Owns the resource by `injector` instead of the current context.
    pub fn injector(mut self, injector: &Injector) -> Self {
        self.injector = Some(injector.clone());
        self
    }
}

type LoadFn<T> = Rc<dyn Fn(u64, AbortSignal, ResourceStatus) -> LocalBoxFuture<'static, anyhow::Result<T>>>;

struct ResourceState<T> {
    runtime: Runtime,
    status: Signal<ResourceStatus>,
    value: Signal<Option<T>>,
    error: Signal<Option<InjectError>>,
    generation: Cell<u64>,
    abort: RefCell<AbortSignal>,
    load: RefCell<Option<LoadFn<T>>>,
    destroyed: Cell<bool>,
    effect: RefCell<Option<EffectRef>>,
}

impl<T: Clone + 'static> ResourceState<T> {
    /// Supersedes the current load, if any, and returns the next generation.
    fn next_generation(&self) -> u64 {
        self.abort.borrow().abort();
        let generation = self.generation.get() + 1;
        self.generation.set(generation);
        generation
    }

    fn on_request(self: &Rc<Self>, load: Option<LoadFn<T>>) {
        if self.destroyed.get() {
            return;
        }
        *self.load.borrow_mut() = load.clone();
        match load {
            Some(load) => self.start(load, false),
            None => {
                self.next_generation();
                self.value.set(None);
                self.error.set(None);
                self.status.set(ResourceStatus::Idle);
            }
        }
    }

    fn start(self: &Rc<Self>, load: LoadFn<T>, keep_value: bool) {
        let generation = self.next_generation();
        let abort = AbortSignal::default();
        *self.abort.borrow_mut() = abort.clone();
        let previous = self.status.get_untracked();

        if !keep_value {
            self.value.set(None);
        }
        self.error.set(None);
        self.status.set(ResourceStatus::Loading);
        self.runtime
            .tracer()
            .on_resource_state(generation, ResourceStatus::Loading);
        trace!(generation, %previous, "resource load started");

        let future = load(generation, abort, previous);
        let state = Rc::downgrade(self);
        let spawned = self.runtime.spawn_local(async move {
            let result = future.await;
            if let Some(state) = Weak::upgrade(&state) {
                state.settle(generation, result);
            }
        });
        if let Err(err) = spawned {
            self.settle(generation, Err(anyhow::Error::from(err)));
        }
    }

    fn settle(&self, generation: u64, result: anyhow::Result<T>) {
        if self.destroyed.get() || generation != self.generation.get() {
            debug!(generation, current = self.generation.get(), "discarding stale resource result");
            return;
        }
        let status = match result {
            Ok(value) => {
                self.value.set(Some(value));
                self.error.set(None);
                ResourceStatus::Resolved
            }
            Err(error) => {
                self.value.set(None);
                self.error.set(Some(InjectError::ResourceLoad {
                    generation,
                    error: Arc::new(error),
                }));
                ResourceStatus::Error
            }
        };
        self.status.set(status);
        self.runtime.tracer().on_resource_state(generation, status);
    }

    fn destroy(&self) {
        if self.destroyed.replace(true) {
            return;
        }
        self.next_generation();
        let effect = self.effect.borrow_mut().take();
        if let Some(effect) = effect {
            effect.destroy();
        }
        self.load.borrow_mut().take();
        self.value.set(None);
        self.error.set(None);
        self.status.set(ResourceStatus::Idle);
    }
}

/// An asynchronously loaded value derived from a reactive request.
///
/// Status, value and error are signals: reading them in a computed or effect
/// tracks them. The resource is destroyed with its owning injector.
pub struct Resource<T> {
    state: Rc<ResourceState<T>>,
}

impl<T: Clone + 'static> Resource<T> {
    pub(crate) fn create<R: Clone + PartialEq + 'static>(runtime: &Runtime, options: ResourceOptions<R, T>) -> Result<Self> {
        let injector = match options.injector.or_else(current_injector) {
            Some(injector) => injector,
            None => {
                return Err(InjectError::InjectionContext {
                    operation: "resource".into(),
                })
            }
        };

        let state = Rc::new(ResourceState {
            runtime: runtime.clone(),
            status: runtime.signal(ResourceStatus::Idle),
            value: runtime.signal_with_equal(None, |_, _| false),
            error: runtime.signal_with_equal(None, |_, _| false),
            generation: Cell::new(0),
            abort: RefCell::new(AbortSignal::default()),
            load: RefCell::new(None),
            destroyed: Cell::new(false),
            effect: RefCell::new(None),
        });

        // an equal request does not start a new load
        let request = runtime.computed(options.request);
        let loader = options.loader;
        let weak = Rc::downgrade(&state);
        let effect = runtime.effect_with(
            move |_| {
                let request = request.get();
                if let Some(state) = weak.upgrade() {
                    let load = request.map(|request| load_fn(request, loader.clone()));
                    untracked(|| state.on_request(load));
                }
                Ok(())
            },
            EffectOptions::new().injector(&injector),
        )?;
        *state.effect.borrow_mut() = Some(effect);

        let owned = state.clone();
        injector.destroy_ref().on_destroy(move || owned.destroy())?;
        Ok(Self { state })
    }

    /// Current status, tracked.
    pub fn status(&self) -> ResourceStatus {
        self.state.status.get()
    }

    /// Returns `true` while a load is in flight.
    pub fn is_loading(&self) -> bool {
        self.status() == ResourceStatus::Loading
    }

    /// The loaded or locally set value, tracked.
    pub fn value(&self) -> Option<T> {
        self.state.value.get()
    }

    /// Returns `true` if a value is present.
    pub fn has_value(&self) -> bool {
        self.state.value.with(Option::is_some)
    }

    /// The error of the last load, tracked.
    pub fn error(&self) -> Option<InjectError> {
        self.state.error.get()
    }

    /// Generation number of the most recent load.
    pub fn generation(&self) -> u64 {
        self.state.generation.get()
    }

    /// Re-runs the loader for the current request.
    ///
    /// Returns `false` (and does nothing) while idle or loading.
    pub fn reload(&self) -> bool {
        let status = self.state.status.get_untracked();
        if !matches!(
            status,
            ResourceStatus::Resolved | ResourceStatus::Error | ResourceStatus::Local
        ) {
            return false;
        }
        let load = self.state.load.borrow().clone();
        match load {
            Some(load) => {
                untracked(|| self.state.start(load, true));
                true
            }
            None => false,
        }
    }

    /// Sets the value locally, superseding any in-flight load.
    pub fn set(&self, value: T) {
        if self.state.destroyed.get() {
            return;
        }
        self.state.next_generation();
        self.state.value.set(Some(value));
        self.state.error.set(None);
        self.state.status.set(ResourceStatus::Local);
    }

    /// Computes a new local value from the current one.
    pub fn update(&self, f: impl FnOnce(Option<T>) -> T) {
        let next = f(self.state.value.get_untracked());
        self.set(next);
    }

    /// Cancels any load, stops tracking the request and returns to idle.
    pub fn destroy(&self) {
        self.state.destroy();
    }
}

impl<T> Clone for Resource<T> {
    fn clone(&self) -> Self {
        Self {
            state: self.state.clone(),
        }
    }
}

fn load_fn<R, T>(request: R, loader: Rc<dyn ResourceLoader<R, T>>) -> LoadFn<T>
where
    R: Clone + 'static,
    T: 'static,
{
    Rc::new(
        move |generation: u64, abort: AbortSignal, previous: ResourceStatus| {
            let loader = loader.clone();
            let params = LoaderParams {
                request: request.clone(),
                generation,
                previous,
                abort,
            };
            async move { loader.load(params).await }.boxed_local()
        },
    )
}
