use std::cell::{Cell, RefCell};
use std::rc::Rc;

use crate::context::current_injector;
use crate::destroy::DestroyHandle;
use crate::error::{InjectError, Result};
use crate::injector::{Injector, WeakInjector};
use crate::reactive::graph::{NodeId, NodeKind};
use crate::reactive::{track, untracked, Consumer};
use crate::runtime::Runtime;

type EffectBody = Box<dyn FnMut(&EffectCleanup) -> anyhow::Result<()>>;

/// Options for [`Runtime::effect_with`].
#[derive(Default)]
pub struct EffectOptions {
    injector: Option<Injector>,
    manual_cleanup: bool,
}

impl EffectOptions {
    /// Default options: the effect belongs to the current injection context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the effect with `injector` instead of the current context.
    pub fn injector(mut self, injector: &Injector) -> Self {
        self.injector = Some(injector.clone());
        self
    }

    /// Allows creating the effect without any injector. It then lives until
    /// [`EffectRef::destroy`] is called.
    pub fn manual_cleanup(mut self) -> Self {
        self.manual_cleanup = true;
        self
    }
}

/// Cleanup registrar handed to effect bodies.
///
/// Registered callbacks run before the next execution of the effect and when
/// the effect is destroyed.
#[derive(Default)]
pub struct EffectCleanup {
    callbacks: RefCell<Vec<Box<dyn FnOnce()>>>,
}

impl EffectCleanup {
    /// Registers `callback` for the next cleanup.
    pub fn on_cleanup(&self, callback: impl FnOnce() + 'static) {
        self.callbacks.borrow_mut().push(Box::new(callback));
    }

    fn run(&self) {
        let callbacks = std::mem::take(&mut *self.callbacks.borrow_mut());
        for callback in callbacks {
            callback();
        }
    }
}

pub(crate) struct EffectInner {
    runtime: Runtime,
    id: NodeId,
    seq: u64,
    body: RefCell<EffectBody>,
    cleanup: EffectCleanup,
    has_run: Cell<bool>,
    disposed: Cell<bool>,
    injector: Option<WeakInjector>,
    registration: RefCell<Option<DestroyHandle>>,
}

impl EffectInner {
    pub(crate) fn create(runtime: &Runtime, body: EffectBody, options: EffectOptions) -> Result<EffectRef> {
        let injector = options.injector.or_else(current_injector);
        if injector.is_none() && !options.manual_cleanup {
            return Err(InjectError::InjectionContext {
                operation: "effect".into(),
            });
        }

        let id = runtime.insert_node(NodeKind::Effect);
        let seq = runtime.next_seq();
        runtime.set_effect_key(id, seq);
        let inner = Rc::new(EffectInner {
            runtime: runtime.clone(),
            id,
            seq,
            body: RefCell::new(body),
            cleanup: EffectCleanup::default(),
            has_run: Cell::new(false),
            disposed: Cell::new(false),
            injector: injector.as_ref().map(Injector::downgrade),
            registration: RefCell::new(None),
        });

        if let Some(injector) = &injector {
            let effect = inner.clone();
            match injector.destroy_ref().on_destroy(move || effect.dispose()) {
                Ok(handle) => *inner.registration.borrow_mut() = Some(handle),
                Err(err) => {
                    inner.dispose();
                    return Err(err);
                }
            }
        }

        runtime.register_effect(seq, inner.clone());
        Ok(EffectRef { inner })
    }

    /// Runs the body if this is the first run or a producer changed.
    pub(crate) fn run(&self) {
        if self.disposed.get() {
            return;
        }
        if self.has_run.get() {
            if !self.runtime.is_dirty(self.id) {
                return;
            }
            if !self.runtime.producers_changed(self.id) {
                self.runtime.set_clean(self.id);
                return;
            }
        }
        self.has_run.set(true);
        self.cleanup.run();

        let previous = self.runtime.begin_evaluation(self.id);
        let result = {
            let _tracking = track(Some(Consumer {
                runtime: self.runtime.id(),
                node: self.id,
            }));
            match self.body.try_borrow_mut() {
                Ok(mut body) => body(&self.cleanup),
                Err(_) => Ok(()),
            }
        };
        self.runtime.end_evaluation(self.id, previous);
        self.runtime.tracer().on_effect_run(self.seq);

        if let Err(err) = result {
            let injector = self.injector.as_ref().and_then(WeakInjector::upgrade);
            self.runtime.route_error(injector.as_ref(), &err);
        }
    }

    /// Drops a pending run so the next producer change schedules it again.
    pub(crate) fn abandon(&self) {
        if self.disposed.get() {
            return;
        }
        untracked(|| self.runtime.settle(self.id));
    }

    pub(crate) fn dispose(&self) {
        if self.disposed.replace(true) {
            return;
        }
        self.cleanup.run();
        self.runtime.remove_node(self.id);
        self.runtime.unregister_effect(self.seq);
        if let Some(handle) = self.registration.borrow_mut().take() {
            handle.unregister();
        }
    }
}

/// Handle to a scheduled effect.
///
/// Dropping the handle does not stop the effect; it keeps running until it
/// is destroyed explicitly or its injector is destroyed.
#[derive(Clone)]
pub struct EffectRef {
    inner: Rc<EffectInner>,
}

impl EffectRef {
    /// Destroys the effect. It never runs again, even if re-triggered.
    pub fn destroy(&self) {
        self.inner.dispose();
    }

    /// Returns `true` once the effect has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.inner.disposed.get()
    }
}
