//! Per-injector teardown registry.

use std::cell::{Cell, RefCell};
use std::rc::{Rc, Weak};

use crate::error::{InjectError, Result};

/// Lifecycle hook for values constructed through
/// [`ClassFactory::destroyable`](crate::ClassFactory::destroyable).
pub trait OnDestroy {
    /// Called once when the owning injector is destroyed.
    fn on_destroy(&self);
}

type Callback = Box<dyn FnOnce()>;

struct Registry {
    owner: String,
    callbacks: RefCell<Vec<(u64, Callback)>>,
    next_id: Cell<u64>,
    destroyed: Cell<bool>,
}

/// Teardown callbacks of one injector, run in registration order when the
/// injector is destroyed.
///
/// Effects and resources register here so that destroying an injector tears
/// down every reactive subscription created under it.
#[derive(Clone)]
pub struct DestroyRef {
    registry: Rc<Registry>,
}

impl DestroyRef {
    pub(crate) fn new(owner: impl Into<String>) -> Self {
        Self {
            registry: Rc::new(Registry {
                owner: owner.into(),
                callbacks: RefCell::new(Vec::new()),
                next_id: Cell::new(0),
                destroyed: Cell::new(false),
            }),
        }
    }

    /// Registers `callback`. The returned handle can unregister it again.
    ///
    /// # Errors
    ///
    /// [`InjectError::InjectorDestroyed`] if the owner is already destroyed.
    pub fn on_destroy(&self, callback: impl FnOnce() + 'static) -> Result<DestroyHandle> {
        if self.registry.destroyed.get() {
            return Err(InjectError::InjectorDestroyed {
                injector: self.registry.owner.clone(),
            });
        }
        let id = self.registry.next_id.get();
        self.registry.next_id.set(id + 1);
        self.registry
            .callbacks
            .borrow_mut()
            .push((id, Box::new(callback)));
        Ok(DestroyHandle {
            registry: Rc::downgrade(&self.registry),
            id,
        })
    }

    /// Returns `true` once the owner has been destroyed.
    pub fn destroyed(&self) -> bool {
        self.registry.destroyed.get()
    }

    /// Number of callbacks still registered.
    pub fn len(&self) -> usize {
        self.registry.callbacks.borrow().len()
    }

    /// Returns `true` if no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Marks the registry destroyed and runs every callback once.
    pub(crate) fn run(&self) {
        if self.registry.destroyed.replace(true) {
            return;
        }
        let callbacks = std::mem::take(&mut *self.registry.callbacks.borrow_mut());
        for (_, callback) in callbacks {
            callback();
        }
    }
}

/// Handle returned by [`DestroyRef::on_destroy`].
pub struct DestroyHandle {
    registry: Weak<Registry>,
    id: u64,
}

impl DestroyHandle {
    /// Removes the callback without running it. A no-op once the owner has
    /// been destroyed.
    pub fn unregister(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry
                .callbacks
                .borrow_mut()
                .retain(|(id, _)| *id != self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn callbacks_run_once_in_registration_order() {
        let log = Rc::new(RefCell::new(Vec::new()));
        let destroy_ref = DestroyRef::new("test");
        for i in 0..3 {
            let log = log.clone();
            destroy_ref.on_destroy(move || log.borrow_mut().push(i)).unwrap();
        }

        destroy_ref.run();
        destroy_ref.run();

        assert_eq!(*log.borrow(), vec![0, 1, 2]);
        assert!(destroy_ref.destroyed());
    }

    #[test]
    fn unregistered_callbacks_do_not_run() {
        let ran = Rc::new(Cell::new(false));
        let destroy_ref = DestroyRef::new("test");
        let handle = {
            let ran = ran.clone();
            destroy_ref.on_destroy(move || ran.set(true)).unwrap()
        };
        handle.unregister();

        destroy_ref.run();
        assert!(!ran.get());
    }

    #[test]
    fn registering_after_destroy_fails() {
        let destroy_ref = DestroyRef::new("gone");
        destroy_ref.run();
        let err = destroy_ref.on_destroy(|| {}).err().unwrap();
        assert!(matches!(err, InjectError::InjectorDestroyed { injector } if injector == "gone"));
    }
}
