use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::reactive::graph::{NodeId, NodeKind};
use crate::runtime::Runtime;

pub(crate) type EqualFn<T> = Rc<dyn Fn(&T, &T) -> bool>;

struct SignalInner<T> {
    runtime: Runtime,
    id: NodeId,
    value: RefCell<T>,
    equal: EqualFn<T>,
}

impl<T> Drop for SignalInner<T> {
    fn drop(&mut self) {
        self.runtime.remove_node(self.id);
    }
}

/// A writable reactive cell.
///
/// Reading with [`Signal::get`] inside a computed or effect body registers a
/// dependency. Writing a value that is not equal to the current one (per the
/// equality function, `PartialEq` by default) bumps the signal's version and
/// marks every consumer dirty.
///
/// This is cheap to clone - clones share the same cell.
pub struct Signal<T> {
    inner: Rc<SignalInner<T>>,
}

impl<T: 'static> Signal<T> {
    pub(crate) fn new(runtime: &Runtime, value: T, equal: EqualFn<T>) -> Self {
        let id = runtime.insert_node(NodeKind::Signal);
        Self {
            inner: Rc::new(SignalInner {
                runtime: runtime.clone(),
                id,
                value: RefCell::new(value),
                equal,
            }),
        }
    }

    /// Reads the value, tracking the dependency.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.with(T::clone)
    }

    /// Reads the value without tracking.
    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        self.inner.value.borrow().clone()
    }

    /// Borrows the value, tracking the dependency.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.inner.runtime.record_read(self.inner.id);
        f(&self.inner.value.borrow())
    }

    /// Replaces the value. Equal values are ignored.
    pub fn set(&self, value: T) {
        let changed = {
            let mut current = self.inner.value.borrow_mut();
            if (self.inner.equal)(&current, &value) {
                false
            } else {
                *current = value;
                true
            }
        };
        if changed {
            self.inner.runtime.notify_changed(self.inner.id);
        }
    }

    /// Computes a new value from the current one.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.inner.value.borrow());
        self.set(next);
    }

    /// A read-only view of this signal.
    pub fn as_readonly(&self) -> ReadSignal<T> {
        ReadSignal {
            signal: self.clone(),
        }
    }
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Signal").field(&self.inner.value.borrow()).finish()
    }
}

/// Read-only view of a [`Signal`].
pub struct ReadSignal<T> {
    signal: Signal<T>,
}

impl<T: 'static> ReadSignal<T> {
    /// Reads the value, tracking the dependency.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.signal.get()
    }

    /// Reads the value without tracking.
    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        self.signal.get_untracked()
    }

    /// Borrows the value, tracking the dependency.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.signal.with(f)
    }
}

impl<T> Clone for ReadSignal<T> {
    fn clone(&self) -> Self {
        Self {
            signal: self.signal.clone(),
        }
    }
}
