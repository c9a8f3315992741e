use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use crate::reactive::graph::{NodeId, NodeKind, Refresh};
use crate::reactive::signal::EqualFn;
use crate::reactive::{track, untracked, Consumer};
use crate::runtime::Runtime;

pub(crate) type ComputeFn<T> = Box<dyn Fn(Option<&T>) -> T>;

/// Memoized, dependency-tracked value shared by [`Computed`] and
/// [`LinkedSignal`](crate::LinkedSignal).
pub(crate) struct Derived<T> {
    runtime: Runtime,
    id: NodeId,
    compute: ComputeFn<T>,
    value: RefCell<Option<T>>,
    equal: EqualFn<T>,
    computing: Cell<bool>,
}

impl<T: 'static> Derived<T> {
    pub(crate) fn new(runtime: &Runtime, compute: ComputeFn<T>, equal: EqualFn<T>) -> Rc<Self> {
        let id = runtime.insert_node(NodeKind::Computed);
        let derived = Rc::new(Self {
            runtime: runtime.clone(),
            id,
            compute,
            value: RefCell::new(None),
            equal,
            computing: Cell::new(false),
        });
        let hook: Weak<dyn Refresh> = Rc::downgrade(&derived) as Weak<dyn Refresh>;
        runtime.set_refresh_hook(id, hook);
        derived
    }

    pub(crate) fn id(&self) -> NodeId {
        self.id
    }

    pub(crate) fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub(crate) fn equal(&self) -> &EqualFn<T> {
        &self.equal
    }

    pub(crate) fn value(&self) -> &RefCell<Option<T>> {
        &self.value
    }

    /// Recomputes if a producer changed since the last evaluation.
    ///
    /// # Panics
    ///
    /// Panics if the value is read while it is being computed.
    pub(crate) fn update(&self) {
        if self.computing.get() {
            panic!("cycle detected: a computed value read itself while computing");
        }
        let has_value = self.value.borrow().is_some();
        if has_value && !self.runtime.is_dirty(self.id) {
            return;
        }
        if has_value && !self.runtime.producers_changed(self.id) {
            self.runtime.set_clean(self.id);
            return;
        }
        self.recompute();
    }

    fn recompute(&self) {
        self.computing.set(true);
        let previous_edges = self.runtime.begin_evaluation(self.id);
        let previous = self.value.borrow_mut().take();
        let next = {
            let _tracking = track(Some(Consumer {
                runtime: self.runtime.id(),
                node: self.id,
            }));
            (self.compute)(previous.as_ref())
        };
        self.runtime.end_evaluation(self.id, previous_edges);

        // an equal result keeps the old value and version
        let stored = match previous {
            Some(previous) if (self.equal)(&previous, &next) => previous,
            _ => {
                self.runtime.bump_version(self.id);
                next
            }
        };
        *self.value.borrow_mut() = Some(stored);
        self.computing.set(false);
    }

    /// Brings the value up to date, tracks the read and borrows the value.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.update();
        self.runtime.record_read(self.id);
        let value = self.value.borrow();
        match value.as_ref() {
            Some(value) => f(value),
            None => unreachable!("derived value is populated by update"),
        }
    }
}

impl<T: 'static> Refresh for Derived<T> {
    fn refresh(&self) {
        self.update();
    }
}

impl<T> Drop for Derived<T> {
    fn drop(&mut self) {
        self.runtime.remove_node(self.id);
    }
}

/// A memoized value derived from other reactive nodes.
///
/// The body runs lazily on the first read and again only when a producer it
/// read last time has changed. If the new result is equal to the previous one
/// the computed keeps its version, so its own consumers are not re-run.
///
/// # Example
///
/// ```ignore
/// let a = runtime.signal(1);
/// let b = runtime.signal(2);
/// let sum = runtime.computed({
///     let (a, b) = (a.clone(), b.clone());
///     move || a.get() + b.get()
/// });
/// assert_eq!(sum.get(), 3);
/// ```
pub struct Computed<T> {
    derived: Rc<Derived<T>>,
}

impl<T: 'static> Computed<T> {
    pub(crate) fn new(runtime: &Runtime, compute: impl Fn() -> T + 'static, equal: EqualFn<T>) -> Self {
        Self {
            derived: Derived::new(runtime, Box::new(move |_| compute()), equal),
        }
    }

    /// Reads the (possibly recomputed) value, tracking the dependency.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.derived.with(T::clone)
    }

    /// Reads the value without tracking.
    pub fn get_untracked(&self) -> T
    where
        T: Clone,
    {
        untracked(|| self.get())
    }

    /// Borrows the value, tracking the dependency.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.derived.with(f)
    }
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            derived: self.derived.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Computed")
            .field(&self.derived.value.borrow())
            .finish()
    }
}
