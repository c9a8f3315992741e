use std::cell::RefCell;
use std::rc::Rc;

use crate::reactive::computed::Derived;
use crate::reactive::signal::EqualFn;
use crate::reactive::untracked;
use crate::runtime::Runtime;

/// The source value and resulting value of the previous evaluation of a
/// [`LinkedSignal`].
#[derive(Debug, Clone, PartialEq)]
pub struct Previous<S, T> {
    /// Source value seen by the previous evaluation.
    pub source: S,
    /// Value of the signal just before this evaluation (possibly set locally).
    pub value: T,
}

/// A writable signal that resets whenever its source changes.
///
/// The value is `computation(source(), previous)` after every upstream
/// change, but it can also be written with [`LinkedSignal::set`]. A local
/// write persists until the next upstream change, which discards it.
///
/// # Example
///
/// ```ignore
/// let options = runtime.signal(vec!["a", "b"]);
/// let selected = runtime.linked_signal(
///     { let options = options.clone(); move || options.get() },
///     |options, _previous| options[0],
/// );
/// selected.set("b");            // local choice
/// options.set(vec!["c", "d"]);  // upstream change resets to "c"
/// ```
pub struct LinkedSignal<T> {
    derived: Rc<Derived<T>>,
}

impl<T: Clone + 'static> LinkedSignal<T> {
    pub(crate) fn new<S, F, C>(runtime: &Runtime, source: F, computation: C, equal: EqualFn<T>) -> Self
    where
        S: Clone + 'static,
        F: Fn() -> S + 'static,
        C: Fn(S, Option<Previous<S, T>>) -> T + 'static,
    {
        let last_source: RefCell<Option<S>> = RefCell::new(None);
        let compute = move |current: Option<&T>| {
            let source_value = source();
            let previous = match (last_source.borrow_mut().take(), current) {
                (Some(seen), Some(value)) => Some(Previous {
                    source: seen,
                    value: value.clone(),
                }),
                _ => None,
            };
            *last_source.borrow_mut() = Some(source_value.clone());
            computation(source_value, previous)
        };
        Self {
            derived: Derived::new(runtime, Box::new(compute), equal),
        }
    }

    /// Reads the value, tracking the dependency.
    pub fn get(&self) -> T {
        self.derived.with(T::clone)
    }

    /// Reads the value without tracking.
    pub fn get_untracked(&self) -> T {
        untracked(|| self.get())
    }

    /// Borrows the value, tracking the dependency.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.derived.with(f)
    }

    /// Overrides the value until the next upstream change.
    pub fn set(&self, value: T) {
        // settle any pending upstream change first so it cannot discard this write later
        untracked(|| self.derived.update());
        let changed = {
            let mut current = self.derived.value().borrow_mut();
            match current.as_ref() {
                Some(existing) if (self.derived.equal())(existing, &value) => false,
                _ => {
                    *current = Some(value);
                    true
                }
            }
        };
        if changed {
            self.derived.runtime().notify_changed(self.derived.id());
        }
    }

    /// Computes a new local value from the current one.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let next = f(&self.get_untracked());
        self.set(next);
    }
}

impl<T> Clone for LinkedSignal<T> {
    fn clone(&self) -> Self {
        Self {
            derived: self.derived.clone(),
        }
    }
}
