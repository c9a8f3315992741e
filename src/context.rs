//! Injection context.
//!
//! Factories receive an explicit [`InjectionContext`]. While a factory, an
//! environment initializer or a [`run_in_injection_context`] closure runs,
//! the same injector is also installed as the thread's current injector so
//! that [`request_injection`] and context-bound constructors such as effects
//! can find it.

use std::cell::RefCell;
use std::rc::Rc;

use crate::destroy::DestroyRef;
use crate::error::{InjectError, Result};
use crate::injector::Injector;
use crate::provider::InjectFlags;
use crate::runtime::Runtime;
use crate::token::Token;

thread_local! {
    static CURRENT_INJECTOR: RefCell<Option<Injector>> = const { RefCell::new(None) };
}

/// Handle to the injector a factory is running in.
#[derive(Clone)]
pub struct InjectionContext {
    injector: Injector,
}

impl InjectionContext {
    pub(crate) fn new(injector: Injector) -> Self {
        Self { injector }
    }

    /// Resolves a required token from the context injector.
    pub fn inject<T: 'static>(&self, token: &Token<T>) -> Result<Rc<T>> {
        self.injector.get(token)
    }

    /// Resolves a token with explicit flags.
    pub fn inject_with<T: 'static>(&self, token: &Token<T>, flags: InjectFlags) -> Result<Option<Rc<T>>> {
        self.injector.get_with(token, flags)
    }

    /// Resolves every contribution to a multi-provider token.
    pub fn inject_multi<T: 'static>(&self, token: &Token<T>) -> Result<Vec<Rc<T>>> {
        self.injector.get_multi(token)
    }

    /// The context injector.
    pub fn injector(&self) -> &Injector {
        &self.injector
    }

    /// Teardown registry of the context injector.
    pub fn destroy_ref(&self) -> DestroyRef {
        self.injector.destroy_ref()
    }

    /// Runtime owning the context injector.
    pub fn runtime(&self) -> &Runtime {
        self.injector.runtime()
    }
}

/// Restores the previous current injector when dropped.
pub(crate) struct ContextGuard {
    previous: Option<Injector>,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        let previous = self.previous.take();
        CURRENT_INJECTOR.with(|current| *current.borrow_mut() = previous);
    }
}

pub(crate) fn enter(injector: &Injector) -> ContextGuard {
    let previous = CURRENT_INJECTOR.with(|current| current.borrow_mut().replace(injector.clone()));
    ContextGuard { previous }
}

/// Runs `f` with `injector` as the current injection context.
///
/// # Example
///
/// ```ignore
/// run_in_injection_context(&injector, |ctx| {
///     let config = request_injection(&CONFIG)?;
///     ctx.runtime().effect(move |_| { /* ... */ Ok(()) })
/// })?;
/// ```
pub fn run_in_injection_context<R>(injector: &Injector, f: impl FnOnce(&InjectionContext) -> R) -> R {
    let _guard = enter(injector);
    f(&InjectionContext::new(injector.clone()))
}

/// The current injector, if a context is active.
pub fn current_injector() -> Option<Injector> {
    CURRENT_INJECTOR.with(|current| current.borrow().clone())
}

/// Returns the active context or an [`InjectError::InjectionContext`]
/// naming `operation`.
pub fn assert_in_injection_context(operation: &str) -> Result<InjectionContext> {
    current_injector()
        .map(InjectionContext::new)
        .ok_or_else(|| InjectError::InjectionContext {
            operation: operation.to_string(),
        })
}

/// Resolves `token` from the current injection context.
///
/// # Errors
///
/// [`InjectError::InjectionContext`] when called outside a context, which is
/// a programming error distinct from a missing provider.
pub fn request_injection<T: 'static>(token: &Token<T>) -> Result<Rc<T>> {
    assert_in_injection_context("request_injection")?.inject(token)
}

/// Like [`request_injection`] with explicit flags.
pub fn request_injection_with<T: 'static>(token: &Token<T>, flags: InjectFlags) -> Result<Option<Rc<T>>> {
    assert_in_injection_context("request_injection")?.inject_with(token, flags)
}
