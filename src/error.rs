//! Error types for resolution, scheduling and resource loading.

use std::sync::Arc;

/// Result alias used throughout the crate.
pub type Result<T, E = InjectError> = std::result::Result<T, E>;

/// Errors raised by injectors, the effect scheduler and resources.
///
/// Factories and loaders report failures as [`anyhow::Error`]. When such an
/// error wraps an `InjectError` (for example a cycle detected while a factory
/// resolved its own dependencies) the structured error is recovered at the
/// injector boundary; anything else becomes [`InjectError::Factory`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum InjectError {
    /// No provider exists for the token anywhere on the walked injector chain.
    #[error("no provider for {token} (requested from {injector})")]
    ProviderNotFound {
        /// Display form of the missing token.
        token: String,
        /// Name of the injector the request originated from.
        injector: String,
    },

    /// A token was requested while its own construction was still in progress.
    ///
    /// The `path` lists the tokens forming the cycle, starting and ending with
    /// the repeated token.
    #[error("cyclic dependency detected: {}", path.join(" -> "))]
    CyclicDependency {
        /// Tokens forming the cycle.
        path: Vec<String>,
    },

    /// A context-bound operation ran while no injector context was active.
    #[error("{operation} can only be used within an injection context")]
    InjectionContext {
        /// Name of the operation that needed the context.
        operation: String,
    },

    /// The injector (or one of its ancestors) was destroyed.
    #[error("injector {injector} has already been destroyed")]
    InjectorDestroyed {
        /// Name of the destroyed injector.
        injector: String,
    },

    /// An effect flush kept producing new dirty effects past the configured cap.
    #[error("effect flush did not settle after {iterations} iterations")]
    SchedulerRunaway {
        /// The iteration cap that was exceeded.
        iterations: usize,
    },

    /// A resource loader failed.
    #[error("resource load (generation {generation}) failed: {error}")]
    ResourceLoad {
        /// Generation of the load that failed.
        generation: u64,
        /// The loader's error.
        error: Arc<anyhow::Error>,
    },

    /// A provider declaration was rejected while building the record table.
    #[error("invalid provider for {token}: {reason}")]
    InvalidProvider {
        /// Display form of the provided token.
        token: String,
        /// Why the declaration was rejected.
        reason: String,
    },

    /// The stored value for a token does not have the requested type.
    #[error("value provided for {token} is not a {expected}")]
    TypeMismatch {
        /// Display form of the token.
        token: String,
        /// Type name the caller asked for.
        expected: &'static str,
    },

    /// A user factory failed.
    ///
    /// Unlike cycles or missing providers these are raised by application code.
    /// The construction is not memoized, so a later `get` retries the factory.
    #[error("factory for {token} failed: {error}")]
    Factory {
        /// Display form of the token being constructed.
        token: String,
        /// The factory's error.
        error: Arc<anyhow::Error>,
    },
}

impl InjectError {
    /// Returns the inner user error for [`InjectError::Factory`] and
    /// [`InjectError::ResourceLoad`].
    pub fn user_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            InjectError::Factory { error, .. } | InjectError::ResourceLoad { error, .. } => {
                Some(error)
            }
            _ => None,
        }
    }

    /// Attempts to downcast the user error to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.user_error().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if this is a user error of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }

    /// Converts an error returned by user code into an `InjectError`,
    /// recovering structured errors that passed through `anyhow`.
    pub(crate) fn from_user(token: impl Into<String>, err: anyhow::Error) -> Self {
        match err.downcast::<InjectError>() {
            Ok(inner) => inner,
            Err(err) => InjectError::Factory {
                token: token.into(),
                error: Arc::new(err),
            },
        }
    }
}
