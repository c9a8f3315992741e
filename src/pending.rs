//! Tracking of background work started under an injector.

use std::cell::Cell;
use std::future::Future;
use std::rc::Rc;
use std::sync::Arc;

use tracing::error;

use crate::context::InjectionContext;
use crate::error::{InjectError, Result};
use crate::injector::WeakInjector;
use crate::runtime::Runtime;
use crate::token::Token;

thread_local! {
    static PENDING_TASKS: Token<PendingTasks> =
        Token::with_factory("PendingTasks", |ctx| Ok(PendingTasks::new(ctx)));
}

/// Counts in-flight background tasks and reports their failures.
///
/// `PendingTasks` is root-scoped and needs no provider: the first request
/// materializes a single instance in the root injector.
///
/// # Example
///
/// ```ignore
/// let tasks = injector.get(&PendingTasks::token())?;
/// tasks.run(async move {
///     sync_settings().await?;
///     Ok(())
/// });
/// runtime.run_until_stalled()?;
/// assert!(!tasks.has_pending());
/// ```
pub struct PendingTasks {
    runtime: Runtime,
    injector: WeakInjector,
    count: Rc<Cell<usize>>,
}

impl PendingTasks {
    fn new(ctx: &InjectionContext) -> Self {
        Self {
            runtime: ctx.runtime().clone(),
            injector: ctx.injector().downgrade(),
            count: Rc::new(Cell::new(0)),
        }
    }

    /// The root-scoped token for the shared instance.
    pub fn token() -> Token<PendingTasks> {
        PENDING_TASKS.with(Token::clone)
    }

    /// Marks a task as pending until the returned guard is dropped.
    pub fn add(&self) -> PendingTask {
        self.count.set(self.count.get() + 1);
        PendingTask {
            count: self.count.clone(),
        }
    }

    /// Returns `true` while any task is pending.
    pub fn has_pending(&self) -> bool {
        self.count.get() > 0
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.count.get()
    }

    /// Returns `true` if no task is pending.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs `task` on the runtime's executor, keeping it pending until it
    /// completes. A failure is routed to the nearest
    /// [`ErrorHandler`](crate::ErrorHandler) or the runtime's error hook.
    pub fn run(&self, task: impl Future<Output = anyhow::Result<()>> + 'static) -> Result<()> {
        let pending = self.add();
        let runtime = self.runtime.clone();
        let injector = self.injector.clone();
        self.runtime
            .spawn_local(async move {
                let result = task.await;
                drop(pending);
                if let Err(err) = result {
                    runtime.route_error(injector.upgrade().as_ref(), &err);
                }
            })
            .map_err(|err| {
                error!("failed to spawn pending task: {err}");
                InjectError::Factory {
                    token: PendingTasks::token().to_string(),
                    error: Arc::new(anyhow::Error::from(err)),
                }
            })
    }
}

/// Guard returned by [`PendingTasks::add`].
pub struct PendingTask {
    count: Rc<Cell<usize>>,
}

impl PendingTask {
    /// Marks the task complete.
    pub fn done(self) {}
}

impl Drop for PendingTask {
    fn drop(&mut self) {
        self.count.set(self.count.get().saturating_sub(1));
    }
}
