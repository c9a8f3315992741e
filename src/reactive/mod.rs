//! Reactive graph: signals, computed values, linked signals and effects.
//!
//! Dependencies are discovered while a computed or effect body runs: every
//! signal or computed read in that window becomes a producer of the running
//! node. Writes only mark consumers dirty; derived values are recomputed when
//! pulled, and effects are queued for the next flush.

mod computed;
mod effect;
pub(crate) mod graph;
mod linked;
mod signal;

use std::cell::Cell;

pub use computed::Computed;
pub use effect::{EffectCleanup, EffectOptions, EffectRef};
pub(crate) use effect::EffectInner;
pub use linked::{LinkedSignal, Previous};
pub use signal::{ReadSignal, Signal};

use graph::NodeId;

/// The node whose evaluation is currently collecting dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Consumer {
    pub(crate) runtime: u64,
    pub(crate) node: NodeId,
}

thread_local! {
    static ACTIVE_CONSUMER: Cell<Option<Consumer>> = const { Cell::new(None) };
}

/// Restores the previously active consumer when dropped.
pub(crate) struct TrackingGuard {
    previous: Option<Consumer>,
}

impl Drop for TrackingGuard {
    fn drop(&mut self) {
        ACTIVE_CONSUMER.with(|active| active.set(self.previous));
    }
}

pub(crate) fn track(consumer: Option<Consumer>) -> TrackingGuard {
    let previous = ACTIVE_CONSUMER.with(|active| active.replace(consumer));
    TrackingGuard { previous }
}

pub(crate) fn active_consumer() -> Option<Consumer> {
    ACTIVE_CONSUMER.with(Cell::get)
}

/// Runs `f` without registering any dependency, even inside a computed or
/// effect body.
///
/// # Example
///
/// ```ignore
/// runtime.effect(move |_| {
///     let count = count.get();            // tracked
///     let label = untracked(|| label.get()); // not tracked
///     println!("{label}: {count}");
///     Ok(())
/// })?;
/// ```
pub fn untracked<R>(f: impl FnOnce() -> R) -> R {
    let _guard = track(None);
    f()
}
