//! Tracer trait for observing resolution, scheduling and resource loading.
//!
//! The default [`NoopTracer`] ignores every event. Structured logs are
//! emitted separately through `tracing`; a tracer is for programmatic
//! observation (tests, inspectors, custom metrics).
//!
//! # Example
//!
//! ```ignore
//! use inject_flow::{Runtime, Tracer};
//!
//! struct CycleLogger;
//!
//! impl Tracer for CycleLogger {
//!     fn on_cycle_detected(&self, path: &[String]) {
//!         eprintln!("cycle: {}", path.join(" -> "));
//!     }
//! }
//!
//! let runtime = Runtime::builder().tracer(CycleLogger).build();
//! ```

use crate::resource::ResourceStatus;

/// Observer of runtime events.
///
/// All methods have default empty implementations, so you only need to
/// override the events you're interested in.
pub trait Tracer: 'static {
    /// A token was resolved by `injector`, either from its cache or by
    /// constructing it.
    #[inline]
    fn on_resolve(&self, _token: &str, _injector: &str, _cached: bool) {}

    /// A dependency cycle was detected during resolution.
    #[inline]
    fn on_cycle_detected(&self, _path: &[String]) {}

    /// An injector was destroyed.
    #[inline]
    fn on_injector_destroyed(&self, _injector: &str) {}

    /// An effect body ran. `effect` is its registration sequence number.
    #[inline]
    fn on_effect_run(&self, _effect: u64) {}

    /// A flush iteration is about to run `effects` effects.
    #[inline]
    fn on_flush(&self, _iteration: usize, _effects: usize) {}

    /// A resource load of `generation` entered `status`.
    #[inline]
    fn on_resource_state(&self, _generation: u64, _status: ResourceStatus) {}
}

/// A tracer that ignores every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {}
