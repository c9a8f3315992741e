//! Coalescing effect scheduler.
//!
//! Dirty effects are queued by their registration sequence number. Any number
//! of writes between two flushes produce a single flush request, and a flush
//! runs queued effects in registration order, repeating while effects dirty
//! other effects, up to a fixed iteration cap.

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, BTreeSet};
use std::rc::Rc;

use tracing::{trace, warn};

use crate::error::{InjectError, Result};
use crate::reactive::EffectInner;
use crate::runtime::Runtime;

/// Default cap on fixed-point iterations per flush.
pub const DEFAULT_MAX_FLUSH_ITERATIONS: usize = 100;

pub(crate) struct Scheduler {
    effects: RefCell<BTreeMap<u64, Rc<EffectInner>>>,
    queue: RefCell<BTreeSet<u64>>,
    flushing: Cell<bool>,
    requested: Cell<bool>,
    max_iterations: usize,
    on_flush_requested: Option<Rc<dyn Fn()>>,
}

impl Scheduler {
    pub(crate) fn new(max_iterations: usize, on_flush_requested: Option<Rc<dyn Fn()>>) -> Self {
        Self {
            effects: RefCell::new(BTreeMap::new()),
            queue: RefCell::new(BTreeSet::new()),
            flushing: Cell::new(false),
            requested: Cell::new(false),
            max_iterations,
            on_flush_requested,
        }
    }

    /// Tracks a new effect and queues its first run.
    pub(crate) fn register(&self, seq: u64, effect: Rc<EffectInner>) {
        self.effects.borrow_mut().insert(seq, effect);
        self.enqueue(seq);
    }

    pub(crate) fn unregister(&self, seq: u64) {
        self.queue.borrow_mut().remove(&seq);
        let removed = self.effects.borrow_mut().remove(&seq);
        drop(removed);
    }

    pub(crate) fn enqueue(&self, seq: u64) {
        self.queue.borrow_mut().insert(seq);
        if !self.requested.replace(true) {
            if let Some(notify) = &self.on_flush_requested {
                notify();
            }
        }
    }

    /// Returns `true` if effects are waiting for a flush.
    pub(crate) fn has_pending(&self) -> bool {
        !self.queue.borrow().is_empty()
    }

    /// Number of live effects.
    pub(crate) fn len(&self) -> usize {
        self.effects.borrow().len()
    }

    /// Runs queued effects until none is dirty.
    ///
    /// A nested call (from inside an effect) returns immediately; the outer
    /// flush picks up whatever the nested caller queued.
    ///
    /// # Errors
    ///
    /// `InjectError::SchedulerRunaway` when effects keep dirtying each other
    /// for more than the configured number of iterations. The remaining
    /// effects are dropped from the queue and will run again on their next
    /// change.
    pub(crate) fn flush(&self, runtime: &Runtime) -> Result<()> {
        if self.flushing.replace(true) {
            return Ok(());
        }
        let _flushing = FlushGuard(&self.flushing);

        let mut iteration = 0;
        loop {
            let batch: Vec<Rc<EffectInner>> = {
                let queued = std::mem::take(&mut *self.queue.borrow_mut());
                let effects = self.effects.borrow();
                queued
                    .iter()
                    .filter_map(|seq| effects.get(seq).cloned())
                    .collect()
            };
            if batch.is_empty() {
                break;
            }

            iteration += 1;
            if iteration > self.max_iterations {
                warn!(
                    iterations = self.max_iterations,
                    pending = batch.len(),
                    "effect flush did not settle, dropping pending effects"
                );
                for effect in &batch {
                    effect.abandon();
                }
                self.requested.set(false);
                return Err(InjectError::SchedulerRunaway {
                    iterations: self.max_iterations,
                });
            }

            trace!(iteration, effects = batch.len(), "flushing effects");
            runtime.tracer().on_flush(iteration, batch.len());
            for effect in batch {
                effect.run();
            }
        }
        self.requested.set(false);
        Ok(())
    }
}

struct FlushGuard<'a>(&'a Cell<bool>);

impl Drop for FlushGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}
