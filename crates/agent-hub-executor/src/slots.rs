//! Per-session bookkeeping for the execution bridge.
//!
//! Two layers keep a session's invocations from overlapping:
//! - `InFlight` counts submissions per key across threads and enforces
//!   the [`BusyPolicy`] at submit time.
//! - `Lanes` lives on the run-loop and hands out one async mutex per key,
//!   so queued invocations for the same session run one after another.

use std::{
    cell::RefCell,
    collections::HashMap,
    rc::Rc,
    sync::{Arc, Mutex, PoisonError},
};

use agent_hub_core::SessionKey;
use serde::{Deserialize, Serialize};

/// What to do with a submission for a session that already has one in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusyPolicy {
    /// Queue behind the running invocation (FIFO per session).
    #[default]
    Queue,
    /// Fail fast with `SessionBusy`.
    Reject,
}

type Counts = Arc<Mutex<HashMap<SessionKey, usize>>>;

/// Thread-safe submission counter.
#[derive(Clone, Default)]
pub(crate) struct InFlight {
    counts: Counts,
}

impl InFlight {
    /// Register a submission for `key`.
    ///
    /// Returns the key back if the policy rejects it.
    pub(crate) fn acquire(&self, key: &str, policy: BusyPolicy) -> Result<InFlightSlot, SessionKey> {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        let count = counts.entry(key.to_string()).or_insert(0);
        if *count > 0 && policy == BusyPolicy::Reject {
            return Err(key.to_string());
        }
        *count += 1;
        Ok(InFlightSlot {
            counts: Arc::clone(&self.counts),
            key: key.to_string(),
        })
    }

    /// Number of submissions for `key` that have not finished.
    pub(crate) fn count(&self, key: &str) -> usize {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(key)
            .copied()
            .unwrap_or(0)
    }
}

/// Releases its submission when dropped, whatever happened to the job.
pub(crate) struct InFlightSlot {
    counts: Counts,
    key: SessionKey,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(count) = counts.get_mut(&self.key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(&self.key);
            }
        }
    }
}

/// Run-loop-local per-session mutexes.
#[derive(Default)]
pub(crate) struct Lanes {
    lanes: RefCell<HashMap<SessionKey, Rc<tokio::sync::Mutex<()>>>>,
}

impl Lanes {
    /// Get or create the lane for `key`.
    pub(crate) fn get(&self, key: &str) -> Rc<tokio::sync::Mutex<()>> {
        Rc::clone(
            self.lanes
                .borrow_mut()
                .entry(key.to_string())
                .or_insert_with(|| Rc::new(tokio::sync::Mutex::new(()))),
        )
    }

    /// Drop the lane once nobody but the map and `lane` refer to it.
    pub(crate) fn release(&self, key: &str, lane: Rc<tokio::sync::Mutex<()>>) {
        let mut lanes = self.lanes.borrow_mut();
        if Rc::strong_count(&lane) == 2 {
            lanes.remove(key);
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.lanes.borrow().len()
    }
}
