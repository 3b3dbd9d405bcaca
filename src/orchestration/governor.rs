//! Bounded concurrency for Specialist workers.
//!
//! Each Manager gets a fixed number of slots. Requests beyond the ceiling
//! wait in a queue ordered by priority tier, FIFO within a tier, until a
//! permit is dropped or their wait runs out.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::core::WorkerId;
use crate::{clog_debug, Error, Result};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Medium,
    High,
    Critical,
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        };
        f.write_str(s)
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(Error::Validation(format!("unknown priority: {}", other))),
        }
    }
}

#[derive(Debug)]
struct Waiter {
    seq: u64,
    priority: Priority,
    tx: oneshot::Sender<()>,
}

#[derive(Debug, Default)]
struct Slots {
    active: usize,
    waiting: Vec<Waiter>,
}

impl Slots {
    /// Hand a free slot to the best waiter still listening.
    fn admit_next(&mut self, limit: usize) {
        while self.active < limit {
            let Some(best) = self
                .waiting
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
                .map(|(i, _)| i)
            else {
                return;
            };
            let waiter = self.waiting.remove(best);
            if waiter.tx.send(()).is_ok() {
                self.active += 1;
            }
        }
    }
}

#[derive(Debug)]
struct State {
    limit: usize,
    seq: u64,
    managers: HashMap<WorkerId, Slots>,
}

#[derive(Debug, Clone)]
pub struct Governor {
    state: Arc<Mutex<State>>,
}

impl Governor {
    pub fn new(limit: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                limit: limit.max(1),
                seq: 0,
                managers: HashMap::new(),
            })),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, State>> {
        self.state
            .lock()
            .map_err(|_| Error::invalid_state("governor state poisoned"))
    }

    fn permit(&self, manager: &WorkerId) -> SlotPermit {
        SlotPermit {
            state: self.state.clone(),
            manager: manager.clone(),
        }
    }

    /// Take a slot under `manager`, queueing for at most `wait`.
    pub async fn acquire(
        &self,
        manager: &WorkerId,
        priority: Priority,
        wait: Duration,
    ) -> Result<SlotPermit> {
        let (seq, mut rx) = {
            let mut state = self.lock()?;
            let limit = state.limit;
            state.seq += 1;
            let seq = state.seq;
            let slots = state.managers.entry(manager.clone()).or_default();
            if slots.active < limit && slots.waiting.is_empty() {
                slots.active += 1;
                return Ok(self.permit(manager));
            }
            let (tx, rx) = oneshot::channel();
            slots.waiting.push(Waiter { seq, priority, tx });
            clog_debug!(
                "Governor: {} queued at {} priority ({} waiting)",
                manager,
                priority,
                slots.waiting.len()
            );
            (seq, rx)
        };

        match tokio::time::timeout(wait, &mut rx).await {
            Ok(Ok(())) => Ok(self.permit(manager)),
            Ok(Err(_)) => Err(Error::Cancelled(format!("slot request under {}", manager))),
            Err(_) => {
                let mut state = self.lock()?;
                if let Some(slots) = state.managers.get_mut(manager) {
                    if let Some(pos) = slots.waiting.iter().position(|w| w.seq == seq) {
                        slots.waiting.remove(pos);
                        return Err(Error::Timeout(wait));
                    }
                }
                // Admitted between the timeout firing and taking the lock
                match rx.try_recv() {
                    Ok(()) => Ok(self.permit(manager)),
                    Err(_) => Err(Error::Timeout(wait)),
                }
            }
        }
    }

    /// Count an already-running worker against `manager`'s slots, even if
    /// that exceeds the ceiling (used when rebuilding state after a restart).
    pub fn adopt(&self, manager: &WorkerId) -> Result<SlotPermit> {
        let mut state = self.lock()?;
        state.managers.entry(manager.clone()).or_default().active += 1;
        Ok(self.permit(manager))
    }

    pub fn active(&self, manager: &WorkerId) -> usize {
        self.lock()
            .ok()
            .and_then(|s| s.managers.get(manager).map(|m| m.active))
            .unwrap_or(0)
    }

    pub fn waiting(&self, manager: &WorkerId) -> usize {
        self.lock()
            .ok()
            .and_then(|s| s.managers.get(manager).map(|m| m.waiting.len()))
            .unwrap_or(0)
    }
}

/// A held slot; dropping it frees the slot for the next waiter.
#[derive(Debug)]
pub struct SlotPermit {
    state: Arc<Mutex<State>>,
    manager: WorkerId,
}

impl SlotPermit {
    pub fn manager(&self) -> &WorkerId {
        &self.manager
    }
}

impl Drop for SlotPermit {
    fn drop(&mut self) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        let limit = state.limit;
        if let Some(slots) = state.managers.get_mut(&self.manager) {
            slots.active = slots.active.saturating_sub(1);
            slots.admit_next(limit);
        }
    }
}
