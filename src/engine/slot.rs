// src/engine/slot.rs

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::time::Instant;

use crate::errors::EngineError;
use crate::manifold::Manifold;
use crate::types::SlotState;
use crate::worker::Worker;

/// Engine-owned state for one installed manifold.
pub(crate) struct Slot {
    pub manifold: Manifold,
    pub worker: Option<Arc<dyn Worker>>,
    /// Bumped on every successful start.
    pub generation: u64,
    /// Input generations observed when the current worker started.
    pub started_with: BTreeMap<String, u64>,
    pub started_at: Option<Instant>,
    /// Set when the engine asked the running worker to stop.
    pub stop_reason: Option<EngineError>,
    pub state: SlotState,
    pub failures: u32,
    pub retry_at: Option<Instant>,
    /// Set when the worker stopped as not ready: an input moving past
    /// `started_with` wakes the slot before `retry_at`.
    pub parked: bool,
    pub last_error: Option<EngineError>,
}

impl Slot {
    pub fn new(manifold: Manifold) -> Self {
        Self {
            manifold,
            worker: None,
            generation: 0,
            started_with: BTreeMap::new(),
            started_at: None,
            stop_reason: None,
            state: SlotState::Waiting,
            failures: 0,
            retry_at: None,
            parked: false,
            last_error: None,
        }
    }

    /// Generation of the running worker, if it is running and not being
    /// stopped.
    pub fn live_generation(&self) -> Option<u64> {
        match (&self.worker, &self.stop_reason) {
            (Some(_), None) => Some(self.generation),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.worker.is_none()
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.retry_at.is_none_or(|at| at <= now)
    }

    /// Ask the running worker to stop, remembering why.
    pub fn request_stop(&mut self, reason: EngineError) {
        if let Some(worker) = &self.worker {
            if self.stop_reason.is_none() {
                self.stop_reason = Some(reason);
                self.state = SlotState::Stopping;
                worker.kill();
            }
        }
    }

    /// Error a dependent sees when this slot is not live.
    pub fn unavailable_error(&self) -> EngineError {
        match (&self.stop_reason, &self.last_error) {
            (Some(reason), _) => reason.clone(),
            (None, Some(err)) if self.worker.is_none() => err.clone(),
            _ => EngineError::Bounce,
        }
    }
}
