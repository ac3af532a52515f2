// src/types.rs

//! Small shared types used across modules.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

/// Boxed, sendable future. Used at trait seams instead of `async fn` so the
/// traits stay object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Diagnostic state of a single engine slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// No worker; waiting for inputs (or for an input to report ready).
    Waiting,
    /// A worker is running.
    Started,
    /// The engine asked the worker to stop and is waiting for it.
    Stopping,
    /// The last start (or the last worker) failed; retry is scheduled.
    Failed,
    /// The worker exited on its own without error; restart is scheduled.
    Stopped,
}

impl fmt::Display for SlotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SlotState::Waiting => "waiting",
            SlotState::Started => "started",
            SlotState::Stopping => "stopping",
            SlotState::Failed => "failed",
            SlotState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Lifecycle of the engine as a whole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Started,
    Stopping,
    Stopped,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::Started => "started",
            EngineState::Stopping => "stopping",
            EngineState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}
