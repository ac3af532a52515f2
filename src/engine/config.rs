// src/engine/config.rs

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::engine::backoff::BackoffPolicy;
use crate::errors::{EngineError, Result};
use crate::worker::DyingSignal;

/// Decides whether an error should take down the whole engine.
pub type FatalFn = Arc<dyn Fn(&EngineError) -> bool + Send + Sync>;

/// Runtime settings for an [`Engine`](crate::engine::Engine).
#[derive(Clone)]
pub struct EngineConfig {
    /// Upper bound between two passes when nothing happens.
    pub idle_poll: Duration,
    pub backoff: BackoffPolicy,
    pub is_fatal: FatalFn,
    /// Process-wide stop signal; the engine shuts down when it fires.
    pub shutdown: Option<DyingSignal>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            idle_poll: Duration::from_secs(3),
            backoff: BackoffPolicy::default(),
            is_fatal: Arc::new(|err: &EngineError| matches!(err, EngineError::TerminateAgent)),
            shutdown: None,
        }
    }
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("idle_poll", &self.idle_poll)
            .field("backoff", &self.backoff)
            .field("shutdown", &self.shutdown.is_some())
            .finish_non_exhaustive()
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.idle_poll.is_zero() {
            return Err(EngineError::Config("idle poll interval must be > 0".into()));
        }
        self.backoff.validate()
    }

    pub fn with_fatal<F>(mut self, is_fatal: F) -> Self
    where
        F: Fn(&EngineError) -> bool + Send + Sync + 'static,
    {
        self.is_fatal = Arc::new(is_fatal);
        self
    }

    pub fn with_shutdown(mut self, shutdown: DyingSignal) -> Self {
        self.shutdown = Some(shutdown);
        self
    }
}
