// src/errors.rs

//! Crate-wide error type.
//!
//! `EngineError` is both the failure type and the engine's control
//! vocabulary: `Missing`, `Bounce`, `Uninstall` and `Dying` are sentinels
//! that steer restart policy instead of reporting a fault. The type is
//! `Clone` because a single terminal error is handed to every waiter.

use std::sync::Arc;

use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum EngineError {
    /// A dependency is not running, or external state is not defined yet.
    #[error("dependency not available")]
    Missing,

    /// Restart the worker right away (dependency output changed).
    #[error("restart immediately")]
    Bounce,

    /// The manifold should be removed from the engine for good.
    #[error("resource permanently unavailable")]
    Uninstall,

    #[error("not found: {0}")]
    NotFound(String),

    /// The worker was asked to stop.
    #[error("worker is dying")]
    Dying,

    #[error("agent should be terminated")]
    TerminateAgent,

    #[error("{0:?} manifold already installed")]
    DuplicateName(String),

    #[error("{name:?} manifold depends on unknown {input:?} manifold")]
    UnknownInput { name: String, input: String },

    #[error("{0:?} manifold cannot depend on itself")]
    SelfDependency(String),

    #[error("cycle detected in manifold graph involving {0:?}")]
    Cycle(String),

    #[error("undeclared input {0:?} requested")]
    UndeclaredInput(String),

    #[error("cannot extract {target} from {worker}")]
    OutputMismatch {
        worker: &'static str,
        target: &'static str,
    },

    #[error("supervision unit already invoked")]
    AlreadyInvoked,

    #[error("configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("TOML parsing error: {0}")]
    Toml(Arc<toml::de::Error>),

    #[error("watcher closed channel")]
    WatcherClosed,

    #[error("panic in worker: {0}")]
    Panicked(String),

    #[error("{0:#}")]
    Other(Arc<anyhow::Error>),
}

impl EngineError {
    /// Wrap any error (or message) as `Other`.
    pub fn other(err: impl Into<anyhow::Error>) -> Self {
        EngineError::Other(Arc::new(err.into()))
    }

    /// Add context to this error, keeping it inspectable through the chain.
    pub fn annotate(self, context: impl Into<String>) -> Self {
        let context = context.into();
        EngineError::Other(Arc::new(anyhow::Error::new(self).context(context)))
    }

    pub fn is_missing(&self) -> bool {
        matches!(self, EngineError::Missing)
    }

    pub fn is_bounce(&self) -> bool {
        matches!(self, EngineError::Bounce)
    }

    pub fn is_uninstall(&self) -> bool {
        matches!(self, EngineError::Uninstall)
    }

    pub fn is_dying(&self) -> bool {
        matches!(self, EngineError::Dying)
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

impl From<anyhow::Error> for EngineError {
    fn from(err: anyhow::Error) -> Self {
        // Keep sentinels recognisable when they round-trip through anyhow,
        // but never strip context that was added on top of them.
        if err.chain().count() == 1 {
            if let Some(inner) = err.downcast_ref::<EngineError>() {
                return inner.clone();
            }
        }
        EngineError::Other(Arc::new(err))
    }
}

impl From<std::io::Error> for EngineError {
    fn from(err: std::io::Error) -> Self {
        EngineError::Io(Arc::new(err))
    }
}

impl From<toml::de::Error> for EngineError {
    fn from(err: toml::de::Error) -> Self {
        EngineError::Toml(Arc::new(err))
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn annotate_keeps_message_chain() {
        let err = EngineError::NotFound("mysql/0".into()).annotate("cannot fetch spec");
        let text = err.to_string();
        assert!(text.contains("cannot fetch spec"));
        assert!(text.contains("mysql/0"));
        assert!(!err.is_not_found());
    }

    #[test]
    fn sentinels_survive_anyhow_round_trip() {
        let err: EngineError = anyhow::Error::new(EngineError::Missing).into();
        assert!(err.is_missing());
    }
}
