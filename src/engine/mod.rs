// src/engine/mod.rs

//! Dependency engine.
//!
//! The engine keeps one worker running per installed manifold:
//! - a slot starts once every input has a running worker;
//! - when an input restarts or stops, its dependents are bounced;
//! - failing workers are retried with exponential backoff;
//! - killing the engine stops every worker it started.
//!
//! The pure slot state machine lives in [`core`]; the async shell that
//! owns it, watches workers and exposes the [`Engine`] worker is
//! implemented in [`runtime`].

pub mod backoff;
pub mod config;
pub mod core;
pub mod report;
pub mod runtime;
mod slot;

pub use backoff::BackoffPolicy;
pub use config::{EngineConfig, FatalFn};
pub use core::{EngineCommand, EngineCore};
pub use report::{Report, SlotReport};
pub use runtime::{Engine, install_all};
