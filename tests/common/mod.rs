#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use depengine::engine::{BackoffPolicy, Engine, EngineConfig};

pub use depengine_test_utils::{
    EnsureCall, FakeBroker, FakeStateSource, Harness, TestWorker, eventually, init_tracing,
    with_timeout,
};

/// Engine with deterministic timings: 1s idle poll, 1s..8s backoff, no jitter.
pub fn test_engine() -> Arc<Engine> {
    Engine::new(test_config()).unwrap()
}

pub fn test_config() -> EngineConfig {
    EngineConfig {
        idle_poll: Duration::from_secs(1),
        backoff: BackoffPolicy {
            base: Duration::from_secs(1),
            max: Duration::from_secs(8),
            factor: 2.0,
            jitter: 0.0,
        },
        ..EngineConfig::default()
    }
}
