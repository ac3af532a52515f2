// src/worker/mod.rs

//! The worker contract and the supervision primitives built on it.
//!
//! - [`Worker`] is the minimal capability every managed unit exposes:
//!   request stop, wait for the terminal error.
//! - [`catacomb`] couples a primary task with any number of sub-workers into
//!   a single killable, waitable lifecycle.
//! - [`value`] holds a plain value for as long as it is alive, which is how
//!   static facts (such as the agent configuration) are published to the
//!   dependency engine.

pub mod catacomb;
pub mod value;

use std::any::Any;

use crate::errors::Result;
use crate::types::BoxFuture;

pub use catacomb::{Catacomb, DyingSignal};
pub use value::ValueWorker;

/// Upcast helper so `&dyn Worker` can be downcast to its concrete type.
///
/// Implemented for every sized `'static` type; call it through a `&dyn
/// Worker` (not through an `Arc`), otherwise the `Arc` itself is returned.
pub trait AsAny {
    fn as_any(&self) -> &dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// An abstract running task.
///
/// `kill` is idempotent and returns immediately. `wait` resolves once the
/// task and everything it owns has unwound; it may be awaited any number of
/// times and always yields the same result (`Ok(())` on a clean stop).
pub trait Worker: AsAny + Send + Sync + 'static {
    fn kill(&self);

    fn wait(&self) -> BoxFuture<'_, Result<()>>;
}

/// Kill a worker and wait for it to finish.
pub async fn stop(worker: &dyn Worker) -> Result<()> {
    worker.kill();
    worker.wait().await
}
