// src/manifold/output.rs

//! The single typed seam between a running worker and its dependents.
//!
//! Dependents never see a concrete worker type; they ask their [`Context`]
//! for a `T`, and the dependency's output extractor decides whether its
//! worker can provide one.
//!
//! [`Context`]: crate::manifold::Context

use std::any::{Any, type_name};
use std::sync::Arc;

use crate::errors::{EngineError, Result};
use crate::manifold::OutputFn;
use crate::worker::Worker;

/// Build an output extractor for workers of type `W` exposing a `T`.
///
/// The extractor fails with `OutputMismatch` when the running worker is not
/// a `W` or the dependent asked for something other than `T`.
pub fn output<W, T, F>(extract: F) -> OutputFn
where
    W: Worker,
    T: Any,
    F: Fn(&W) -> T + Send + Sync + 'static,
{
    Arc::new(move |worker: &dyn Worker, out: &mut dyn Any| -> Result<()> {
        let mismatch = || EngineError::OutputMismatch {
            worker: type_name::<W>(),
            target: type_name::<T>(),
        };
        let worker = worker.as_any().downcast_ref::<W>().ok_or_else(mismatch)?;
        let slot = out.downcast_mut::<Option<T>>().ok_or_else(mismatch)?;
        *slot = Some(extract(worker));
        Ok(())
    })
}

/// Run `extract` against `worker`, asking for a `T`.
///
/// A mismatch always names the requested `T`, not what the extractor offers.
pub(crate) fn extract<T: Any>(extract: &OutputFn, worker: &dyn Worker) -> Result<T> {
    let mut slot: Option<T> = None;
    extract(worker, &mut slot).map_err(|err| match err {
        EngineError::OutputMismatch { worker, .. } => EngineError::OutputMismatch {
            worker,
            target: type_name::<T>(),
        },
        other => other,
    })?;
    slot.ok_or(EngineError::OutputMismatch {
        worker: "worker",
        target: type_name::<T>(),
    })
}
