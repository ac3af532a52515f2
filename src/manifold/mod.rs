// src/manifold/mod.rs

//! Declarative description of supervised worker nodes.
//!
//! A [`Manifold`] names its inputs, knows how to start its worker given a
//! [`Context`] that resolves those inputs, and optionally:
//! - exposes a typed facet of its running worker through an output
//!   extractor (see [`output`]);
//! - filters the errors that would bounce it when an input changes.
//!
//! Manifolds are built once at process construction and never mutated.

pub mod context;
pub mod graph;
pub mod output;

use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::errors::{EngineError, Result};
use crate::worker::Worker;

pub use context::Context;
pub use graph::ManifoldGraph;
pub use output::output;

/// Start factory: builds a worker from resolved inputs.
///
/// Must not block; long-running setup belongs inside the worker.
pub type StartFn = Arc<dyn Fn(&Context) -> Result<Arc<dyn Worker>> + Send + Sync>;

/// Output extractor: writes a typed facet of `worker` into `out`, which is
/// always an `&mut Option<T>` for the requested `T`.
pub type OutputFn = Arc<dyn Fn(&dyn Worker, &mut dyn Any) -> Result<()> + Send + Sync>;

/// Input filter: given the input name and the error that would bounce this
/// manifold, returns the error to apply, or `None` to keep running.
pub type FilterFn = Arc<dyn Fn(&str, EngineError) -> Option<EngineError> + Send + Sync>;

/// All manifolds of a process, keyed by name.
pub type Manifolds = BTreeMap<String, Manifold>;

#[derive(Clone)]
pub struct Manifold {
    pub inputs: Vec<String>,
    pub start: StartFn,
    pub output: Option<OutputFn>,
    pub filter: Option<FilterFn>,
}

impl Manifold {
    pub fn new<I, S, F>(inputs: I, start: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(&Context) -> Result<Arc<dyn Worker>> + Send + Sync + 'static,
    {
        Self {
            inputs: inputs.into_iter().map(Into::into).collect(),
            start: Arc::new(start),
            output: None,
            filter: None,
        }
    }

    pub fn with_output(mut self, output: OutputFn) -> Self {
        self.output = Some(output);
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&str, EngineError) -> Option<EngineError> + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }
}

impl fmt::Debug for Manifold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Manifold")
            .field("inputs", &self.inputs)
            .field("output", &self.output.is_some())
            .field("filter", &self.filter.is_some())
            .finish_non_exhaustive()
    }
}

/// Convenience for manifolds without inputs.
pub const NO_INPUTS: [&str; 0] = [];
