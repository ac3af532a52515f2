// src/manifold/context.rs

use std::any::{Any, type_name};
use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::debug;

use crate::errors::{EngineError, Result};
use crate::manifold::{OutputFn, output};
use crate::worker::Worker;

/// A running dependency as seen by a starting manifold.
#[derive(Clone)]
struct Resolved {
    worker: Arc<dyn Worker>,
    output: Option<OutputFn>,
}

/// Input resolution for one start attempt.
///
/// Built by the engine right before calling a manifold's start function.
/// Only declared inputs are resolvable; an input that is declared but not
/// running resolves to `Missing`.
#[derive(Clone)]
pub struct Context {
    name: String,
    inputs: BTreeMap<String, Option<Resolved>>,
}

impl Context {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            inputs: BTreeMap::new(),
        }
    }

    /// Declare `input` as running `worker`, exposing it through `output`.
    pub fn with_input(
        mut self,
        input: impl Into<String>,
        worker: Arc<dyn Worker>,
        output: Option<OutputFn>,
    ) -> Self {
        self.inputs
            .insert(input.into(), Some(Resolved { worker, output }));
        self
    }

    /// Declare `input` as not currently running.
    pub fn with_missing(mut self, input: impl Into<String>) -> Self {
        self.inputs.insert(input.into(), None);
        self
    }

    /// Name of the manifold being started.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check that `input` is declared and running without extracting
    /// anything from it.
    pub fn exists(&self, input: &str) -> Result<()> {
        self.resolve(input).map(|_| ())
    }

    /// Resolve `input` to a `T` through its manifold's output extractor.
    ///
    /// An input that cannot provide a `T` counts as not ready: the start
    /// attempt waits instead of failing.
    pub fn get<T: Any>(&self, input: &str) -> Result<T> {
        let resolved = self.resolve(input)?;
        let result = match &resolved.output {
            Some(extract) => output::extract(extract, &*resolved.worker),
            None => Err(EngineError::OutputMismatch {
                worker: "manifold without output",
                target: type_name::<T>(),
            }),
        };
        result.map_err(|err| match err {
            EngineError::OutputMismatch { .. } => {
                debug!(manifold = %self.name, input, error = %err, "input output unavailable");
                EngineError::Missing
            }
            other => other,
        })
    }

    fn resolve(&self, input: &str) -> Result<&Resolved> {
        match self.inputs.get(input) {
            None => Err(EngineError::UndeclaredInput(input.to_string())),
            Some(None) => Err(EngineError::Missing),
            Some(Some(resolved)) => Ok(resolved),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::ValueWorker;

    #[tokio::test]
    async fn resolves_declared_inputs() {
        let agent = ValueWorker::start("mysql".to_string()).unwrap();
        let out = output::output(|w: &ValueWorker<String>| w.value().clone());
        let ctx = Context::new("unit-provisioner")
            .with_input("agent", agent.clone(), Some(out))
            .with_missing("upgrade-steps-gate");

        assert_eq!(ctx.name(), "unit-provisioner");
        assert_eq!(ctx.get::<String>("agent").unwrap(), "mysql");
        assert!(ctx.exists("agent").is_ok());
        assert!(ctx.get::<String>("upgrade-steps-gate").unwrap_err().is_missing());
        assert!(matches!(
            ctx.get::<String>("termination"),
            Err(EngineError::UndeclaredInput(_))
        ));
        agent.kill();
    }

    #[tokio::test]
    async fn input_without_output_is_not_ready() {
        let agent = ValueWorker::start(()).unwrap();
        let ctx = Context::new("upgrader").with_input("agent", agent.clone(), None);

        assert!(ctx.exists("agent").is_ok());
        assert!(ctx.get::<()>("agent").unwrap_err().is_missing());
        agent.kill();
    }

    #[tokio::test]
    async fn wrong_output_type_is_not_ready() {
        let agent = ValueWorker::start("mysql".to_string()).unwrap();
        let out = output::output(|w: &ValueWorker<String>| w.value().clone());
        let ctx = Context::new("upgrader").with_input("agent", agent.clone(), Some(out));

        assert!(ctx.get::<u32>("agent").unwrap_err().is_missing());
        agent.kill();
    }
}
