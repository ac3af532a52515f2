use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use depengine::errors::{EngineError, Result};
use depengine::manifold::{Manifold, output};
use depengine::types::BoxFuture;
use depengine::worker::{Catacomb, Worker};
use tokio::sync::watch;

/// A worker that publishes a string and runs until killed or told to exit.
#[derive(Debug)]
pub struct TestWorker {
    value: String,
    exit: watch::Sender<Option<Result<()>>>,
    catacomb: Catacomb,
}

impl TestWorker {
    pub fn start(value: impl Into<String>) -> Result<Arc<Self>> {
        let catacomb = Catacomb::new();
        let dying = catacomb.dying();
        let (exit, mut exit_rx) = watch::channel(None);

        catacomb.invoke(async move {
            tokio::select! {
                _ = dying => Err(EngineError::Dying),
                exited = exit_rx.wait_for(Option::is_some) => match exited {
                    Ok(result) => result.clone().unwrap_or(Ok(())),
                    Err(_) => Err(EngineError::Dying),
                },
            }
        })?;

        Ok(Arc::new(Self {
            value: value.into(),
            exit,
            catacomb,
        }))
    }

    pub fn value(&self) -> String {
        self.value.clone()
    }

    pub fn is_dying(&self) -> bool {
        self.catacomb.is_dying()
    }

    /// Stop on its own with `result`, as if the work finished or failed.
    pub fn exit(&self, result: Result<()>) {
        self.exit.send_replace(Some(result));
    }
}

impl Worker for TestWorker {
    fn kill(&self) {
        self.catacomb.kill(None);
    }

    fn wait(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.catacomb.wait())
    }
}

/// One successful start of a harness manifold.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Start {
    pub name: String,
    /// Input name → value published by that input when the start happened.
    pub inputs: BTreeMap<String, String>,
    pub value: String,
}

#[derive(Default)]
struct HarnessState {
    values: BTreeMap<String, String>,
    failures: BTreeMap<String, EngineError>,
    attempts: BTreeMap<String, usize>,
    starts: Vec<Start>,
    workers: BTreeMap<String, Arc<TestWorker>>,
}

/// Builds manifolds backed by [`TestWorker`]s and records what the engine
/// does with them.
///
/// Each worker publishes the harness value for its manifold (defaulting to
/// `"<name>:v1"`); starts fail while a failure is set for the manifold.
#[derive(Clone, Default)]
pub struct Harness {
    state: Arc<Mutex<HarnessState>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn manifold(&self, name: &str, inputs: &[&str]) -> Manifold {
        let harness = self.clone();
        let name = name.to_string();
        let declared: Vec<String> = inputs.iter().map(|s| s.to_string()).collect();
        let names = declared.clone();

        Manifold::new(declared, move |ctx| {
            let mut state = harness.lock();
            *state.attempts.entry(name.clone()).or_default() += 1;
            if let Some(err) = state.failures.get(&name) {
                return Err(err.clone());
            }

            let mut seen = BTreeMap::new();
            for input in &names {
                let value: String = ctx.get(input)?;
                seen.insert(input.clone(), value);
            }

            let value = state
                .values
                .get(&name)
                .cloned()
                .unwrap_or_else(|| format!("{name}:v1"));
            let worker = TestWorker::start(value.clone())?;
            state.starts.push(Start {
                name: name.clone(),
                inputs: seen,
                value,
            });
            state.workers.insert(name.clone(), worker.clone());
            let worker: Arc<dyn Worker> = worker;
            Ok(worker)
        })
        .with_output(output(TestWorker::value))
    }

    /// Value published by workers started from now on.
    pub fn set_value(&self, name: &str, value: &str) {
        self.lock().values.insert(name.to_string(), value.to_string());
    }

    /// Make every start of `name` fail with `err` until cleared.
    pub fn fail_starts(&self, name: &str, err: EngineError) {
        self.lock().failures.insert(name.to_string(), err);
    }

    pub fn clear_failure(&self, name: &str) {
        self.lock().failures.remove(name);
    }

    pub fn attempts(&self, name: &str) -> usize {
        self.lock().attempts.get(name).copied().unwrap_or(0)
    }

    pub fn starts(&self) -> Vec<Start> {
        self.lock().starts.clone()
    }

    pub fn starts_of(&self, name: &str) -> Vec<Start> {
        self.lock()
            .starts
            .iter()
            .filter(|s| s.name == name)
            .cloned()
            .collect()
    }

    /// Most recently started worker of `name`.
    pub fn worker(&self, name: &str) -> Option<Arc<TestWorker>> {
        self.lock().workers.get(name).cloned()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HarnessState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}
