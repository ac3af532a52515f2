// src/agent/termination.rs

//! Turns a process termination request into a fatal engine error.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::info;

use crate::errors::{EngineError, Result};
use crate::manifold::{Manifold, NO_INPUTS};
use crate::types::BoxFuture;
use crate::worker::{Catacomb, Worker};

/// Create a linked trigger/signal pair.
pub fn termination_channel() -> (TerminationTrigger, TerminationSignal) {
    let (tx, _) = watch::channel(false);
    let tx = Arc::new(tx);
    (
        TerminationTrigger { tx: tx.clone() },
        TerminationSignal { tx },
    )
}

/// Requests agent termination (e.g. on SIGTERM).
#[derive(Debug, Clone)]
pub struct TerminationTrigger {
    tx: Arc<watch::Sender<bool>>,
}

impl TerminationTrigger {
    pub fn fire(&self) {
        self.tx.send_replace(true);
    }
}

#[derive(Debug, Clone)]
pub struct TerminationSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl TerminationSignal {
    pub fn is_requested(&self) -> bool {
        *self.tx.borrow()
    }

    pub async fn requested(&self) {
        let mut rx = self.tx.subscribe();
        let _ = rx.wait_for(|requested| *requested).await;
    }
}

/// Exits with `TerminateAgent` once termination is requested.
#[derive(Debug)]
pub struct TerminationWorker {
    catacomb: Catacomb,
}

impl TerminationWorker {
    pub fn start(signal: TerminationSignal) -> Result<Arc<Self>> {
        let catacomb = Catacomb::new();
        let dying = catacomb.dying();
        catacomb.invoke(async move {
            tokio::select! {
                _ = dying => Err(EngineError::Dying),
                _ = signal.requested() => {
                    info!("agent termination requested");
                    Err(EngineError::TerminateAgent)
                }
            }
        })?;
        Ok(Arc::new(Self { catacomb }))
    }
}

impl Worker for TerminationWorker {
    fn kill(&self) {
        self.catacomb.kill(None);
    }

    fn wait(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.catacomb.wait())
    }
}

pub fn manifold(signal: TerminationSignal) -> Manifold {
    Manifold::new(NO_INPUTS, move |_| {
        let worker: Arc<dyn Worker> = TerminationWorker::start(signal.clone())?;
        Ok(worker)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[tokio::test]
    async fn fires_terminate_agent() {
        let (trigger, signal) = termination_channel();
        let worker = TerminationWorker::start(signal.clone()).unwrap();
        assert!(!signal.is_requested());

        trigger.fire();
        let err = timeout(Duration::from_secs(5), worker.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, EngineError::TerminateAgent));
    }

    #[tokio::test]
    async fn kill_is_clean() {
        let (_trigger, signal) = termination_channel();
        let worker = TerminationWorker::start(signal).unwrap();
        worker.kill();
        assert!(worker.wait().await.is_ok());
    }
}
