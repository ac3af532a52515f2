// src/reconcile/worker.rs

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info};

use crate::errors::{EngineError, Result};
use crate::reconcile::{Broker, NotifyWatch, Payload, StateSource};
use crate::types::BoxFuture;
use crate::worker::{Catacomb, Worker};

/// Observable lifecycle of a [`ReconcileWorker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Watching,
    Reconciling,
    Dying,
    Stopped,
}

/// What a reconcile worker keeps in sync, and with whom.
pub struct ReconcileParams<P> {
    /// Owning group of the entity (the application for a unit).
    pub group: String,
    pub entity: String,
    pub source: Arc<dyn StateSource>,
    pub broker: Arc<dyn Broker<P>>,
}

impl<P> Clone for ReconcileParams<P> {
    fn clone(&self) -> Self {
        Self {
            group: self.group.clone(),
            entity: self.entity.clone(),
            source: self.source.clone(),
            broker: self.broker.clone(),
        }
    }
}

/// Keeps one entity's external state in line with its source.
pub struct ReconcileWorker<P> {
    entity: String,
    phase: watch::Receiver<Phase>,
    catacomb: Catacomb,
    _payload: PhantomData<fn() -> P>,
}

impl<P> fmt::Debug for ReconcileWorker<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconcileWorker")
            .field("entity", &self.entity)
            .field("phase", &*self.phase.borrow())
            .finish()
    }
}

impl<P: Payload> ReconcileWorker<P> {
    pub fn start(params: ReconcileParams<P>) -> Result<Arc<Self>> {
        let catacomb = Catacomb::new();
        let (phase_tx, phase) = watch::channel(Phase::Idle);
        let entity = params.entity.clone();

        let run = Reconciler {
            params,
            catacomb: catacomb.clone(),
            phase: phase_tx,
        };
        catacomb.invoke(run.run())?;

        Ok(Arc::new(Self {
            entity,
            phase,
            catacomb,
            _payload: PhantomData,
        }))
    }

    pub fn entity(&self) -> &str {
        &self.entity
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    pub fn is_dying(&self) -> bool {
        self.catacomb.is_dying()
    }

    pub fn phase_watch(&self) -> watch::Receiver<Phase> {
        self.phase.clone()
    }
}

impl<P: Payload> Worker for ReconcileWorker<P> {
    fn kill(&self) {
        self.catacomb.kill(None);
    }

    fn wait(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.catacomb.wait())
    }
}

struct Reconciler<P> {
    params: ReconcileParams<P>,
    catacomb: Catacomb,
    phase: watch::Sender<Phase>,
}

impl<P: Payload> Reconciler<P> {
    async fn run(self) -> Result<()> {
        let result = self.watch_loop().await;
        self.phase.send_replace(Phase::Stopped);
        if let Err(err) = &result {
            if !err.is_dying() {
                info!(entity = %self.params.entity, error = %err, "reconcile worker failed");
            }
        }
        result
    }

    async fn watch_loop(&self) -> Result<()> {
        let NotifyWatch {
            worker: watcher,
            mut changes,
        } = self.params.source.watch(&self.params.entity)?;
        if let Err(err) = self.catacomb.add(watcher.clone()) {
            watcher.kill();
            return Err(err);
        }

        let dying = self.catacomb.dying_signal();
        self.phase.send_replace(Phase::Watching);

        loop {
            let changed = tokio::select! {
                biased;
                _ = dying.dying() => None,
                change = changes.recv() => Some(change.is_some()),
            };
            match changed {
                None => return Err(self.stop()),
                Some(false) => return Err(EngineError::WatcherClosed),
                Some(true) => {}
            }

            self.phase.send_replace(Phase::Reconciling);
            tokio::select! {
                biased;
                _ = dying.dying() => return Err(self.stop()),
                result = self.reconcile() => result?,
            }
            self.phase.send_replace(Phase::Watching);
        }
    }

    fn stop(&self) -> EngineError {
        self.phase.send_replace(Phase::Dying);
        self.catacomb.err_dying()
    }

    async fn reconcile(&self) -> Result<()> {
        let ReconcileParams {
            group,
            entity,
            source,
            broker,
        } = &self.params;

        let text = match source.fetch(entity).await {
            Ok(text) => text,
            Err(err) if err.is_not_found() => {
                debug!(entity = %entity, "no {} defined yet", P::KIND);
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let payload = P::parse(&text)
            .map_err(|err| EngineError::other(err.context(format!("cannot parse {}", P::KIND))))?;
        broker.ensure(group, entity, &payload).await?;
        debug!(entity = %entity, "created/updated {}", P::KIND);
        Ok(())
    }
}

/// Resolves once `phases` reports `phase`; fails if the worker is gone.
pub async fn wait_for_phase(mut phases: watch::Receiver<Phase>, phase: Phase) -> Result<()> {
    phases
        .wait_for(|current| *current == phase)
        .await
        .map(|_| ())
        .map_err(|_| EngineError::Dying)
}
