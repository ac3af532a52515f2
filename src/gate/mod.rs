// src/gate/mod.rs

//! One-shot milestone gates.
//!
//! A [`Lock`] starts locked and can be unlocked exactly once through its
//! [`Unlocker`]. The gate manifold exposes a [`Waiter`] to dependents.
//!
//! A gate worker started while locked exits with `Bounce` when the lock
//! opens, so the engine restarts it and every dependent is bounced exactly
//! once into a world where the gate is open. Once started unlocked, a gate
//! worker runs until killed.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::debug;

use crate::errors::{EngineError, Result};
use crate::manifold::{Manifold, NO_INPUTS, output};
use crate::types::BoxFuture;
use crate::worker::{Catacomb, Worker};

/// Shared binary milestone. Cloning shares the same state.
#[derive(Debug, Clone)]
pub struct Lock {
    state: Arc<watch::Sender<bool>>,
}

impl Default for Lock {
    fn default() -> Self {
        Self::new()
    }
}

impl Lock {
    /// A new, locked gate.
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// A gate that is open from the start.
    pub fn unlocked() -> Self {
        let lock = Self::new();
        lock.unlocker().unlock();
        lock
    }

    pub fn unlocker(&self) -> Unlocker {
        Unlocker {
            state: self.state.clone(),
        }
    }

    pub fn waiter(&self) -> Waiter {
        Waiter {
            state: self.state.clone(),
        }
    }
}

/// Owner-side capability: opens the gate.
#[derive(Debug, Clone)]
pub struct Unlocker {
    state: Arc<watch::Sender<bool>>,
}

impl Unlocker {
    /// Open the gate. Calling it again has no effect.
    pub fn unlock(&self) {
        let changed = self.state.send_if_modified(|unlocked| {
            let was = *unlocked;
            *unlocked = true;
            !was
        });
        if changed {
            debug!("gate unlocked");
        }
    }
}

/// Read-only view of a gate.
#[derive(Debug, Clone)]
pub struct Waiter {
    state: Arc<watch::Sender<bool>>,
}

impl Waiter {
    pub fn is_unlocked(&self) -> bool {
        *self.state.borrow()
    }

    /// Resolves once the gate is open (immediately if it already is).
    pub async fn unlocked(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|unlocked| *unlocked).await;
    }
}

/// Worker backing a gate manifold.
#[derive(Debug)]
pub struct GateWorker {
    waiter: Waiter,
    catacomb: Catacomb,
}

impl GateWorker {
    pub fn start(waiter: Waiter) -> Result<Arc<Self>> {
        let catacomb = Catacomb::new();
        let dying = catacomb.dying();
        let watched = waiter.clone();
        let started_unlocked = waiter.is_unlocked();

        catacomb.invoke(async move {
            if started_unlocked {
                dying.await;
                return Err(EngineError::Dying);
            }
            tokio::select! {
                _ = dying => Err(EngineError::Dying),
                _ = watched.unlocked() => Err(EngineError::Bounce),
            }
        })?;

        Ok(Arc::new(Self { waiter, catacomb }))
    }

    pub fn waiter(&self) -> Waiter {
        self.waiter.clone()
    }
}

impl Worker for GateWorker {
    fn kill(&self) {
        self.catacomb.kill(None);
    }

    fn wait(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.catacomb.wait())
    }
}

/// Manifold for `lock`. Its output is a [`Waiter`].
pub fn manifold(lock: &Lock) -> Manifold {
    let lock = lock.clone();
    Manifold::new(NO_INPUTS, move |_| {
        let worker: Arc<dyn Worker> = GateWorker::start(lock.waiter())?;
        Ok(worker)
    })
    .with_output(output(GateWorker::waiter))
}

/// A fresh locked gate manifold and the capability to open it.
pub fn new_gate() -> (Manifold, Unlocker) {
    let lock = Lock::new();
    (manifold(&lock), lock.unlocker())
}

/// A gate manifold that is open from the start.
pub fn already_unlocked() -> Manifold {
    manifold(&Lock::unlocked())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    #[test]
    fn unlock_is_monotonic_and_idempotent() {
        let lock = Lock::new();
        let waiter = lock.waiter();
        assert!(!waiter.is_unlocked());

        lock.unlocker().unlock();
        lock.unlocker().unlock();
        assert!(waiter.is_unlocked());
        assert!(lock.waiter().is_unlocked());
    }

    #[tokio::test]
    async fn waiter_resolves_after_unlock() {
        let lock = Lock::new();
        let waiter = lock.waiter();
        let unlocker = lock.unlocker();

        let pending = tokio::spawn(async move { waiter.unlocked().await });
        tokio::task::yield_now().await;
        assert!(!pending.is_finished());

        unlocker.unlock();
        timeout(Duration::from_secs(5), pending).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn locked_worker_bounces_on_unlock() {
        let lock = Lock::new();
        let worker = GateWorker::start(lock.waiter()).unwrap();

        lock.unlocker().unlock();
        let err = timeout(Duration::from_secs(5), worker.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert!(err.is_bounce());
    }

    #[tokio::test]
    async fn unlocked_worker_runs_until_killed() {
        let worker = GateWorker::start(Lock::unlocked().waiter()).unwrap();
        assert!(
            timeout(Duration::from_millis(50), worker.wait())
                .await
                .is_err()
        );

        worker.kill();
        let result = timeout(Duration::from_secs(5), worker.wait()).await.unwrap();
        assert!(result.is_ok());
    }
}
