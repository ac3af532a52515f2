// src/worker/catacomb.rs

//! Supervision unit: one primary task plus the sub-workers it spawned.
//!
//! A `Catacomb` guarantees that:
//! - killing it kills the primary task (through [`Catacomb::dying`]) and
//!   every worker registered with [`Catacomb::add`];
//! - a registered worker that stops on its own kills the catacomb, with its
//!   error as the cause;
//! - [`Catacomb::wait`] resolves only after the primary task and every
//!   registered worker have stopped. The primary task's own error is the
//!   terminal error; when it has none (or just `Dying`), the first real
//!   kill cause is.
//!
//! A panic inside the primary task is captured and reported as
//! [`EngineError::Panicked`].

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::errors::{EngineError, Result};
use crate::types::BoxFuture;
use crate::worker::Worker;

struct Inner {
    invoked: AtomicBool,
    dying: watch::Sender<bool>,
    /// First real (non-`Dying`) kill cause.
    reason: Mutex<Option<EngineError>>,
    /// One tracker task per registered worker.
    children: Mutex<Vec<JoinHandle<()>>>,
    done: watch::Sender<Option<Result<()>>>,
}

/// Cloneable handle to a supervision unit.
#[derive(Clone)]
pub struct Catacomb {
    inner: Arc<Inner>,
}

impl fmt::Debug for Catacomb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Catacomb")
            .field("dying", &self.is_dying())
            .field("done", &self.inner.done.borrow().is_some())
            .finish()
    }
}

impl Default for Catacomb {
    fn default() -> Self {
        Self::new()
    }
}

impl Catacomb {
    pub fn new() -> Self {
        let (dying, _) = watch::channel(false);
        let (done, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                invoked: AtomicBool::new(false),
                dying,
                reason: Mutex::new(None),
                children: Mutex::new(Vec::new()),
                done,
            }),
        }
    }

    /// Start `work` as the primary task.
    ///
    /// Returns immediately. Fails with `AlreadyInvoked` if the catacomb has
    /// been invoked before. Must be called from within a Tokio runtime.
    pub fn invoke<F>(&self, work: F) -> Result<()>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        if self.inner.invoked.swap(true, Ordering::SeqCst) {
            return Err(EngineError::AlreadyInvoked);
        }

        let primary = tokio::spawn(work);
        let this = self.clone();
        tokio::spawn(async move { this.supervise(primary).await });
        Ok(())
    }

    /// Register an already-running worker.
    ///
    /// If the catacomb is already dying this returns `Dying` and does not
    /// touch `worker`; the caller is responsible for stopping it.
    pub fn add(&self, worker: Arc<dyn Worker>) -> Result<()> {
        let mut children = self
            .inner
            .children
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_dying() {
            return Err(EngineError::Dying);
        }

        let this = self.clone();
        children.push(tokio::spawn(async move { this.track(worker).await }));
        Ok(())
    }

    /// Request shutdown. The first real cause wins; `None` and `Dying` only
    /// start the shutdown without recording an error.
    pub fn kill(&self, cause: Option<EngineError>) {
        if let Some(err) = cause {
            if !err.is_dying() {
                let mut reason = self
                    .inner
                    .reason
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                if reason.is_none() {
                    debug!(error = %err, "catacomb killed");
                    *reason = Some(err);
                }
            }
        }
        self.inner.dying.send_replace(true);
    }

    pub fn is_dying(&self) -> bool {
        *self.inner.dying.borrow()
    }

    /// Resolves once the catacomb starts dying (immediately if it already is).
    pub fn dying(&self) -> impl Future<Output = ()> + Send + 'static {
        let signal = self.dying_signal();
        async move { signal.dying().await }
    }

    /// A detached, cloneable view of the dying state.
    pub fn dying_signal(&self) -> DyingSignal {
        DyingSignal {
            rx: self.inner.dying.subscribe(),
        }
    }

    /// The error a primary task should return once it observes `dying`.
    pub fn err_dying(&self) -> EngineError {
        EngineError::Dying
    }

    /// Resolves once the primary task and all registered workers are done.
    ///
    /// Never resolves for a catacomb that was never invoked.
    pub fn wait(&self) -> impl Future<Output = Result<()>> + Send + 'static {
        let mut rx = self.inner.done.subscribe();
        async move {
            match rx.wait_for(|done| done.is_some()).await {
                Ok(done) => done.clone().unwrap_or(Ok(())),
                Err(_) => Ok(()),
            }
        }
    }

    async fn supervise(self, primary: JoinHandle<Result<()>>) {
        let outcome = match primary.await {
            Ok(result) => result,
            Err(join_err) if join_err.is_panic() => {
                let message = panic_message(join_err.into_panic());
                warn!(panic = %message, "primary task panicked");
                Err(EngineError::Panicked(message))
            }
            Err(_) => Err(EngineError::Dying),
        };
        self.kill(outcome.clone().err());

        // `add` refuses new workers once dying, so this drains to empty.
        loop {
            let batch = std::mem::take(
                &mut *self
                    .inner
                    .children
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner),
            );
            if batch.is_empty() {
                break;
            }
            for handle in batch {
                if let Err(err) = handle.await {
                    warn!(error = %err, "worker tracker failed");
                }
            }
        }

        let result = match outcome {
            Err(err) if !err.is_dying() => Err(err),
            _ => match self
                .inner
                .reason
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone()
            {
                Some(err) => Err(err),
                None => Ok(()),
            },
        };
        self.inner.done.send_replace(Some(result));
    }

    async fn track(self, child: Arc<dyn Worker>) {
        let dying = self.dying();
        tokio::select! {
            _ = dying => {
                child.kill();
            }
            result = child.wait() => {
                // Never outlive a child that stopped on its own.
                self.kill(result.err());
                return;
            }
        }

        if let Err(err) = child.wait().await {
            self.kill(Some(err));
        }
    }
}

impl Worker for Catacomb {
    fn kill(&self) {
        Catacomb::kill(self, None);
    }

    fn wait(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(Catacomb::wait(self))
    }
}

/// Cloneable, read-only view of a catacomb's dying state.
#[derive(Clone, Debug)]
pub struct DyingSignal {
    rx: watch::Receiver<bool>,
}

impl DyingSignal {
    pub fn is_dying(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn dying(&self) {
        let mut rx = self.rx.clone();
        // A dropped sender means the catacomb is gone; treat it as dead.
        let _ = rx.wait_for(|dying| *dying).await;
    }
}

pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    /// A child that runs until killed.
    fn idle_child() -> Catacomb {
        let child = Catacomb::new();
        let dying = child.dying();
        child
            .invoke(async move {
                dying.await;
                Err(EngineError::Dying)
            })
            .unwrap();
        child
    }

    #[tokio::test]
    async fn primary_error_is_terminal_error() {
        let catacomb = Catacomb::new();
        catacomb
            .invoke(async { Err(EngineError::NotFound("spec".into())) })
            .unwrap();

        let err = catacomb.wait().await.unwrap_err();
        assert!(err.is_not_found());
        assert!(catacomb.is_dying());
    }

    #[tokio::test]
    async fn kill_stops_primary_and_children() {
        let catacomb = Catacomb::new();
        let dying = catacomb.dying();
        catacomb
            .invoke(async move {
                dying.await;
                Err(EngineError::Dying)
            })
            .unwrap();

        let child = idle_child();
        catacomb.add(Arc::new(child.clone())).unwrap();

        catacomb.kill(None);
        let result = timeout(Duration::from_secs(5), catacomb.wait()).await.unwrap();
        assert!(result.is_ok());
        assert!(child.is_dying());
        assert!(timeout(Duration::from_secs(5), child.wait()).await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn child_failure_kills_unit_with_child_error() {
        let catacomb = Catacomb::new();
        let dying = catacomb.dying();
        catacomb
            .invoke(async move {
                dying.await;
                Err(EngineError::Dying)
            })
            .unwrap();

        let child = Catacomb::new();
        child.invoke(async { Err(EngineError::WatcherClosed) }).unwrap();
        catacomb.add(Arc::new(child)).unwrap();

        let err = timeout(Duration::from_secs(5), catacomb.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, EngineError::WatcherClosed));
    }

    #[tokio::test]
    async fn primary_error_beats_earlier_child_error() {
        let catacomb = Catacomb::new();
        let dying = catacomb.dying();
        catacomb
            .invoke(async move {
                dying.await;
                Err(EngineError::Config("primary".into()))
            })
            .unwrap();

        let child = Catacomb::new();
        child.invoke(async { Err(EngineError::WatcherClosed) }).unwrap();
        catacomb.add(Arc::new(child)).unwrap();

        let err = timeout(Duration::from_secs(5), catacomb.wait())
            .await
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, EngineError::Config(msg) if msg == "primary"));
    }

    #[tokio::test]
    async fn first_kill_cause_wins() {
        let catacomb = Catacomb::new();
        let dying = catacomb.dying();
        catacomb
            .invoke(async move {
                dying.await;
                Err(EngineError::Dying)
            })
            .unwrap();

        catacomb.kill(Some(EngineError::Dying));
        catacomb.kill(Some(EngineError::Missing));
        catacomb.kill(Some(EngineError::Bounce));

        let err = catacomb.wait().await.unwrap_err();
        assert!(err.is_missing());
    }

    #[tokio::test]
    async fn panic_is_captured() {
        let catacomb = Catacomb::new();
        catacomb
            .invoke(async {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
            .unwrap();

        match catacomb.wait().await {
            Err(EngineError::Panicked(msg)) => assert!(msg.contains("boom")),
            other => panic!("expected panic error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn invoke_twice_fails() {
        let catacomb = Catacomb::new();
        catacomb.invoke(async { Ok(()) }).unwrap();
        let err = catacomb.invoke(async { Ok(()) }).unwrap_err();
        assert!(matches!(err, EngineError::AlreadyInvoked));
    }

    #[tokio::test]
    async fn add_after_dying_is_rejected() {
        let catacomb = Catacomb::new();
        catacomb.invoke(async { Ok(()) }).unwrap();
        catacomb.wait().await.unwrap();

        let child = idle_child();
        let err = catacomb.add(Arc::new(child.clone())).unwrap_err();
        assert!(err.is_dying());
        assert!(!child.is_dying());
        child.kill(None);
    }
}
