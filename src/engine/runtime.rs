// src/engine/runtime.rs

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, info, warn};

use crate::engine::config::EngineConfig;
use crate::engine::core::{EngineCommand, EngineCore};
use crate::engine::report::Report;
use crate::errors::{EngineError, Result};
use crate::manifold::{Manifold, ManifoldGraph, Manifolds};
use crate::types::{BoxFuture, EngineState};
use crate::worker::{Catacomb, DyingSignal, Worker};

const REQUEST_QUEUE: usize = 64;

enum Request {
    Install {
        name: String,
        manifold: Manifold,
        reply: oneshot::Sender<Result<()>>,
    },
    Report {
        reply: oneshot::Sender<Report>,
    },
}

#[derive(Debug)]
struct WorkerStopped {
    name: String,
    generation: u64,
    result: Result<()>,
}

/// The dependency engine: a [`Worker`] that keeps one worker running per
/// installed manifold.
///
/// This is the async shell around [`EngineCore`]. A single coordinating
/// task owns the core; `install` and `report` talk to it over a channel.
pub struct Engine {
    catacomb: Catacomb,
    requests: mpsc::Sender<Request>,
    last_report: Arc<Mutex<Option<Report>>>,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("catacomb", &self.catacomb)
            .finish_non_exhaustive()
    }
}

impl Engine {
    /// Validate `config` and start the coordinating task.
    pub fn new(config: EngineConfig) -> Result<Arc<Self>> {
        config.validate()?;

        let (requests, request_rx) = mpsc::channel(REQUEST_QUEUE);
        let (stopped_tx, stopped_rx) = mpsc::unbounded_channel();
        let catacomb = Catacomb::new();
        let last_report = Arc::new(Mutex::new(None));

        let coordinator = Coordinator {
            core: EngineCore::new(&config),
            idle_poll: config.idle_poll,
            requests: request_rx,
            stopped_tx,
            stopped_rx,
            catacomb: catacomb.clone(),
            shutdown: config.shutdown.clone(),
            last_report: last_report.clone(),
        };
        catacomb.invoke(coordinator.run())?;

        Ok(Arc::new(Self {
            catacomb,
            requests,
            last_report,
        }))
    }

    /// Install a manifold. Its inputs must already be installed.
    pub async fn install(&self, name: impl Into<String>, manifold: Manifold) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        let request = Request::Install {
            name: name.into(),
            manifold,
            reply,
        };
        self.requests
            .send(request)
            .await
            .map_err(|_| EngineError::Dying)?;
        rx.await.map_err(|_| EngineError::Dying)?
    }

    /// Diagnostic snapshot. After the engine stopped this is the final
    /// snapshot it recorded.
    pub async fn report(&self) -> Report {
        let (reply, rx) = oneshot::channel();
        if self.requests.send(Request::Report { reply }).await.is_ok() {
            if let Ok(report) = rx.await {
                return report;
            }
        }
        self.last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
            .unwrap_or_else(|| Report {
                state: EngineState::Stopped,
                slots: Default::default(),
            })
    }

    pub fn dying_signal(&self) -> DyingSignal {
        self.catacomb.dying_signal()
    }
}

impl Worker for Engine {
    fn kill(&self) {
        self.catacomb.kill(None);
    }

    fn wait(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.catacomb.wait())
    }
}

/// Validate `manifolds` as a whole and install them inputs first.
pub async fn install_all(engine: &Engine, mut manifolds: Manifolds) -> Result<()> {
    let graph = ManifoldGraph::new(&manifolds)?;
    for name in graph.order() {
        if let Some(manifold) = manifolds.remove(name) {
            engine.install(name.clone(), manifold).await?;
        }
    }
    Ok(())
}

struct Coordinator {
    core: EngineCore,
    idle_poll: std::time::Duration,
    requests: mpsc::Receiver<Request>,
    stopped_tx: mpsc::UnboundedSender<WorkerStopped>,
    stopped_rx: mpsc::UnboundedReceiver<WorkerStopped>,
    catacomb: Catacomb,
    shutdown: Option<DyingSignal>,
    last_report: Arc<Mutex<Option<Report>>>,
}

impl Coordinator {
    async fn run(mut self) -> Result<()> {
        info!("dependency engine started");
        let dying = self.catacomb.dying_signal();

        loop {
            let now = Instant::now();
            let commands = self.core.pass(now);
            self.execute(commands);

            if self.core.is_finished() {
                break;
            }

            let poll = now + self.idle_poll;
            let deadline = self.core.next_deadline().map_or(poll, |at| at.min(poll));
            let running = self.core.state() == EngineState::Started;

            tokio::select! {
                _ = dying.dying(), if running => {
                    self.core.shutdown();
                }
                _ = external_shutdown(&self.shutdown), if running => {
                    info!("process shutdown requested");
                    self.core.shutdown();
                }
                Some(request) = self.requests.recv() => {
                    self.handle_request(request);
                }
                Some(stopped) = self.stopped_rx.recv() => {
                    debug!(
                        manifold = %stopped.name,
                        generation = stopped.generation,
                        result = ?stopped.result,
                        "worker stopped"
                    );
                    let commands = self.core.worker_stopped(
                        &stopped.name,
                        stopped.generation,
                        stopped.result,
                        Instant::now(),
                    );
                    self.execute(commands);
                }
                _ = sleep_until(deadline) => {}
            }
        }

        self.core.mark_stopped();
        let report = self.core.report();
        *self
            .last_report
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(report);
        info!("dependency engine stopped");
        Err(self.catacomb.err_dying())
    }

    fn handle_request(&mut self, request: Request) {
        match request {
            Request::Install {
                name,
                manifold,
                reply,
            } => {
                let result = self.core.install(&name, manifold);
                if let Err(err) = &result {
                    warn!(manifold = %name, error = %err, "install rejected");
                }
                let _ = reply.send(result);
            }
            Request::Report { reply } => {
                let _ = reply.send(self.core.report());
            }
        }
    }

    fn execute(&mut self, commands: Vec<EngineCommand>) {
        for command in commands {
            match command {
                EngineCommand::Watch {
                    name,
                    generation,
                    worker,
                } => {
                    let stopped_tx = self.stopped_tx.clone();
                    tokio::spawn(async move {
                        let result = worker.wait().await;
                        let _ = stopped_tx.send(WorkerStopped {
                            name,
                            generation,
                            result,
                        });
                    });
                }
                EngineCommand::Fatal(err) => {
                    warn!(error = %err, "fatal error; stopping dependency engine");
                    self.catacomb.kill(Some(err));
                }
            }
        }
    }
}

async fn external_shutdown(signal: &Option<DyingSignal>) {
    match signal {
        Some(signal) => signal.dying().await,
        None => std::future::pending().await,
    }
}
