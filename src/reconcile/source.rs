// src/reconcile/source.rs

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::errors::{EngineError, Result};
use crate::fs::FileSystem;
use crate::reconcile::spec::unit_tag;
use crate::reconcile::{NotifyWatch, StateSource};
use crate::types::BoxFuture;
use crate::worker::{Catacomb, Worker};

/// Desired unit state stored as one TOML file per unit.
///
/// The spec for unit `mysql/0` is read from `<dir>/mysql-0.toml`; a missing
/// file means no spec is defined yet.
#[derive(Debug, Clone)]
pub struct FileStateSource {
    dir: PathBuf,
    fs: Arc<dyn FileSystem>,
}

impl FileStateSource {
    /// Creates `dir` if it does not exist yet.
    pub fn new(dir: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Result<Self> {
        let dir = dir.into();
        fs.create_dir_all(&dir)?;
        Ok(Self { dir, fs })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn spec_path(&self, unit: &str) -> PathBuf {
        self.dir.join(spec_file_name(unit))
    }
}

fn spec_file_name(unit: &str) -> String {
    format!("{}.toml", unit_tag(unit))
}

impl StateSource for FileStateSource {
    fn watch(&self, key: &str) -> Result<NotifyWatch> {
        let (watcher, changes) = FileWatcher::start(&self.dir, spec_file_name(key).into())?;
        Ok(NotifyWatch {
            worker: watcher,
            changes,
        })
    }

    fn fetch(&self, key: &str) -> BoxFuture<'_, Result<String>> {
        let path = self.spec_path(key);
        let key = key.to_string();
        Box::pin(async move {
            if !self.fs.exists(&path) {
                return Err(EngineError::NotFound(key));
            }
            match self.fs.read_to_string(&path) {
                Ok(text) => Ok(text),
                // Removed between the two calls.
                Err(_) if !self.fs.exists(&path) => Err(EngineError::NotFound(key)),
                Err(err) => Err(err.into()),
            }
        })
    }
}

/// Watches one file name inside a directory.
///
/// Sends one notification right away and one per filesystem event touching
/// the file. Notifications coalesce while the receiver is busy.
#[derive(Debug)]
pub struct FileWatcher {
    catacomb: Catacomb,
}

impl FileWatcher {
    pub fn start(dir: &Path, file_name: OsString) -> Result<(Arc<Self>, mpsc::Receiver<()>)> {
        let (changes_tx, changes_rx) = mpsc::channel(1);
        let (event_tx, mut event_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

        // Called synchronously by notify on its own thread.
        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let _ = event_tx.send(res);
            },
            Config::default(),
        )
        .map_err(EngineError::other)?;
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(EngineError::other)?;
        info!(dir = ?dir, file = ?file_name, "watching for spec changes");

        let _ = changes_tx.try_send(());

        let catacomb = Catacomb::new();
        let dying = catacomb.dying_signal();
        catacomb.invoke(async move {
            let _watcher = watcher;
            loop {
                tokio::select! {
                    biased;
                    _ = dying.dying() => return Err(EngineError::Dying),
                    event = event_rx.recv() => match event {
                        None => return Err(EngineError::WatcherClosed),
                        Some(Err(err)) => return Err(EngineError::other(err)),
                        Some(Ok(event)) => {
                            let touched = event
                                .paths
                                .iter()
                                .any(|path| path.file_name() == Some(file_name.as_os_str()));
                            if touched {
                                debug!(file = ?file_name, kind = ?event.kind, "spec file changed");
                                let _ = changes_tx.try_send(());
                            }
                        }
                    },
                }
            }
        })?;

        Ok((Arc::new(Self { catacomb }), changes_rx))
    }
}

impl Worker for FileWatcher {
    fn kill(&self) {
        self.catacomb.kill(None);
    }

    fn wait(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.catacomb.wait())
    }
}
