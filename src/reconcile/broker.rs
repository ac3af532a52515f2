// src/reconcile/broker.rs

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use tracing::{debug, info};

use crate::errors::{EngineError, Result};
use crate::fs::FileSystem;
use crate::reconcile::spec::{ContainerSpec, application_of, unit_tag};
use crate::reconcile::Broker;
use crate::types::BoxFuture;

/// Deploys container specs as files under a root directory.
///
/// The spec for unit `mysql/0` lands in `<root>/mysql/mysql-0.toml`. A
/// write only happens when the rendered spec differs from what was last
/// deployed, so repeated `ensure` calls with the same spec are no-ops.
#[derive(Debug)]
pub struct FileBroker {
    root: PathBuf,
    fs: Arc<dyn FileSystem>,
    /// blake3 of the last content deployed per path.
    deployed: Mutex<HashMap<PathBuf, blake3::Hash>>,
    writes: AtomicUsize,
}

impl FileBroker {
    pub fn new(root: impl Into<PathBuf>, fs: Arc<dyn FileSystem>) -> Self {
        Self {
            root: root.into(),
            fs,
            deployed: Mutex::new(HashMap::new()),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn unit_path(&self, application: &str, unit: &str) -> PathBuf {
        self.root
            .join(application)
            .join(format!("{}.toml", unit_tag(unit)))
    }

    /// Number of files actually written.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Create or update the deployed spec of `unit`.
    pub fn ensure_unit(&self, application: &str, unit: &str, spec: &ContainerSpec) -> Result<()> {
        if application_of(unit) != application {
            return Err(EngineError::other(anyhow!(
                "unit {unit:?} does not belong to application {application:?}"
            )));
        }

        let rendered = spec.render()?;
        let hash = blake3::hash(rendered.as_bytes());
        let path = self.unit_path(application, unit);

        if self.is_deployed(&path, &hash) {
            debug!(unit = %unit, path = ?path, "container spec unchanged; skipping");
            return Ok(());
        }

        self.fs.write(&path, rendered.as_bytes())?;
        self.deployed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.clone(), hash);
        self.writes.fetch_add(1, Ordering::SeqCst);
        info!(unit = %unit, path = ?path, "deployed container spec");
        Ok(())
    }

    fn is_deployed(&self, path: &Path, hash: &blake3::Hash) -> bool {
        let mut deployed = self.deployed.lock().unwrap_or_else(PoisonError::into_inner);
        if deployed.get(path) == Some(hash) {
            return self.fs.exists(path);
        }
        // Content left by an earlier run counts as deployed.
        match self.fs.read_to_string(path) {
            Ok(existing) if blake3::hash(existing.as_bytes()) == *hash => {
                deployed.insert(path.to_path_buf(), *hash);
                true
            }
            _ => false,
        }
    }
}

impl Broker<ContainerSpec> for FileBroker {
    fn ensure<'a>(
        &'a self,
        group: &'a str,
        entity: &'a str,
        payload: &'a ContainerSpec,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move { self.ensure_unit(group, entity, payload) })
    }
}
