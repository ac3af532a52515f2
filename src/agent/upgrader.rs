// src/agent/upgrader.rs

//! Runs the agent's upgrade steps and opens the upgrade gates.
//!
//! The steps prepare the on-disk layout the unit workers rely on; once
//! they succeed the upgrade-steps gate opens, and the upgrade-check gate
//! follows since no newer agent version is ever pending here.

use std::sync::Arc;

use tracing::info;

use crate::agent::AGENT;
use crate::config::AgentConfig;
use crate::errors::{EngineError, Result};
use crate::fs::FileSystem;
use crate::gate::Unlocker;
use crate::manifold::Manifold;
use crate::types::BoxFuture;
use crate::worker::{Catacomb, Worker};

#[derive(Debug)]
pub struct UpgraderWorker {
    catacomb: Catacomb,
}

impl UpgraderWorker {
    pub fn start(
        agent: AgentConfig,
        fs: Arc<dyn FileSystem>,
        steps: Unlocker,
        check: Unlocker,
    ) -> Result<Arc<Self>> {
        let catacomb = Catacomb::new();
        let dying = catacomb.dying();
        catacomb.invoke(async move {
            run_upgrade_steps(&agent, fs.as_ref())?;
            steps.unlock();
            info!(application = %agent.application, "upgrade steps complete");

            check.unlock();
            dying.await;
            Err(EngineError::Dying)
        })?;
        Ok(Arc::new(Self { catacomb }))
    }
}

/// Idempotent preparation of the agent's directories.
fn run_upgrade_steps(agent: &AgentConfig, fs: &dyn FileSystem) -> Result<()> {
    fs.create_dir_all(&agent.state_dir)?;
    fs.create_dir_all(&agent.deploy_dir.join(&agent.application))?;
    Ok(())
}

impl Worker for UpgraderWorker {
    fn kill(&self) {
        self.catacomb.kill(None);
    }

    fn wait(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.catacomb.wait())
    }
}

pub fn manifold(fs: Arc<dyn FileSystem>, steps: Unlocker, check: Unlocker) -> Manifold {
    Manifold::new([AGENT], move |ctx| {
        let agent: AgentConfig = ctx.get(AGENT)?;
        let worker: Arc<dyn Worker> =
            UpgraderWorker::start(agent, fs.clone(), steps.clone(), check.clone())?;
        Ok(worker)
    })
}
