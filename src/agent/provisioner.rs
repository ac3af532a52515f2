// src/agent/provisioner.rs

//! Runs one reconcile worker per configured unit.

use std::sync::Arc;

use tracing::{debug, info};

use crate::agent::{AGENT, UPGRADE_STEPS_GATE};
use crate::config::AgentConfig;
use crate::errors::{EngineError, Result};
use crate::gate::Waiter;
use crate::manifold::{Manifold, output};
use crate::reconcile::{Broker, ContainerSpec, ReconcileParams, ReconcileWorker, StateSource};
use crate::types::BoxFuture;
use crate::worker::{Catacomb, Worker};

/// Owns the unit workers of one application. If any of them fails, they
/// all go down together and the engine restarts the provisioner.
#[derive(Debug)]
pub struct UnitProvisioner {
    catacomb: Catacomb,
    units: Vec<Arc<ReconcileWorker<ContainerSpec>>>,
}

impl UnitProvisioner {
    pub fn start(
        agent: &AgentConfig,
        source: Arc<dyn StateSource>,
        broker: Arc<dyn Broker<ContainerSpec>>,
    ) -> Result<Arc<Self>> {
        let catacomb = Catacomb::new();
        let dying = catacomb.dying();
        catacomb.invoke(async move {
            dying.await;
            Err(EngineError::Dying)
        })?;

        let mut units = Vec::with_capacity(agent.units.len());
        for unit in &agent.units {
            let params = ReconcileParams {
                group: agent.application.clone(),
                entity: unit.clone(),
                source: source.clone(),
                broker: broker.clone(),
            };
            let worker = match ReconcileWorker::start(params) {
                Ok(worker) => worker,
                Err(err) => {
                    catacomb.kill(Some(err.clone()));
                    return Err(err);
                }
            };
            if let Err(err) = catacomb.add(worker.clone()) {
                worker.kill();
                return Err(err);
            }
            debug!(unit = %unit, "started unit worker");
            units.push(worker);
        }

        info!(application = %agent.application, units = units.len(), "unit provisioner started");
        Ok(Arc::new(Self { catacomb, units }))
    }

    pub fn is_dying(&self) -> bool {
        self.catacomb.is_dying()
    }

    pub fn units(&self) -> Vec<String> {
        self.units.iter().map(|w| w.entity().to_string()).collect()
    }

    pub fn unit_worker(&self, unit: &str) -> Option<Arc<ReconcileWorker<ContainerSpec>>> {
        self.units.iter().find(|w| w.entity() == unit).cloned()
    }
}

impl Worker for UnitProvisioner {
    fn kill(&self) {
        self.catacomb.kill(None);
    }

    fn wait(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(self.catacomb.wait())
    }
}

/// Starts only once the upgrade steps are done; until then it reports its
/// dependencies as missing.
pub fn manifold(source: Arc<dyn StateSource>, broker: Arc<dyn Broker<ContainerSpec>>) -> Manifold {
    Manifold::new([AGENT, UPGRADE_STEPS_GATE], move |ctx| {
        let agent: AgentConfig = ctx.get(AGENT)?;
        let gate: Waiter = ctx.get(UPGRADE_STEPS_GATE)?;
        if !gate.is_unlocked() {
            return Err(EngineError::Missing);
        }
        let worker: Arc<dyn Worker> =
            UnitProvisioner::start(&agent, source.clone(), broker.clone())?;
        Ok(worker)
    })
    .with_output(output(UnitProvisioner::units))
}
