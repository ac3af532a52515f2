// src/agent/mod.rs

//! The machine agent's manifold set.
//!
//! ```text
//! agent ──► upgrader ──(unlocks)──► upgrade-steps-gate ─┐
//!   │                               upgrade-check-gate  │
//!   └──────────────────────────────► unit-provisioner ◄─┘
//! termination
//! ```
//!
//! `agent` publishes the configuration, `termination` turns SIGTERM into
//! a fatal error, and `unit-provisioner` runs one reconcile worker per unit
//! once the upgrade steps are done.

pub mod provisioner;
pub mod termination;
pub mod upgrader;

use std::sync::Arc;

use crate::config::AgentConfig;
use crate::fs::FileSystem;
use crate::gate::{self, Lock, Unlocker};
use crate::manifold::{Manifold, Manifolds, NO_INPUTS, output};
use crate::reconcile::{Broker, ContainerSpec, StateSource};
use crate::worker::{ValueWorker, Worker};

pub use provisioner::UnitProvisioner;
pub use termination::{
    TerminationSignal, TerminationTrigger, TerminationWorker, termination_channel,
};
pub use upgrader::UpgraderWorker;

pub const AGENT: &str = "agent";
pub const TERMINATION: &str = "termination";
pub const UPGRADE_STEPS_GATE: &str = "upgrade-steps-gate";
pub const UPGRADE_CHECK_GATE: &str = "upgrade-check-gate";
pub const UPGRADER: &str = "upgrader";
pub const UNIT_PROVISIONER: &str = "unit-provisioner";

/// Everything the agent manifolds need from the outside.
pub struct ManifoldsConfig {
    pub agent: AgentConfig,
    pub fs: Arc<dyn FileSystem>,
    pub source: Arc<dyn StateSource>,
    pub broker: Arc<dyn Broker<ContainerSpec>>,
    pub termination: TerminationSignal,
}

/// Build the agent's manifolds.
///
/// Also returns the unlockers of the upgrade-steps and upgrade-check gates
/// so callers outside the engine can open them.
pub fn manifolds(config: ManifoldsConfig) -> (Manifolds, Unlocker, Unlocker) {
    let steps = Lock::new();
    let check = Lock::new();

    let mut manifolds = Manifolds::new();
    manifolds.insert(AGENT.to_string(), agent_manifold(config.agent));
    manifolds.insert(
        TERMINATION.to_string(),
        termination::manifold(config.termination),
    );
    manifolds.insert(UPGRADE_STEPS_GATE.to_string(), gate::manifold(&steps));
    manifolds.insert(UPGRADE_CHECK_GATE.to_string(), gate::manifold(&check));
    manifolds.insert(
        UPGRADER.to_string(),
        upgrader::manifold(config.fs, steps.unlocker(), check.unlocker()),
    );
    manifolds.insert(
        UNIT_PROVISIONER.to_string(),
        provisioner::manifold(config.source, config.broker),
    );

    (manifolds, steps.unlocker(), check.unlocker())
}

fn agent_manifold(agent: AgentConfig) -> Manifold {
    Manifold::new(NO_INPUTS, move |_| {
        let worker: Arc<dyn Worker> = ValueWorker::start(agent.clone())?;
        Ok(worker)
    })
    .with_output(output(|w: &ValueWorker<AgentConfig>| w.value().clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::mock::MockFileSystem;
    use crate::gate::Waiter;
    use crate::manifold::{Context, ManifoldGraph};
    use crate::reconcile::{FileBroker, FileStateSource};
    use crate::worker::stop;

    fn config() -> ManifoldsConfig {
        let fs = MockFileSystem::new();
        let fs: Arc<dyn FileSystem> = Arc::new(fs);
        let (_trigger, termination) = termination_channel();
        ManifoldsConfig {
            agent: AgentConfig {
                application: "mysql".into(),
                units: vec!["mysql/0".into()],
                state_dir: "state".into(),
                deploy_dir: "deployed".into(),
            },
            fs: fs.clone(),
            source: Arc::new(FileStateSource::new("state", fs.clone()).unwrap()),
            broker: Arc::new(FileBroker::new("deployed", fs)),
            termination,
        }
    }

    #[test]
    fn manifold_names() {
        let (manifolds, _, _) = manifolds(config());
        let names: Vec<&str> = manifolds.keys().map(String::as_str).collect();
        assert_eq!(
            names,
            vec![
                AGENT,
                TERMINATION,
                UNIT_PROVISIONER,
                UPGRADE_CHECK_GATE,
                UPGRADE_STEPS_GATE,
                UPGRADER,
            ]
        );
    }

    #[test]
    fn install_order_puts_agent_before_its_users() {
        let (manifolds, _, _) = manifolds(config());
        let graph = ManifoldGraph::new(&manifolds).unwrap();
        let order = graph.order();
        let pos = |name: &str| order.iter().position(|n| n == name).unwrap();
        assert!(pos(AGENT) < pos(UPGRADER));
        assert!(pos(AGENT) < pos(UNIT_PROVISIONER));
        assert!(pos(UPGRADE_STEPS_GATE) < pos(UNIT_PROVISIONER));
    }

    async fn assert_gate(manifolds: &Manifolds, name: &str, unlocker: Unlocker) {
        let manifold = &manifolds[name];
        let worker = (manifold.start)(&Context::new(name)).unwrap();
        let extract = manifold.output.as_ref().unwrap();
        let mut out: Option<Waiter> = None;
        extract(&*worker, &mut out).unwrap();
        let waiter = out.unwrap();

        assert!(!waiter.is_unlocked());
        unlocker.unlock();
        assert!(waiter.is_unlocked());
        let _ = stop(&*worker).await;
    }

    #[tokio::test]
    async fn upgrade_steps_gate() {
        let (manifolds, steps, _) = manifolds(config());
        assert_gate(&manifolds, UPGRADE_STEPS_GATE, steps).await;
    }

    #[tokio::test]
    async fn upgrade_check_gate() {
        let (manifolds, _, check) = manifolds(config());
        assert_gate(&manifolds, UPGRADE_CHECK_GATE, check).await;
    }

    #[tokio::test]
    async fn provisioner_waits_for_upgrade_steps() {
        let (manifolds, _, _) = manifolds(config());
        let agent = ValueWorker::start(config().agent).unwrap();
        let gate_lock = Lock::new();
        let gate_worker = gate::GateWorker::start(gate_lock.waiter()).unwrap();
        let ctx = Context::new(UNIT_PROVISIONER)
            .with_input(AGENT, agent.clone(), manifolds[AGENT].output.clone())
            .with_input(
                UPGRADE_STEPS_GATE,
                gate_worker.clone(),
                manifolds[UPGRADE_STEPS_GATE].output.clone(),
            );

        let err = (manifolds[UNIT_PROVISIONER].start)(&ctx).err().unwrap();
        assert!(err.is_missing());

        stop(&*agent).await.unwrap();
        let _ = stop(&*gate_worker).await;
    }
}
