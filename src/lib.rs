// src/lib.rs

pub mod agent;
pub mod cli;
pub mod config;
pub mod engine;
pub mod errors;
pub mod fs;
pub mod gate;
pub mod logging;
pub mod manifold;
pub mod reconcile;
pub mod types;
pub mod worker;

use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use crate::agent::{ManifoldsConfig, TerminationSignal, termination_channel};
use crate::cli::CliArgs;
use crate::config::ConfigFile;
use crate::config::loader::load_and_validate;
use crate::engine::{Engine, install_all};
use crate::errors::EngineError;
use crate::fs::mock::MockFileSystem;
use crate::fs::{FileSystem, RealFileSystem};
use crate::manifold::{ManifoldGraph, Manifolds};
use crate::reconcile::{FileBroker, FileStateSource};
use crate::worker::Worker;

/// High-level entry point used by `main.rs`.
///
/// This wires together:
/// - config loading
/// - the dependency engine and the agent manifolds
/// - file-backed state source and broker
/// - Ctrl-C and SIGTERM handling
pub async fn run(args: CliArgs) -> Result<()> {
    let cfg = load_and_validate(&args.config)?;

    if args.dry_run {
        return print_dry_run(&cfg);
    }

    let engine = Engine::new(cfg.engine_config())?;
    let (trigger, termination) = termination_channel();
    let fs: Arc<dyn FileSystem> = Arc::new(RealFileSystem);
    let manifolds = agent_manifolds(&cfg, fs, termination)?;

    // Ctrl-C → stop everything without going through termination.
    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "failed to listen for Ctrl+C");
                return;
            }
            info!("interrupted");
            engine.kill();
        });
    }

    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::spawn(async move {
                    if sigterm.recv().await.is_some() {
                        trigger.fire();
                    }
                });
            }
            Err(e) => warn!(error = %e, "failed to listen for SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    drop(trigger);

    if let Err(err) = install_all(&engine, manifolds).await {
        engine.kill();
        let _ = engine.wait().await;
        return Err(err.into());
    }
    info!(application = %cfg.agent.application, units = cfg.agent.units.len(), "agent running");

    match engine.wait().await {
        Ok(()) => Ok(()),
        Err(EngineError::TerminateAgent) => {
            info!("agent terminated");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}

fn agent_manifolds(
    cfg: &ConfigFile,
    fs: Arc<dyn FileSystem>,
    termination: TerminationSignal,
) -> Result<Manifolds> {
    let source = FileStateSource::new(cfg.agent.state_dir.clone(), fs.clone())?;
    let broker = FileBroker::new(cfg.agent.deploy_dir.clone(), fs.clone());
    let (manifolds, _, _) = agent::manifolds(ManifoldsConfig {
        agent: cfg.agent.clone(),
        fs,
        source: Arc::new(source),
        broker: Arc::new(broker),
        termination,
    });
    Ok(manifolds)
}

/// Print engine settings and the manifold graph in install order.
///
/// Built against an in-memory filesystem so nothing is created on disk.
fn print_dry_run(cfg: &ConfigFile) -> Result<()> {
    let fs: Arc<dyn FileSystem> = Arc::new(MockFileSystem::new());
    let (_trigger, termination) = termination_channel();
    let manifolds = agent_manifolds(cfg, fs, termination)?;
    let graph = ManifoldGraph::new(&manifolds)?;

    let engine = cfg.engine_config();
    println!("depagent dry-run");
    println!("  engine.idle_poll = {:?}", engine.idle_poll);
    println!(
        "  engine.backoff = {:?} .. {:?} (x{}, jitter {})",
        engine.backoff.base, engine.backoff.max, engine.backoff.factor, engine.backoff.jitter
    );
    println!("  agent.application = {}", cfg.agent.application);
    println!("  agent.units = {:?}", cfg.agent.units);
    println!("  agent.state_dir = {}", cfg.agent.state_dir.display());
    println!("  agent.deploy_dir = {}", cfg.agent.deploy_dir.display());
    println!();

    println!("manifolds ({}):", graph.len());
    for name in graph.order() {
        println!("  - {name}");
        let inputs = graph.dependencies_of(name);
        if !inputs.is_empty() {
            println!("      inputs: {inputs:?}");
        }
    }
    Ok(())
}
