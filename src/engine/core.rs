// src/engine/core.rs

//! Pure engine state machine.
//!
//! `EngineCore` owns every slot and decides, pass by pass, which workers to
//! start, which to bounce and when to retry. It never awaits: the async
//! shell ([`crate::engine::runtime`]) feeds it install requests, worker
//! deaths and clock ticks, and executes the [`EngineCommand`]s it returns.
//!
//! The only side effects it performs directly are calling manifold start
//! functions and `Worker::kill`, both of which return immediately.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::backoff::BackoffPolicy;
use crate::engine::config::{EngineConfig, FatalFn};
use crate::engine::report::{Report, SlotReport};
use crate::engine::slot::Slot;
use crate::errors::{EngineError, Result};
use crate::manifold::{Context, Manifold};
use crate::types::{EngineState, SlotState};
use crate::worker::Worker;
use crate::worker::catacomb::panic_message;

/// Command produced by the core, to be executed by the async shell.
pub enum EngineCommand {
    /// Wait on a freshly started worker and report back when it stops.
    Watch {
        name: String,
        generation: u64,
        worker: Arc<dyn Worker>,
    },
    /// Kill the whole engine with this error.
    Fatal(EngineError),
}

impl std::fmt::Debug for EngineCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineCommand::Watch {
                name, generation, ..
            } => f
                .debug_struct("Watch")
                .field("name", name)
                .field("generation", generation)
                .finish_non_exhaustive(),
            EngineCommand::Fatal(err) => f.debug_tuple("Fatal").field(err).finish(),
        }
    }
}

/// A dependency change that would bounce a running slot.
struct Trigger {
    input: String,
    error: EngineError,
    /// Current generation of the input when it is live.
    generation: Option<u64>,
}

pub struct EngineCore {
    slots: BTreeMap<String, Slot>,
    backoff: BackoffPolicy,
    idle_poll: Duration,
    is_fatal: FatalFn,
    state: EngineState,
}

impl std::fmt::Debug for EngineCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineCore")
            .field("slots", &self.slots.keys().collect::<Vec<_>>())
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl EngineCore {
    pub fn new(config: &EngineConfig) -> Self {
        Self {
            slots: BTreeMap::new(),
            backoff: config.backoff,
            idle_poll: config.idle_poll,
            is_fatal: config.is_fatal.clone(),
            state: EngineState::Started,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Add a manifold. Its inputs must already be installed.
    pub fn install(&mut self, name: &str, manifold: Manifold) -> Result<()> {
        if self.state != EngineState::Started {
            return Err(EngineError::Dying);
        }
        if self.slots.contains_key(name) {
            return Err(EngineError::DuplicateName(name.to_string()));
        }
        for input in &manifold.inputs {
            if input == name {
                return Err(EngineError::SelfDependency(name.to_string()));
            }
            if !self.slots.contains_key(input) {
                return Err(EngineError::UnknownInput {
                    name: name.to_string(),
                    input: input.clone(),
                });
            }
        }

        info!(manifold = %name, inputs = ?manifold.inputs, "installed manifold");
        self.slots.insert(name.to_string(), Slot::new(manifold));
        Ok(())
    }

    /// Record that the worker started as `generation` of `name` has stopped.
    ///
    /// Reports about workers the slot no longer owns are ignored.
    pub fn worker_stopped(
        &mut self,
        name: &str,
        generation: u64,
        result: Result<()>,
        now: Instant,
    ) -> Vec<EngineCommand> {
        let mut commands = Vec::new();
        let engine_running = self.state == EngineState::Started;
        let backoff = self.backoff;
        let idle_poll = self.idle_poll;

        let Some(slot) = self.slots.get_mut(name) else {
            debug!(manifold = %name, generation, "stop reported for unknown manifold");
            return commands;
        };
        if slot.generation != generation || slot.worker.is_none() {
            debug!(manifold = %name, generation, "ignoring stale stop report");
            return commands;
        }

        slot.worker = None;
        let requested = slot.stop_reason.take();
        let ran_for = slot
            .started_at
            .take()
            .map(|at| now.saturating_duration_since(at))
            .unwrap_or_default();

        let fatal = match (&result, &requested) {
            (Err(err), _) if (self.is_fatal)(err) => Some(err),
            (_, Some(reason)) if (self.is_fatal)(reason) => Some(reason),
            _ => None,
        };
        if let Some(err) = fatal {
            warn!(manifold = %name, error = %err, "fatal worker error");
            commands.push(EngineCommand::Fatal(err.clone()));
        }

        if !engine_running {
            slot.state = SlotState::Stopped;
            slot.retry_at = None;
            if let Err(err) = result {
                if !err.is_dying() {
                    slot.last_error = Some(err);
                }
            }
            debug!(manifold = %name, generation, "worker stopped during shutdown");
            return commands;
        }

        // Uninstall is honoured whatever the engine asked for.
        let uninstall = matches!(&result, Err(err) if err.is_uninstall())
            || matches!(&requested, Some(reason) if reason.is_uninstall());
        if uninstall {
            self.uninstall(name);
            return commands;
        }

        let cause = match requested {
            Some(reason) => Some(reason),
            None => result.err(),
        };
        match cause {
            None | Some(EngineError::Dying) => {
                info!(manifold = %name, generation, "worker exited; restarting after base delay");
                slot.state = SlotState::Stopped;
                slot.failures = 0;
                slot.retry_at = Some(now + backoff.base);
            }
            Some(EngineError::Bounce) => {
                debug!(manifold = %name, generation, "worker bounced; restarting");
                slot.state = SlotState::Waiting;
                slot.failures = 0;
                slot.retry_at = None;
            }
            Some(EngineError::Missing) => {
                // Retried when an input changes or on the next idle tick.
                debug!(manifold = %name, generation, "worker stopped; waiting for dependencies");
                slot.state = SlotState::Waiting;
                slot.retry_at = Some(now + idle_poll);
                slot.parked = true;
            }
            Some(err) => {
                // A worker that ran for a long while starts its count over.
                slot.failures = if ran_for < backoff.max {
                    slot.failures.saturating_add(1)
                } else {
                    1
                };
                let delay = backoff.delay(slot.failures);
                warn!(
                    manifold = %name,
                    generation,
                    failures = slot.failures,
                    error = %err,
                    retry_in = ?delay,
                    "worker failed"
                );
                slot.state = SlotState::Failed;
                slot.retry_at = Some(now + delay);
                slot.last_error = Some(err);
            }
        }
        commands
    }

    /// Bring slot state up to date: bounce stale workers and start every
    /// pending slot whose inputs are running.
    ///
    /// Slots are visited in name order; each pending slot gets at most one
    /// start attempt per pass.
    pub fn pass(&mut self, now: Instant) -> Vec<EngineCommand> {
        let mut commands = Vec::new();
        if self.state != EngineState::Started {
            return commands;
        }

        let mut attempted = BTreeSet::new();
        loop {
            let bounced = self.bounce_stale();
            let started = self.start_ready(now, &mut attempted, &mut commands);
            if !bounced && !started {
                break;
            }
        }
        commands
    }

    /// Earliest scheduled retry, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        if self.state != EngineState::Started {
            return None;
        }
        self.slots
            .values()
            .filter(|slot| slot.is_pending())
            .filter_map(|slot| slot.retry_at)
            .min()
    }

    /// Stop every worker. No slot starts again afterwards.
    pub fn shutdown(&mut self) {
        if self.state != EngineState::Started {
            return;
        }
        info!(slots = self.slots.len(), "stopping dependency engine");
        self.state = EngineState::Stopping;
        for slot in self.slots.values_mut() {
            slot.retry_at = None;
            slot.request_stop(EngineError::Dying);
        }
    }

    /// True once shutdown was requested and every worker has stopped.
    pub fn is_finished(&self) -> bool {
        self.state != EngineState::Started && self.slots.values().all(Slot::is_pending)
    }

    pub fn mark_stopped(&mut self) {
        self.state = EngineState::Stopped;
    }

    pub fn report(&self) -> Report {
        let slots = self
            .slots
            .iter()
            .map(|(name, slot)| {
                let report = SlotReport {
                    state: slot.state,
                    generation: slot.generation,
                    inputs: slot.manifold.inputs.clone(),
                    failures: slot.failures,
                    last_error: slot.last_error.as_ref().map(ToString::to_string),
                };
                (name.clone(), report)
            })
            .collect();
        Report {
            state: self.state,
            slots,
        }
    }

    pub fn is_installed(&self, name: &str) -> bool {
        self.slots.contains_key(name)
    }

    pub fn state_of(&self, name: &str) -> Option<SlotState> {
        self.slots.get(name).map(|slot| slot.state)
    }

    pub fn generation(&self, name: &str) -> Option<u64> {
        self.slots.get(name).map(|slot| slot.generation)
    }

    /// Input generations the running worker of `name` was started with.
    pub fn input_snapshot(&self, name: &str) -> Option<&BTreeMap<String, u64>> {
        self.slots
            .get(name)
            .filter(|slot| slot.worker.is_some())
            .map(|slot| &slot.started_with)
    }

    /// Slots whose worker was asked to stop and has not reported back yet.
    pub fn stopping(&self) -> Vec<(String, u64)> {
        self.slots
            .iter()
            .filter(|(_, slot)| slot.worker.is_some() && slot.stop_reason.is_some())
            .map(|(name, slot)| (name.clone(), slot.generation))
            .collect()
    }

    /// Nothing left to do at `now` until an external event arrives.
    pub fn is_quiescent(&self, now: Instant) -> bool {
        self.slots.iter().all(|(name, slot)| {
            if slot.stop_reason.is_some() {
                return false;
            }
            if slot.is_pending() {
                return !self.may_start(slot, now) || self.resolve_inputs(name, slot).is_none();
            }
            self.triggers_for(slot).is_empty()
        })
    }

    fn uninstall(&mut self, name: &str) {
        if self.slots.remove(name).is_some() {
            info!(manifold = %name, "uninstalled manifold");
        }
    }

    fn triggers_for(&self, slot: &Slot) -> Vec<Trigger> {
        let mut triggers = Vec::new();
        for input in &slot.manifold.inputs {
            let (error, generation) = match self.slots.get(input) {
                None => (EngineError::Missing, None),
                Some(dep) => match dep.live_generation() {
                    None => (dep.unavailable_error(), None),
                    Some(current) if slot.started_with.get(input) != Some(&current) => {
                        (EngineError::Bounce, Some(current))
                    }
                    Some(_) => continue,
                },
            };
            triggers.push(Trigger {
                input: input.clone(),
                error,
                generation,
            });
        }
        triggers
    }

    fn bounce_stale(&mut self) -> bool {
        let stale: Vec<(String, Vec<Trigger>)> = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.live_generation().is_some())
            .map(|(name, slot)| (name.clone(), self.triggers_for(slot)))
            .filter(|(_, triggers)| !triggers.is_empty())
            .collect();

        let mut bounced = false;
        for (name, triggers) in stale {
            let Some(slot) = self.slots.get_mut(&name) else {
                continue;
            };
            let filter = slot.manifold.filter.clone();
            let mut reason = None;
            for trigger in triggers {
                // Unfiltered, a dead input only makes the dependent wait.
                let applied = match &filter {
                    Some(filter) => filter(&trigger.input, trigger.error),
                    None if trigger.error.is_bounce() => Some(EngineError::Bounce),
                    None => Some(EngineError::Missing),
                };
                match applied {
                    Some(err) => {
                        reason = Some((trigger.input, err));
                        break;
                    }
                    None => {
                        debug!(
                            manifold = %name,
                            input = %trigger.input,
                            "input change filtered out"
                        );
                        if let Some(generation) = trigger.generation {
                            slot.started_with.insert(trigger.input, generation);
                        }
                    }
                }
            }

            if let Some((input, err)) = reason {
                info!(manifold = %name, input = %input, reason = %err, "bouncing manifold");
                slot.request_stop(err);
                bounced = true;
            }
        }
        bounced
    }

    /// A pending slot may start once its retry deadline passed, or, when
    /// parked as not ready, as soon as any input runs a new generation.
    fn may_start(&self, slot: &Slot, now: Instant) -> bool {
        if slot.is_due(now) {
            return true;
        }
        slot.parked
            && slot.manifold.inputs.iter().any(|input| {
                let current = self.slots.get(input).and_then(Slot::live_generation);
                current.is_some() && current.as_ref() != slot.started_with.get(input)
            })
    }

    /// Build the start context for a pending slot, with the input
    /// generations it will be started with. `None` if any input is not
    /// running.
    fn resolve_inputs(&self, name: &str, slot: &Slot) -> Option<(Context, BTreeMap<String, u64>)> {
        let mut ctx = Context::new(name);
        let mut snapshot = BTreeMap::new();
        for input in &slot.manifold.inputs {
            let dep = self.slots.get(input)?;
            let generation = dep.live_generation()?;
            let worker = dep.worker.clone()?;
            ctx = ctx.with_input(input.clone(), worker, dep.manifold.output.clone());
            snapshot.insert(input.clone(), generation);
        }
        Some((ctx, snapshot))
    }

    fn start_ready(
        &mut self,
        now: Instant,
        attempted: &mut BTreeSet<String>,
        commands: &mut Vec<EngineCommand>,
    ) -> bool {
        let names: Vec<String> = self.slots.keys().cloned().collect();
        let mut progressed = false;

        for name in names {
            if attempted.contains(&name) {
                continue;
            }
            let Some(slot) = self.slots.get(&name) else {
                continue;
            };
            if !slot.is_pending() || !self.may_start(slot, now) {
                continue;
            }
            let Some((ctx, snapshot)) = self.resolve_inputs(&name, slot) else {
                if let Some(slot) = self.slots.get_mut(&name) {
                    slot.state = SlotState::Waiting;
                }
                continue;
            };

            attempted.insert(name.clone());
            let start = slot.manifold.start.clone();
            let outcome = catch_unwind(AssertUnwindSafe(|| start(&ctx)))
                .unwrap_or_else(|payload| Err(EngineError::Panicked(panic_message(payload))));

            match outcome {
                Ok(worker) => {
                    let Some(slot) = self.slots.get_mut(&name) else {
                        continue;
                    };
                    slot.generation += 1;
                    slot.worker = Some(worker.clone());
                    slot.started_with = snapshot;
                    slot.started_at = Some(now);
                    slot.state = SlotState::Started;
                    slot.retry_at = None;
                    slot.parked = false;
                    info!(manifold = %name, generation = slot.generation, "started manifold");
                    commands.push(EngineCommand::Watch {
                        name: name.clone(),
                        generation: slot.generation,
                        worker,
                    });
                    progressed = true;
                }
                Err(err) => {
                    progressed |= self.start_failed(&name, err, now, commands);
                }
            }
        }
        progressed
    }

    /// Apply a failed start. Returns true if the slot set changed.
    fn start_failed(
        &mut self,
        name: &str,
        err: EngineError,
        now: Instant,
        commands: &mut Vec<EngineCommand>,
    ) -> bool {
        if err.is_uninstall() {
            self.uninstall(name);
            return true;
        }
        let backoff = self.backoff;
        let is_fatal = (self.is_fatal)(&err);
        let Some(slot) = self.slots.get_mut(name) else {
            return false;
        };

        match err {
            EngineError::Missing => {
                debug!(manifold = %name, "start postponed: dependency not available");
                slot.state = SlotState::Waiting;
                slot.retry_at = None;
            }
            EngineError::Bounce => {
                debug!(manifold = %name, "start bounced; retrying on next pass");
                slot.state = SlotState::Waiting;
                slot.retry_at = None;
            }
            err => {
                slot.failures = slot.failures.saturating_add(1);
                let delay = backoff.delay(slot.failures);
                warn!(
                    manifold = %name,
                    failures = slot.failures,
                    error = %err,
                    retry_in = ?delay,
                    "start failed"
                );
                if is_fatal {
                    commands.push(EngineCommand::Fatal(err.clone()));
                }
                slot.state = SlotState::Failed;
                slot.retry_at = Some(now + delay);
                slot.parked = false;
                slot.last_error = Some(err);
            }
        }
        false
    }
}
