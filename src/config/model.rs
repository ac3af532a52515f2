// src/config/model.rs

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::duration;
use crate::engine::{BackoffPolicy, EngineConfig};

/// Top-level configuration as read from a TOML file.
///
/// ```toml
/// [engine]
/// idle_poll = "3s"
/// backoff_base = "3s"
/// backoff_max = "1m"
/// backoff_factor = 2.0
/// backoff_jitter = 0.1
///
/// [agent]
/// application = "mysql"
/// units = ["mysql/0", "mysql/1"]
/// state_dir = "state"
/// deploy_dir = "deployed"
/// ```
///
/// `[engine]` is optional. Relative directories are resolved against the
/// directory holding the config file.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    #[serde(default)]
    pub engine: EngineSection,
    pub agent: AgentConfig,
}

/// Validated configuration; build it with `ConfigFile::try_from(raw)`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub engine: EngineSection,
    pub agent: AgentConfig,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(engine: EngineSection, agent: AgentConfig) -> Self {
        Self { engine, agent }
    }

    /// Engine settings; everything except the timing knobs is left at its
    /// default.
    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            idle_poll: self.engine.idle_poll,
            backoff: self.engine.backoff(),
            ..EngineConfig::default()
        }
    }
}

/// `[engine]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct EngineSection {
    /// Upper bound between two engine passes when nothing happens.
    #[serde(with = "duration")]
    pub idle_poll: Duration,

    /// Delay before the first retry of a failed worker.
    #[serde(with = "duration")]
    pub backoff_base: Duration,

    /// Cap on the retry delay.
    #[serde(with = "duration")]
    pub backoff_max: Duration,

    pub backoff_factor: f64,

    /// Random stretch of each delay, as a fraction in `[0, 1]`.
    pub backoff_jitter: f64,
}

impl Default for EngineSection {
    fn default() -> Self {
        let backoff = BackoffPolicy::default();
        Self {
            idle_poll: EngineConfig::default().idle_poll,
            backoff_base: backoff.base,
            backoff_max: backoff.max,
            backoff_factor: backoff.factor,
            backoff_jitter: backoff.jitter,
        }
    }
}

impl EngineSection {
    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy {
            base: self.backoff_base,
            max: self.backoff_max,
            factor: self.backoff_factor,
            jitter: self.backoff_jitter,
        }
    }
}

/// `[agent]` section: what the machine agent provisions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentConfig {
    /// Application whose units this agent runs.
    pub application: String,

    /// Units to provision, e.g. `"mysql/0"`.
    #[serde(default)]
    pub units: Vec<String>,

    /// Where desired container specs are read from.
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Where deployed container specs are written to.
    #[serde(default = "default_deploy_dir")]
    pub deploy_dir: PathBuf,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("state")
}

fn default_deploy_dir() -> PathBuf {
    PathBuf::from("deployed")
}

impl AgentConfig {
    /// Resolve relative directories against `root`.
    pub fn rooted_at(mut self, root: &std::path::Path) -> Self {
        if self.state_dir.is_relative() {
            self.state_dir = root.join(&self.state_dir);
        }
        if self.deploy_dir.is_relative() {
            self.deploy_dir = root.join(&self.deploy_dir);
        }
        self
    }
}
