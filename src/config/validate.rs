// src/config/validate.rs

use std::collections::BTreeSet;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{EngineError, Result};
use crate::reconcile::spec::{application_of, validate_unit_name};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::EngineError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw.engine, raw.agent))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_engine_section(cfg)?;
    validate_agent_section(cfg)?;
    Ok(())
}

fn validate_engine_section(cfg: &RawConfigFile) -> Result<()> {
    if cfg.engine.idle_poll.is_zero() {
        return Err(EngineError::Config(
            "[engine].idle_poll must be > 0".to_string(),
        ));
    }
    cfg.engine.backoff().validate().map_err(|err| match err {
        EngineError::Config(msg) => EngineError::Config(format!("[engine]: {msg}")),
        other => other,
    })
}

fn validate_agent_section(cfg: &RawConfigFile) -> Result<()> {
    let agent = &cfg.agent;
    if agent.application.trim().is_empty() {
        return Err(EngineError::Config(
            "[agent].application must not be empty".to_string(),
        ));
    }

    let mut seen = BTreeSet::new();
    for unit in &agent.units {
        validate_unit_name(unit).map_err(|_| {
            EngineError::Config(format!(
                "[agent].units: {unit:?} is not a valid unit name"
            ))
        })?;
        if application_of(unit) != agent.application {
            return Err(EngineError::Config(format!(
                "[agent].units: unit {:?} does not belong to application {:?}",
                unit, agent.application
            )));
        }
        if !seen.insert(unit.as_str()) {
            return Err(EngineError::Config(format!(
                "[agent].units: unit {unit:?} listed more than once"
            )));
        }
    }

    if agent.state_dir == agent.deploy_dir {
        return Err(EngineError::Config(
            "[agent].state_dir and [agent].deploy_dir must differ".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(text: &str) -> RawConfigFile {
        toml::from_str(text).unwrap()
    }

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = ConfigFile::try_from(raw("[agent]\napplication = \"mysql\"\n")).unwrap();
        assert_eq!(cfg.engine.backoff_factor, 2.0);
        assert!(cfg.agent.units.is_empty());
        assert_eq!(cfg.engine_config().idle_poll, std::time::Duration::from_secs(3));
    }

    #[test]
    fn rejects_foreign_unit() {
        let err = ConfigFile::try_from(raw(
            "[agent]\napplication = \"mysql\"\nunits = [\"redis/0\"]\n",
        ))
        .unwrap_err();
        assert!(err.to_string().contains("does not belong"));
    }

    #[test]
    fn rejects_bad_backoff() {
        let err = ConfigFile::try_from(raw(
            "[engine]\nbackoff_factor = 0.5\n[agent]\napplication = \"mysql\"\n",
        ))
        .unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
    }
}
