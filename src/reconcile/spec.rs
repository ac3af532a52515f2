// src/reconcile/spec.rs

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use anyhow::{Context, bail};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, Result};
use crate::reconcile::Payload;

static UNIT_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z][a-z0-9]*(-[a-z0-9]*[a-z][a-z0-9]*)*/[0-9]+$")
        .unwrap_or_else(|err| panic!("invalid unit name pattern: {err}"))
});

/// Check that `name` looks like `application/number`.
pub fn validate_unit_name(name: &str) -> Result<()> {
    if UNIT_NAME.is_match(name) {
        Ok(())
    } else {
        Err(EngineError::Config(format!("{name:?} is not a valid unit name")))
    }
}

/// Filesystem-safe form of a unit name: `mysql/0` becomes `mysql-0`.
pub fn unit_tag(unit: &str) -> String {
    unit.replace('/', "-")
}

/// Application part of a unit name.
pub fn application_of(unit: &str) -> &str {
    unit.split_once('/').map_or(unit, |(app, _)| app)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PortSpec {
    pub container_port: u16,
    #[serde(default)]
    pub protocol: Protocol,
}

/// Desired container for one unit.
///
/// ```toml
/// image = "mysql:8.0"
/// ports = [{ container_port = 3306 }]
///
/// [config]
/// MYSQL_DATABASE = "wordpress"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ContainerSpec {
    pub image: String,
    #[serde(default)]
    pub ports: Vec<PortSpec>,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

impl ContainerSpec {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.image.trim().is_empty() {
            bail!("image must not be empty");
        }
        let mut seen = BTreeSet::new();
        for port in &self.ports {
            if port.container_port == 0 {
                bail!("container_port must be > 0");
            }
            if !seen.insert((port.container_port, port.protocol)) {
                bail!(
                    "port {}/{:?} declared more than once",
                    port.container_port,
                    port.protocol
                );
            }
        }
        Ok(())
    }

    /// Canonical TOML rendering.
    pub fn render(&self) -> Result<String> {
        toml::to_string(self).map_err(EngineError::other)
    }
}

impl Payload for ContainerSpec {
    const KIND: &'static str = "container spec";

    fn parse(text: &str) -> anyhow::Result<Self> {
        let spec: ContainerSpec = toml::from_str(text).context("invalid TOML")?;
        spec.validate()?;
        Ok(spec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_full_spec() {
        let spec = ContainerSpec::parse(
            r#"
image = "mysql:8.0"
ports = [
  { container_port = 3306 },
  { container_port = 53, protocol = "UDP" },
]

[config]
MYSQL_DATABASE = "wordpress"
"#,
        )
        .unwrap();

        assert_eq!(spec.image, "mysql:8.0");
        assert_eq!(spec.ports[0].protocol, Protocol::Tcp);
        assert_eq!(spec.ports[1].protocol, Protocol::Udp);
        assert_eq!(spec.config["MYSQL_DATABASE"], "wordpress");
    }

    #[test]
    fn rendered_spec_parses_back() {
        let spec =
            ContainerSpec::parse("image = \"redis\"\nports = [{ container_port = 6379 }]\n")
                .unwrap();
        let again = ContainerSpec::parse(&spec.render().unwrap()).unwrap();
        assert_eq!(spec, again);
    }

    #[test]
    fn rejects_invalid_specs() {
        for text in [
            "ports = []",
            "image = \"\"",
            "image = \"x\"\nports = [{ container_port = 0 }]",
            "image = \"x\"\nports = [{ container_port = 80 }, { container_port = 80 }]",
            "image = \"x\"\nunknown = 1",
            "image = \"x\"\nports = [{ container_port = 80, protocol = \"SCTP\" }]",
        ] {
            assert!(ContainerSpec::parse(text).is_err(), "{text}");
        }
    }

    #[test]
    fn unit_names() {
        for ok in ["mysql/0", "wordpress-db/12", "a1-b2c/3"] {
            assert!(validate_unit_name(ok).is_ok(), "{ok}");
        }
        for bad in ["mysql", "MySQL/0", "mysql/", "1sql/0", "my--sql/0", "mysql-/0", "mysql/x"] {
            assert!(validate_unit_name(bad).is_err(), "{bad}");
        }
        assert_eq!(unit_tag("mysql/0"), "mysql-0");
        assert_eq!(application_of("wordpress-db/12"), "wordpress-db");
    }
}
