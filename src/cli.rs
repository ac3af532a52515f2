// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

use crate::config::default_config_path;

/// Command-line arguments for `depagent`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "depagent",
    version,
    about = "Run an application's units under a supervised dependency engine.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the agent config file (TOML).
    ///
    /// Default: `depagent.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value_os_t = default_config_path())]
    pub config: PathBuf,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `DEPENGINE_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the manifold graph, but don't start anything.
    #[arg(long)]
    pub dry_run: bool,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let args = CliArgs::try_parse_from(["depagent"]).unwrap();
        assert_eq!(args.config, PathBuf::from("depagent.toml"));
        assert_eq!(args.log_level, None);
        assert!(!args.dry_run);
    }

    #[test]
    fn all_flags() {
        let args = CliArgs::try_parse_from([
            "depagent",
            "--config",
            "etc/agent.toml",
            "--log-level",
            "debug",
            "--dry-run",
        ])
        .unwrap();
        assert_eq!(args.config, PathBuf::from("etc/agent.toml"));
        assert_eq!(args.log_level, Some(LogLevel::Debug));
        assert!(args.dry_run);
    }
}
