//! Command-line interface

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};

use crate::config::humantime_serde;

/// Mirror CrowdSec decisions as local blocklists
#[derive(Parser, Debug)]
#[command(name = "blocklist-mirror")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file (YAML)
    #[arg(short, long, env = "BLOCKLIST_MIRROR_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(
        long,
        default_value = "info",
        env = "BLOCKLIST_MIRROR_LOG_LEVEL",
        global = true
    )]
    pub log_level: String,

    /// Log format (text, json)
    #[arg(long, env = "BLOCKLIST_MIRROR_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Subcommand (optional - defaults to server mode)
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Command {
    /// Connect to the Local API and serve blocklists (default)
    Serve,

    /// Validate the configuration and print it with secrets masked
    CheckConfig,

    /// Wait until the Local API answers on /health
    Health {
        /// Give up after this long (e.g. 30s, 1m30s)
        #[arg(long, default_value = "30s", value_parser = humantime_serde::parse)]
        timeout: Duration,

        /// Delay between probes
        #[arg(long, default_value = "1s", value_parser = humantime_serde::parse)]
        interval: Duration,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_to_serve_mode() {
        let cli = Cli::try_parse_from(["blocklist-mirror", "-c", "cfg.yaml"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config, Some(PathBuf::from("cfg.yaml")));
        assert_eq!(cli.log_level, "info");
    }

    #[test]
    fn health_parses_durations() {
        let cli = Cli::try_parse_from([
            "blocklist-mirror",
            "health",
            "--timeout",
            "2m",
            "--interval",
            "250ms",
        ])
        .unwrap();
        match cli.command {
            Some(Command::Health { timeout, interval }) => {
                assert_eq!(timeout, Duration::from_secs(120));
                assert_eq!(interval, Duration::from_millis(250));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "blocklist-mirror",
            "check-config",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert!(matches!(cli.command, Some(Command::CheckConfig)));
        assert_eq!(cli.log_format.as_deref(), Some("json"));
    }

    #[test]
    fn bad_duration_is_rejected() {
        let err = Cli::try_parse_from(["blocklist-mirror", "health", "--timeout", "soon"]);
        assert!(err.is_err());
    }

    #[test]
    fn compound_timeout_is_accepted() {
        let cli =
            Cli::try_parse_from(["blocklist-mirror", "health", "--timeout", "1m30s"]).unwrap();
        match cli.command {
            Some(Command::Health { timeout, .. }) => assert_eq!(timeout, Duration::from_secs(90)),
            other => panic!("unexpected command: {other:?}"),
        }
    }
}
