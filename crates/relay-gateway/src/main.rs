//! Relay gateway entry point.
//!
//! Loads the TOML configuration, starts the transport service, binds every
//! configured service and runs until Ctrl+C.
//!
//! # Usage
//!
//! ```text
//! relay-gateway [OPTIONS]
//!
//! Options:
//!   --config    <PATH>   Configuration file [default: relay.toml]
//!   --workers   <N>      I/O worker threads (overrides gateway.workers)
//!   --log-level <LEVEL>  Log filter when RUST_LOG is unset (overrides gateway.log_level)
//! ```
//!
//! # Environment variable overrides
//!
//! | Variable            | Default      | Description             |
//! |---------------------|--------------|-------------------------|
//! | `RELAY_CONFIG`      | `relay.toml` | Configuration file path |
//! | `RELAY_WORKERS`     | one per CPU  | I/O worker threads      |
//! | `RELAY_LOG_LEVEL`   | `info`       | Log filter              |
//! | `RUST_LOG`          |              | Takes precedence over both log settings |

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use relay_gateway::infrastructure::{load_config, Gateway};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// Multi-protocol relay gateway.
#[derive(Debug, Parser)]
#[command(
    name = "relay-gateway",
    about = "Binds prefix-sniffed echo and relay services onto shared ports",
    version
)]
struct Cli {
    /// Path of the TOML configuration file.  A missing file means defaults.
    #[arg(long, default_value = "relay.toml", env = "RELAY_CONFIG")]
    config: PathBuf,

    /// Number of I/O worker threads.
    #[arg(long, env = "RELAY_WORKERS")]
    workers: Option<usize>,

    /// Log filter used when `RUST_LOG` is unset (`info`, `debug`, ...).
    #[arg(long, env = "RELAY_LOG_LEVEL")]
    log_level: Option<String>,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_config(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config.display()))?;

    // `RUST_LOG` wins; then --log-level; then the config file.
    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.gateway.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level)))
        .init();

    info!(
        config = %cli.config.display(),
        services = config.services.len(),
        "relay gateway starting"
    );

    let gateway = Gateway::start(&config, cli.workers)
        .await
        .context("starting gateway")?;

    info!("relay gateway ready.  Press Ctrl-C to exit.");
    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    info!("shutdown signal received");

    gateway.shutdown().await;
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_defaults() {
        // Arrange / Act
        let cli = Cli::parse_from(["relay-gateway"]);

        // Assert
        assert_eq!(cli.config, PathBuf::from("relay.toml"));
        assert_eq!(cli.workers, None);
    }

    #[test]
    fn test_cli_parses_overrides() {
        let cli = Cli::parse_from([
            "relay-gateway",
            "--config",
            "/etc/relay.toml",
            "--workers",
            "6",
            "--log-level",
            "debug",
        ]);
        assert_eq!(cli.config, PathBuf::from("/etc/relay.toml"));
        assert_eq!(cli.workers, Some(6));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
    }
}
