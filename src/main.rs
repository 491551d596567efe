//! Blocklist mirror - CrowdSec decisions served as local blocklists

use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};

use blocklist_mirror::{
    bouncer,
    cli::{Cli, Command},
    config::Config,
    lapi::{HealthProbe, wait_until_ready},
    setup_tracing,
};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_tracing(&cli.log_level, cli.log_format.as_deref()) {
        eprintln!("Failed to setup tracing: {e}");
        return ExitCode::FAILURE;
    }

    if rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .is_err()
    {
        tracing::debug!("A rustls crypto provider was already installed");
    }

    let config = match Config::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            error!("process terminated with error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match cli.command {
        Some(Command::CheckConfig) => run_check_config(&config),
        Some(Command::Health { timeout, interval }) => {
            run_health(&config, timeout, interval).await
        }
        Some(Command::Serve) | None => run_server(config).await,
    }
}

/// Print the effective configuration with secrets masked
fn run_check_config(config: &Config) -> ExitCode {
    match serde_yaml::to_string(&config.redacted()) {
        Ok(yaml) => {
            println!("{yaml}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Failed to render configuration: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Wait for the authority's /health
async fn run_health(config: &Config, timeout: Duration, interval: Duration) -> ExitCode {
    let connected = match bouncer::connect(config) {
        Ok(connected) => connected,
        Err(e) => {
            error!("process terminated with error: {e}");
            return ExitCode::FAILURE;
        }
    };
    let probe: Arc<dyn HealthProbe> = match connected.client.health_probe() {
        Ok(probe) => Arc::new(probe),
        Err(e) => {
            error!("process terminated with error: {e}");
            return ExitCode::FAILURE;
        }
    };

    match wait_until_ready(probe, interval, timeout).await {
        Ok(ready) => {
            println!("ready (HTTP {}, {} ms)", ready.status, ready.latency_ms);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("process terminated with error: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run_server(config: Config) -> ExitCode {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        lapi_url = %config.crowdsec_config.lapi_url,
        blocklists = config.blocklists.len(),
        "Starting blocklist mirror"
    );

    match bouncer::start(Arc::new(config)).await {
        Ok(running) => {
            running.run_until_signal().await;
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("process terminated with error: {e}");
            ExitCode::FAILURE
        }
    }
}
