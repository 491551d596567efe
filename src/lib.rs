//! Blocklist mirror
//!
//! A CrowdSec bouncer that mirrors Local API decisions and republishes them
//! as blocklists over a local HTTP endpoint.
//!
//! # Features
//!
//! - **Authentication**: static API key or mutual-TLS client certificate
//! - **Trust**: system roots, or a CA bundle that replaces them
//! - **Sync**: periodic decision stream pulls into an in-memory cache
//! - **Formats**: plain text and `MikroTik` address-list scripts
//! - **Access control**: basic auth or trusted address lists per endpoint

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod blocklist;
pub mod bouncer;
pub mod cli;
pub mod config;
pub mod decision;
pub mod error;
pub mod lapi;
pub mod server;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` wins over `level` when set.
///
/// # Errors
///
/// Returns `Error::Config` if `level` is not a valid filter directive or a
/// global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(level)
            .map_err(|e| Error::Config(format!("invalid log level '{level}': {e}")))?,
    };

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        Some("text") | None => subscriber.with(fmt::layer()).try_init(),
        Some(other) => {
            return Err(Error::Config(format!(
                "unknown log format '{other}' (expected text or json)"
            )));
        }
    };
    installed.map_err(|e| Error::Config(format!("tracing already initialised: {e}")))
}
