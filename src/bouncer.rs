//! Bouncer lifecycle
//!
//! Startup is a strict sequence of phases:
//!
//! ```text
//! Init -> TlsHandshake -> AuthSelect -> Authenticating -> Serving
//!   \__________\______________\______________\___________> Failed
//! ```
//!
//! Any failure before `Serving` is terminal and carries the phase it
//! happened in. Once serving, the sync task owns the authority client and
//! the local server only reads the shared decision cache.

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use tokio::signal;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval_at};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::decision::{DecisionCache, DecisionFilter, SyncTracker};
use crate::lapi::tls::{announce_trust, build_client_config};
use crate::lapi::{AuthMode, ClientIdentity, DecisionSource, LapiClient, TrustRoots};
use crate::server::{self, AppState, BoundServer};
use crate::Error;

/// Startup phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Validating configuration and resolving the auth mode
    Init,
    /// Building the trust store and loading the client certificate
    TlsHandshake,
    /// Announcing the auth mode and building the client
    AuthSelect,
    /// First authenticated request
    Authenticating,
    /// Local server bound
    Serving,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Init => "init",
            Self::TlsHandshake => "tls handshake",
            Self::AuthSelect => "auth select",
            Self::Authenticating => "authenticating",
            Self::Serving => "serving",
        })
    }
}

/// Terminal startup failure
#[derive(Debug, thiserror::Error)]
#[error("{phase}: {source}")]
pub struct StartupError {
    /// Phase that failed
    pub phase: Phase,
    /// Underlying error
    #[source]
    pub source: Error,
}

impl StartupError {
    fn at(phase: Phase) -> impl FnOnce(Error) -> Self {
        move |source| Self { phase, source }
    }
}

/// Client ready for its first authenticated request
#[derive(Debug)]
pub struct Connected {
    /// Authority client
    pub client: LapiClient,
    /// Selected auth mode
    pub mode: AuthMode,
}

/// Run `Init` through `AuthSelect`. No network traffic happens here.
///
/// # Errors
///
/// Returns a [`StartupError`] tagged with the phase that failed.
pub fn connect(config: &Config) -> Result<Connected, StartupError> {
    let lapi = &config.crowdsec_config;

    // Init
    let mode = AuthMode::resolve(lapi).map_err(StartupError::at(Phase::Init))?;
    let url = lapi.url().map_err(StartupError::at(Phase::Init))?;
    debug!(url = %url, mode = mode.label(), "Configuration accepted");

    // TlsHandshake: the handshake itself runs on the first request
    let roots = TrustRoots::from_config(lapi);
    if url.scheme() == "https" {
        announce_trust(&roots);
    }
    let identity = match &mode {
        AuthMode::Cert {
            cert_path,
            key_path,
        } => {
            let identity = ClientIdentity::load(cert_path, key_path)
                .map_err(StartupError::at(Phase::TlsHandshake))?;
            debug!(
                cn = identity.subject().display_name(),
                ou = identity.subject().organizational_unit.as_deref().unwrap_or(""),
                not_after = identity.subject().not_after,
                "Loaded client certificate"
            );
            Some(identity)
        }
        AuthMode::ApiKey(_) => None,
    };
    let tls = build_client_config(&roots, identity.as_ref())
        .map_err(StartupError::at(Phase::TlsHandshake))?;

    // AuthSelect
    mode.announce();
    let client =
        LapiClient::new(lapi, mode.clone(), tls).map_err(StartupError::at(Phase::AuthSelect))?;

    Ok(Connected { client, mode })
}

/// Run the whole startup sequence against the configured authority.
///
/// # Errors
///
/// Returns a [`StartupError`] tagged with the phase that failed.
pub async fn start(config: Arc<Config>) -> Result<RunningBouncer, StartupError> {
    let Connected { client, mode } = connect(&config)?;
    serve(config, Arc::new(client), &mode).await
}

/// Run `Authenticating` and `Serving` against any decision source.
///
/// # Errors
///
/// Returns a [`StartupError`] tagged with the phase that failed.
pub async fn serve(
    config: Arc<Config>,
    source: Arc<dyn DecisionSource>,
    mode: &AuthMode,
) -> Result<RunningBouncer, StartupError> {
    let lapi = &config.crowdsec_config;
    let cache = Arc::new(DecisionCache::new(DecisionFilter::from_config(lapi)));
    let sync = Arc::new(SyncTracker::default());

    // Authenticating
    let first = match tokio::time::timeout(lapi.startup_timeout, source.pull(true)).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(
            lapi.startup_timeout,
            "first decision stream pull".to_string(),
        )),
    };
    let stream = match first {
        Ok(stream) => stream,
        Err(e) => {
            if matches!(mode, AuthMode::ApiKey(_)) {
                error!("auth-api: auth with api key failed: {e}");
            } else {
                error!("auth-cert: auth with client certificate failed: {e}");
            }
            return Err(StartupError::at(Phase::Authenticating)(e));
        }
    };
    let stats = cache.apply(stream, Instant::now());
    sync.record_success();
    info!(decisions = stats.added, "Initial decisions loaded");

    // Serving
    let (shutdown_tx, _) = broadcast::channel(1);
    let state = Arc::new(AppState {
        cache: Arc::clone(&cache),
        sync: Arc::clone(&sync),
        auth_mode: mode.label(),
    });
    let BoundServer { local_addr, task } = server::bind(&config, state, shutdown_tx.subscribe())
        .await
        .map_err(StartupError::at(Phase::Serving))?;

    let sync_task = spawn_sync(
        source,
        Arc::clone(&cache),
        Arc::clone(&sync),
        lapi.update_frequency,
        shutdown_tx.subscribe(),
    );

    Ok(RunningBouncer {
        local_addr,
        cache,
        sync,
        shutdown_tx,
        tasks: vec![task, sync_task],
    })
}

fn spawn_sync(
    source: Arc<dyn DecisionSource>,
    cache: Arc<DecisionCache>,
    sync: Arc<SyncTracker>,
    every: std::time::Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = interval_at(tokio::time::Instant::now() + every, every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match source.pull(false).await {
                        Ok(stream) => {
                            let now = Instant::now();
                            let stats = cache.apply(stream, now);
                            let purged = cache.purge_expired(now);
                            sync.record_success();
                            debug!(
                                added = stats.added,
                                deleted = stats.deleted,
                                purged,
                                total = cache.len(),
                                "Decision stream synced"
                            );
                        }
                        Err(e) => {
                            warn!(error = %e, "Decision stream pull failed");
                            sync.record_failure(&e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Decision sync stopped");
                    break;
                }
            }
        }
    })
}

/// A bouncer in the `Serving` phase
#[derive(Debug)]
pub struct RunningBouncer {
    local_addr: std::net::SocketAddr,
    cache: Arc<DecisionCache>,
    sync: Arc<SyncTracker>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Vec<JoinHandle<()>>,
}

impl RunningBouncer {
    /// Address the blocklist server is bound to
    #[must_use]
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Mirrored decisions
    #[must_use]
    pub fn cache(&self) -> &Arc<DecisionCache> {
        &self.cache
    }

    /// Sync outcome tracker
    #[must_use]
    pub fn sync(&self) -> &Arc<SyncTracker> {
        &self.sync
    }

    /// Stop both tasks and wait for them
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(());
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Task ended abnormally");
            }
        }
        info!("Shutdown complete");
    }

    /// Serve until Ctrl+C or SIGTERM
    pub async fn run_until_signal(self) {
        shutdown_signal().await;
        self.shutdown().await;
    }
}

/// Resolve on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
