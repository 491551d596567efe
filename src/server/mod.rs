//! Local blocklist server

mod auth;
mod router;

pub use auth::{EndpointGuard, TrustedNet};
pub use router::{AppState, create_router};

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::config::Config;
use crate::lapi::tls::{crypto_provider, load_certs, load_private_key};
use crate::{Error, Result};

const GRACEFUL_SHUTDOWN: Duration = Duration::from_secs(5);

/// A listening server task.
#[derive(Debug)]
pub struct BoundServer {
    /// Address actually bound (resolves port 0)
    pub local_addr: SocketAddr,
    /// Task serving requests until shutdown
    pub task: JoinHandle<()>,
}

/// Bind `listen_uri` and serve the blocklists until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the listener TLS
/// material cannot be loaded.
pub async fn bind(
    config: &Config,
    state: Arc<AppState>,
    shutdown: broadcast::Receiver<()>,
) -> Result<BoundServer> {
    let addr = config.listen_addr()?;
    let app = create_router(state, &config.blocklists)?;

    let bound = match config.tls.paths() {
        Some((cert, key)) => bind_tls(addr, app, &cert, &key, shutdown).await?,
        None => bind_plain(addr, app, shutdown).await?,
    };

    info!("Starting server at {}", bound.local_addr);
    Ok(bound)
}

async fn bind_plain(
    addr: SocketAddr,
    app: Router,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<BoundServer> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;

    let task = tokio::spawn(async move {
        let served = axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await;
        if let Err(e) = served {
            error!(error = %e, "Blocklist server failed");
        }
    });

    Ok(BoundServer { local_addr, task })
}

async fn bind_tls(
    addr: SocketAddr,
    app: Router,
    cert: &Path,
    key: &Path,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<BoundServer> {
    let mut tls = rustls::ServerConfig::builder_with_provider(crypto_provider())
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Config(format!("TLS protocol setup failed: {e}")))?
        .with_no_client_auth()
        .with_single_cert(load_certs(cert)?, load_private_key(key)?)
        .map_err(|e| Error::Config(format!("invalid listener certificate: {e}")))?;
    tls.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    let handle = axum_server::Handle::new();
    let server = axum_server::bind_rustls(addr, RustlsConfig::from_config(Arc::new(tls)))
        .handle(handle.clone());

    let task = tokio::spawn(async move {
        if let Err(e) = server
            .serve(app.into_make_service_with_connect_info::<SocketAddr>())
            .await
        {
            error!(error = %e, "Blocklist server failed");
        }
    });

    let Some(local_addr) = handle.listening().await else {
        return Err(Error::Internal(format!("failed to bind {addr}")));
    };

    tokio::spawn(async move {
        let _ = shutdown.recv().await;
        handle.graceful_shutdown(Some(GRACEFUL_SHUTDOWN));
    });

    Ok(BoundServer { local_addr, task })
}
