//! Shared fixtures for integration tests
//!
//! - [`Pki`]: throwaway CA, authority certificate and bouncer certificate
//! - [`FakeLapi`]: a TLS Local API serving `/health` and the decision stream
//! - [`LogCapture`]: collects formatted log lines for assertions

#![allow(dead_code)]

use std::fs;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
};
use axum_server::tls_rustls::RustlsConfig;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, IsCa, Issuer, KeyPair,
};
use rustls::RootCertStore;
use rustls::server::WebPkiClientVerifier;
use serde_json::json;
use tempfile::TempDir;
use tracing_subscriber::fmt::MakeWriter;

use blocklist_mirror::config::Config;
use blocklist_mirror::decision::{Decision, DecisionStream};
use blocklist_mirror::lapi::{DecisionSource, TrustRoots};
use blocklist_mirror::lapi::tls::{
    build_client_config, crypto_provider, load_certs, load_private_key,
};
use blocklist_mirror::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// PKI
// ─────────────────────────────────────────────────────────────────────────────

/// Files of a private PKI, removed when dropped
pub struct Pki {
    _dir: TempDir,
    pub ca_cert: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub client_cert: PathBuf,
    pub client_key: PathBuf,
}

impl Pki {
    pub fn generate() -> Self {
        let dir = tempfile::Builder::new().prefix("bm-tls").tempdir().unwrap();

        let ca_key = KeyPair::generate().unwrap();
        let mut ca_params = CertificateParams::default();
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.distinguished_name = name("Blocklist Mirror Test CA", None);
        let ca = ca_params.self_signed(&ca_key).unwrap();
        let issuer = Issuer::new(ca_params, ca_key);

        let server_key = KeyPair::generate().unwrap();
        let mut server_params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .unwrap();
        server_params.distinguished_name = name("lapi", None);
        let server = server_params.signed_by(&server_key, &issuer).unwrap();

        let client_key = KeyPair::generate().unwrap();
        let mut client_params = CertificateParams::default();
        client_params.distinguished_name = name("blocklist-mirror", Some("bouncer-ou"));
        let client = client_params.signed_by(&client_key, &issuer).unwrap();

        let write = |file: &str, pem: String| {
            let path = dir.path().join(file);
            fs::write(&path, pem).unwrap();
            path
        };

        Self {
            ca_cert: write("ca.crt", ca.pem()),
            server_cert: write("lapi.crt", server.pem()),
            server_key: write("lapi.key", server_key.serialize_pem()),
            client_cert: write("bouncer.crt", client.pem()),
            client_key: write("bouncer.key", client_key.serialize_pem()),
            _dir: dir,
        }
    }

    fn server_config(&self, require_client_cert: bool) -> rustls::ServerConfig {
        let provider = crypto_provider();
        let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()
            .unwrap();

        let builder = if require_client_cert {
            let mut roots = RootCertStore::empty();
            roots.add_parsable_certificates(load_certs(&self.ca_cert).unwrap());
            let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider)
                .build()
                .unwrap();
            builder.with_client_cert_verifier(verifier)
        } else {
            builder.with_no_client_auth()
        };

        let mut config = builder
            .with_single_cert(
                load_certs(&self.server_cert).unwrap(),
                load_private_key(&self.server_key).unwrap(),
            )
            .unwrap();
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        config
    }
}

fn name(common_name: &str, unit: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    if let Some(unit) = unit {
        dn.push(DnType::OrganizationalUnitName, unit);
    }
    dn
}

// ─────────────────────────────────────────────────────────────────────────────
// Fake Local API
// ─────────────────────────────────────────────────────────────────────────────

/// What the fake authority saw
#[derive(Debug, Default)]
pub struct Seen {
    /// `X-Api-Key` of each stream request (`None` when absent)
    pub api_keys: Vec<Option<String>>,
    /// `startup` query parameter of each stream request
    pub startup: Vec<String>,
    /// `User-Agent` of the last request
    pub user_agent: Option<String>,
}

struct LapiState {
    api_key: Option<String>,
    decisions: Vec<Decision>,
    seen: Mutex<Seen>,
}

/// A Local API over TLS
pub struct FakeLapi {
    pub addr: SocketAddr,
    state: Arc<LapiState>,
    task: tokio::task::JoinHandle<()>,
}

impl FakeLapi {
    /// Start an authority accepting `api_key` (any key when `None`).
    /// With `require_client_cert` the handshake demands a certificate
    /// issued by the test CA.
    pub async fn start(pki: &Pki, api_key: Option<&str>, require_client_cert: bool) -> Self {
        let state = Arc::new(LapiState {
            api_key: api_key.map(str::to_string),
            decisions: vec![ban("192.0.2.10", "4h"), ban("2001:db8::10", "1h")],
            seen: Mutex::new(Seen::default()),
        });

        let app = Router::new()
            .route("/health", get(|| async { Json(json!({"status": "up"})) }))
            .route("/v1/decisions/stream", get(stream_handler))
            .with_state(Arc::clone(&state));

        let handle = axum_server::Handle::new();
        let tls = RustlsConfig::from_config(Arc::new(pki.server_config(require_client_cert)));
        let bind: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = axum_server::bind_rustls(bind, tls).handle(handle.clone());
        let task = tokio::spawn(async move {
            let _ = server.serve(app.into_make_service()).await;
        });
        let addr = handle.listening().await.expect("fake LAPI failed to bind");

        Self { addr, state, task }
    }

    pub fn url(&self) -> String {
        format!("https://127.0.0.1:{}/", self.addr.port())
    }

    pub fn with_seen<T>(&self, f: impl FnOnce(&Seen) -> T) -> T {
        f(&self.state.seen.lock().unwrap())
    }
}

impl Drop for FakeLapi {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn stream_handler(
    State(state): State<Arc<LapiState>>,
    headers: HeaderMap,
    Query(params): Query<std::collections::HashMap<String, String>>,
) -> impl IntoResponse {
    let key = headers
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    {
        let mut seen = state.seen.lock().unwrap();
        seen.api_keys.push(key.clone());
        seen.startup
            .push(params.get("startup").cloned().unwrap_or_default());
        seen.user_agent = headers
            .get("user-agent")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
    }

    if let Some(expected) = &state.api_key {
        if key.as_deref() != Some(expected.as_str()) {
            return (
                StatusCode::FORBIDDEN,
                Json(json!({"message": "access forbidden"})),
            )
                .into_response();
        }
    }

    let startup = params.get("startup").is_some_and(|s| s == "true");
    let new = if startup { state.decisions.clone() } else { Vec::new() };
    Json(json!({ "new": new, "deleted": null })).into_response()
}

pub fn ban(value: &str, duration: &str) -> Decision {
    Decision {
        id: 1,
        origin: "crowdsec".to_string(),
        kind: "ban".to_string(),
        scope: "Ip".to_string(),
        value: value.to_string(),
        duration: duration.to_string(),
        scenario: "crowdsecurity/ssh-bf".to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// In-process decision source
// ─────────────────────────────────────────────────────────────────────────────

/// Serves `startup` on the first pull, then pops `updates` one per pull.
pub struct FakeSource {
    startup: Mutex<Option<DecisionStream>>,
    updates: Mutex<Vec<DecisionStream>>,
    reject: bool,
}

impl FakeSource {
    pub fn new(startup: DecisionStream, mut updates: Vec<DecisionStream>) -> Arc<Self> {
        updates.reverse();
        Arc::new(Self {
            startup: Mutex::new(Some(startup)),
            updates: Mutex::new(updates),
            reject: false,
        })
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self {
            startup: Mutex::new(None),
            updates: Mutex::new(Vec::new()),
            reject: true,
        })
    }
}

#[async_trait]
impl DecisionSource for FakeSource {
    async fn pull(&self, startup: bool) -> Result<DecisionStream> {
        if self.reject {
            return Err(Error::Authentication("403 Forbidden: access forbidden".to_string()));
        }
        if startup {
            return Ok(self.startup.lock().unwrap().take().unwrap_or_default());
        }
        Ok(self.updates.lock().unwrap().pop().unwrap_or_default())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Config and logs
// ─────────────────────────────────────────────────────────────────────────────

/// Config bound to an ephemeral local port
pub fn local_config(lapi_url: &str) -> Config {
    let mut config = Config::default();
    config.listen_uri = "127.0.0.1:0".to_string();
    config.crowdsec_config.lapi_url = lapi_url.to_string();
    config.crowdsec_config.startup_timeout = std::time::Duration::from_secs(10);
    config
}

/// Collects formatted log output of the current thread
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Route this thread's logs into the capture until the guard drops
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let subscriber = tracing_subscriber::fmt()
            .with_writer(self.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }

    /// Every needle appears in order; consecutive needles may share a line
    pub fn assert_lines_in_order(&self, needles: &[&str]) {
        let contents = self.contents();
        let lines: Vec<&str> = contents.lines().collect();
        let mut from = 0;
        for needle in needles {
            match lines[from..].iter().position(|line| line.contains(needle)) {
                Some(offset) => from += offset,
                None => panic!("missing log line containing {needle:?} (in order) in:\n{contents}"),
            }
        }
    }
}

/// Install the process-wide crypto provider used by any rustls config
/// built without an explicit one
pub fn init_crypto() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// HTTP client trusting only `ca` (or the web PKI roots when `None`)
pub fn http_client(ca: Option<&Path>) -> reqwest::Client {
    let roots = ca.map_or(TrustRoots::System, |p| TrustRoots::Bundle(p.to_path_buf()));
    #[allow(deprecated)]
    let client = reqwest::Client::builder()
        .use_preconfigured_tls(build_client_config(&roots, None).unwrap())
        .build()
        .unwrap();
    client
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LogCapture {
    type Writer = LogCapture;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}
