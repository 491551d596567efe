//! Trust store and client identity for the Local API connection.
//!
//! Provides:
//! - [`TrustRoots`]: which anchors verify the authority's certificate
//! - [`build_client_config`]: a `rustls::ClientConfig` for reqwest
//! - [`load_certs`] / [`load_private_key`]: PEM file loading
//!
//! A custom CA bundle **replaces** the built-in roots; it never augments
//! them. An authority whose certificate was issued by a private CA therefore
//! fails verification with an unknown-authority error unless that CA's
//! bundle is configured.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tracing::{debug, info, warn};

use super::identity::ClientIdentity;
use crate::config::LapiConfig;
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Trust roots
// ─────────────────────────────────────────────────────────────────────────────

/// Anchors used to verify the authority's certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustRoots {
    /// Built-in web PKI roots
    System,
    /// Exactly the certificates in this PEM bundle
    Bundle(PathBuf),
    /// No verification at all (`insecure_skip_verify`)
    Disabled,
}

impl TrustRoots {
    /// Pick the trust roots described by the configuration.
    #[must_use]
    pub fn from_config(config: &LapiConfig) -> Self {
        if config.insecure_skip_verify {
            Self::Disabled
        } else if let Some(path) = config.ca_cert_path() {
            Self::Bundle(path.to_path_buf())
        } else {
            Self::System
        }
    }

    fn root_store(&self) -> Result<Option<RootCertStore>> {
        match self {
            Self::System => Ok(Some(RootCertStore::from_iter(
                webpki_roots::TLS_SERVER_ROOTS.iter().cloned(),
            ))),
            Self::Bundle(path) => {
                let certs = load_certs(path)?;
                let mut store = RootCertStore::empty();
                let (added, ignored) = store.add_parsable_certificates(certs);
                if added == 0 {
                    return Err(Error::Config(format!(
                        "no usable CA certificate in '{}'",
                        path.display()
                    )));
                }
                if ignored > 0 {
                    warn!(path = %path.display(), ignored, "Skipped unparsable CA certificates");
                }
                Ok(Some(store))
            }
            Self::Disabled => Ok(None),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: build TLS client config
// ─────────────────────────────────────────────────────────────────────────────

/// Crypto provider shared by every TLS config this crate builds.
#[must_use]
pub fn crypto_provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::aws_lc_rs::default_provider())
}

/// Build the `rustls::ClientConfig` used to talk to the authority.
///
/// When `identity` is present it is presented during the handshake for
/// mutual TLS.
///
/// # Errors
///
/// Returns an error if the CA bundle cannot be read or holds no usable
/// certificate, or if the client certificate and key do not match.
pub fn build_client_config(
    roots: &TrustRoots,
    identity: Option<&ClientIdentity>,
) -> Result<ClientConfig> {
    let provider = crypto_provider();
    let builder = ClientConfig::builder_with_provider(Arc::clone(&provider))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Config(format!("TLS protocol setup failed: {e}")))?;

    let builder = match roots.root_store()? {
        Some(store) => builder.with_root_certificates(store),
        None => {
            warn!("TLS certificate verification is disabled (insecure_skip_verify)");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider)))
        }
    };

    let config = match identity {
        Some(id) => builder
            .with_client_auth_cert(id.chain().to_vec(), id.key().clone_key())
            .map_err(|e| {
                Error::Config(format!(
                    "client certificate '{}' does not match its key: {e}",
                    id.cert_path().display()
                ))
            })?,
        None => builder.with_no_client_auth(),
    };

    debug!(
        roots = ?roots,
        client_cert = identity.is_some(),
        "LAPI TLS config built"
    );

    Ok(config)
}

/// Log the trust decision. Emitted once per run.
pub fn announce_trust(roots: &TrustRoots) {
    match roots {
        TrustRoots::Bundle(path) => info!(path = %path.display(), "Using CA cert"),
        TrustRoots::System => debug!("Using system trust roots"),
        TrustRoots::Disabled => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: PEM loading
// ─────────────────────────────────────────────────────────────────────────────

/// Certificates of a PEM bundle, in file order. Non-certificate sections
/// (keys, parameters) are skipped.
///
/// # Errors
///
/// `Error::Config` when the file is unreadable, a `CERTIFICATE` section is
/// corrupt, or the bundle holds no certificate at all.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_file(path)?;
    let mut certs = Vec::new();
    for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
        certs.push(cert.map_err(|e| pem_error(path, "certificate", &e))?);
    }
    if certs.is_empty() {
        return Err(Error::Config(format!(
            "'{}' holds no PEM certificate",
            path.display()
        )));
    }
    Ok(certs)
}

/// First private key of a PEM file (PKCS#1, PKCS#8 or SEC1).
///
/// # Errors
///
/// `Error::Config` when the file is unreadable or holds no usable key.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = read_file(path)?;
    match rustls_pemfile::private_key(&mut pem.as_slice()) {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err(Error::Config(format!(
            "'{}' holds no PEM private key",
            path.display()
        ))),
        Err(e) => Err(pem_error(path, "private key", &e)),
    }
}

fn pem_error(path: &Path, what: &str, err: &std::io::Error) -> Error {
    Error::Config(format!("corrupt {what} in '{}': {err}", path.display()))
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Config(format!("cannot read '{}': {e}", path.display())))
}

// ─────────────────────────────────────────────────────────────────────────────
// insecure_skip_verify
// ─────────────────────────────────────────────────────────────────────────────

/// Accepts any server certificate but still checks handshake signatures,
/// so the session keys stay bound to whatever certificate was sent.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
