//! Error types for the blocklist mirror

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Result type alias for the blocklist mirror
pub type Result<T> = std::result::Result<T, Error>;

/// Blocklist mirror errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal before any network activity)
    #[error("configuration error: {0}")]
    Config(String),

    /// The authority's certificate could not be chained to a trusted root
    #[error("tls: failed to verify certificate: {0}")]
    TlsVerification(X509Reason),

    /// The authority refused the certificate we presented
    #[error("remote error: tls: {0}")]
    TlsRejected(String),

    /// Credential presented but rejected by the authority
    #[error("authentication rejected: {0}")]
    Authentication(String),

    /// Connection refused, reset, DNS failure
    #[error("transport error: {0}")]
    Transport(String),

    /// An operation did not finish in time
    #[error("timed out after {0:?}: {1}")]
    Timeout(Duration, String),

    /// Unexpected status or body from the authority
    #[error("protocol error: {0}")]
    Protocol(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error that could not be classified further
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Internal error
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether retrying the same operation later may succeed.
    ///
    /// Trust and credential failures are never transient: the same request
    /// will fail the same way until the configuration changes.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) | Self::Timeout(..) | Self::Io(_) => true,
            Self::Http(e) => e.is_connect() || e.is_timeout() || e.is_request(),
            _ => false,
        }
    }
}

/// X.509 verification failure reasons, rendered the way operators grep for them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum X509Reason {
    /// Issuer not present in the trust store
    UnknownAuthority,
    /// Certificate outside its validity window
    Expired,
    /// Certificate does not cover the host we dialled
    NameMismatch(String),
    /// Certificate revoked
    Revoked,
    /// Signature does not verify
    BadSignature,
    /// Anything else reported by the verifier
    Other(String),
}

impl fmt::Display for X509Reason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownAuthority => f.write_str("x509: certificate signed by unknown authority"),
            Self::Expired => {
                f.write_str("x509: certificate has expired or is not yet valid")
            }
            Self::NameMismatch(host) => {
                write!(f, "x509: certificate is not valid for {host}")
            }
            Self::Revoked => f.write_str("x509: certificate revoked"),
            Self::BadSignature => f.write_str("x509: certificate signature is invalid"),
            Self::Other(reason) => write!(f, "x509: {reason}"),
        }
    }
}
