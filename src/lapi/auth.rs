//! Authentication mode towards the Local API.
//!
//! The mode is resolved once from the configuration shape and never
//! re-derived: request code matches on [`AuthMode`] instead of probing
//! optional config fields.

use std::fmt;
use std::path::{Path, PathBuf};

use reqwest::header::HeaderValue;
use tracing::info;

use crate::config::LapiConfig;
use crate::{Error, Result};

/// Header carrying the bouncer API key
pub const API_KEY_HEADER: &str = "X-Api-Key";

/// How the bouncer proves its identity to the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthMode {
    /// Mutual TLS: the certificate presented during the handshake is the credential
    Cert {
        /// Client certificate path
        cert_path: PathBuf,
        /// Client key path
        key_path: PathBuf,
    },
    /// Static API key sent with every request
    ApiKey(ApiKey),
}

impl AuthMode {
    /// Resolve the mode from configuration.
    ///
    /// A complete certificate pair wins over an API key when both are set.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if neither credential is configured or the
    /// certificate pair is incomplete.
    pub fn resolve(config: &LapiConfig) -> Result<Self> {
        match (config.cert_path(), config.key_path(), config.api_key()) {
            (Some(cert), Some(key), _) => Ok(Self::Cert {
                cert_path: cert.to_path_buf(),
                key_path: key.to_path_buf(),
            }),
            (Some(_), None, _) | (None, Some(_), _) => Err(Error::Config(
                "cert_path and key_path must be set together".to_string(),
            )),
            (None, None, Some(key)) => Ok(Self::ApiKey(ApiKey::new(key))),
            (None, None, None) => Err(Error::Config(
                "no authentication configured: set lapi_key or cert_path/key_path".to_string(),
            )),
        }
    }

    /// Client certificate path in certificate mode
    #[must_use]
    pub fn cert_path(&self) -> Option<&Path> {
        match self {
            Self::Cert { cert_path, .. } => Some(cert_path),
            Self::ApiKey(_) => None,
        }
    }

    /// Short label for logs and the health endpoint
    #[must_use]
    pub fn label(&self) -> &'static str {
        match self {
            Self::Cert { .. } => "cert",
            Self::ApiKey(_) => "api_key",
        }
    }

    /// Log the selected mode.
    pub fn announce(&self) {
        match self {
            Self::Cert { cert_path, .. } => {
                info!("Using cert auth with cert {}", cert_path.display());
            }
            Self::ApiKey(_) => info!("Using API key auth"),
        }
    }
}

/// API key with a redacted `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    /// Wrap a key
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Header value, flagged sensitive so it never shows up in HTTP traces.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the key contains characters not allowed in
    /// an HTTP header.
    pub fn header_value(&self) -> Result<HeaderValue> {
        let mut value = HeaderValue::from_str(&self.0)
            .map_err(|_| Error::Config("lapi_key contains invalid characters".to_string()))?;
        value.set_sensitive(true);
        Ok(value)
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(********)")
    }
}
