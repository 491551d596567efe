//! Client certificate identity for mutual TLS.
//!
//! Loads the PEM certificate chain and key presented to the authority and
//! extracts the subject fields worth logging: Common Name, Organisational
//! Unit and the validity window. An expired certificate is reported up front
//! instead of surfacing later as an opaque handshake alert.

use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use x509_parser::x509::AttributeTypeAndValue;

use super::tls::{load_certs, load_private_key};
use crate::{Error, Result};

/// Client certificate chain, key and subject summary.
#[derive(Debug)]
pub struct ClientIdentity {
    cert_path: PathBuf,
    chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    subject: CertSubject,
}

/// Subject fields extracted from the leaf certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertSubject {
    /// Certificate Common Name (CN).
    pub common_name: Option<String>,
    /// First Organisational Unit (OU) in the subject.
    pub organizational_unit: Option<String>,
    /// `notAfter`, seconds since the Unix epoch.
    pub not_after: i64,
    /// `notBefore`, seconds since the Unix epoch.
    pub not_before: i64,
}

impl CertSubject {
    /// Parse a DER-encoded certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the certificate cannot be parsed.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::Config(format!("Failed to parse client certificate: {e}")))?;

        Ok(Self {
            common_name: first_attr(cert.subject().iter_common_name()),
            organizational_unit: first_attr(cert.subject().iter_organizational_unit()),
            not_after: cert.validity().not_after.timestamp(),
            not_before: cert.validity().not_before.timestamp(),
        })
    }

    /// Whether `now` (Unix seconds) falls inside the validity window.
    #[must_use]
    pub fn is_valid_at(&self, now: i64) -> bool {
        self.not_before <= now && now <= self.not_after
    }

    /// Human-readable label for logs.
    #[must_use]
    pub fn display_name(&self) -> &str {
        self.common_name.as_deref().unwrap_or("<unknown>")
    }
}

fn first_attr<'a, 'b: 'a>(
    mut attrs: impl Iterator<Item = &'a AttributeTypeAndValue<'b>>,
) -> Option<String> {
    attrs.next().and_then(|a| a.as_str().ok()).map(str::to_owned)
}

impl ClientIdentity {
    /// Load the certificate chain and private key.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if either file is unreadable, holds no
    /// certificate / key, or if the leaf certificate is outside its
    /// validity window.
    pub fn load(cert_path: &Path, key_path: &Path) -> Result<Self> {
        let chain = load_certs(cert_path)?;
        let key = load_private_key(key_path)?;
        let subject = CertSubject::from_der(&chain[0])?;

        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_secs()).unwrap_or(i64::MAX))
            .unwrap_or_default();
        if !subject.is_valid_at(now) {
            return Err(Error::Config(format!(
                "client certificate '{}' ({}) is expired or not yet valid",
                cert_path.display(),
                subject.display_name()
            )));
        }

        Ok(Self {
            cert_path: cert_path.to_path_buf(),
            chain,
            key,
            subject,
        })
    }

    /// Path the certificate was loaded from
    #[must_use]
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Full certificate chain, leaf first
    #[must_use]
    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.chain
    }

    /// Private key matching the leaf
    #[must_use]
    pub fn key(&self) -> &PrivateKeyDer<'static> {
        &self.key
    }

    /// Subject summary of the leaf
    #[must_use]
    pub fn subject(&self) -> &CertSubject {
        &self.subject
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, date_time_ymd};

    fn write_pair(dir: &Path, params: &CertificateParams) -> (PathBuf, PathBuf) {
        let key = KeyPair::generate().unwrap();
        let cert = params.self_signed(&key).unwrap();
        let cert_path = dir.join("bouncer.crt");
        let key_path = dir.join("bouncer.key");
        std::fs::write(&cert_path, cert.pem()).unwrap();
        std::fs::write(&key_path, key.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    fn named(cn: &str, ou: Option<&str>) -> CertificateParams {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        if let Some(ou) = ou {
            dn.push(DnType::OrganizationalUnitName, ou);
        }
        params.distinguished_name = dn;
        params
    }

    #[test]
    fn load_extracts_subject() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = write_pair(dir.path(), &named("blocklist-mirror", Some("bouncer-ou")));

        let identity = ClientIdentity::load(&cert, &key).unwrap();
        assert_eq!(identity.subject().common_name.as_deref(), Some("blocklist-mirror"));
        assert_eq!(
            identity.subject().organizational_unit.as_deref(),
            Some("bouncer-ou")
        );
        assert_eq!(identity.chain().len(), 1);
        assert_eq!(identity.cert_path(), cert.as_path());
    }

    #[test]
    fn expired_certificate_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut params = named("old-bouncer", None);
        params.not_before = date_time_ymd(2000, 1, 1);
        params.not_after = date_time_ymd(2001, 1, 1);
        let (cert, key) = write_pair(dir.path(), &params);

        let err = ClientIdentity::load(&cert, &key).unwrap_err();
        assert!(err.to_string().contains("expired"));
    }

    #[test]
    fn missing_key_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, _) = write_pair(dir.path(), &named("bouncer", None));

        let err = ClientIdentity::load(&cert, &dir.path().join("absent.key")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn display_name_falls_back_when_cn_absent() {
        let subject = CertSubject::default();
        assert_eq!(subject.display_name(), "<unknown>");
    }

    #[test]
    fn from_der_rejects_garbage() {
        assert!(CertSubject::from_der(b"not a cert").is_err());
    }
}
