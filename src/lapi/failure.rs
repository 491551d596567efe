//! Classification of request failures against the authority.
//!
//! reqwest buries the rustls verdict several layers deep (reqwest → hyper
//! connector → `io::Error` → `rustls::Error`). `io::Error::source()` skips
//! its own payload, so the walk below also looks inside `io::Error::get_ref`.

use std::error::Error as StdError;
use std::io;
use std::time::Duration;

use rustls::{AlertDescription, CertificateError};

use crate::error::{Error, X509Reason};

/// Map a reqwest failure onto the crate's error taxonomy. `limit` is the
/// request timeout the client was built with.
#[must_use]
pub fn classify(err: reqwest::Error, limit: Duration) -> Error {
    if let Some(reason) = certificate_failure(&err) {
        return Error::TlsVerification(reason);
    }
    if let Some(alert) = peer_alert(&err) {
        return Error::TlsRejected(alert);
    }
    if err.is_timeout() {
        return Error::Timeout(limit, chain_message(&err));
    }
    if err.is_connect() {
        return Error::Transport(chain_message(&err));
    }
    Error::Http(err)
}

/// The certificate verification failure behind `err`, if any.
#[must_use]
pub fn certificate_failure(err: &(dyn StdError + 'static)) -> Option<X509Reason> {
    for e in chain(err) {
        if let Some(rustls::Error::InvalidCertificate(cert_err)) = as_rustls(e) {
            return Some(x509_reason(cert_err));
        }
    }
    // Fall back to the rendered messages in case a layer re-wrapped the
    // rustls error as text.
    let message = chain_message(err);
    if message.contains("UnknownIssuer") {
        return Some(X509Reason::UnknownAuthority);
    }
    if message.contains("invalid peer certificate") {
        return Some(X509Reason::Other(message));
    }
    None
}

/// A fatal alert sent by the authority during the handshake, typically
/// because it refused our client certificate.
fn peer_alert(err: &(dyn StdError + 'static)) -> Option<String> {
    chain(err).find_map(|e| match as_rustls(e) {
        Some(rustls::Error::AlertReceived(alert)) => Some(alert_text(*alert)),
        _ => None,
    })
}

fn x509_reason(err: &CertificateError) -> X509Reason {
    match err {
        CertificateError::UnknownIssuer => X509Reason::UnknownAuthority,
        CertificateError::Expired | CertificateError::NotValidYet => X509Reason::Expired,
        CertificateError::NotValidForName => X509Reason::NameMismatch("the requested host".into()),
        CertificateError::Revoked => X509Reason::Revoked,
        CertificateError::BadSignature => X509Reason::BadSignature,
        other => {
            let text = format!("{other:?}");
            if text.starts_with("ExpiredContext") || text.starts_with("NotValidYetContext") {
                X509Reason::Expired
            } else if text.starts_with("NotValidForNameContext") {
                X509Reason::NameMismatch("the requested host".into())
            } else {
                X509Reason::Other(text)
            }
        }
    }
}

fn alert_text(alert: AlertDescription) -> String {
    match alert {
        AlertDescription::UnknownCA => "unknown certificate authority".to_string(),
        AlertDescription::BadCertificate => "bad certificate".to_string(),
        AlertDescription::CertificateRequired => "certificate required".to_string(),
        AlertDescription::CertificateExpired => "expired certificate".to_string(),
        AlertDescription::CertificateRevoked => "revoked certificate".to_string(),
        AlertDescription::AccessDenied => "access denied".to_string(),
        other => format!("{other:?}"),
    }
}

fn as_rustls<'a>(e: &'a (dyn StdError + 'static)) -> Option<&'a rustls::Error> {
    if let Some(tls) = e.downcast_ref::<rustls::Error>() {
        return Some(tls);
    }
    e.downcast_ref::<io::Error>()
        .and_then(io::Error::get_ref)
        .and_then(|inner| inner.downcast_ref::<rustls::Error>())
}

fn chain<'a>(
    err: &'a (dyn StdError + 'static),
) -> impl Iterator<Item = &'a (dyn StdError + 'static)> {
    std::iter::successors(Some(err), |&e| {
        e.source().or_else(move || {
            e.downcast_ref::<io::Error>()
                .and_then(io::Error::get_ref)
                .map(|inner| inner as &(dyn StdError + 'static))
        })
    })
}

/// `outer: inner: innermost`, deduplicating layers that repeat their source.
fn chain_message(err: &(dyn StdError + 'static)) -> String {
    let mut parts: Vec<String> = Vec::new();
    for e in chain(err) {
        let text = e.to_string();
        if parts.last().is_some_and(|prev| prev.contains(&text)) {
            continue;
        }
        parts.push(text);
    }
    parts.join(": ")
}
