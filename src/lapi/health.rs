//! Authority readiness probing.
//!
//! Readiness here means "the authority answers HTTP": any response, whatever
//! its status code, counts as ready. Certificate failures are not transient
//! and abort the wait immediately.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backon::{ConstantBuilder, Retryable};
use reqwest::Client;
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use super::failure::classify;
use crate::{Error, Result};

/// Result of one successful probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Readiness {
    /// Status code the authority answered with
    pub status: u16,
    /// Round-trip time in milliseconds
    pub latency_ms: u64,
}

/// Something that can tell whether the authority is up.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe once.
    async fn probe(&self) -> Result<Readiness>;
}

/// Probe hitting `<lapi_url>/health`.
#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    http: Client,
    url: Url,
    timeout: Duration,
}

impl HttpHealthProbe {
    /// Create a probe reusing an existing client built with `timeout`
    #[must_use]
    pub fn new(http: Client, url: Url, timeout: Duration) -> Self {
        Self { http, url, timeout }
    }

    /// URL being probed
    #[must_use]
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> Result<Readiness> {
        let started = std::time::Instant::now();
        let response = self
            .http
            .get(self.url.clone())
            .send()
            .await
            .map_err(|e| classify(e, self.timeout))?;
        Ok(Readiness {
            status: response.status().as_u16(),
            latency_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
        })
    }
}

/// Poll `probe` every `interval` until it answers or `timeout` elapses.
///
/// # Errors
///
/// Returns the first non-transient error as-is, or `Error::Timeout` wrapping
/// the last transient failure.
pub async fn wait_until_ready(
    probe: Arc<dyn HealthProbe>,
    interval: Duration,
    timeout: Duration,
) -> Result<Readiness> {
    let attempt = || {
        let probe = Arc::clone(&probe);
        async move { probe.probe().await }
    };

    let retries = timeout.as_millis() / interval.as_millis().max(1);
    let backoff = ConstantBuilder::default()
        .with_delay(interval)
        .with_max_times(usize::try_from(retries).unwrap_or(usize::MAX));

    let polled = attempt
        .retry(backoff)
        .when(Error::is_transient)
        .notify(|e: &Error, delay: Duration| {
            debug!(error = %e, retry_in = ?delay, "Authority not ready yet");
        });

    match tokio::time::timeout(timeout, polled).await {
        Ok(Ok(ready)) => {
            info!(status = ready.status, latency_ms = ready.latency_ms, "Authority is ready");
            Ok(ready)
        }
        Ok(Err(e)) if e.is_transient() => Err(Error::Timeout(timeout, e.to_string())),
        Ok(Err(e)) => Err(e),
        Err(_) => Err(Error::Timeout(
            timeout,
            "authority did not become ready".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::X509Reason;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails with `error` for the first `failures` probes.
    struct FlakyProbe {
        calls: AtomicUsize,
        failures: usize,
        error: fn() -> Error,
    }

    #[async_trait]
    impl HealthProbe for FlakyProbe {
        async fn probe(&self) -> Result<Readiness> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err((self.error)());
            }
            Ok(Readiness {
                status: 404,
                latency_ms: 1,
            })
        }
    }

    fn flaky(failures: usize, error: fn() -> Error) -> Arc<FlakyProbe> {
        Arc::new(FlakyProbe {
            calls: AtomicUsize::new(0),
            failures,
            error,
        })
    }

    #[tokio::test]
    async fn any_status_counts_as_ready_after_transient_failures() {
        let probe = flaky(2, || Error::Transport("connection refused".to_string()));
        let ready = wait_until_ready(
            probe.clone(),
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap();
        assert_eq!(ready.status, 404);
        assert_eq!(probe.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn certificate_failure_aborts_immediately() {
        let probe = flaky(usize::MAX, || {
            Error::TlsVerification(X509Reason::UnknownAuthority)
        });
        let err = wait_until_ready(
            probe.clone(),
            Duration::from_millis(5),
            Duration::from_secs(5),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::TlsVerification(_)));
        assert_eq!(probe.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn gives_up_after_timeout() {
        let probe = flaky(usize::MAX, || Error::Transport("connection refused".to_string()));
        let err = wait_until_ready(probe, Duration::from_millis(10), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(..)));
    }
}
