//! HTTP client for the Local API decision stream.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, warn};
use url::Url;

use super::auth::{API_KEY_HEADER, AuthMode};
use super::failure::classify;
use super::health::HttpHealthProbe;
use crate::config::LapiConfig;
use crate::decision::DecisionStream;
use crate::{Error, Result};

/// `User-Agent` sent on every request
pub const USER_AGENT_VALUE: &str = concat!("blocklist-mirror/", env!("CARGO_PKG_VERSION"));

const STREAM_PATH: &str = "v1/decisions/stream";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Upstream of the decision mirror.
#[async_trait]
pub trait DecisionSource: Send + Sync {
    /// Pull the decision stream. `startup` asks for the full set instead of
    /// the delta since the previous pull.
    async fn pull(&self, startup: bool) -> Result<DecisionStream>;
}

/// Filters forwarded as query parameters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct StreamQuery {
    scopes: String,
    origins: String,
    scenarios_containing: String,
    scenarios_not_containing: String,
}

impl StreamQuery {
    fn from_config(config: &LapiConfig) -> Self {
        Self {
            scopes: config.scopes.join(","),
            origins: config.only_include_decisions_from.join(","),
            scenarios_containing: config.include_scenarios_containing.join(","),
            scenarios_not_containing: config.exclude_scenarios_containing.join(","),
        }
    }

    fn pairs(&self, startup: bool) -> Vec<(&'static str, &str)> {
        let mut pairs = vec![("startup", if startup { "true" } else { "false" })];
        for (name, value) in [
            ("scopes", &self.scopes),
            ("origins", &self.origins),
            ("scenarios_containing", &self.scenarios_containing),
            ("scenarios_not_containing", &self.scenarios_not_containing),
        ] {
            if !value.is_empty() {
                pairs.push((name, value.as_str()));
            }
        }
        pairs
    }
}

/// Error body returned by the Local API
#[derive(Debug, Deserialize)]
struct ApiMessage {
    message: String,
}

/// Authenticated client for one Local API.
#[derive(Debug, Clone)]
pub struct LapiClient {
    http: Client,
    base: Url,
    mode: AuthMode,
    query: StreamQuery,
    request_timeout: Duration,
}

impl LapiClient {
    /// Build the client. No network activity happens here: the TLS
    /// handshake runs on the first request.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the URL is invalid, the API key is not a
    /// valid header value, or reqwest rejects the TLS configuration.
    pub fn new(config: &LapiConfig, mode: AuthMode, tls: rustls::ClientConfig) -> Result<Self> {
        let base = config.url()?;

        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        match &mode {
            AuthMode::ApiKey(key) => {
                headers.insert(API_KEY_HEADER, key.header_value()?);
            }
            AuthMode::Cert { .. } if base.scheme() != "https" => {
                warn!(url = %base, "Certificate auth configured on a plain HTTP URL; no certificate will be sent");
            }
            AuthMode::Cert { .. } => {}
        }

        let request_timeout = config.startup_timeout.max(config.update_frequency);
        #[allow(deprecated)]
        let http = Client::builder()
            .use_preconfigured_tls(tls)
            .default_headers(headers)
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::Config(format!("Failed to create LAPI HTTP client: {e}")))?;

        Ok(Self {
            http,
            base,
            mode,
            query: StreamQuery::from_config(config),
            request_timeout,
        })
    }

    /// Authentication mode in use
    #[must_use]
    pub fn mode(&self) -> &AuthMode {
        &self.mode
    }

    /// Base URL, always ending with `/`
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base
    }

    /// Readiness probe sharing this client's TLS settings
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the health URL cannot be derived.
    pub fn health_probe(&self) -> Result<HttpHealthProbe> {
        let url = self
            .base
            .join("health")
            .map_err(|e| Error::Config(format!("invalid health URL: {e}")))?;
        Ok(HttpHealthProbe::new(self.http.clone(), url, self.request_timeout))
    }

    fn stream_url(&self) -> Result<Url> {
        self.base
            .join(STREAM_PATH)
            .map_err(|e| Error::Config(format!("invalid stream URL: {e}")))
    }
}

#[async_trait]
impl DecisionSource for LapiClient {
    async fn pull(&self, startup: bool) -> Result<DecisionStream> {
        let url = self.stream_url()?;
        debug!(url = %url, startup, "Pulling decision stream");

        let response = self
            .http
            .get(url)
            .query(&self.query.pairs(startup))
            .send()
            .await
            .map_err(|e| classify(e, self.request_timeout))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ApiMessage>(&body)
                .map(|m| m.message)
                .unwrap_or(body);
            return Err(Error::Authentication(format!("{status}: {message}")));
        }
        if !status.is_success() {
            return Err(Error::Protocol(format!(
                "unexpected status {status} from decision stream"
            )));
        }

        response
            .json::<DecisionStream>()
            .await
            .map_err(|e| Error::Protocol(format!("invalid decision stream body: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lapi::auth::ApiKey;
    use crate::lapi::tls::{TrustRoots, build_client_config};

    #[test]
    fn query_skips_empty_filters() {
        let query = StreamQuery::from_config(&LapiConfig::default());
        assert_eq!(
            query.pairs(true),
            vec![("startup", "true"), ("scopes", "ip,range")]
        );
    }

    #[test]
    fn query_forwards_scenario_filters() {
        let config = LapiConfig {
            include_scenarios_containing: vec!["ssh".to_string(), "http".to_string()],
            exclude_scenarios_containing: vec!["slow".to_string()],
            only_include_decisions_from: vec!["crowdsec".to_string()],
            ..LapiConfig::default()
        };
        let query = StreamQuery::from_config(&config);
        let pairs = query.pairs(false);
        assert!(pairs.contains(&("startup", "false")));
        assert!(pairs.contains(&("origins", "crowdsec")));
        assert!(pairs.contains(&("scenarios_containing", "ssh,http")));
        assert!(pairs.contains(&("scenarios_not_containing", "slow")));
    }

    #[test]
    fn urls_keep_path_prefix() {
        let config = LapiConfig {
            lapi_url: "https://lapi.example:8080/crowdsec".to_string(),
            ..LapiConfig::default()
        };
        let tls = build_client_config(&TrustRoots::System, None).unwrap();
        let client = LapiClient::new(&config, AuthMode::ApiKey(ApiKey::new("k")), tls).unwrap();
        assert_eq!(
            client.stream_url().unwrap().as_str(),
            "https://lapi.example:8080/crowdsec/v1/decisions/stream"
        );
        assert_eq!(client.mode().label(), "api_key");
    }

    #[tokio::test]
    async fn silent_authority_is_a_timeout() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let held = tokio::spawn(async move {
            let mut sockets = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                sockets.push(socket);
            }
        });

        let config = LapiConfig {
            lapi_url: format!("http://{addr}/"),
            startup_timeout: Duration::from_millis(100),
            update_frequency: Duration::from_millis(50),
            ..LapiConfig::default()
        };
        let tls = build_client_config(&TrustRoots::System, None).unwrap();
        let client = LapiClient::new(&config, AuthMode::ApiKey(ApiKey::new("k")), tls).unwrap();

        let err = client.pull(true).await.unwrap_err();
        assert!(
            matches!(err, Error::Timeout(limit, _) if limit == Duration::from_millis(100)),
            "{err}"
        );
        assert!(err.is_transient());
        held.abort();
    }

    #[test]
    fn user_agent_names_the_crate() {
        assert!(USER_AGENT_VALUE.starts_with("blocklist-mirror/"));
    }
}
