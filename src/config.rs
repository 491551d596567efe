//! Configuration management

use std::{
    collections::HashSet,
    env,
    net::SocketAddr,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::{Error, Result};

/// Prefix for environment overrides (`BLOCKLIST_MIRROR_CROWDSEC_CONFIG__LAPI_KEY=...`)
pub const ENV_PREFIX: &str = "BLOCKLIST_MIRROR_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Connection to the CrowdSec Local API
    pub crowdsec_config: LapiConfig,
    /// Blocklists published by the local server
    pub blocklists: Vec<BlocklistConfig>,
    /// Local bind address
    pub listen_uri: String,
    /// Optional TLS for the local listener
    pub tls: ListenerTlsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            crowdsec_config: LapiConfig::default(),
            blocklists: vec![BlocklistConfig::default()],
            listen_uri: "127.0.0.1:41412".to_string(),
            tls: ListenerTlsConfig::default(),
        }
    }
}

/// Local API connection settings.
///
/// Optional string fields treat `""` as unset, so templates can ship
/// `cert_path: ""` without switching on certificate auth.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LapiConfig {
    /// Authority URL; the `https` scheme turns on TLS
    pub lapi_url: String,
    /// Static API key (supports `${VAR}` expansion)
    pub lapi_key: Option<String>,
    /// Client certificate for mutual TLS (PEM)
    pub cert_path: Option<String>,
    /// Client private key for mutual TLS (PEM)
    pub key_path: Option<String>,
    /// CA bundle replacing the system roots when verifying the authority
    pub ca_cert_path: Option<String>,
    /// Skip server certificate verification entirely
    pub insecure_skip_verify: bool,
    /// Decision stream poll interval
    #[serde(with = "humantime_serde")]
    pub update_frequency: Duration,
    /// Bound on the first authenticated request
    #[serde(with = "humantime_serde")]
    pub startup_timeout: Duration,
    /// Keep only decisions whose scenario contains one of these
    pub include_scenarios_containing: Vec<String>,
    /// Drop decisions whose scenario contains one of these
    pub exclude_scenarios_containing: Vec<String>,
    /// Keep only decisions from these origins (`crowdsec`, `cscli`, `CAPI`, `lists`)
    pub only_include_decisions_from: Vec<String>,
    /// Decision scopes to mirror
    pub scopes: Vec<String>,
    /// Decision types to mirror
    pub supported_decisions_types: Vec<String>,
}

impl Default for LapiConfig {
    fn default() -> Self {
        Self {
            lapi_url: "http://127.0.0.1:8080/".to_string(),
            lapi_key: None,
            cert_path: None,
            key_path: None,
            ca_cert_path: None,
            insecure_skip_verify: false,
            update_frequency: Duration::from_secs(10),
            startup_timeout: Duration::from_secs(30),
            include_scenarios_containing: Vec::new(),
            exclude_scenarios_containing: Vec::new(),
            only_include_decisions_from: Vec::new(),
            scopes: vec!["ip".to_string(), "range".to_string()],
            supported_decisions_types: vec!["ban".to_string()],
        }
    }
}

fn non_empty(value: Option<&String>) -> Option<&str> {
    value.map(|s| s.trim()).filter(|s| !s.is_empty())
}

impl LapiConfig {
    /// API key, if one is configured
    #[must_use]
    pub fn api_key(&self) -> Option<&str> {
        non_empty(self.lapi_key.as_ref())
    }

    /// Client certificate path, if configured
    #[must_use]
    pub fn cert_path(&self) -> Option<&Path> {
        non_empty(self.cert_path.as_ref()).map(Path::new)
    }

    /// Client key path, if configured
    #[must_use]
    pub fn key_path(&self) -> Option<&Path> {
        non_empty(self.key_path.as_ref()).map(Path::new)
    }

    /// Custom CA bundle path, if configured
    #[must_use]
    pub fn ca_cert_path(&self) -> Option<&Path> {
        non_empty(self.ca_cert_path.as_ref()).map(Path::new)
    }

    /// Parsed authority URL, normalised to end with `/` so relative joins
    /// keep any path prefix.
    pub fn url(&self) -> Result<Url> {
        let raw = self.lapi_url.trim();
        let mut url = Url::parse(raw)
            .map_err(|e| Error::Config(format!("invalid lapi_url '{raw}': {e}")))?;
        match url.scheme() {
            "http" | "https" => {}
            other => {
                return Err(Error::Config(format!(
                    "unsupported lapi_url scheme '{other}' (expected http or https)"
                )));
            }
        }
        if url.host_str().is_none() {
            return Err(Error::Config(format!("lapi_url '{raw}' has no host")));
        }
        if !url.path().ends_with('/') {
            let path = format!("{}/", url.path());
            url.set_path(&path);
        }
        Ok(url)
    }

    fn validate(&self) -> Result<()> {
        self.url()?;

        match (self.cert_path(), self.key_path()) {
            (Some(_), None) => {
                return Err(Error::Config(
                    "cert_path is set but key_path is missing".to_string(),
                ));
            }
            (None, Some(_)) => {
                return Err(Error::Config(
                    "key_path is set but cert_path is missing".to_string(),
                ));
            }
            (None, None) if self.api_key().is_none() => {
                return Err(Error::Config(
                    "no authentication configured: set lapi_key or cert_path/key_path"
                        .to_string(),
                ));
            }
            _ => {}
        }

        if self.update_frequency.is_zero() {
            return Err(Error::Config("update_frequency must be positive".to_string()));
        }
        if self.startup_timeout.is_zero() {
            return Err(Error::Config("startup_timeout must be positive".to_string()));
        }
        if self.supported_decisions_types.is_empty() {
            return Err(Error::Config(
                "supported_decisions_types must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// One published blocklist
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlocklistConfig {
    /// Output format
    pub format: BlocklistFormat,
    /// URL path, e.g. `/security/blocklist`
    pub endpoint: String,
    /// Access control for this endpoint
    pub authentication: EndpointAuthConfig,
}

impl Default for BlocklistConfig {
    fn default() -> Self {
        Self {
            format: BlocklistFormat::PlainText,
            endpoint: "/security/blocklist".to_string(),
            authentication: EndpointAuthConfig::default(),
        }
    }
}

/// Blocklist output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BlocklistFormat {
    /// One value per line
    #[default]
    PlainText,
    /// RouterOS address-list script
    Mikrotik,
}

/// Endpoint authentication settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EndpointAuthConfig {
    /// Authentication type
    #[serde(rename = "type")]
    pub kind: EndpointAuthType,
    /// Basic auth user
    pub user: Option<String>,
    /// Basic auth password (supports `${VAR}` expansion)
    pub password: Option<String>,
    /// Addresses or CIDR ranges allowed by `ip_based`
    pub trusted_ips: Vec<String>,
}

/// Endpoint authentication type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EndpointAuthType {
    /// Open endpoint
    #[default]
    None,
    /// HTTP basic auth
    Basic,
    /// Peer address allowlist
    IpBased,
}

/// TLS for the local listener
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ListenerTlsConfig {
    /// PEM certificate chain
    pub cert_file: Option<String>,
    /// PEM private key
    pub key_file: Option<String>,
}

impl ListenerTlsConfig {
    /// Certificate and key paths when both are configured
    #[must_use]
    pub fn paths(&self) -> Option<(PathBuf, PathBuf)> {
        match (
            non_empty(self.cert_file.as_ref()),
            non_empty(self.key_file.as_ref()),
        ) {
            (Some(cert), Some(key)) => Some((PathBuf::from(cert), PathBuf::from(key))),
            _ => None,
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist, cannot be parsed,
    /// or fails validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.expand_env_vars();
        config.validate()?;

        Ok(config)
    }

    /// Check invariants that serde cannot express
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.crowdsec_config.validate()?;
        self.listen_addr()?;

        if self.blocklists.is_empty() {
            return Err(Error::Config("at least one blocklist is required".to_string()));
        }

        let mut seen = HashSet::new();
        for list in &self.blocklists {
            if !list.endpoint.starts_with('/') {
                return Err(Error::Config(format!(
                    "blocklist endpoint '{}' must start with '/'",
                    list.endpoint
                )));
            }
            if list.endpoint == "/health" {
                return Err(Error::Config(
                    "blocklist endpoint '/health' is reserved".to_string(),
                ));
            }
            if !seen.insert(list.endpoint.as_str()) {
                return Err(Error::Config(format!(
                    "duplicate blocklist endpoint '{}'",
                    list.endpoint
                )));
            }
            let auth = &list.authentication;
            match auth.kind {
                EndpointAuthType::Basic
                    if non_empty(auth.user.as_ref()).is_none()
                        || non_empty(auth.password.as_ref()).is_none() =>
                {
                    return Err(Error::Config(format!(
                        "blocklist '{}': basic auth needs user and password",
                        list.endpoint
                    )));
                }
                EndpointAuthType::IpBased if auth.trusted_ips.is_empty() => {
                    return Err(Error::Config(format!(
                        "blocklist '{}': ip_based auth needs trusted_ips",
                        list.endpoint
                    )));
                }
                _ => {}
            }
        }

        let tls = &self.tls;
        if tls.paths().is_none()
            && (non_empty(tls.cert_file.as_ref()).is_some()
                || non_empty(tls.key_file.as_ref()).is_some())
        {
            return Err(Error::Config(
                "tls needs both cert_file and key_file".to_string(),
            ));
        }

        Ok(())
    }

    /// Parsed local bind address
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen_uri
            .parse()
            .map_err(|e| Error::Config(format!("invalid listen_uri '{}': {e}", self.listen_uri)))
    }

    /// Copy of this config with secrets masked, for display
    #[must_use]
    pub fn redacted(&self) -> Self {
        const MASK: &str = "********";
        let mut copy = self.clone();
        if copy.crowdsec_config.api_key().is_some() {
            copy.crowdsec_config.lapi_key = Some(MASK.to_string());
        }
        for list in &mut copy.blocklists {
            if list.authentication.password.is_some() {
                list.authentication.password = Some(MASK.to_string());
            }
        }
        copy
    }

    /// Expand `${VAR}` and `${VAR:-default}` in secret-bearing fields
    fn expand_env_vars(&mut self) {
        let re = Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}")
            .expect("static regex is valid");

        let lapi = &mut self.crowdsec_config;
        lapi.lapi_url = Self::expand_string(&re, &lapi.lapi_url);
        if let Some(key) = lapi.lapi_key.as_mut() {
            *key = Self::expand_string(&re, key);
        }
        for list in &mut self.blocklists {
            if let Some(password) = list.authentication.password.as_mut() {
                *password = Self::expand_string(&re, password);
            }
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Duration serde accepting Go-style strings (`"1m30s"`, `"100ms"`, `"1h"`)
/// or bare seconds
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    use crate::decision::parse_go_duration;

    /// Parse a configured duration
    ///
    /// # Errors
    ///
    /// Returns a message for malformed, negative or out-of-range values.
    pub fn parse(value: &str) -> Result<Duration, String> {
        let s = value.trim();
        if !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit()) {
            return s
                .parse::<u64>()
                .map(Duration::from_secs)
                .map_err(|e| format!("invalid duration '{value}': {e}"));
        }
        match parse_go_duration(s) {
            Ok(Some(duration)) => Ok(duration),
            Ok(None) => Err(format!("duration '{value}' must not be negative")),
            Err(e) => Err(e.to_string()),
        }
    }

    /// Serialize Duration to a human-readable string
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    /// Deserialize a human-readable duration string
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse(&s).map_err(serde::de::Error::custom)
    }
}
