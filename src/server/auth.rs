//! Access control for blocklist endpoints
//!
//! Supports:
//! - open endpoints
//! - HTTP basic auth, compared in constant time
//! - peer address allowlists (exact address or CIDR range)

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use base64::{Engine, engine::general_purpose::STANDARD};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::config::{EndpointAuthConfig, EndpointAuthType};
use crate::{Error, Result};

const REALM: &str = "Basic realm=\"blocklist-mirror\"";

/// Resolved access rule for one endpoint
#[derive(Clone)]
pub enum EndpointGuard {
    /// Anyone may fetch
    Open,
    /// HTTP basic credentials
    Basic {
        /// Expected user
        user: String,
        /// Expected password
        password: String,
    },
    /// Peer address must match one of these
    Trusted(Vec<TrustedNet>),
}

impl fmt::Debug for EndpointGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => f.write_str("Open"),
            Self::Basic { user, .. } => f
                .debug_struct("Basic")
                .field("user", user)
                .field("password", &"********")
                .finish(),
            Self::Trusted(nets) => f.debug_tuple("Trusted").field(nets).finish(),
        }
    }
}

impl EndpointGuard {
    /// Resolve from configuration
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` for an unparsable trusted address.
    pub fn from_config(config: &EndpointAuthConfig) -> Result<Self> {
        match config.kind {
            EndpointAuthType::None => Ok(Self::Open),
            EndpointAuthType::Basic => Ok(Self::Basic {
                user: config.user.clone().unwrap_or_default(),
                password: config.password.clone().unwrap_or_default(),
            }),
            EndpointAuthType::IpBased => config
                .trusted_ips
                .iter()
                .map(|s| TrustedNet::parse(s))
                .collect::<Result<Vec<_>>>()
                .map(Self::Trusted),
        }
    }

    fn check_basic(expected_user: &str, expected_password: &str, header: Option<&str>) -> bool {
        let Some(encoded) = header.and_then(|h| h.strip_prefix("Basic ")) else {
            return false;
        };
        let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
            return false;
        };
        let Some(sep) = decoded.iter().position(|b| *b == b':') else {
            return false;
        };
        let (user, password) = (&decoded[..sep], &decoded[sep + 1..]);

        let user_ok = user.ct_eq(expected_user.as_bytes());
        let password_ok = password.ct_eq(expected_password.as_bytes());
        bool::from(user_ok & password_ok)
    }
}

/// An address or CIDR range from `trusted_ips`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrustedNet {
    addr: IpAddr,
    prefix: u8,
}

impl TrustedNet {
    /// Parse `10.0.0.0/8`, `::1` or `192.168.1.10`
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the address or prefix length is invalid.
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || Error::Config(format!("invalid trusted_ips entry '{value}'"));
        let (addr, prefix) = match value.trim().split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (value.trim(), None),
        };
        let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
        let max = if addr.is_ipv4() { 32 } else { 128 };
        let prefix = match prefix {
            Some(p) => p.parse::<u8>().ok().filter(|p| *p <= max).ok_or_else(invalid)?,
            None => max,
        };
        Ok(Self { addr, prefix })
    }

    /// Whether `ip` falls inside this range
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        match (self.addr, ip.to_canonical()) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let mask = u32::MAX.checked_shl(32 - u32::from(self.prefix)).unwrap_or(0);
                u32::from(net) & mask == u32::from(ip) & mask
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let mask = u128::MAX.checked_shl(128 - u32::from(self.prefix)).unwrap_or(0);
                u128::from(net) & mask == u128::from(ip) & mask
            }
            _ => false,
        }
    }
}

/// Endpoint access middleware
pub async fn guard_middleware(
    State(guard): State<Arc<EndpointGuard>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let path = request.uri().path().to_string();
    match guard.as_ref() {
        EndpointGuard::Open => next.run(request).await,
        EndpointGuard::Basic { user, password } => {
            let header = request
                .headers()
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok());
            if EndpointGuard::check_basic(user, password, header) {
                debug!(path = %path, "Basic auth accepted");
                next.run(request).await
            } else {
                warn!(path = %path, "Rejected blocklist request: bad credentials");
                (
                    StatusCode::UNAUTHORIZED,
                    [(header::WWW_AUTHENTICATE, REALM)],
                    "Unauthorized\n",
                )
                    .into_response()
            }
        }
        EndpointGuard::Trusted(nets) => {
            let peer = request
                .extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|ConnectInfo(addr)| addr.ip());
            match peer {
                Some(ip) if nets.iter().any(|n| n.contains(ip)) => next.run(request).await,
                _ => {
                    warn!(path = %path, peer = ?peer, "Rejected blocklist request: untrusted address");
                    (StatusCode::FORBIDDEN, "Forbidden\n").into_response()
                }
            }
        }
    }
}
