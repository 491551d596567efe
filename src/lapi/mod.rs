//! Local API connection: trust, identity, auth mode and the decision client

pub mod auth;
pub mod client;
pub mod failure;
pub mod health;
pub mod identity;
pub mod tls;

pub use auth::{ApiKey, AuthMode};
pub use client::{DecisionSource, LapiClient};
pub use health::{HealthProbe, HttpHealthProbe, Readiness, wait_until_ready};
pub use identity::ClientIdentity;
pub use tls::TrustRoots;
