//! Decisions mirrored from the Local API.
//!
//! Holds the wire types of the decision stream, Go-style duration parsing,
//! the local filter and the in-memory cache served by the blocklist
//! endpoints.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::LapiConfig;
use crate::{Error, Result};

/// One decision as sent by the Local API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    /// Decision id
    #[serde(default)]
    pub id: i64,
    /// Who issued it (`crowdsec`, `cscli`, `CAPI`, `lists`)
    #[serde(default)]
    pub origin: String,
    /// Remediation type, usually `ban`
    #[serde(rename = "type", default)]
    pub kind: String,
    /// `Ip` or `Range`
    #[serde(default)]
    pub scope: String,
    /// Address or CIDR range
    pub value: String,
    /// Remaining lifetime as a Go duration string (`3h59m58.1s`)
    #[serde(default)]
    pub duration: String,
    /// Scenario that triggered the decision
    #[serde(default)]
    pub scenario: String,
}

impl Decision {
    /// Whether the value is an IPv6 address or range.
    #[must_use]
    pub fn is_ipv6(&self) -> bool {
        self.value.contains(':')
    }

    /// Whether the value is an IPv4 address or range.
    #[must_use]
    pub fn is_ipv4(&self) -> bool {
        !self.is_ipv6()
    }

    /// Whether the value parses as an address or CIDR range with a prefix
    /// length that fits the address family.
    #[must_use]
    pub fn has_valid_value(&self) -> bool {
        let (addr, prefix) = match self.value.split_once('/') {
            Some((addr, prefix)) => (addr, Some(prefix)),
            None => (self.value.as_str(), None),
        };
        let Ok(addr) = addr.parse::<IpAddr>() else {
            return false;
        };
        let max = if addr.is_ipv4() { 32 } else { 128 };
        prefix.is_none_or(|p| p.parse::<u8>().is_ok_and(|p| p <= max))
    }
}

/// Body of `GET /v1/decisions/stream`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecisionStream {
    /// Decisions added since the previous pull
    #[serde(default, deserialize_with = "null_as_empty")]
    pub new: Vec<Decision>,
    /// Decisions removed since the previous pull
    #[serde(default, deserialize_with = "null_as_empty")]
    pub deleted: Vec<Decision>,
}

fn null_as_empty<'de, D>(deserializer: D) -> std::result::Result<Vec<Decision>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    Ok(Option::<Vec<Decision>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Parse a Go `time.Duration` string.
///
/// Returns `None` for a negative duration, which the Local API uses for
/// decisions that already expired.
///
/// # Errors
///
/// Returns `Error::Protocol` for anything Go would not accept.
pub fn parse_go_duration(input: &str) -> Result<Option<Duration>> {
    let invalid = || Error::Protocol(format!("invalid duration '{input}'"));

    let s = input.trim();
    let (negative, mut rest) = match s.as_bytes().first() {
        Some(b'-') => (true, &s[1..]),
        Some(b'+') => (false, &s[1..]),
        _ => (false, s),
    };
    if rest == "0" {
        return Ok(Some(Duration::ZERO));
    }
    if rest.is_empty() {
        return Err(invalid());
    }

    let mut total_nanos: u64 = 0;
    while !rest.is_empty() {
        let whole_len = rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len());
        let whole = &rest[..whole_len];
        rest = &rest[whole_len..];
        let fraction = match rest.strip_prefix('.') {
            Some(after) => {
                let len = after.find(|c: char| !c.is_ascii_digit()).unwrap_or(after.len());
                rest = &after[len..];
                &after[..len]
            }
            None => "",
        };
        if whole.is_empty() && fraction.is_empty() {
            return Err(invalid());
        }

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let scale: u64 = match &rest[..unit_len] {
            "ns" => 1,
            "us" | "µs" | "μs" => 1_000,
            "ms" => 1_000_000,
            "s" => 1_000_000_000,
            "m" => 60_000_000_000,
            "h" => 3_600_000_000_000,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];

        let nanos = component_nanos(whole, fraction, scale).ok_or_else(|| {
            Error::Protocol(format!("duration '{input}' is out of range"))
        })?;
        total_nanos = total_nanos.checked_add(nanos).ok_or_else(|| {
            Error::Protocol(format!("duration '{input}' is out of range"))
        })?;
    }

    if negative && total_nanos > 0 {
        return Ok(None);
    }
    Ok(Some(Duration::from_nanos(total_nanos)))
}

/// `whole.fraction` units of `scale` nanoseconds, `None` on overflow.
fn component_nanos(whole: &str, fraction: &str, scale: u64) -> Option<u64> {
    let whole_value = if whole.is_empty() {
        0
    } else {
        whole.parse::<u64>().ok()?.checked_mul(scale)?
    };
    // Digits past nanosecond precision cannot change the result.
    let digits = &fraction[..fraction.len().min(19)];
    let fraction_value = if digits.is_empty() {
        0
    } else {
        let numerator = u128::from(digits.parse::<u64>().ok()?) * u128::from(scale);
        let denominator = 10u128.pow(u32::try_from(digits.len()).ok()?);
        u64::try_from(numerator / denominator).ok()?
    };
    whole_value.checked_add(fraction_value)
}

// ─────────────────────────────────────────────────────────────────────────────
// Filter
// ─────────────────────────────────────────────────────────────────────────────

/// Local copy of the filters also sent to the Local API as query parameters.
#[derive(Debug, Clone, Default)]
pub struct DecisionFilter {
    types: Vec<String>,
    scopes: Vec<String>,
    origins: Vec<String>,
    include_scenarios: Vec<String>,
    exclude_scenarios: Vec<String>,
}

impl DecisionFilter {
    /// Build from the Local API configuration
    #[must_use]
    pub fn from_config(config: &LapiConfig) -> Self {
        let lower = |v: &[String]| v.iter().map(|s| s.to_lowercase()).collect::<Vec<_>>();
        Self {
            types: lower(&config.supported_decisions_types),
            scopes: lower(&config.scopes),
            origins: lower(&config.only_include_decisions_from),
            include_scenarios: config.include_scenarios_containing.clone(),
            exclude_scenarios: config.exclude_scenarios_containing.clone(),
        }
    }

    /// Whether a decision should be mirrored
    #[must_use]
    pub fn accepts(&self, decision: &Decision) -> bool {
        let listed = |set: &[String], value: &str| {
            set.is_empty() || set.iter().any(|s| s.eq_ignore_ascii_case(value))
        };

        listed(&self.types, &decision.kind)
            && listed(&self.scopes, &decision.scope)
            && listed(&self.origins, &decision.origin)
            && (self.include_scenarios.is_empty()
                || self
                    .include_scenarios
                    .iter()
                    .any(|s| decision.scenario.contains(s.as_str())))
            && !self
                .exclude_scenarios
                .iter()
                .any(|s| decision.scenario.contains(s.as_str()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache
// ─────────────────────────────────────────────────────────────────────────────

/// A decision with its absolute expiry.
#[derive(Debug, Clone)]
pub struct ActiveDecision {
    /// The decision as received
    pub decision: Decision,
    /// When it stops applying
    pub expires_at: Instant,
}

impl ActiveDecision {
    /// Time left at `now`
    #[must_use]
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

/// Outcome of applying one stream pull.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ApplyStats {
    /// Decisions inserted or extended
    pub added: usize,
    /// Values removed
    pub deleted: usize,
    /// Decisions dropped by the filter, expired or malformed
    pub skipped: usize,
}

/// Decisions keyed by value; the one expiring last wins.
#[derive(Debug, Default)]
pub struct DecisionCache {
    filter: DecisionFilter,
    entries: RwLock<HashMap<String, ActiveDecision>>,
}

impl DecisionCache {
    /// Create an empty cache
    #[must_use]
    pub fn new(filter: DecisionFilter) -> Self {
        Self {
            filter,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Apply a stream pull received at `now`. Deletions go first so a value
    /// deleted and re-added in the same pull stays.
    ///
    /// A deletion only lifts a mirrored decision of the same type; deletions
    /// the filter would not have mirrored are ignored.
    pub fn apply(&self, stream: DecisionStream, now: Instant) -> ApplyStats {
        let mut stats = ApplyStats::default();
        let mut entries = self.entries.write();

        for decision in stream.deleted {
            if !self.filter.accepts(&decision) {
                stats.skipped += 1;
                continue;
            }
            let same_kind = entries
                .get(&decision.value)
                .is_some_and(|e| e.decision.kind.eq_ignore_ascii_case(&decision.kind));
            if same_kind {
                entries.remove(&decision.value);
                stats.deleted += 1;
            }
        }

        for decision in stream.new {
            if !self.filter.accepts(&decision) || !decision.has_valid_value() {
                stats.skipped += 1;
                continue;
            }
            let remaining = match parse_go_duration(&decision.duration) {
                Ok(Some(d)) if !d.is_zero() => d,
                Ok(_) => {
                    stats.skipped += 1;
                    continue;
                }
                Err(e) => {
                    warn!(value = %decision.value, error = %e, "Skipping decision");
                    stats.skipped += 1;
                    continue;
                }
            };
            let expires_at = now + remaining;
            match entries.get(&decision.value) {
                Some(existing) if existing.expires_at >= expires_at => {}
                _ => {
                    entries.insert(
                        decision.value.clone(),
                        ActiveDecision {
                            decision,
                            expires_at,
                        },
                    );
                    stats.added += 1;
                }
            }
        }

        debug!(
            added = stats.added,
            deleted = stats.deleted,
            skipped = stats.skipped,
            total = entries.len(),
            "Applied decision stream"
        );
        stats
    }

    /// Decisions still in force at `now`
    #[must_use]
    pub fn active(&self, now: Instant) -> Vec<ActiveDecision> {
        self.entries
            .read()
            .values()
            .filter(|d| d.expires_at > now)
            .cloned()
            .collect()
    }

    /// Drop expired entries, returning how many were removed
    pub fn purge_expired(&self, now: Instant) -> usize {
        let mut entries = self.entries.write();
        let before = entries.len();
        entries.retain(|_, d| d.expires_at > now);
        before - entries.len()
    }

    /// Number of cached entries, expired ones included until purged
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sync status
// ─────────────────────────────────────────────────────────────────────────────

/// Tracks the outcome of decision stream pulls.
#[derive(Debug, Default)]
pub struct SyncTracker {
    pulls: AtomicU64,
    failures: AtomicU64,
    last_success_ms: AtomicU64,
    last_error: RwLock<Option<String>>,
}

impl SyncTracker {
    /// Record a successful pull
    pub fn record_success(&self) {
        self.pulls.fetch_add(1, Ordering::Relaxed);
        self.last_success_ms.store(now_millis(), Ordering::Relaxed);
        *self.last_error.write() = None;
    }

    /// Record a failed pull
    pub fn record_failure(&self, error: &Error) {
        self.pulls.fetch_add(1, Ordering::Relaxed);
        self.failures.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write() = Some(error.to_string());
    }

    /// Snapshot for the health endpoint
    #[must_use]
    pub fn status(&self) -> SyncStatus {
        let last = self.last_success_ms.load(Ordering::Relaxed);
        SyncStatus {
            pulls: self.pulls.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            last_success_ms: (last > 0).then_some(last),
            last_error: self.last_error.read().clone(),
        }
    }
}

/// Sync status snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    /// Pulls attempted
    pub pulls: u64,
    /// Pulls that failed
    pub failures: u64,
    /// Last successful pull (millis since epoch)
    pub last_success_ms: Option<u64>,
    /// Error of the most recent pull, cleared on success
    pub last_error: Option<String>,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or_default()
}
