//! Blocklist rendering
//!
//! Turns the active decisions into the body served by a blocklist endpoint.

use std::collections::HashMap;
use std::fmt::Write as _;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::config::BlocklistFormat;
use crate::decision::ActiveDecision;

/// RouterOS address-list receiving the mirrored values
pub const MIKROTIK_LIST: &str = "CrowdSec";

/// Per-request rendering options taken from the query string.
///
/// Flags are presence-based: `?ipv4only` and `?ipv4only=true` mean the same.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RenderOptions {
    /// Only IPv4 values
    pub ipv4_only: bool,
    /// Only IPv6 values
    pub ipv6_only: bool,
    /// Only decisions from this origin
    pub origin: Option<String>,
    /// Keep cache order instead of sorting by address
    pub no_sort: bool,
}

impl RenderOptions {
    /// Parse from query parameters
    #[must_use]
    pub fn from_query(params: &HashMap<String, String>) -> Self {
        let flag = |name: &str| {
            params
                .get(name)
                .is_some_and(|v| !matches!(v.as_str(), "false" | "0"))
        };
        Self {
            ipv4_only: flag("ipv4only"),
            ipv6_only: flag("ipv6only"),
            origin: params.get("origin").filter(|o| !o.is_empty()).cloned(),
            no_sort: flag("nosort"),
        }
    }

    fn keeps(&self, active: &ActiveDecision) -> bool {
        let decision = &active.decision;
        if self.ipv4_only && !decision.is_ipv4() {
            return false;
        }
        if self.ipv6_only && !decision.is_ipv6() {
            return false;
        }
        self.origin
            .as_deref()
            .is_none_or(|o| decision.origin.eq_ignore_ascii_case(o))
    }
}

/// Render `decisions` in `format`.
#[must_use]
pub fn render(
    format: BlocklistFormat,
    decisions: Vec<ActiveDecision>,
    options: &RenderOptions,
    now: Instant,
) -> String {
    let mut selected: Vec<ActiveDecision> =
        decisions.into_iter().filter(|d| options.keeps(d)).collect();
    if !options.no_sort {
        selected.sort_by_key(|d| sort_key(&d.decision.value));
    }

    match format {
        BlocklistFormat::PlainText => plain_text(&selected),
        BlocklistFormat::Mikrotik => mikrotik(&selected, now),
    }
}

/// Content type for `format`
#[must_use]
pub fn content_type(format: BlocklistFormat) -> &'static str {
    match format {
        BlocklistFormat::PlainText | BlocklistFormat::Mikrotik => "text/plain; charset=utf-8",
    }
}

fn plain_text(decisions: &[ActiveDecision]) -> String {
    let mut out = String::new();
    for d in decisions {
        out.push_str(&d.decision.value);
        out.push('\n');
    }
    out
}

fn mikrotik(decisions: &[ActiveDecision], now: Instant) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "/ip firewall address-list remove [find list={MIKROTIK_LIST}]"
    );
    let _ = writeln!(
        out,
        "/ipv6 firewall address-list remove [find list={MIKROTIK_LIST}]"
    );
    for d in decisions {
        let family = if d.decision.is_ipv6() { "/ipv6" } else { "/ip" };
        let _ = writeln!(
            out,
            "{family} firewall address-list add list={MIKROTIK_LIST} address={} comment=\"{}\" timeout={}",
            d.decision.value,
            d.decision.scenario.replace('"', "'"),
            routeros_timeout(d.remaining(now)),
        );
    }
    out
}

/// `1d2h3m4s`, the duration syntax RouterOS accepts for `timeout=`
fn routeros_timeout(remaining: Duration) -> String {
    let mut secs = remaining.as_secs().max(1);
    let mut out = String::new();
    for (unit, size) in [("d", 86_400), ("h", 3_600), ("m", 60)] {
        if secs >= size {
            let _ = write!(out, "{}{unit}", secs / size);
            secs %= size;
        }
    }
    if secs > 0 || out.is_empty() {
        let _ = write!(out, "{secs}s");
    }
    out
}

/// IPv4 before IPv6, then numeric address, then prefix length.
fn sort_key(value: &str) -> (u8, u128, u8, String) {
    let (addr, prefix) = value.split_once('/').unwrap_or((value, ""));
    let prefix = prefix.parse().unwrap_or(u8::MAX);
    match addr.parse::<IpAddr>() {
        Ok(IpAddr::V4(v4)) => (0, u128::from(u32::from(v4)), prefix, String::new()),
        Ok(IpAddr::V6(v6)) => (1, u128::from(v6), prefix, String::new()),
        Err(_) => (2, 0, prefix, value.to_string()),
    }
}
