use super::tiers::Tier;
use crate::store::WindowOutcome;
use serde::Serialize;
use std::fmt;

/// Escape a key component so that `:` can only ever be a separator
fn component(raw: &str) -> String {
    raw.replace('%', "%25").replace(':', "%3A")
}

/// Composite rate limit key
///
/// Built deterministically from the limiting dimension, the target route (or
/// route class) and the tier. Construction is pure, so identical logical
/// requests always land on the same key regardless of arrival order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RateLimitKey(String);

impl RateLimitKey {
    /// Login attempts: `(ip, username)`
    pub fn login(ip: &str, username: &str) -> Self {
        Self(format!("login:{}:{}", component(ip), component(username)))
    }

    /// General API calls: `(userId, endpoint)`
    pub fn api(tier: Tier, user_id: &str, endpoint: &str) -> Self {
        Self(format!(
            "api:{}:{}:{}",
            tier.as_str(),
            component(user_id),
            component(endpoint)
        ))
    }

    /// Consultant multi-firm access: `(consultantId, firmId, endpoint)`
    pub fn consultant(tier: Tier, consultant_id: &str, firm_id: &str, endpoint: &str) -> Self {
        Self(format!(
            "consultant:{}:{}:{}:{}",
            tier.as_str(),
            component(consultant_id),
            component(firm_id),
            component(endpoint)
        ))
    }

    /// Callers without an identity: `(ip, route)`
    pub fn ip(tier: Tier, ip: &str, route: &str) -> Self {
        Self(format!(
            "ip:{}:{}:{}",
            tier.as_str(),
            component(ip),
            component(route)
        ))
    }

    /// Service-to-service calls: `(service, route)`
    pub fn internal(service: &str, route: &str) -> Self {
        Self(format!(
            "internal:{}:{}:{}",
            Tier::InternalService.as_str(),
            component(service),
            component(route)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Rate limit result
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitResult {
    /// Whether the request is allowed
    pub allowed: bool,
    /// Window capacity (limit + burst)
    pub limit: u64,
    /// Remaining requests in the current window
    pub remaining: u64,
    /// When the oldest entry leaves the window (epoch seconds)
    pub reset_at: u64,
    /// Seconds until a slot frees up (rejections only)
    pub retry_after: Option<u64>,
    /// Whether the answer came from the per-instance fallback
    pub degraded: bool,
}

impl RateLimitResult {
    /// Build a result from a store window outcome
    pub fn from_outcome(
        outcome: &WindowOutcome,
        capacity: u64,
        window_ms: u64,
        degraded: bool,
    ) -> Self {
        let remaining = capacity.saturating_sub(outcome.count);
        let frees_at_ms = outcome
            .oldest_ms
            .unwrap_or(outcome.now_ms)
            .saturating_add(window_ms);

        let retry_after = (!outcome.admitted).then(|| {
            let wait_ms = frees_at_ms.saturating_sub(outcome.now_ms);
            wait_ms.div_ceil(1000).max(1)
        });

        Self {
            allowed: outcome.admitted,
            limit: capacity,
            remaining,
            reset_at: frees_at_ms.div_ceil(1000),
            retry_after,
            degraded,
        }
    }
}
