use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Named rate-limit profile
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Unauthenticated,
    Authenticated,
    Consultant,
    InternalService,
}

impl Tier {
    /// All tiers, least to most permissive
    pub const ALL: [Tier; 4] = [
        Tier::Unauthenticated,
        Tier::Authenticated,
        Tier::Consultant,
        Tier::InternalService,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Unauthenticated => "unauthenticated",
            Tier::Authenticated => "authenticated",
            Tier::Consultant => "consultant",
            Tier::InternalService => "internal_service",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Limit, window and burst for one tier
///
/// Burst is an over-limit allowance sharing the same window and counter, so
/// the effective capacity of a window is `limit + burst`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TierConfig {
    /// Steady-state requests per window
    pub limit: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// Extra requests tolerated in the same window
    #[serde(default)]
    pub burst: u64,
}

impl TierConfig {
    pub const fn new(limit: u64, window_ms: u64, burst: u64) -> Self {
        Self {
            limit,
            window_ms,
            burst,
        }
    }

    /// Entries the window may hold
    pub fn capacity(&self) -> u64 {
        self.limit.saturating_add(self.burst)
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }

    /// Admissions per second at full capacity
    fn rate(&self) -> f64 {
        self.capacity() as f64 * 1000.0 / self.window_ms as f64
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.limit == 0 {
            return Err(GatewayError::Config(format!(
                "rate limit '{}': limit must be greater than zero",
                name
            )));
        }
        if self.window_ms == 0 {
            return Err(GatewayError::Config(format!(
                "rate limit '{}': window_ms must be greater than zero",
                name
            )));
        }
        Ok(())
    }
}

fn default_unauthenticated() -> TierConfig {
    TierConfig::new(60, 60_000, 10)
}

fn default_authenticated() -> TierConfig {
    TierConfig::new(600, 60_000, 60)
}

fn default_consultant() -> TierConfig {
    TierConfig::new(1_200, 60_000, 120)
}

fn default_internal_service() -> TierConfig {
    TierConfig::new(10_000, 60_000, 1_000)
}

/// The four tiers, loaded once at startup
///
/// Unknown tier names are rejected while deserializing, so a typo in the
/// config file fails startup instead of surfacing at request time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct TierTable {
    #[serde(default = "default_unauthenticated")]
    pub unauthenticated: TierConfig,
    #[serde(default = "default_authenticated")]
    pub authenticated: TierConfig,
    #[serde(default = "default_consultant")]
    pub consultant: TierConfig,
    #[serde(default = "default_internal_service")]
    pub internal_service: TierConfig,
}

impl Default for TierTable {
    fn default() -> Self {
        Self {
            unauthenticated: default_unauthenticated(),
            authenticated: default_authenticated(),
            consultant: default_consultant(),
            internal_service: default_internal_service(),
        }
    }
}

impl TierTable {
    pub fn get(&self, tier: Tier) -> &TierConfig {
        match tier {
            Tier::Unauthenticated => &self.unauthenticated,
            Tier::Authenticated => &self.authenticated,
            Tier::Consultant => &self.consultant,
            Tier::InternalService => &self.internal_service,
        }
    }

    /// Check every tier and that permissiveness strictly increases
    pub fn validate(&self) -> Result<()> {
        for tier in Tier::ALL {
            self.get(tier).validate(tier.as_str())?;
        }

        for pair in Tier::ALL.windows(2) {
            let (lower, higher) = (pair[0], pair[1]);
            if self.get(higher).rate() <= self.get(lower).rate() {
                return Err(GatewayError::Config(format!(
                    "tier '{}' must be more permissive than tier '{}'",
                    higher, lower
                )));
            }
        }

        Ok(())
    }
}
