//! Shared counter store
//!
//! Every piece of state that must be agreed on across gateway instances
//! (sliding-window entries, circuit breaker state, registry entries) goes
//! through the [`SharedStore`] trait. Three implementations exist:
//!
//! - [`RedisStore`]: the distributed store, all mutations are single
//!   round-trip atomic commands or Lua scripts
//! - [`MemoryStore`]: per-process store with per-key locking, used on its own
//!   for local-only deployments and as the degraded-mode fallback
//! - [`FailoverStore`]: wraps a primary and a fallback, bounding every call
//!   with a timeout and switching to the fallback when the primary fails

pub mod failover;
pub mod lua_scripts;
pub mod memory;
pub mod redis;

pub use self::failover::{FailoverStore, StoreMode};
pub use self::memory::MemoryStore;
pub use self::redis::RedisStore;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Store failures. These never reach callers of the admission path.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),

    #[error("unexpected store reply: {0}")]
    Protocol(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Which implementation answered
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Redis,
    Memory,
}

impl std::fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreBackend::Redis => write!(f, "redis"),
            StoreBackend::Memory => write!(f, "memory"),
        }
    }
}

/// Outcome of one atomic sliding-window admission attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowOutcome {
    /// Whether a new entry was recorded
    pub admitted: bool,
    /// Entries inside the window after the attempt
    pub count: u64,
    /// Timestamp of the oldest live entry, if any
    pub oldest_ms: Option<u64>,
    /// The store's notion of "now" used for the attempt
    pub now_ms: u64,
}

/// Precondition checked by [`SharedStore::hash_transaction`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashCondition {
    /// The field holds exactly `value`
    Equals {
        key: String,
        field: String,
        value: String,
    },
    /// The field is not present
    Absent { key: String, field: String },
    /// The hash has no fields at all
    Empty { key: String },
}

impl HashCondition {
    /// `Equals` for `Some`, `Absent` for `None`
    pub fn field(key: impl Into<String>, field: impl Into<String>, expected: Option<&str>) -> Self {
        let (key, field) = (key.into(), field.into());
        match expected {
            Some(value) => HashCondition::Equals {
                key,
                field,
                value: value.to_string(),
            },
            None => HashCondition::Absent { key, field },
        }
    }

    pub fn empty(key: impl Into<String>) -> Self {
        HashCondition::Empty { key: key.into() }
    }
}

/// Field mutation applied by [`SharedStore::hash_transaction`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HashWrite {
    Set {
        key: String,
        field: String,
        value: String,
    },
    Delete { key: String, field: String },
}

impl HashWrite {
    pub fn set(key: impl Into<String>, field: impl Into<String>, value: impl Into<String>) -> Self {
        HashWrite::Set {
            key: key.into(),
            field: field.into(),
            value: value.into(),
        }
    }

    pub fn delete(key: impl Into<String>, field: impl Into<String>) -> Self {
        HashWrite::Delete {
            key: key.into(),
            field: field.into(),
        }
    }
}

/// Narrow interface over the shared store
#[async_trait]
pub trait SharedStore: Send + Sync + std::fmt::Debug {
    /// Backend currently serving requests
    fn backend(&self) -> StoreBackend;

    /// Current time according to the store
    async fn now_ms(&self) -> StoreResult<u64>;

    /// Atomically prune entries older than `now - window_ms`, count the rest,
    /// and record `member` at `now` when fewer than `capacity` remain.
    async fn record_in_window(
        &self,
        key: &str,
        member: &str,
        window_ms: u64,
        capacity: u64,
    ) -> StoreResult<WindowOutcome>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()>;

    /// Write `value` only if the current value equals `expected`
    /// (`None` meaning the key must be absent). Returns whether it wrote.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool>;

    async fn delete(&self, key: &str) -> StoreResult<()>;

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()>;

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>>;

    async fn hash_get_all(&self, key: &str) -> StoreResult<Vec<(String, String)>>;

    /// Returns whether the field existed
    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool>;

    /// Apply `writes` only if every condition holds, as one atomic step.
    /// Returns whether the writes were applied.
    async fn hash_transaction(
        &self,
        conditions: &[HashCondition],
        writes: &[HashWrite],
    ) -> StoreResult<bool>;

    async fn ping(&self) -> StoreResult<()>;

    /// Housekeeping hook run periodically by the gateway
    async fn maintain(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Key layout inside the shared store
#[derive(Debug, Clone)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn rate_limit(&self, key: &str) -> String {
        format!("{}:ratelimit:{}", self.prefix, key)
    }

    pub fn breaker(&self, service: &str) -> String {
        format!("{}:breaker:{}", self.prefix, service)
    }

    /// Hash of instance id -> serialized instance for one service
    pub fn registry_service(&self, service: &str) -> String {
        format!("{}:registry:service:{}", self.prefix, service)
    }

    /// Hash of instance id -> owning service name
    pub fn registry_instances(&self) -> String {
        format!("{}:registry:instances", self.prefix)
    }

    /// Hash of known service names
    pub fn registry_services(&self) -> String {
        format!("{}:registry:services", self.prefix)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new("gateway")
    }
}
