use super::{HashCondition, HashWrite, SharedStore, StoreBackend, StoreResult, WindowOutcome};
use crate::clock::{Clock, SystemClock};
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tracing::debug;

/// Per-process store
///
/// Each key is guarded by its DashMap shard lock for the whole
/// prune/count/insert sequence, so concurrent callers inside one process
/// never over-admit. Hash writes are serialized by one lock so that a
/// conditional transaction over several hashes sees no interleaved write.
/// Nothing is shared with other gateway instances.
#[derive(Debug)]
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    windows: DashMap<String, WindowLog>,
    values: DashMap<String, StoredValue>,
    hashes: DashMap<String, HashMap<String, String>>,
    hash_writes: Mutex<()>,
}

#[derive(Debug)]
struct WindowLog {
    window_ms: u64,
    entries: VecDeque<u64>,
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: String,
    expires_at_ms: Option<u64>,
}

impl StoredValue {
    fn is_live(&self, now_ms: u64) -> bool {
        self.expires_at_ms.map_or(true, |at| now_ms < at)
    }
}

fn expiry(now_ms: u64, ttl: Option<Duration>) -> Option<u64> {
    ttl.map(|ttl| now_ms.saturating_add(u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX)))
}

impl MemoryStore {
    /// Create a store driven by the system clock
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store driven by the given clock
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            windows: DashMap::new(),
            values: DashMap::new(),
            hashes: DashMap::new(),
            hash_writes: Mutex::new(()),
        }
    }

    fn lock_hashes(&self) -> MutexGuard<'_, ()> {
        self.hash_writes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn field_value(&self, key: &str, field: &str) -> Option<String> {
        self.hashes.get(key).and_then(|hash| hash.get(field).cloned())
    }

    fn set_field(&self, key: &str, field: &str, value: &str) {
        self.hashes
            .entry(key.to_string())
            .or_default()
            .insert(field.to_string(), value.to_string());
    }

    fn delete_field(&self, key: &str, field: &str) -> bool {
        let removed = match self.hashes.get_mut(key) {
            Some(mut hash) => hash.remove(field).is_some(),
            None => false,
        };
        self.hashes.remove_if(key, |_, hash| hash.is_empty());
        removed
    }

    fn holds(&self, condition: &HashCondition) -> bool {
        match condition {
            HashCondition::Equals { key, field, value } => {
                self.field_value(key, field).as_deref() == Some(value.as_str())
            }
            HashCondition::Absent { key, field } => self.field_value(key, field).is_none(),
            HashCondition::Empty { key } => self.hashes.get(key).map_or(true, |hash| hash.is_empty()),
        }
    }

    /// Number of tracked windows (for testing/monitoring)
    pub fn window_count(&self) -> usize {
        self.windows.len()
    }

    /// Drop windows and values whose entries have all expired
    pub fn purge_expired(&self) {
        let now = self.clock.now_ms();

        self.windows.retain(|_, log| match now.checked_sub(log.window_ms) {
            Some(cutoff) => log.entries.iter().any(|&t| t > cutoff),
            None => true,
        });
        self.values.retain(|_, v| v.is_live(now));

        debug!(
            windows = self.windows.len(),
            values = self.values.len(),
            "Purged expired in-memory store entries"
        );
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SharedStore for MemoryStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Memory
    }

    async fn now_ms(&self) -> StoreResult<u64> {
        Ok(self.clock.now_ms())
    }

    async fn record_in_window(
        &self,
        key: &str,
        _member: &str,
        window_ms: u64,
        capacity: u64,
    ) -> StoreResult<WindowOutcome> {
        let now = self.clock.now_ms();

        let mut log = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| WindowLog {
                window_ms,
                entries: VecDeque::new(),
            });
        log.window_ms = window_ms;

        if let Some(cutoff) = now.checked_sub(window_ms) {
            log.entries.retain(|&t| t > cutoff);
        }

        let admitted = (log.entries.len() as u64) < capacity;
        if admitted {
            log.entries.push_back(now);
        }

        Ok(WindowOutcome {
            admitted,
            count: log.entries.len() as u64,
            oldest_ms: log.entries.iter().min().copied(),
            now_ms: now,
        })
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = self.clock.now_ms();
        Ok(self
            .values
            .get(key)
            .filter(|v| v.is_live(now))
            .map(|v| v.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let now = self.clock.now_ms();
        self.values.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at_ms: expiry(now, ttl),
            },
        );
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let now = self.clock.now_ms();
        let replacement = StoredValue {
            value: value.to_string(),
            expires_at_ms: expiry(now, ttl),
        };

        match self.values.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = Some(occupied.get())
                    .filter(|v| v.is_live(now))
                    .map(|v| v.value.as_str());
                if current == expected {
                    occupied.insert(replacement);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
            Entry::Vacant(vacant) => {
                if expected.is_none() {
                    vacant.insert(replacement);
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.values.remove(key);
        self.windows.remove(key);
        self.hashes.remove(key);
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let _writes = self.lock_hashes();
        self.set_field(key, field, value);
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        Ok(self.field_value(key, field))
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<Vec<(String, String)>> {
        Ok(self
            .hashes
            .get(key)
            .map(|hash| {
                hash.iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        let _writes = self.lock_hashes();
        Ok(self.delete_field(key, field))
    }

    async fn hash_transaction(
        &self,
        conditions: &[HashCondition],
        writes: &[HashWrite],
    ) -> StoreResult<bool> {
        let _writes = self.lock_hashes();

        if !conditions.iter().all(|condition| self.holds(condition)) {
            return Ok(false);
        }

        for write in writes {
            match write {
                HashWrite::Set { key, field, value } => self.set_field(key, field, value),
                HashWrite::Delete { key, field } => {
                    self.delete_field(key, field);
                }
            }
        }
        Ok(true)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }

    async fn maintain(&self) -> StoreResult<()> {
        self.purge_expired();
        Ok(())
    }
}
