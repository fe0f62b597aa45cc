use super::lua_scripts::{COMPARE_AND_SET_SCRIPT, HASH_TRANSACTION_SCRIPT, SLIDING_WINDOW_SCRIPT};
use super::{
    HashCondition, HashWrite, SharedStore, StoreBackend, StoreError, StoreResult, WindowOutcome,
};
use async_trait::async_trait;
use redis::{aio::ConnectionManager, AsyncCommands, Script};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Redis-backed shared store
///
/// The connection manager is multiplexed and cheap to clone, so each call
/// takes its own handle instead of locking a shared connection. The manager
/// itself is created on first use; a failed connect leaves it unset and the
/// next call tries again.
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    connection: Arc<OnceCell<ConnectionManager>>,
    sliding_window: Script,
    compare_and_set: Script,
    hash_transaction: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("connected", &self.connection.initialized())
            .finish()
    }
}

fn ttl_millis(ttl: Option<Duration>) -> u64 {
    ttl.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// 1-based position of `key` in the script's KEYS, adding it if new
fn key_index<'a>(keys: &mut Vec<&'a str>, key: &'a str) -> usize {
    match keys.iter().position(|k| *k == key) {
        Some(i) => i + 1,
        None => {
            keys.push(key);
            keys.len()
        }
    }
}

impl RedisStore {
    /// Create a store that connects on first use
    ///
    /// Only the URL is checked here, so a Redis that is down at startup does
    /// not prevent the store from being built.
    pub fn lazy(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;

        Ok(Self {
            client,
            connection: Arc::new(OnceCell::new()),
            sliding_window: Script::new(SLIDING_WINDOW_SCRIPT),
            compare_and_set: Script::new(COMPARE_AND_SET_SCRIPT),
            hash_transaction: Script::new(HASH_TRANSACTION_SCRIPT),
        })
    }

    /// Connect to Redis
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let store = Self::lazy(redis_url)?;
        store.connection().await?;
        Ok(store)
    }

    async fn connection(&self) -> StoreResult<ConnectionManager> {
        let connection = self
            .connection
            .get_or_try_init(|| async {
                let connection = ConnectionManager::new(self.client.clone()).await?;
                info!("Connected to Redis shared store");
                Ok::<_, StoreError>(connection)
            })
            .await?;
        Ok(connection.clone())
    }
}

#[async_trait]
impl SharedStore for RedisStore {
    fn backend(&self) -> StoreBackend {
        StoreBackend::Redis
    }

    async fn now_ms(&self) -> StoreResult<u64> {
        let mut conn = self.connection().await?;
        let (secs, micros): (u64, u64) = redis::cmd("TIME").query_async(&mut conn).await?;
        Ok(secs * 1000 + micros / 1000)
    }

    async fn record_in_window(
        &self,
        key: &str,
        member: &str,
        window_ms: u64,
        capacity: u64,
    ) -> StoreResult<WindowOutcome> {
        let mut conn = self.connection().await?;

        let result: Vec<i64> = self
            .sliding_window
            .key(key)
            .arg(window_ms)
            .arg(capacity)
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        let [admitted, count, oldest, now] = result[..] else {
            return Err(StoreError::Protocol(format!(
                "sliding window script returned {} values",
                result.len()
            )));
        };

        debug!(
            key = key,
            admitted = admitted == 1,
            count = count,
            "Sliding window script executed"
        );

        Ok(WindowOutcome {
            admitted: admitted == 1,
            count: count.max(0) as u64,
            oldest_ms: u64::try_from(oldest).ok(),
            now_ms: now.max(0) as u64,
        })
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection().await?;
        Ok(conn.get(key).await?)
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl {
            cmd.arg("PX").arg(ttl_millis(Some(ttl)).max(1));
        }
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<bool> {
        let mut conn = self.connection().await?;

        let written: i64 = self
            .compare_and_set
            .key(key)
            .arg(expected.unwrap_or(""))
            .arg(if expected.is_some() { "1" } else { "0" })
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        Ok(written == 1)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.del(key).await?;
        Ok(())
    }

    async fn hash_set(&self, key: &str, field: &str, value: &str) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _: () = conn.hset(key, field, value).await?;
        Ok(())
    }

    async fn hash_get(&self, key: &str, field: &str) -> StoreResult<Option<String>> {
        let mut conn = self.connection().await?;
        Ok(conn.hget(key, field).await?)
    }

    async fn hash_get_all(&self, key: &str) -> StoreResult<Vec<(String, String)>> {
        let mut conn = self.connection().await?;
        let all: HashMap<String, String> = conn.hgetall(key).await?;
        Ok(all.into_iter().collect())
    }

    async fn hash_delete(&self, key: &str, field: &str) -> StoreResult<bool> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn.hdel(key, field).await?;
        Ok(removed > 0)
    }

    async fn hash_transaction(
        &self,
        conditions: &[HashCondition],
        writes: &[HashWrite],
    ) -> StoreResult<bool> {
        let mut keys: Vec<&str> = Vec::new();
        let mut args: Vec<String> = vec![conditions.len().to_string()];

        for condition in conditions {
            let (kind, key, field, value) = match condition {
                HashCondition::Equals { key, field, value } => ("eq", key, field.as_str(), value.as_str()),
                HashCondition::Absent { key, field } => ("absent", key, field.as_str(), ""),
                HashCondition::Empty { key } => ("empty", key, "", ""),
            };
            args.extend([
                kind.to_string(),
                key_index(&mut keys, key).to_string(),
                field.to_string(),
                value.to_string(),
            ]);
        }

        args.push(writes.len().to_string());
        for write in writes {
            let (kind, key, field, value) = match write {
                HashWrite::Set { key, field, value } => ("set", key, field.as_str(), value.as_str()),
                HashWrite::Delete { key, field } => ("del", key, field.as_str(), ""),
            };
            args.extend([
                kind.to_string(),
                key_index(&mut keys, key).to_string(),
                field.to_string(),
                value.to_string(),
            ]);
        }

        let mut invocation = self.hash_transaction.prepare_invoke();
        for key in &keys {
            invocation.key(*key);
        }
        for arg in &args {
            invocation.arg(arg);
        }

        let mut conn = self.connection().await?;
        let applied: i64 = invocation.invoke_async(&mut conn).await?;

        debug!(
            conditions = conditions.len(),
            writes = writes.len(),
            applied = applied == 1,
            "Hash transaction executed"
        );
        Ok(applied == 1)
    }

    async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.connection().await?;
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}
