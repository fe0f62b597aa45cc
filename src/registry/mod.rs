//! Service registry
//!
//! Live backend instances per logical service, kept in the shared store:
//!
//! - `{prefix}:registry:service:{name}`: hash of instance id -> instance JSON
//! - `{prefix}:registry:instances`: hash of instance id -> service name
//! - `{prefix}:registry:services`: hash of known service names
//!
//! Liveness is TTL based. Expiry is checked on every read, so an instance
//! that missed its heartbeat is never returned even before the purge sweep
//! removes it.
//!
//! Every mutation is one conditional hash transaction guarded by the values
//! it read. A write that lost a race is recomputed from fresh reads, so a
//! heartbeat can never resurrect a deregistered instance and a purge can
//! never remove a registration that was just refreshed.

pub mod types;

pub use types::{validate_service_name, RegistrationRequest, RegistryConfig, ServiceInstance};

use crate::circuit_breaker::{RetryConfig, RetryExecutor};
use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::store::{HashCondition, HashWrite, KeySpace, SharedStore, StoreMode};
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

fn is_conflict(e: &GatewayError) -> bool {
    matches!(e, GatewayError::Conflict(_))
}

/// Registry of backend instances
pub struct ServiceRegistry {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    config: RegistryConfig,
    retry: RetryExecutor,
    /// Instances last read from the shared store, per service
    last_known: DashMap<String, Vec<ServiceInstance>>,
    store_mode: Option<watch::Receiver<StoreMode>>,
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("backend", &self.store.backend())
            .field("config", &self.config)
            .finish()
    }
}

impl ServiceRegistry {
    pub fn new(store: Arc<dyn SharedStore>, keys: KeySpace, config: RegistryConfig) -> Self {
        Self {
            store,
            keys,
            config,
            retry: RetryExecutor::new(RetryConfig::default()),
            last_known: DashMap::new(),
            store_mode: None,
        }
    }

    /// Follow the failover store's mode
    ///
    /// While degraded, lookups also return unexpired instances last seen in
    /// the shared store, so an outage does not empty the routing table.
    pub fn with_store_mode(mut self, mode: watch::Receiver<StoreMode>) -> Self {
        self.store_mode = Some(mode);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    fn is_degraded(&self) -> bool {
        self.store_mode
            .as_ref()
            .is_some_and(|mode| *mode.borrow() == StoreMode::Degraded)
    }

    fn parse(service: &str, instance_id: &str, json: &str) -> Option<ServiceInstance> {
        match serde_json::from_str(json) {
            Ok(instance) => Some(instance),
            Err(e) => {
                warn!(service = %service, instance_id = %instance_id, error = %e, "Skipping unreadable registry entry");
                None
            }
        }
    }

    async fn read_entry(&self, service: &str, instance_id: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .hash_get(&self.keys.registry_service(service), instance_id)
            .await?)
    }

    async fn owner_of(&self, instance_id: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .hash_get(&self.keys.registry_instances(), instance_id)
            .await?)
    }

    /// Apply `writes` if nothing in `conditions` changed since it was read
    async fn commit(&self, conditions: &[HashCondition], writes: &[HashWrite], instance_id: &str) -> Result<()> {
        if self.store.hash_transaction(conditions, writes).await? {
            Ok(())
        } else {
            debug!(instance_id = %instance_id, "Registry entry changed concurrently, retrying");
            Err(GatewayError::Conflict(instance_id.to_string()))
        }
    }

    /// Guards on the owner index and the entry as they were read
    fn guards(&self, service: &str, instance_id: &str, owner: Option<&str>, entry: Option<&str>) -> Vec<HashCondition> {
        vec![
            HashCondition::field(self.keys.registry_instances(), instance_id, owner),
            HashCondition::field(self.keys.registry_service(service), instance_id, entry),
        ]
    }

    /// Writes removing an instance and its owner index entry
    fn removal(&self, service: &str, instance_id: &str) -> Vec<HashWrite> {
        vec![
            HashWrite::delete(self.keys.registry_service(service), instance_id),
            HashWrite::delete(self.keys.registry_instances(), instance_id),
        ]
    }

    fn forget(&self, service: &str, instance_id: &str) {
        if let Some(mut cached) = self.last_known.get_mut(service) {
            cached.retain(|i| i.instance_id != instance_id);
        }
    }

    /// Register or refresh an instance (idempotent upsert)
    pub async fn register(&self, request: RegistrationRequest) -> Result<ServiceInstance> {
        let ttl = request.validate(self.config.default_ttl(), self.config.max_ttl())?;
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);

        let (instance, moved_from) = self
            .retry
            .execute(|| self.try_register(&request, ttl_ms), is_conflict)
            .await?;

        if let Some(previous) = moved_from {
            info!(
                instance_id = %instance.instance_id,
                from = %previous,
                to = %instance.service_name,
                "Instance moved to another service"
            );
            self.forget(&previous, &instance.instance_id);
        }

        info!(
            service = %instance.service_name,
            instance_id = %instance.instance_id,
            address = %instance.address,
            ttl_ms = ttl_ms,
            "Instance registered"
        );
        metrics::record_registry_event("register");

        Ok(instance)
    }

    async fn try_register(
        &self,
        request: &RegistrationRequest,
        ttl_ms: u64,
    ) -> Result<(ServiceInstance, Option<String>)> {
        let service = request.service_name.as_str();
        let id = request.instance_id.as_str();

        let owner = self.owner_of(id).await?;
        let current = self.read_entry(service, id).await?;
        let now = self.store.now_ms().await?;

        let mut conditions = self.guards(service, id, owner.as_deref(), current.as_deref());
        let mut writes = Vec::new();
        let mut registered_at = now;
        let mut moved_from = None;

        match owner {
            // Moving an instance id to another service drops the old entry
            Some(previous) if previous != service => {
                let old = self.read_entry(&previous, id).await?;
                conditions.push(HashCondition::field(
                    self.keys.registry_service(&previous),
                    id,
                    old.as_deref(),
                ));
                writes.push(HashWrite::delete(self.keys.registry_service(&previous), id));
                moved_from = Some(previous);
            }
            _ => {
                if let Some(existing) = current.as_deref().and_then(|json| Self::parse(service, id, json)) {
                    if !existing.is_expired(now) {
                        registered_at = existing.registered_at;
                    }
                }
            }
        }

        let instance = ServiceInstance {
            service_name: request.service_name.clone(),
            instance_id: request.instance_id.clone(),
            address: request.address.clone(),
            registered_at,
            ttl_expires_at: now.saturating_add(ttl_ms),
            ttl_ms,
            metadata: request.metadata.clone(),
        };

        writes.extend([
            HashWrite::set(self.keys.registry_service(service), id, serde_json::to_string(&instance)?),
            HashWrite::set(self.keys.registry_instances(), id, service),
            HashWrite::set(self.keys.registry_services(), service, "1"),
        ]);

        self.commit(&conditions, &writes, id).await?;
        Ok((instance, moved_from))
    }

    /// Extend an instance's TTL by the amount granted at registration
    pub async fn heartbeat(&self, instance_id: &str) -> Result<ServiceInstance> {
        let instance = self
            .retry
            .execute(|| self.try_heartbeat(instance_id), is_conflict)
            .await?;

        debug!(
            service = %instance.service_name,
            instance_id = %instance_id,
            ttl_expires_at = instance.ttl_expires_at,
            "Heartbeat received"
        );
        metrics::record_registry_event("heartbeat");

        Ok(instance)
    }

    async fn try_heartbeat(&self, instance_id: &str) -> Result<ServiceInstance> {
        let not_found = || GatewayError::InstanceNotFound(instance_id.to_string());

        let service = self.owner_of(instance_id).await?.ok_or_else(not_found)?;
        let raw = self
            .read_entry(&service, instance_id)
            .await?
            .ok_or_else(not_found)?;
        let mut instance = Self::parse(&service, instance_id, &raw).ok_or_else(not_found)?;
        let now = self.store.now_ms().await?;

        let conditions = self.guards(&service, instance_id, Some(service.as_str()), Some(raw.as_str()));

        if instance.is_expired(now) {
            // Too late: the instance has to register again
            self.commit(&conditions, &self.removal(&service, instance_id), instance_id)
                .await?;
            self.forget(&service, instance_id);
            debug!(service = %service, instance_id = %instance_id, "Heartbeat for expired instance");
            return Err(not_found());
        }

        instance.ttl_expires_at = now.saturating_add(instance.ttl_ms);
        let refreshed = [HashWrite::set(
            self.keys.registry_service(&service),
            instance_id,
            serde_json::to_string(&instance)?,
        )];
        self.commit(&conditions, &refreshed, instance_id).await?;

        Ok(instance)
    }

    /// Remove an instance explicitly
    pub async fn deregister(&self, instance_id: &str) -> Result<()> {
        let service = self
            .retry
            .execute(|| self.try_deregister(instance_id), is_conflict)
            .await?;

        info!(service = %service, instance_id = %instance_id, "Instance deregistered");
        metrics::record_registry_event("deregister");
        Ok(())
    }

    async fn try_deregister(&self, instance_id: &str) -> Result<String> {
        let service = self
            .owner_of(instance_id)
            .await?
            .ok_or_else(|| GatewayError::InstanceNotFound(instance_id.to_string()))?;
        let raw = self.read_entry(&service, instance_id).await?;

        self.commit(
            &self.guards(&service, instance_id, Some(service.as_str()), raw.as_deref()),
            &self.removal(&service, instance_id),
            instance_id,
        )
        .await?;
        self.forget(&service, instance_id);

        Ok(service)
    }

    /// Unexpired instances of a service, ordered by instance id
    pub async fn lookup(&self, service: &str) -> Result<Vec<ServiceInstance>> {
        let now = self.store.now_ms().await?;
        let entries = self
            .store
            .hash_get_all(&self.keys.registry_service(service))
            .await?;

        let mut instances: Vec<ServiceInstance> = entries
            .into_iter()
            .filter_map(|(id, json)| Self::parse(service, &id, &json))
            .filter(|instance| !instance.is_expired(now))
            .collect();

        if self.is_degraded() {
            if let Some(cached) = self.last_known.get(service) {
                for instance in cached.iter().filter(|i| !i.is_expired(now)) {
                    if !instances.iter().any(|i| i.instance_id == instance.instance_id) {
                        instances.push(instance.clone());
                    }
                }
            }
        } else {
            self.last_known.insert(service.to_string(), instances.clone());
        }

        instances.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(instances)
    }

    /// Known service names, sorted
    pub async fn services(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self
            .store
            .hash_get_all(&self.keys.registry_services())
            .await?
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        names.sort();
        Ok(names)
    }

    /// Physically remove expired instances and empty services
    ///
    /// An entry that changed after it was read is left for the next sweep.
    pub async fn purge_expired(&self) -> Result<usize> {
        let now = self.store.now_ms().await?;
        let mut purged = 0;

        for service in self.services().await? {
            let key = self.keys.registry_service(&service);
            let entries = self.store.hash_get_all(&key).await?;
            let mut live = 0usize;

            for (id, json) in entries {
                let expired = serde_json::from_str::<ServiceInstance>(&json)
                    .map(|instance| instance.is_expired(now))
                    .unwrap_or(true);
                if !expired {
                    live += 1;
                    continue;
                }

                // The owner index may point elsewhere after a move
                let owner = self.owner_of(&id).await?;
                let mut writes = vec![HashWrite::delete(key.as_str(), id.as_str())];
                if owner.as_deref() == Some(service.as_str()) {
                    writes.push(HashWrite::delete(self.keys.registry_instances(), id.as_str()));
                }

                let conditions = self.guards(&service, &id, owner.as_deref(), Some(json.as_str()));
                if self.store.hash_transaction(&conditions, &writes).await? {
                    self.forget(&service, &id);
                    purged += 1;
                } else {
                    debug!(service = %service, instance_id = %id, "Registry entry changed during purge, keeping it");
                    live += 1;
                }
            }

            if live == 0 {
                let dropped = self
                    .store
                    .hash_transaction(
                        &[HashCondition::empty(key.as_str())],
                        &[HashWrite::delete(self.keys.registry_services(), service.as_str())],
                    )
                    .await?;
                if dropped {
                    self.last_known.remove(&service);
                }
            }
            metrics::record_registry_size(&service, live);
        }

        if purged > 0 {
            info!(purged, "Purged expired registry instances");
        }
        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn registry() -> (ServiceRegistry, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (
            ServiceRegistry::new(store, KeySpace::default(), RegistryConfig::default()),
            clock,
        )
    }

    fn request(service: &str, id: &str, ttl: u64) -> RegistrationRequest {
        RegistrationRequest {
            service_name: service.to_string(),
            instance_id: id.to_string(),
            address: format!("http://{}.internal:8080", id),
            ttl: Some(ttl),
            metadata: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let (registry, _clock) = registry();

        registry.register(request("orders", "orders-2", 10)).await.unwrap();
        registry.register(request("orders", "orders-1", 10)).await.unwrap();
        registry.register(request("billing", "billing-1", 10)).await.unwrap();

        let ids: Vec<_> = registry
            .lookup("orders")
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.instance_id)
            .collect();
        assert_eq!(ids, vec!["orders-1", "orders-2"]);
        assert_eq!(registry.services().await.unwrap(), vec!["billing", "orders"]);
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let (registry, clock) = registry();

        let first = registry.register(request("orders", "orders-1", 10)).await.unwrap();
        clock.advance(Duration::from_secs(5));
        let second = registry.register(request("orders", "orders-1", 10)).await.unwrap();

        assert_eq!(second.registered_at, first.registered_at);
        assert_eq!(second.ttl_expires_at, first.ttl_expires_at + 5_000);
        assert_eq!(registry.lookup("orders").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_expired_instance_is_not_returned() {
        let (registry, clock) = registry();
        registry.register(request("orders", "orders-1", 10)).await.unwrap();

        clock.advance(Duration::from_millis(9_999));
        assert_eq!(registry.lookup("orders").await.unwrap().len(), 1);

        clock.advance(Duration::from_millis(1));
        assert!(registry.lookup("orders").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_heartbeat_extends_ttl() {
        let (registry, clock) = registry();
        registry.register(request("orders", "orders-1", 10)).await.unwrap();

        clock.advance(Duration::from_secs(8));
        registry.heartbeat("orders-1").await.unwrap();
        clock.advance(Duration::from_secs(8));

        assert_eq!(registry.lookup("orders").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_after_expiry_requires_registration() {
        let (registry, clock) = registry();
        registry.register(request("orders", "orders-1", 10)).await.unwrap();

        clock.advance(Duration::from_secs(11));
        let err = registry.heartbeat("orders-1").await.unwrap_err();
        assert!(matches!(err, GatewayError::InstanceNotFound(_)));

        assert!(matches!(
            registry.heartbeat("unknown").await,
            Err(GatewayError::InstanceNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_deregister() {
        let (registry, _clock) = registry();
        registry.register(request("orders", "orders-1", 10)).await.unwrap();

        registry.deregister("orders-1").await.unwrap();
        assert!(registry.lookup("orders").await.unwrap().is_empty());
        assert!(registry.deregister("orders-1").await.is_err());
    }

    #[tokio::test]
    async fn test_instance_moving_between_services() {
        let (registry, _clock) = registry();
        registry.register(request("orders", "shared-1", 10)).await.unwrap();
        registry.register(request("billing", "shared-1", 10)).await.unwrap();

        assert!(registry.lookup("orders").await.unwrap().is_empty());
        assert_eq!(registry.lookup("billing").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let (registry, clock) = registry();
        registry.register(request("orders", "orders-1", 10)).await.unwrap();
        registry.register(request("orders", "orders-2", 60)).await.unwrap();
        registry.register(request("billing", "billing-1", 10)).await.unwrap();

        clock.advance(Duration::from_secs(30));
        assert_eq!(registry.purge_expired().await.unwrap(), 2);
        assert_eq!(registry.services().await.unwrap(), vec!["orders"]);
        assert!(registry.heartbeat("orders-1").await.is_err());
    }

    #[tokio::test]
    async fn test_degraded_lookup_keeps_last_known_instances() {
        let clock = Arc::new(ManualClock::new(0));
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        let (mode_tx, mode_rx) = watch::channel(StoreMode::Primary);
        let registry = ServiceRegistry::new(store.clone(), KeySpace::default(), RegistryConfig::default())
            .with_store_mode(mode_rx);

        registry.register(request("orders", "orders-1", 10)).await.unwrap();
        assert_eq!(registry.lookup("orders").await.unwrap().len(), 1);

        // Simulate the failover store now answering from an empty local store
        store.delete("gateway:registry:service:orders").await.unwrap();
        mode_tx.send(StoreMode::Degraded).unwrap();
        assert_eq!(registry.lookup("orders").await.unwrap().len(), 1);

        // Still bound by the TTL
        clock.advance(Duration::from_secs(10));
        assert!(registry.lookup("orders").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_registration_rejected() {
        let (registry, _clock) = registry();
        let err = registry
            .register(request("bad name", "x", 10))
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidRegistration(_)));
    }
}
