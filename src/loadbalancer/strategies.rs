use crate::registry::ServiceInstance;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Picks one instance out of the routable candidates for a service
pub trait InstanceSelector: Send + Sync + std::fmt::Debug {
    fn select<'a>(&self, service: &str, instances: &'a [ServiceInstance])
        -> Option<&'a ServiceInstance>;
}

/// Per-service rotating counters
#[derive(Debug, Default)]
struct Counters {
    by_service: DashMap<String, AtomicUsize>,
}

impl Counters {
    fn next(&self, service: &str) -> usize {
        if let Some(counter) = self.by_service.get(service) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }
        self.by_service
            .entry(service.to_string())
            .or_default()
            .fetch_add(1, Ordering::Relaxed)
    }
}

/// Round-robin: distribute requests evenly across instances
#[derive(Debug, Default)]
pub struct RoundRobinSelector {
    counters: Counters,
}

impl RoundRobinSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstanceSelector for RoundRobinSelector {
    fn select<'a>(
        &self,
        service: &str,
        instances: &'a [ServiceInstance],
    ) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }

        let index = self.counters.next(service) % instances.len();
        instances.get(index)
    }
}

/// Weighted round-robin: distribute based on the `weight` metadata
#[derive(Debug, Default)]
pub struct WeightedSelector {
    counters: Counters,
}

impl WeightedSelector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl InstanceSelector for WeightedSelector {
    fn select<'a>(
        &self,
        service: &str,
        instances: &'a [ServiceInstance],
    ) -> Option<&'a ServiceInstance> {
        if instances.is_empty() {
            return None;
        }

        let total_weight: u64 = instances.iter().map(|i| u64::from(i.weight())).sum();
        let counter = self.counters.next(service) as u64;

        if total_weight == 0 {
            // All weights zero: plain rotation
            return instances.get((counter % instances.len() as u64) as usize);
        }

        let position = counter % total_weight;
        let mut cumulative = 0u64;
        for instance in instances {
            cumulative += u64::from(instance.weight());
            if position < cumulative {
                return Some(instance);
            }
        }

        instances.first()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    fn instance(id: &str, weight: u32) -> ServiceInstance {
        ServiceInstance {
            service_name: "orders".to_string(),
            instance_id: id.to_string(),
            address: format!("http://{}:8080", id),
            registered_at: 0,
            ttl_expires_at: u64::MAX,
            ttl_ms: 30_000,
            metadata: BTreeMap::from([("weight".to_string(), weight.to_string())]),
        }
    }

    fn instances(count: usize) -> Vec<ServiceInstance> {
        (0..count).map(|i| instance(&format!("orders-{}", i), 1)).collect()
    }

    #[test]
    fn test_round_robin() {
        let instances = instances(3);
        let selector = RoundRobinSelector::new();

        let picks: Vec<_> = (0..4)
            .map(|_| selector.select("orders", &instances).unwrap().instance_id.clone())
            .collect();

        assert_eq!(picks, vec!["orders-0", "orders-1", "orders-2", "orders-0"]);
    }

    #[test]
    fn test_round_robin_counters_are_per_service() {
        let instances = instances(2);
        let selector = RoundRobinSelector::new();

        selector.select("orders", &instances);
        let first_billing = selector.select("billing", &instances).unwrap();
        assert_eq!(first_billing.instance_id, "orders-0");
    }

    #[test]
    fn test_weighted_distribution() {
        let instances = vec![
            instance("orders-0", 1),
            instance("orders-1", 2),
            instance("orders-2", 3),
        ];
        let selector = WeightedSelector::new();

        let mut counts = HashMap::new();
        for _ in 0..60 {
            let picked = selector.select("orders", &instances).unwrap();
            *counts.entry(picked.instance_id.clone()).or_insert(0) += 1;
        }

        assert_eq!(counts.get("orders-0"), Some(&10));
        assert_eq!(counts.get("orders-1"), Some(&20));
        assert_eq!(counts.get("orders-2"), Some(&30));
    }

    #[test]
    fn test_zero_weights_fall_back_to_rotation() {
        let instances = vec![instance("orders-0", 0), instance("orders-1", 0)];
        let selector = WeightedSelector::new();

        assert_eq!(selector.select("orders", &instances).unwrap().instance_id, "orders-0");
        assert_eq!(selector.select("orders", &instances).unwrap().instance_id, "orders-1");
    }

    #[test]
    fn test_empty_candidates() {
        assert!(RoundRobinSelector::new().select("orders", &[]).is_none());
        assert!(WeightedSelector::new().select("orders", &[]).is_none());
    }
}
