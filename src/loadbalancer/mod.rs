pub mod strategies;

pub use strategies::{InstanceSelector, RoundRobinSelector, WeightedSelector};

use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Instance selection policy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionPolicy {
    /// Distribute requests evenly across instances
    #[default]
    RoundRobin,
    /// Distribute according to each instance's `weight` metadata
    Weighted,
}

impl SelectionPolicy {
    pub fn build(&self) -> Arc<dyn InstanceSelector> {
        match self {
            SelectionPolicy::RoundRobin => Arc::new(RoundRobinSelector::new()),
            SelectionPolicy::Weighted => Arc::new(WeightedSelector::new()),
        }
    }
}

/// Load balancer settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LoadBalancerConfig {
    #[serde(default)]
    pub policy: SelectionPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_from_yaml() {
        let config: LoadBalancerConfig = serde_yaml::from_str("policy: weighted").unwrap();
        assert_eq!(config.policy, SelectionPolicy::Weighted);

        let config: LoadBalancerConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.policy, SelectionPolicy::RoundRobin);
    }

    #[test]
    fn test_policy_builds_selector() {
        let selector = SelectionPolicy::Weighted.build();
        assert!(format!("{:?}", selector).contains("WeightedSelector"));
    }
}
