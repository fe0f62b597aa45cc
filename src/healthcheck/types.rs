use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// How an instance is probed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProbeStrategy {
    /// `GET {address}{path}`; any 2xx is healthy
    Http {
        #[serde(default = "default_path")]
        path: String,
    },
    /// TCP connect to the instance's host and port
    Tcp,
}

fn default_path() -> String {
    "/health".to_string()
}

impl Default for ProbeStrategy {
    fn default() -> Self {
        ProbeStrategy::Http {
            path: default_path(),
        }
    }
}

/// Health check configuration for one service
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckConfig {
    /// Enable active checks
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Interval between checks in milliseconds
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Probe timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Consecutive failed probes before marking unhealthy
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default)]
    pub strategy: ProbeStrategy,
}

fn default_enabled() -> bool {
    true
}

fn default_interval_ms() -> u64 {
    10_000
}

fn default_timeout_ms() -> u64 {
    2_000
}

fn default_failure_threshold() -> u32 {
    3
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            interval_ms: default_interval_ms(),
            timeout_ms: default_timeout_ms(),
            failure_threshold: default_failure_threshold(),
            strategy: ProbeStrategy::default(),
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        if self.interval_ms == 0 {
            return Err(GatewayError::Config(format!(
                "health_check '{}': interval_ms must be greater than zero",
                name
            )));
        }
        if self.timeout_ms == 0 || self.timeout_ms > self.interval_ms {
            return Err(GatewayError::Config(format!(
                "health_check '{}': timeout_ms must be between 1 and interval_ms",
                name
            )));
        }
        if self.failure_threshold == 0 {
            return Err(GatewayError::Config(format!(
                "health_check '{}': failure_threshold must be greater than zero",
                name
            )));
        }
        Ok(())
    }
}

/// Default health check settings plus per-service overrides
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSettings {
    #[serde(default)]
    pub default: HealthCheckConfig,

    #[serde(default)]
    pub services: HashMap<String, HealthCheckConfig>,

    /// How often the registry is scanned for new or vanished services
    #[serde(default = "default_discovery_interval_ms")]
    pub discovery_interval_ms: u64,
}

fn default_discovery_interval_ms() -> u64 {
    5_000
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self {
            default: HealthCheckConfig::default(),
            services: HashMap::new(),
            discovery_interval_ms: default_discovery_interval_ms(),
        }
    }
}

impl HealthCheckSettings {
    pub fn for_service(&self, service: &str) -> &HealthCheckConfig {
        self.services.get(service).unwrap_or(&self.default)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms.max(1))
    }

    pub fn validate(&self) -> Result<()> {
        self.default.validate("default")?;
        for (name, config) in &self.services {
            config.validate(name)?;
        }
        Ok(())
    }
}

/// Health of one instance, written only by the health checker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthStatus {
    pub instance_id: String,
    pub service_name: String,
    pub healthy: bool,
    /// Epoch ms of the last completed probe
    pub last_checked_at: u64,
    pub consecutive_failures: u32,
}

impl HealthStatus {
    pub fn new(service_name: &str, instance_id: &str) -> Self {
        Self {
            instance_id: instance_id.to_string(),
            service_name: service_name.to_string(),
            healthy: true,
            last_checked_at: 0,
            consecutive_failures: 0,
        }
    }
}
