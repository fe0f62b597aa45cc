use crate::circuit_breaker::CircuitBreakerConfig;
use crate::error::{GatewayError, Result};
use crate::healthcheck::HealthCheckSettings;
use crate::loadbalancer::LoadBalancerConfig;
use crate::observability::TelemetryConfig;
use crate::rate_limit::TierTable;
use crate::registry::RegistryConfig;
use crate::router::RouteConfig;
use crate::secrets::{resolve_secret, SecretString};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Environment prefix for overrides (`GATEWAY__SERVER__PORT=9090`)
pub const ENV_PREFIX: &str = "GATEWAY";
pub const ENV_SEPARATOR: &str = "__";

/// Main gateway configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,
    /// Shared store connection
    #[serde(default)]
    pub store: StoreConfig,
    /// Rate limit tiers
    #[serde(default)]
    pub rate_limiting: TierTable,
    /// Route definitions
    #[serde(default)]
    pub routes: Vec<RouteConfig>,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub health_check: HealthCheckSettings,
    #[serde(default)]
    pub load_balancer: LoadBalancerConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Server host address
    #[serde(default = "default_host")]
    pub host: String,
    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Proxies whose `X-Forwarded-For` header is believed when keying
    /// limits by client IP
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

/// Shared store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Redis URL or a secret reference to it (`env://VAR`, `file:///path`,
    /// `secret://key`). Local-only state when absent.
    #[serde(default)]
    pub redis_url: Option<String>,
    /// Prefix of every key the gateway writes
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    /// Upper bound for a single store round trip
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,
    /// How often a degraded gateway retries the shared store
    #[serde(default = "default_recovery_interval_ms")]
    pub recovery_interval_ms: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_key_prefix() -> String {
    "gateway".to_string()
}

fn default_operation_timeout_ms() -> u64 {
    250
}

fn default_recovery_interval_ms() -> u64 {
    5_000
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            trusted_proxies: Vec::new(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            redis_url: None,
            key_prefix: default_key_prefix(),
            operation_timeout_ms: default_operation_timeout_ms(),
            recovery_interval_ms: default_recovery_interval_ms(),
        }
    }
}

impl StoreConfig {
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms)
    }

    /// Resolve the Redis URL reference
    pub fn resolve_redis_url(&self) -> Result<Option<SecretString>> {
        self.redis_url.as_deref().map(resolve_secret).transpose()
    }

    fn validate(&self) -> Result<()> {
        if self.key_prefix.is_empty() || self.key_prefix.contains(char::is_whitespace) {
            return Err(GatewayError::Config(format!(
                "store key_prefix '{}' must be non-empty without whitespace",
                self.key_prefix
            )));
        }
        for (name, value) in [
            ("operation_timeout_ms", self.operation_timeout_ms),
            ("recovery_interval_ms", self.recovery_interval_ms),
        ] {
            if value == 0 {
                return Err(GatewayError::Config(format!("store {} must be > 0", name)));
            }
        }
        Ok(())
    }
}

impl GatewayConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| GatewayError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_yaml(&content)
    }

    /// Parse configuration from YAML string
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Load a YAML file layered with `GATEWAY__SECTION__KEY` environment
    /// overrides, then validate
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let config: Self = ::config::Config::builder()
            .add_source(::config::File::from(path.as_ref()).format(::config::FileFormat::Yaml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator(ENV_SEPARATOR)
                    .separator(ENV_SEPARATOR)
                    .try_parsing(true),
            )
            .build()
            .and_then(|built| built.try_deserialize())
            .map_err(|e| GatewayError::Config(format!("Failed to load config: {}", e)))?;

        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    ///
    /// Routes are checked when the route table is built.
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(GatewayError::Config("server port must be > 0".to_string()));
        }

        for route in &self.routes {
            if route.path.is_empty() || !route.path.starts_with('/') {
                return Err(GatewayError::Config(format!(
                    "route path '{}' must start with '/'",
                    route.path
                )));
            }
        }

        self.store.validate()?;
        self.rate_limiting.validate()?;
        self.circuit_breaker.validate()?;
        self.registry.validate()?;
        self.health_check.validate()?;
        self.telemetry.validate()?;
        Ok(())
    }
}
