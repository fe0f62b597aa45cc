use crate::error::{GatewayError, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::time::Duration;
use url::Url;

/// One registered backend instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceInstance {
    pub service_name: String,
    pub instance_id: String,
    pub address: String,
    /// First registration time (epoch ms), kept across re-registrations
    pub registered_at: u64,
    /// Liveness deadline (epoch ms)
    pub ttl_expires_at: u64,
    /// TTL granted at registration, reapplied on every heartbeat
    pub ttl_ms: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl ServiceInstance {
    /// Expired at `now_ms` if the deadline has been reached
    pub fn is_expired(&self, now_ms: u64) -> bool {
        now_ms >= self.ttl_expires_at
    }

    /// Selection weight from the `weight` metadata entry (default 1)
    pub fn weight(&self) -> u32 {
        self.metadata
            .get("weight")
            .and_then(|w| w.parse().ok())
            .unwrap_or(1)
    }

    /// Address as a URL, assuming `http` when no scheme is given
    pub fn base_url(&self) -> Option<Url> {
        parse_address(&self.address)
    }

    /// `host:port` for socket-level probes
    pub fn socket_address(&self) -> Option<String> {
        let url = self.base_url()?;
        let host = url.host_str()?;
        let port = url.port_or_known_default()?;
        Some(format!("{}:{}", host, port))
    }
}

fn parse_address(address: &str) -> Option<Url> {
    let url = if address.contains("://") {
        Url::parse(address).ok()?
    } else {
        Url::parse(&format!("http://{}", address)).ok()?
    };
    url.host_str()?;
    Some(url)
}

/// Body of `POST /register`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationRequest {
    pub service_name: String,
    pub instance_id: String,
    pub address: String,
    /// TTL in seconds; the registry default applies when absent
    #[serde(default)]
    pub ttl: Option<u64>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

fn service_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]{0,63}$").expect("service name pattern is valid")
    })
}

/// Check that a service name is usable as a key component
pub fn validate_service_name(name: &str) -> Result<()> {
    if service_name_pattern().is_match(name) {
        Ok(())
    } else {
        Err(GatewayError::InvalidRegistration(format!(
            "invalid service name '{}'",
            name
        )))
    }
}

impl RegistrationRequest {
    /// Validate the request and resolve its TTL
    pub fn validate(&self, default_ttl: Duration, max_ttl: Duration) -> Result<Duration> {
        validate_service_name(&self.service_name)?;

        if self.instance_id.is_empty()
            || self.instance_id.len() > 128
            || self.instance_id.chars().any(char::is_control)
        {
            return Err(GatewayError::InvalidRegistration(
                "instanceId must be 1-128 printable characters".to_string(),
            ));
        }

        if parse_address(&self.address).is_none() {
            return Err(GatewayError::InvalidRegistration(format!(
                "invalid address '{}'",
                self.address
            )));
        }

        if let Some(weight) = self.metadata.get("weight") {
            if weight.parse::<u32>().is_err() {
                return Err(GatewayError::InvalidRegistration(format!(
                    "metadata weight '{}' is not a non-negative integer",
                    weight
                )));
            }
        }

        let ttl = self.ttl.map(Duration::from_secs).unwrap_or(default_ttl);
        if ttl.is_zero() || ttl > max_ttl {
            return Err(GatewayError::InvalidRegistration(format!(
                "ttl must be between 1 and {} seconds",
                max_ttl.as_secs()
            )));
        }

        Ok(ttl)
    }
}

/// Registry settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RegistryConfig {
    /// TTL applied when a registration does not carry one
    #[serde(default = "default_ttl_secs")]
    pub default_ttl_secs: u64,

    /// Upper bound for requested TTLs
    #[serde(default = "default_max_ttl_secs")]
    pub max_ttl_secs: u64,

    /// How often expired instances are physically removed
    #[serde(default = "default_purge_interval_secs")]
    pub purge_interval_secs: u64,
}

fn default_ttl_secs() -> u64 {
    30
}

fn default_max_ttl_secs() -> u64 {
    300
}

fn default_purge_interval_secs() -> u64 {
    30
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_ttl_secs(),
            max_ttl_secs: default_max_ttl_secs(),
            purge_interval_secs: default_purge_interval_secs(),
        }
    }
}

impl RegistryConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn max_ttl(&self) -> Duration {
        Duration::from_secs(self.max_ttl_secs)
    }

    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_ttl_secs == 0 || self.default_ttl_secs > self.max_ttl_secs {
            return Err(GatewayError::Config(
                "registry.default_ttl_secs must be between 1 and max_ttl_secs".to_string(),
            ));
        }
        if self.purge_interval_secs == 0 {
            return Err(GatewayError::Config(
                "registry.purge_interval_secs must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> RegistrationRequest {
        RegistrationRequest {
            service_name: "orders".to_string(),
            instance_id: "orders-1".to_string(),
            address: "10.0.0.5:8080".to_string(),
            ttl: Some(10),
            metadata: BTreeMap::new(),
        }
    }

    #[test]
    fn test_registration_json_is_camel_case() {
        let json = r#"{"serviceName":"orders","instanceId":"orders-1","address":"http://10.0.0.5:8080","ttl":15}"#;
        let req: RegistrationRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.service_name, "orders");
        assert_eq!(req.ttl, Some(15));
        assert!(req.metadata.is_empty());
    }

    #[test]
    fn test_validate_resolves_ttl() {
        let ttl = request()
            .validate(Duration::from_secs(30), Duration::from_secs(300))
            .unwrap();
        assert_eq!(ttl, Duration::from_secs(10));

        let ttl = RegistrationRequest {
            ttl: None,
            ..request()
        }
        .validate(Duration::from_secs(30), Duration::from_secs(300))
        .unwrap();
        assert_eq!(ttl, Duration::from_secs(30));
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let limits = (Duration::from_secs(30), Duration::from_secs(300));
        let cases = [
            RegistrationRequest {
                service_name: "bad name".to_string(),
                ..request()
            },
            RegistrationRequest {
                instance_id: String::new(),
                ..request()
            },
            RegistrationRequest {
                address: "http://".to_string(),
                ..request()
            },
            RegistrationRequest {
                ttl: Some(0),
                ..request()
            },
            RegistrationRequest {
                ttl: Some(301),
                ..request()
            },
        ];

        for case in cases {
            assert!(
                case.validate(limits.0, limits.1).is_err(),
                "{:?} should be rejected",
                case
            );
        }
    }

    #[test]
    fn test_instance_addresses() {
        let instance = ServiceInstance {
            service_name: "orders".to_string(),
            instance_id: "orders-1".to_string(),
            address: "10.0.0.5:8080".to_string(),
            registered_at: 0,
            ttl_expires_at: 1_000,
            ttl_ms: 1_000,
            metadata: BTreeMap::from([("weight".to_string(), "3".to_string())]),
        };

        assert_eq!(instance.base_url().unwrap().as_str(), "http://10.0.0.5:8080/");
        assert_eq!(instance.socket_address().as_deref(), Some("10.0.0.5:8080"));
        assert_eq!(instance.weight(), 3);
        assert!(!instance.is_expired(999));
        assert!(instance.is_expired(1_000));
    }
}
