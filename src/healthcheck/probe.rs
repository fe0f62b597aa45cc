use super::types::ProbeStrategy;
use crate::registry::ServiceInstance;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::TcpStream;

/// Why a probe failed
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("probe timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("unhealthy status {0}")]
    Status(u16),

    #[error("request failed: {0}")]
    Request(String),

    #[error("connect failed: {0}")]
    Connect(String),

    #[error("instance address '{0}' cannot be probed")]
    InvalidAddress(String),
}

/// One way of asking an instance whether it is healthy
///
/// Implementations do not need their own deadline; the checker bounds every
/// probe with the service's timeout.
#[async_trait]
pub trait HealthProbe: Send + Sync + std::fmt::Debug {
    async fn probe(&self, instance: &ServiceInstance) -> Result<(), ProbeError>;
}

/// `GET` the instance's health path, 2xx is healthy
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpProbe {
    pub fn new(client: reqwest::Client, path: impl Into<String>) -> Self {
        Self {
            client,
            path: path.into(),
        }
    }

    fn url_for(&self, instance: &ServiceInstance) -> Option<String> {
        let base = instance.base_url()?;
        Some(format!(
            "{}/{}",
            base.as_str().trim_end_matches('/'),
            self.path.trim_start_matches('/')
        ))
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, instance: &ServiceInstance) -> Result<(), ProbeError> {
        let url = self
            .url_for(instance)
            .ok_or_else(|| ProbeError::InvalidAddress(instance.address.clone()))?;

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProbeError::Request(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(ProbeError::Status(status.as_u16()))
        }
    }
}

/// Open a TCP connection to the instance
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpProbe;

#[async_trait]
impl HealthProbe for TcpProbe {
    async fn probe(&self, instance: &ServiceInstance) -> Result<(), ProbeError> {
        let address = instance
            .socket_address()
            .ok_or_else(|| ProbeError::InvalidAddress(instance.address.clone()))?;

        TcpStream::connect(&address)
            .await
            .map(drop)
            .map_err(|e| ProbeError::Connect(e.to_string()))
    }
}

/// Build the probe for a configured strategy
pub fn probe_for(strategy: &ProbeStrategy, client: &reqwest::Client) -> Arc<dyn HealthProbe> {
    match strategy {
        ProbeStrategy::Http { path } => Arc::new(HttpProbe::new(client.clone(), path.clone())),
        ProbeStrategy::Tcp => Arc::new(TcpProbe),
    }
}
