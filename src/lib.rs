pub mod admission;
pub mod api;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod error;
pub mod healthcheck;
pub mod loadbalancer;
pub mod metrics;
pub mod observability;
pub mod rate_limit;
pub mod registry;
pub mod router;
pub mod secrets;
pub mod store;

use crate::admission::AdmissionGate;
use crate::api::{api_router, ApiState};
use crate::circuit_breaker::CircuitBreakerService;
use crate::config::GatewayConfig;
use crate::error::{GatewayError, Result};
use crate::healthcheck::HealthChecker;
use crate::metrics::MetricsService;
use crate::rate_limit::RateLimiterService;
use crate::registry::ServiceRegistry;
use crate::router::Router;
use crate::store::{FailoverStore, KeySpace, MemoryStore, RedisStore, SharedStore};
use secrecy::ExposeSecret;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

pub use crate::observability::init_tracing;

/// The assembled admission core
pub struct Gateway {
    pub store: Arc<dyn SharedStore>,
    /// Present when a shared store is configured
    pub failover: Option<Arc<FailoverStore>>,
    pub limiter: Arc<RateLimiterService>,
    pub breakers: Arc<CircuitBreakerService>,
    pub registry: Arc<ServiceRegistry>,
    pub health: Arc<HealthChecker>,
    pub gate: Arc<AdmissionGate>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway")
            .field("backend", &self.store.backend())
            .field("gate", &self.gate)
            .finish()
    }
}

impl Gateway {
    /// Validate the configuration and wire every component
    ///
    /// A configured Redis always sits behind a [`FailoverStore`]. If it is
    /// unreachable at startup the gateway starts degraded and reconnects
    /// through the store's recovery path.
    pub async fn build(config: &GatewayConfig) -> Result<Self> {
        config.validate()?;

        let keys = KeySpace::new(config.store.key_prefix.clone());
        let fallback = Arc::new(MemoryStore::new());

        let failover = match config.store.resolve_redis_url()? {
            Some(url) => {
                let redis = RedisStore::lazy(url.expose_secret())
                    .map_err(|e| GatewayError::Config(format!("Invalid Redis URL: {}", e)))?;
                let failover = Arc::new(FailoverStore::new(
                    Arc::new(redis),
                    fallback.clone(),
                    config.store.operation_timeout(),
                    config.store.recovery_interval(),
                ));

                // First connect, bounded by the operation timeout
                failover.ping().await?;
                if failover.is_degraded() {
                    error!(
                        recovery_interval_ms = config.store.recovery_interval_ms,
                        "Shared store unreachable at startup, running degraded until it recovers"
                    );
                }
                Some(failover)
            }
            None => {
                warn!("No shared store configured, limits and breakers are per instance");
                None
            }
        };

        let (store, limiter): (Arc<dyn SharedStore>, _) = match &failover {
            Some(failover) => (
                failover.clone() as Arc<dyn SharedStore>,
                RateLimiterService::with_failover(failover.clone(), keys.clone()),
            ),
            None => (
                fallback.clone() as Arc<dyn SharedStore>,
                RateLimiterService::new(fallback.clone(), keys.clone()),
            ),
        };
        let limiter = Arc::new(limiter);

        let breakers = Arc::new(CircuitBreakerService::new(
            store.clone(),
            keys.clone(),
            config.circuit_breaker.clone(),
        ));

        let mut registry = ServiceRegistry::new(store.clone(), keys, config.registry.clone());
        if let Some(failover) = &failover {
            registry = registry.with_store_mode(failover.subscribe());
        }
        let registry = Arc::new(registry);

        let health = Arc::new(HealthChecker::new(
            config.health_check.clone(),
            registry.clone(),
            breakers.clone(),
        )?);

        let router = Router::new(config.routes.clone())?;
        info!("Loaded {} routes", router.routes().len());

        let gate = Arc::new(
            AdmissionGate::new(
                router,
                config.rate_limiting.clone(),
                limiter.clone(),
                registry.clone(),
                breakers.clone(),
            )
            .with_health(health.view())
            .with_selector(config.load_balancer.policy.build())
            .with_trusted_proxies(config.server.trusted_proxies.clone()),
        );

        Ok(Self {
            store,
            failover,
            limiter,
            breakers,
            registry,
            health,
            gate,
        })
    }

    /// API state over this gateway's components
    pub fn api_state(&self) -> ApiState {
        let state = ApiState::new(self.registry.clone(), self.breakers.clone(), self.gate.clone())
            .with_health(self.health.view());

        match &self.failover {
            Some(failover) => state.with_store(failover.clone()),
            None => state,
        }
    }

    /// Start health checks and the store/registry maintenance sweep
    ///
    /// The sweep runs on the registry's purge interval.
    pub fn spawn_background(&self) -> Vec<JoinHandle<()>> {
        let store = self.store.clone();
        let registry = self.registry.clone();
        let period = self.registry.config().purge_interval();

        let maintenance = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                if let Err(e) = store.maintain().await {
                    warn!(error = %e, "Store maintenance failed");
                }
                if let Err(e) = registry.purge_expired().await {
                    warn!(error = %e, "Registry purge failed");
                }
            }
        });

        vec![self.health.clone().spawn(), maintenance]
    }
}

/// Initialize the gateway server
pub async fn init_gateway(config: GatewayConfig) -> Result<()> {
    info!("Starting admission gateway");

    let metrics = MetricsService::new()
        .map_err(|e| warn!(error = %e, "Metrics endpoint disabled"))
        .ok();

    let gateway = Gateway::build(&config).await?;
    let background = gateway.spawn_background();

    let mut state = gateway.api_state();
    if let Some(metrics) = metrics {
        state = state.with_metrics(metrics);
    }

    let app = api_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(address = %addr, "Gateway ready to accept connections");

    let served = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| GatewayError::Internal(format!("Server error: {}", e)));

    for task in background {
        task.abort();
    }
    observability::shutdown_telemetry();

    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
