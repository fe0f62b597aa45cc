//! Active health checking of registered instances
//!
//! One background task per registered service probes each of its instances
//! on the service's interval. Probe outcomes update a [`HealthStatus`] per
//! instance; readers get snapshots through [`HealthView`] and never wait on
//! a probe.

pub mod probe;
pub mod types;

pub use probe::{probe_for, HealthProbe, HttpProbe, ProbeError, TcpProbe};
pub use types::{HealthCheckConfig, HealthCheckSettings, HealthStatus, ProbeStrategy};

use crate::circuit_breaker::CircuitBreakerService;
use crate::clock::{Clock, SystemClock};
use crate::error::{GatewayError, Result};
use crate::metrics;
use crate::registry::{ServiceInstance, ServiceRegistry};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Read-only snapshot access to instance health
#[derive(Debug, Clone, Default)]
pub struct HealthView {
    statuses: Arc<DashMap<String, HealthStatus>>,
}

impl HealthView {
    /// Instances that have never been probed count as healthy
    pub fn is_healthy(&self, instance_id: &str) -> bool {
        self.statuses
            .get(instance_id)
            .map_or(true, |status| status.healthy)
    }

    pub fn status(&self, instance_id: &str) -> Option<HealthStatus> {
        self.statuses.get(instance_id).map(|s| s.clone())
    }

    /// All known statuses, ordered by instance id
    pub fn all(&self) -> Vec<HealthStatus> {
        let mut all: Vec<HealthStatus> = self.statuses.iter().map(|s| s.clone()).collect();
        all.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        all
    }

    /// Keep only the routable instances
    pub fn filter_healthy(&self, instances: Vec<ServiceInstance>) -> Vec<ServiceInstance> {
        instances
            .into_iter()
            .filter(|instance| self.is_healthy(&instance.instance_id))
            .collect()
    }
}

/// Health checker for registered instances
pub struct HealthChecker {
    settings: HealthCheckSettings,
    registry: Arc<ServiceRegistry>,
    breakers: Arc<CircuitBreakerService>,
    statuses: Arc<DashMap<String, HealthStatus>>,
    custom_probes: DashMap<String, Arc<dyn HealthProbe>>,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthChecker")
            .field("settings", &self.settings)
            .field("client", &"<reqwest::Client>")
            .finish()
    }
}

impl HealthChecker {
    /// Create a new health checker
    pub fn new(
        settings: HealthCheckSettings,
        registry: Arc<ServiceRegistry>,
        breakers: Arc<CircuitBreakerService>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| GatewayError::Internal(format!("health check client: {}", e)))?;

        Ok(Self {
            settings,
            registry,
            breakers,
            statuses: Arc::new(DashMap::new()),
            custom_probes: DashMap::new(),
            client,
            clock: Arc::new(SystemClock),
        })
    }

    /// Stamp `last_checked_at` from the given clock
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Use a custom probe for one service instead of its configured strategy
    pub fn with_probe(self, service: impl Into<String>, probe: Arc<dyn HealthProbe>) -> Self {
        self.custom_probes.insert(service.into(), probe);
        self
    }

    pub fn view(&self) -> HealthView {
        HealthView {
            statuses: self.statuses.clone(),
        }
    }

    pub fn settings(&self) -> &HealthCheckSettings {
        &self.settings
    }

    fn probe_for_service(&self, service: &str) -> Arc<dyn HealthProbe> {
        match self.custom_probes.get(service) {
            Some(probe) => probe.clone(),
            None => probe_for(&self.settings.for_service(service).strategy, &self.client),
        }
    }

    /// Probe one instance and fold the outcome into its status
    pub async fn check_instance(&self, instance: &ServiceInstance) -> HealthStatus {
        let config = self.settings.for_service(&instance.service_name);
        let probe = self.probe_for_service(&instance.service_name);

        let outcome = match tokio::time::timeout(config.timeout(), probe.probe(instance)).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::Timeout(config.timeout())),
        };

        metrics::record_health_probe(&instance.service_name, outcome.is_ok());

        let (status, became_unhealthy) = {
            let mut status = self
                .statuses
                .entry(instance.instance_id.clone())
                .or_insert_with(|| HealthStatus::new(&instance.service_name, &instance.instance_id));

            let was_healthy = status.healthy;
            status.service_name = instance.service_name.clone();
            status.last_checked_at = self.clock.now_ms();

            match &outcome {
                Ok(()) => {
                    status.consecutive_failures = 0;
                    status.healthy = true;
                    if !was_healthy {
                        info!(
                            service = %instance.service_name,
                            instance_id = %instance.instance_id,
                            "Instance healthy again"
                        );
                    }
                }
                Err(e) => {
                    status.consecutive_failures = status.consecutive_failures.saturating_add(1);
                    debug!(
                        service = %instance.service_name,
                        instance_id = %instance.instance_id,
                        consecutive_failures = status.consecutive_failures,
                        error = %e,
                        "Health probe failed"
                    );
                    if status.consecutive_failures >= config.failure_threshold {
                        status.healthy = false;
                    }
                }
            }

            (status.clone(), was_healthy && !status.healthy)
        };

        metrics::record_instance_health(&instance.service_name, &instance.instance_id, status.healthy);

        if became_unhealthy {
            warn!(
                service = %instance.service_name,
                instance_id = %instance.instance_id,
                consecutive_failures = status.consecutive_failures,
                "Instance marked unhealthy"
            );
            self.breakers
                .record_health_failure(&instance.service_name)
                .await;
        }

        status
    }

    /// Probe every live instance of a service concurrently
    pub async fn check_service(&self, service: &str) -> Vec<HealthStatus> {
        let instances = match self.registry.lookup(service).await {
            Ok(instances) => instances,
            Err(e) => {
                warn!(service = %service, error = %e, "Health check could not read registry");
                return Vec::new();
            }
        };

        let live: HashSet<&str> = instances.iter().map(|i| i.instance_id.as_str()).collect();
        self.statuses
            .retain(|id, status| status.service_name != service || live.contains(id.as_str()));

        futures::future::join_all(instances.iter().map(|i| self.check_instance(i))).await
    }

    async fn run_service(self: Arc<Self>, service: String) {
        let config = self.settings.for_service(&service).clone();
        let mut ticker = interval(config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            service = %service,
            interval_ms = config.interval_ms,
            strategy = ?config.strategy,
            "Started health checks"
        );

        loop {
            ticker.tick().await;
            self.check_service(&service).await;
        }
    }

    /// Start the background supervisor
    ///
    /// The supervisor follows the registry's service list, starting a probe
    /// task for each new service and stopping tasks of vanished ones.
    /// Aborting the returned handle stops every probe task.
    pub fn spawn(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut tasks = ServiceTasks::default();
            let mut ticker = interval(self.settings.discovery_interval());
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                match self.registry.services().await {
                    Ok(services) => tasks.sync(&self, services),
                    Err(e) => warn!(error = %e, "Health check supervisor could not list services"),
                }
            }
        })
    }
}

/// Per-service check tasks owned by the supervisor
#[derive(Default)]
struct ServiceTasks {
    tasks: JoinSet<()>,
    running: HashMap<String, AbortHandle>,
}

impl ServiceTasks {
    /// Reap finished tasks, stop those of vanished services and start
    /// tasks for new ones
    fn sync(&mut self, checker: &Arc<HealthChecker>, services: Vec<String>) {
        while self.tasks.try_join_next().is_some() {}

        self.running.retain(|name, handle| {
            let keep = services.contains(name);
            if !keep {
                debug!(service = %name, "Stopping health checks for vanished service");
                handle.abort();
            }
            keep
        });

        for service in services {
            if self.running.contains_key(&service) || !checker.settings.for_service(&service).enabled {
                continue;
            }
            let handle = self.tasks.spawn(checker.clone().run_service(service.clone()));
            self.running.insert(service, handle);
        }
    }

    /// Tasks not yet reaped
    fn len(&self) -> usize {
        self.tasks.len()
    }
}
