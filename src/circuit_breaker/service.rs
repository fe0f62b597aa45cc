use super::breaker::{transition, Transition};
use super::retry::RetryExecutor;
use super::types::{
    BreakerEvent, BreakerState, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState,
};
use crate::metrics;
use crate::store::{KeySpace, SharedStore, StoreError};
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
enum ApplyError {
    #[error("breaker state changed concurrently")]
    Conflict(Transition),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Circuit breakers for all backend services
///
/// Breaker state lives in the shared store, one JSON record per service, and
/// every change is a compare-and-set against the record that was read. A
/// lost race is retried with backoff, so concurrent gateway instances never
/// overwrite each other's transitions. Per-instance counters are kept
/// locally.
pub struct CircuitBreakerService {
    store: Arc<dyn SharedStore>,
    keys: KeySpace,
    config: CircuitBreakerConfig,
    retry: RetryExecutor,
    metrics: DashMap<String, CircuitBreakerMetrics>,
}

impl std::fmt::Debug for CircuitBreakerService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreakerService")
            .field("backend", &self.store.backend())
            .field("config", &self.config)
            .finish()
    }
}

impl CircuitBreakerService {
    pub fn new(store: Arc<dyn SharedStore>, keys: KeySpace, config: CircuitBreakerConfig) -> Self {
        info!(
            failure_threshold = config.failure_threshold,
            cool_down_ms = config.cool_down_ms,
            half_open_probes = config.half_open_probes,
            "Creating circuit breaker service"
        );

        Self {
            store,
            keys,
            retry: RetryExecutor::new(config.retry.clone()),
            config,
            metrics: DashMap::new(),
        }
    }

    /// Check whether a call to `service` may go through
    pub async fn before_call(&self, service: &str) -> bool {
        self.apply(service, BreakerEvent::CallRequested).await.allowed
    }

    /// Record the outcome of a forwarded call
    pub async fn record_result(&self, service: &str, success: bool) {
        let event = if success {
            BreakerEvent::CallSucceeded
        } else {
            BreakerEvent::CallFailed
        };
        self.apply(service, event).await;
    }

    /// Record a timed-out call, counted as a failure
    pub async fn record_timeout(&self, service: &str) {
        self.metrics
            .entry(service.to_string())
            .or_default()
            .timeout_count += 1;
        self.apply(service, BreakerEvent::CallFailed).await;
    }

    /// Record that the health checker marked an instance of `service` unhealthy
    pub async fn record_health_failure(&self, service: &str) {
        self.apply(service, BreakerEvent::HealthCheckFailed).await;
    }

    /// Current breaker record for a service (Closed if none is stored)
    pub async fn snapshot(&self, service: &str) -> BreakerState {
        match self.load(service).await {
            Ok((_, state)) => state,
            Err(e) => {
                warn!(service = %service, error = %e, "Failed to read circuit breaker state");
                BreakerState::default()
            }
        }
    }

    /// Current circuit state for a service
    pub async fn state(&self, service: &str) -> CircuitState {
        self.snapshot(service).await.circuit_state()
    }

    /// Local counters for a service
    pub fn metrics(&self, service: &str) -> Option<CircuitBreakerMetrics> {
        self.metrics.get(service).map(|m| m.clone())
    }

    /// Local counters for every service seen by this instance
    pub fn all_metrics(&self) -> Vec<(String, CircuitBreakerMetrics)> {
        self.metrics
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect()
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    async fn load(&self, service: &str) -> Result<(Option<String>, BreakerState), StoreError> {
        let raw = self.store.get(&self.keys.breaker(service)).await?;

        let state = match raw.as_deref() {
            Some(json) => serde_json::from_str(json).unwrap_or_else(|e| {
                warn!(service = %service, error = %e, "Discarding unreadable circuit breaker state");
                BreakerState::default()
            }),
            None => BreakerState::default(),
        };

        Ok((raw, state))
    }

    /// One read-transition-write round
    async fn try_apply(&self, service: &str, event: BreakerEvent) -> Result<Transition, ApplyError> {
        let (raw, state) = self.load(service).await?;
        let now_ms = self.store.now_ms().await?;

        let outcome = transition(&state, event, now_ms, &self.config);
        if outcome.state == state {
            return Ok(outcome);
        }

        let value = serde_json::to_string(&outcome.state)
            .map_err(|e| StoreError::Protocol(e.to_string()))?;

        let written = self
            .store
            .compare_and_set(
                &self.keys.breaker(service),
                raw.as_deref(),
                &value,
                Some(self.config.state_ttl()),
            )
            .await?;

        if written {
            Ok(outcome)
        } else {
            Err(ApplyError::Conflict(outcome))
        }
    }

    async fn apply(&self, service: &str, event: BreakerEvent) -> Transition {
        let result = self
            .retry
            .execute(
                || self.try_apply(service, event),
                |e| matches!(e, ApplyError::Conflict(_)),
            )
            .await;

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(ApplyError::Conflict(mut outcome)) => {
                warn!(
                    service = %service,
                    event = event.as_str(),
                    "Circuit breaker state kept changing, using last computed transition"
                );
                // A request only conflicts when it claims a half-open slot,
                // and that claim was never written
                if event == BreakerEvent::CallRequested {
                    outcome.allowed = false;
                    outcome.changed = None;
                }
                outcome
            }
            Err(ApplyError::Store(e)) => {
                // Breaker state unreadable: let the call through rather than
                // reject all traffic for the service
                warn!(
                    service = %service,
                    event = event.as_str(),
                    error = %e,
                    "Circuit breaker store failed, allowing call"
                );
                Transition {
                    state: BreakerState::default(),
                    allowed: true,
                    changed: None,
                }
            }
        };

        self.observe(service, event, &outcome);
        outcome
    }

    fn observe(&self, service: &str, event: BreakerEvent, outcome: &Transition) {
        {
            let mut counters = self.metrics.entry(service.to_string()).or_default();
            match event {
                BreakerEvent::CallRequested => {
                    counters.total_requests += 1;
                    if !outcome.allowed {
                        counters.rejected_requests += 1;
                    }
                }
                BreakerEvent::CallSucceeded => counters.successful_requests += 1,
                BreakerEvent::CallFailed => counters.failed_requests += 1,
                BreakerEvent::HealthCheckFailed => counters.health_failures += 1,
            }

            if let Some((_, to)) = outcome.changed {
                match to {
                    CircuitState::Open => counters.circuit_opened_count += 1,
                    CircuitState::HalfOpen => counters.circuit_half_opened_count += 1,
                    CircuitState::Closed => counters.circuit_closed_count += 1,
                }
            }
        }

        if !outcome.allowed {
            debug!(service = %service, "Circuit breaker open, rejecting request");
            metrics::record_circuit_breaker_rejection(service);
        }

        let Some((from, to)) = outcome.changed else {
            return;
        };

        match to {
            CircuitState::Open => warn!(
                service = %service,
                from = %from,
                consecutive_failures = outcome.state.consecutive_failures,
                event = event.as_str(),
                "Circuit breaker opening"
            ),
            CircuitState::HalfOpen => info!(
                service = %service,
                cool_down_ms = self.config.cool_down_ms,
                "Circuit breaker transitioning to half-open"
            ),
            CircuitState::Closed => info!(service = %service, "Circuit breaker closing"),
        }

        metrics::record_circuit_breaker_transition(service, from, to);
    }
}
