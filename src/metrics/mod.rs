use crate::circuit_breaker::CircuitState;
use crate::error::{GatewayError, Result};
use crate::store::StoreMode;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::Arc;
use tracing::{debug, info};

/// Metrics service for collecting and exposing Prometheus metrics
#[derive(Clone)]
pub struct MetricsService {
    handle: Arc<PrometheusHandle>,
}

impl std::fmt::Debug for MetricsService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsService").finish_non_exhaustive()
    }
}

impl MetricsService {
    /// Install the global Prometheus recorder
    ///
    /// Fails if a recorder is already installed in this process.
    pub fn new() -> Result<Self> {
        let handle = PrometheusBuilder::new().install_recorder().map_err(|e| {
            GatewayError::Internal(format!("Failed to install metrics recorder: {}", e))
        })?;

        Self::register_metrics();

        info!("Metrics service initialized successfully");

        Ok(Self {
            handle: Arc::new(handle),
        })
    }

    /// Register all metrics with descriptions
    fn register_metrics() {
        // Admission
        describe_counter!(
            "gateway_admission_decisions_total",
            "Admission decisions by route and reason"
        );
        describe_histogram!(
            "gateway_admission_duration_seconds",
            "Time spent deciding admission in seconds"
        );

        // Rate limiting
        describe_counter!(
            "gateway_rate_limit_decisions_total",
            "Rate limit checks by key class and outcome"
        );
        describe_counter!(
            "gateway_rate_limit_exceeded_total",
            "Total number of requests rejected due to rate limiting"
        );

        // Shared store
        describe_gauge!(
            "gateway_store_degraded",
            "Whether the shared store is unreachable and local state is used (1 = degraded)"
        );
        describe_counter!(
            "gateway_store_errors_total",
            "Shared store operations that failed or timed out"
        );
        describe_counter!(
            "gateway_store_mode_transitions_total",
            "Transitions between shared and degraded store mode"
        );

        // Circuit breaker
        describe_gauge!(
            "gateway_circuit_breaker_state",
            "Circuit breaker state (0 = closed, 1 = open, 2 = half-open)"
        );
        describe_counter!(
            "gateway_circuit_breaker_transitions_total",
            "Total number of circuit breaker state transitions"
        );
        describe_counter!(
            "gateway_circuit_breaker_rejections_total",
            "Calls rejected by an open circuit"
        );

        // Registry and health
        describe_counter!(
            "gateway_registry_events_total",
            "Registrations, heartbeats and deregistrations"
        );
        describe_gauge!(
            "gateway_registry_instances",
            "Live registered instances per service"
        );
        describe_counter!(
            "gateway_health_probes_total",
            "Health probes by service and outcome"
        );
        describe_gauge!(
            "gateway_instance_healthy",
            "Instance health status (1 = healthy, 0 = unhealthy)"
        );

        debug!("All metrics registered with descriptions");
    }

    /// Render metrics in Prometheus format
    pub fn render(&self) -> String {
        self.handle.render()
    }
}

fn flag(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Record an admission decision
pub fn record_admission_decision(route: &str, reason: &str, duration: f64) {
    let labels = [("route", route.to_string()), ("reason", reason.to_string())];
    counter!("gateway_admission_decisions_total", &labels).increment(1);
    histogram!("gateway_admission_duration_seconds", "route" => route.to_string())
        .record(duration);
}

/// Record a rate limit check
pub fn record_rate_limit_decision(class: &str, allowed: bool, degraded: bool) {
    let labels = [
        ("class", class.to_string()),
        ("outcome", if allowed { "allowed" } else { "rejected" }.to_string()),
        ("degraded", flag(degraded).to_string()),
    ];
    counter!("gateway_rate_limit_decisions_total", &labels).increment(1);

    if !allowed {
        counter!("gateway_rate_limit_exceeded_total", "class" => class.to_string()).increment(1);
    }
}

/// Record whether the store is in degraded mode
pub fn record_store_mode(degraded: bool) {
    gauge!("gateway_store_degraded").set(if degraded { 1.0 } else { 0.0 });
}

/// Record a failed or timed-out shared store operation
pub fn record_store_error(operation: &str) {
    counter!("gateway_store_errors_total", "operation" => operation.to_string()).increment(1);
}

/// Record a store mode transition
pub fn record_store_transition(from: StoreMode, to: StoreMode) {
    let labels = [("from", from.to_string()), ("to", to.to_string())];
    counter!("gateway_store_mode_transitions_total", &labels).increment(1);
}

/// Record a call rejected by an open circuit
pub fn record_circuit_breaker_rejection(service: &str) {
    counter!("gateway_circuit_breaker_rejections_total", "service" => service.to_string())
        .increment(1);
}

/// Record circuit breaker transition and the resulting state
pub fn record_circuit_breaker_transition(service: &str, from: CircuitState, to: CircuitState) {
    let labels = [
        ("service", service.to_string()),
        ("from", from.to_string()),
        ("to", to.to_string()),
    ];
    counter!("gateway_circuit_breaker_transitions_total", &labels).increment(1);
    gauge!("gateway_circuit_breaker_state", "service" => service.to_string()).set(to.as_gauge());
}

/// Record a registry write
pub fn record_registry_event(event: &str) {
    counter!("gateway_registry_events_total", "event" => event.to_string()).increment(1);
}

/// Record the number of live instances of a service
pub fn record_registry_size(service: &str, instances: usize) {
    gauge!("gateway_registry_instances", "service" => service.to_string()).set(instances as f64);
}

/// Record one health probe outcome
pub fn record_health_probe(service: &str, success: bool) {
    let labels = [
        ("service", service.to_string()),
        ("outcome", if success { "success" } else { "failure" }.to_string()),
    ];
    counter!("gateway_health_probes_total", &labels).increment(1);
}

/// Record instance health status
pub fn record_instance_health(service: &str, instance_id: &str, healthy: bool) {
    let labels = [
        ("service", service.to_string()),
        ("instance", instance_id.to_string()),
    ];
    gauge!("gateway_instance_healthy", &labels).set(if healthy { 1.0 } else { 0.0 });
}
