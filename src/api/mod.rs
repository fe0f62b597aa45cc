//! Registration and admin HTTP API
//!
//! - `POST /register`, `POST /heartbeat`, `DELETE /deregister`: instance lifecycle
//! - `GET /services`, `GET /services/:name`: registry and health snapshot
//! - `POST /admit`, `POST /report`: admission decisions for an external forwarder
//! - `GET /health`, `GET /metrics`: gateway status

use crate::admission::{AdmissionGate, AdmissionRequest};
use crate::circuit_breaker::{BreakerState, CircuitBreakerService};
use crate::error::{GatewayError, Result};
use crate::healthcheck::{HealthStatus, HealthView};
use crate::metrics::MetricsService;
use crate::observability::request_id_middleware;
use crate::registry::{RegistrationRequest, ServiceInstance, ServiceRegistry};
use crate::store::{FailoverStore, StoreMode};
use axum::{
    extract::{Path, State},
    http::{header, StatusCode},
    middleware,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::debug;

/// Shared state of the API handlers
#[derive(Clone)]
pub struct ApiState {
    registry: Arc<ServiceRegistry>,
    breakers: Arc<CircuitBreakerService>,
    gate: Arc<AdmissionGate>,
    health: HealthView,
    store: Option<Arc<FailoverStore>>,
    metrics: Option<MetricsService>,
}

impl ApiState {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        breakers: Arc<CircuitBreakerService>,
        gate: Arc<AdmissionGate>,
    ) -> Self {
        Self {
            registry,
            breakers,
            gate,
            health: HealthView::default(),
            store: None,
            metrics: None,
        }
    }

    pub fn with_health(mut self, health: HealthView) -> Self {
        self.health = health;
        self
    }

    /// Report the failover store's mode on `/health`
    pub fn with_store(mut self, store: Arc<FailoverStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsService) -> Self {
        self.metrics = Some(metrics);
        self
    }
}

/// Body of `POST /heartbeat` and `DELETE /deregister`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceRef {
    pub instance_id: String,
}

/// Body of `POST /report`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallReport {
    pub service: String,
    pub success: bool,
    #[serde(default)]
    pub timed_out: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InstanceView {
    #[serde(flatten)]
    instance: ServiceInstance,
    healthy: bool,
    health: Option<HealthStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ServiceView {
    service: String,
    circuit: BreakerState,
    instances: Vec<InstanceView>,
}

/// Build the API router
pub fn api_router(state: ApiState) -> Router {
    Router::new()
        .route("/register", post(register))
        .route("/heartbeat", post(heartbeat))
        .route("/deregister", delete(deregister))
        .route("/services", get(list_services))
        .route("/services/:name", get(service_detail))
        .route("/admit", post(admit))
        .route("/report", post(report))
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .with_state(state)
        .layer(middleware::from_fn(request_id_middleware))
        .layer(TraceLayer::new_for_http())
}

async fn register(
    State(state): State<ApiState>,
    Json(request): Json<RegistrationRequest>,
) -> Result<(StatusCode, Json<ServiceInstance>)> {
    let instance = state.registry.register(request).await?;
    Ok((StatusCode::CREATED, Json(instance)))
}

async fn heartbeat(
    State(state): State<ApiState>,
    Json(body): Json<InstanceRef>,
) -> Result<Json<ServiceInstance>> {
    Ok(Json(state.registry.heartbeat(&body.instance_id).await?))
}

async fn deregister(
    State(state): State<ApiState>,
    Json(body): Json<InstanceRef>,
) -> Result<StatusCode> {
    state.registry.deregister(&body.instance_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_services(State(state): State<ApiState>) -> Result<Json<Vec<String>>> {
    Ok(Json(state.registry.services().await?))
}

async fn service_detail(
    State(state): State<ApiState>,
    Path(name): Path<String>,
) -> Result<Json<ServiceView>> {
    let instances = state.registry.lookup(&name).await?;
    let circuit = state.breakers.snapshot(&name).await;

    let instances = instances
        .into_iter()
        .map(|instance| InstanceView {
            healthy: state.health.is_healthy(&instance.instance_id),
            health: state.health.status(&instance.instance_id),
            instance,
        })
        .collect();

    Ok(Json(ServiceView {
        service: name,
        circuit,
        instances,
    }))
}

async fn admit(State(state): State<ApiState>, Json(request): Json<AdmissionRequest>) -> Response {
    debug!(method = %request.method, path = %request.path, "Admission requested");
    match state.gate.admit(&request).await {
        Ok(decision) => decision.into_response(),
        Err(e) => e.into_response(),
    }
}

async fn report(State(state): State<ApiState>, Json(report): Json<CallReport>) -> StatusCode {
    if report.timed_out {
        state.gate.record_timeout(&report.service).await;
    } else {
        state.gate.record_result(&report.service, report.success).await;
    }
    StatusCode::NO_CONTENT
}

async fn health(State(state): State<ApiState>) -> Json<serde_json::Value> {
    let (status, store) = match &state.store {
        Some(store) => match store.mode() {
            StoreMode::Primary => ("ok", "primary"),
            StoreMode::Degraded => ("degraded", "degraded"),
        },
        None => ("ok", "local"),
    };

    Json(serde_json::json!({
        "status": status,
        "store": store,
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn metrics(State(state): State<ApiState>) -> Response {
    match &state.metrics {
        Some(metrics) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics.render(),
        )
            .into_response(),
        None => GatewayError::RouteNotFound("/metrics".to_string()).into_response(),
    }
}
