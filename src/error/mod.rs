use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Result type for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

/// Gateway error types
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Route not found: {0}")]
    RouteNotFound(String),

    #[error("Invalid route configuration: {0}")]
    InvalidRoute(String),

    #[error("Invalid method: {0}")]
    InvalidMethod(String),

    #[error("No healthy instance available for service: {0}")]
    NoHealthyInstance(String),

    #[error("Circuit open for service: {0}")]
    CircuitOpen(String),

    #[error("Shared store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Invalid registration: {0}")]
    InvalidRegistration(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Registry entry changed concurrently: {0}")]
    Conflict(String),

    #[error("Internal server error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl GatewayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            GatewayError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::RouteNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::InvalidRoute(_) => StatusCode::BAD_REQUEST,
            GatewayError::InvalidMethod(_) => StatusCode::METHOD_NOT_ALLOWED,
            GatewayError::NoHealthyInstance(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::CircuitOpen(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::InvalidRegistration(_) => StatusCode::BAD_REQUEST,
            GatewayError::InstanceNotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Serialization(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable reason code for client-facing bodies
    pub fn reason_code(&self) -> &'static str {
        match self {
            GatewayError::Config(_) => "configuration_error",
            GatewayError::RouteNotFound(_) => "route_not_found",
            GatewayError::InvalidRoute(_) => "invalid_route",
            GatewayError::InvalidMethod(_) => "method_not_allowed",
            GatewayError::NoHealthyInstance(_) => "no_healthy_instance",
            GatewayError::CircuitOpen(_) => "circuit_open",
            GatewayError::StoreUnavailable(_) => "store_unavailable",
            GatewayError::InvalidRegistration(_) => "invalid_registration",
            GatewayError::InstanceNotFound(_) => "instance_not_found",
            GatewayError::Conflict(_) => "registry_conflict",
            GatewayError::Internal(_) => "internal_error",
            GatewayError::Io(_) => "io_error",
            GatewayError::Serialization(_) => "serialization_error",
        }
    }
}

impl From<crate::store::StoreError> for GatewayError {
    fn from(err: crate::store::StoreError) -> Self {
        GatewayError::StoreUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::Serialization(err.to_string())
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "reason": self.reason_code(),
            "status": status.as_u16(),
        }));

        (status, body).into_response()
    }
}
