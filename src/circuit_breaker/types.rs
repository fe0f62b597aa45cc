use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Circuit is closed, requests flow normally
    Closed,
    /// Circuit is open, requests are rejected
    Open,
    /// Circuit is half-open, allowing probe requests
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

impl CircuitState {
    /// Gauge value exported for the state
    pub fn as_gauge(&self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::Open => 1.0,
            CircuitState::HalfOpen => 2.0,
        }
    }
}

/// Phase of the state machine, carrying the data each phase needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BreakerPhase {
    Closed,
    Open {
        opened_at_ms: u64,
    },
    HalfOpen {
        probes_in_flight: u32,
        probe_started_at_ms: u64,
    },
}

impl BreakerPhase {
    pub fn circuit_state(&self) -> CircuitState {
        match self {
            BreakerPhase::Closed => CircuitState::Closed,
            BreakerPhase::Open { .. } => CircuitState::Open,
            BreakerPhase::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }
}

/// Per-service breaker record, persisted as JSON in the shared store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerState {
    #[serde(flatten)]
    pub phase: BreakerPhase,
    pub consecutive_failures: u32,
    pub last_failure_at_ms: Option<u64>,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            phase: BreakerPhase::Closed,
            consecutive_failures: 0,
            last_failure_at_ms: None,
        }
    }
}

impl BreakerState {
    pub fn circuit_state(&self) -> CircuitState {
        self.phase.circuit_state()
    }

    /// When the breaker last opened, if it is open
    pub fn opened_at_ms(&self) -> Option<u64> {
        match self.phase {
            BreakerPhase::Open { opened_at_ms } => Some(opened_at_ms),
            _ => None,
        }
    }
}

/// Input to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerEvent {
    /// A caller wants to forward a request
    CallRequested,
    /// A forwarded call completed successfully
    CallSucceeded,
    /// A forwarded call failed or timed out
    CallFailed,
    /// The health checker marked the service's instance unhealthy
    HealthCheckFailed,
}

impl BreakerEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            BreakerEvent::CallRequested => "call_requested",
            BreakerEvent::CallSucceeded => "call_succeeded",
            BreakerEvent::CallFailed => "call_failed",
            BreakerEvent::HealthCheckFailed => "health_check_failed",
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Failures further apart than this start a new streak
    #[serde(default = "default_failure_interval_ms")]
    pub failure_interval_ms: u64,

    /// Time spent open before probing
    #[serde(default = "default_cool_down_ms")]
    pub cool_down_ms: u64,

    /// Probe calls allowed at once while half-open
    #[serde(default = "default_half_open_probes")]
    pub half_open_probes: u32,

    /// Idle breaker records expire after this long
    #[serde(default = "default_state_ttl_secs")]
    pub state_ttl_secs: u64,

    /// Retries for conflicting state writes
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_failure_interval_ms() -> u64 {
    60_000
}

fn default_cool_down_ms() -> u64 {
    30_000
}

fn default_half_open_probes() -> u32 {
    1
}

fn default_state_ttl_secs() -> u64 {
    86_400
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            failure_interval_ms: default_failure_interval_ms(),
            cool_down_ms: default_cool_down_ms(),
            half_open_probes: default_half_open_probes(),
            state_ttl_secs: default_state_ttl_secs(),
            retry: RetryConfig::default(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn cool_down(&self) -> Duration {
        Duration::from_millis(self.cool_down_ms)
    }

    pub fn state_ttl(&self) -> Duration {
        Duration::from_secs(self.state_ttl_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(GatewayError::Config(
                "circuit_breaker.failure_threshold must be greater than zero".to_string(),
            ));
        }
        if self.half_open_probes == 0 {
            return Err(GatewayError::Config(
                "circuit_breaker.half_open_probes must be greater than zero".to_string(),
            ));
        }
        if self.failure_interval_ms == 0 {
            return Err(GatewayError::Config(
                "circuit_breaker.failure_interval_ms must be greater than zero".to_string(),
            ));
        }
        if self.state_ttl_secs * 1000 <= self.cool_down_ms {
            return Err(GatewayError::Config(
                "circuit_breaker.state_ttl_secs must outlast the cool-down".to_string(),
            ));
        }
        Ok(())
    }
}

/// Retry configuration for breaker state writes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of retry attempts
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial backoff duration in milliseconds
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,

    /// Maximum backoff duration in milliseconds
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_retries() -> u32 {
    5
}

fn default_initial_backoff_ms() -> u64 {
    2
}

fn default_max_backoff_ms() -> u64 {
    50
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Per-instance counters for one service's breaker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CircuitBreakerMetrics {
    /// Calls that asked to go through
    pub total_requests: u64,
    /// Calls reported as successful
    pub successful_requests: u64,
    /// Calls reported as failed (timeouts included)
    pub failed_requests: u64,
    /// Calls rejected because the circuit was open
    pub rejected_requests: u64,
    /// Calls that timed out
    pub timeout_count: u64,
    /// Unhealthy signals from the health checker
    pub health_failures: u64,
    /// Number of times circuit opened
    pub circuit_opened_count: u64,
    /// Number of times circuit closed
    pub circuit_closed_count: u64,
    /// Number of times circuit half-opened
    pub circuit_half_opened_count: u64,
}
