//! Circuit breaker module
//!
//! A per-service breaker modelled as a tagged state machine
//! (`Closed | Open { opened_at } | HalfOpen { probes_in_flight }`) with a
//! pure transition function, persisted to the shared store so all gateway
//! instances observe the same state.

pub mod breaker;
pub mod retry;
pub mod service;
pub mod types;

pub use breaker::{transition, Transition};
pub use retry::RetryExecutor;
pub use service::CircuitBreakerService;
pub use types::{
    BreakerEvent, BreakerPhase, BreakerState, CircuitBreakerConfig, CircuitBreakerMetrics,
    CircuitState, RetryConfig,
};
