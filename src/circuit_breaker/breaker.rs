use super::types::{BreakerEvent, BreakerPhase, BreakerState, CircuitBreakerConfig, CircuitState};

/// Result of feeding one event to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State after the event
    pub state: BreakerState,
    /// Whether a requested call may go through (always true for outcomes)
    pub allowed: bool,
    /// `(from, to)` when the circuit state changed
    pub changed: Option<(CircuitState, CircuitState)>,
}

/// The breaker state machine
///
/// Pure: the same state, event, time and config always give the same
/// transition. Every mutation of a breaker goes through here.
pub fn transition(
    state: &BreakerState,
    event: BreakerEvent,
    now_ms: u64,
    config: &CircuitBreakerConfig,
) -> Transition {
    let mut next = *state;
    let mut allowed = true;

    match (state.phase, event) {
        (BreakerPhase::Closed, BreakerEvent::CallRequested) => {}

        (BreakerPhase::Closed, BreakerEvent::CallSucceeded) => {
            next.consecutive_failures = 0;
        }

        (BreakerPhase::Closed, BreakerEvent::CallFailed | BreakerEvent::HealthCheckFailed) => {
            // A failure outside the interval starts a new streak
            let in_streak = state
                .last_failure_at_ms
                .is_some_and(|at| now_ms.saturating_sub(at) <= config.failure_interval_ms);

            next.consecutive_failures = if in_streak {
                state.consecutive_failures.saturating_add(1)
            } else {
                1
            };
            next.last_failure_at_ms = Some(now_ms);

            if next.consecutive_failures >= config.failure_threshold {
                next.phase = BreakerPhase::Open {
                    opened_at_ms: now_ms,
                };
            }
        }

        (BreakerPhase::Open { opened_at_ms }, BreakerEvent::CallRequested) => {
            if now_ms.saturating_sub(opened_at_ms) >= config.cool_down_ms {
                next.phase = BreakerPhase::HalfOpen {
                    probes_in_flight: 1,
                    probe_started_at_ms: now_ms,
                };
            } else {
                allowed = false;
            }
        }

        // Late outcomes of calls admitted before the circuit opened
        (BreakerPhase::Open { .. }, BreakerEvent::CallSucceeded) => {}
        (BreakerPhase::Open { .. }, BreakerEvent::CallFailed | BreakerEvent::HealthCheckFailed) => {
            next.last_failure_at_ms = Some(now_ms);
        }

        (
            BreakerPhase::HalfOpen {
                probes_in_flight,
                probe_started_at_ms,
            },
            BreakerEvent::CallRequested,
        ) => {
            if probes_in_flight < config.half_open_probes {
                next.phase = BreakerPhase::HalfOpen {
                    probes_in_flight: probes_in_flight + 1,
                    probe_started_at_ms,
                };
            } else if now_ms.saturating_sub(probe_started_at_ms) >= config.cool_down_ms {
                // The probe never reported back; let a fresh one through
                next.phase = BreakerPhase::HalfOpen {
                    probes_in_flight: 1,
                    probe_started_at_ms: now_ms,
                };
            } else {
                allowed = false;
            }
        }

        (BreakerPhase::HalfOpen { .. }, BreakerEvent::CallSucceeded) => {
            next = BreakerState::default();
        }

        (BreakerPhase::HalfOpen { .. }, BreakerEvent::CallFailed | BreakerEvent::HealthCheckFailed) => {
            next.consecutive_failures = state.consecutive_failures.saturating_add(1);
            next.last_failure_at_ms = Some(now_ms);
            next.phase = BreakerPhase::Open {
                opened_at_ms: now_ms,
            };
        }
    }

    let from = state.circuit_state();
    let to = next.circuit_state();

    Transition {
        state: next,
        allowed,
        changed: (from != to).then_some((from, to)),
    }
}
