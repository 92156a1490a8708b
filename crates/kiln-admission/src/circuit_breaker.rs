//! Circuit breaker for external dependencies.
//!
//! Tracks consecutive expected errors per dependency and temporarily rejects
//! calls when the failure threshold is exceeded. The breaker is a guard-style
//! state machine: callers ask [`CircuitBreaker::check`] before the call, then
//! report the result with [`CircuitBreaker::on_success`] /
//! [`CircuitBreaker::on_failure`]. Only failures the breaker's
//! expected-error predicate accepts count toward the threshold.

use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Configuration for a circuit breaker.
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive expected errors before the circuit opens.
    pub failure_threshold: u32,
    /// How long to wait before probing a tripped circuit.
    pub reset_timeout: Duration,
    /// Consecutive probe successes required to close again.
    pub recover_successes: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(60),
            recover_successes: 3,
        }
    }
}

/// The three breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Normal operation; calls pass through.
    Closed,
    /// Rejecting immediately; the dependency is presumed down.
    Open,
    /// Probing; a limited number of calls pass through.
    HalfOpen,
}

impl CircuitState {
    /// Wire/metric token for this state.
    pub const fn as_str(self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half-open",
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure: Option<Instant>,
}

/// Point-in-time view of a breaker for metrics and health reporting.
#[derive(Debug, Clone, Copy)]
pub struct BreakerSnapshot {
    /// Current state.
    pub state: CircuitState,
    /// Consecutive expected-error count.
    pub consecutive_failures: u32,
    /// Time since the last counted failure.
    pub since_last_failure: Option<Duration>,
}

/// A named circuit breaker guarding one external dependency.
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    /// Create a breaker for the named dependency.
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            state: Mutex::new(BreakerState {
                state: CircuitState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_failure: None,
            }),
        }
    }

    /// The dependency name this breaker guards.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a call may proceed right now.
    ///
    /// Returns `Err(retry_in)` while the circuit is open. An open circuit
    /// whose reset timeout has elapsed transitions to half-open here (lazy
    /// transition; no background timer).
    pub fn check(&self) -> Result<(), Duration> {
        let mut st = self.state.lock().expect("breaker lock poisoned");
        match st.state {
            CircuitState::Closed | CircuitState::HalfOpen => Ok(()),
            CircuitState::Open => {
                let Some(last) = st.last_failure else {
                    // Open without a recorded failure cannot happen through
                    // the public API; recover by probing.
                    st.state = CircuitState::HalfOpen;
                    return Ok(());
                };
                let elapsed = last.elapsed();
                if elapsed >= self.config.reset_timeout {
                    st.state = CircuitState::HalfOpen;
                    st.consecutive_successes = 0;
                    tracing::info!(
                        dependency = %self.name,
                        "circuit breaker half-open, allowing probe"
                    );
                    Ok(())
                } else {
                    Err(self.config.reset_timeout - elapsed)
                }
            }
        }
    }

    /// Record a successful call.
    pub fn on_success(&self) {
        let mut st = self.state.lock().expect("breaker lock poisoned");
        match st.state {
            CircuitState::Closed => {
                st.consecutive_failures = 0;
            }
            CircuitState::HalfOpen => {
                st.consecutive_successes += 1;
                if st.consecutive_successes >= self.config.recover_successes {
                    st.state = CircuitState::Closed;
                    st.consecutive_failures = 0;
                    st.last_failure = None;
                    tracing::info!(
                        dependency = %self.name,
                        "circuit breaker closed after successful probes"
                    );
                }
            }
            CircuitState::Open => {
                // A success while open means the caller bypassed check();
                // treat it as a probe success.
                st.state = CircuitState::HalfOpen;
                st.consecutive_successes = 1;
            }
        }
    }

    /// Record a failed call.
    ///
    /// `expected` is the per-breaker predicate's judgment of the error:
    /// unexpected failures (e.g. serialization bugs) do not trip the circuit.
    pub fn on_failure(&self, expected: bool) {
        if !expected {
            return;
        }
        let mut st = self.state.lock().expect("breaker lock poisoned");
        st.consecutive_failures += 1;
        st.consecutive_successes = 0;
        st.last_failure = Some(Instant::now());

        match st.state {
            CircuitState::HalfOpen => {
                st.state = CircuitState::Open;
                tracing::warn!(
                    dependency = %self.name,
                    "circuit breaker re-opened after failed probe"
                );
            }
            CircuitState::Closed => {
                if st.consecutive_failures >= self.config.failure_threshold {
                    st.state = CircuitState::Open;
                    tracing::warn!(
                        dependency = %self.name,
                        failures = st.consecutive_failures,
                        "circuit breaker opened"
                    );
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Current state, after applying any pending lazy transition.
    pub fn state(&self) -> CircuitState {
        let _ = self.check();
        self.state.lock().expect("breaker lock poisoned").state
    }

    /// Snapshot for metrics and health reporting.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let st = self.state.lock().expect("breaker lock poisoned");
        BreakerSnapshot {
            state: st.state,
            consecutive_failures: st.consecutive_failures,
            since_last_failure: st.last_failure.map(|t| t.elapsed()),
        }
    }
}
