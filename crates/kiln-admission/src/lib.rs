#![warn(missing_docs)]

//! # kiln-admission
//!
//! Admission control for the Kiln execution broker.
//!
//! Two independent state machines, both plain records behind narrow mutation
//! operations:
//!
//! - [`RateLimiter`] — per-identity token buckets with a block period after
//!   exhaustion. Rejects abusive callers before any resource is acquired.
//! - [`CircuitBreaker`] — per-dependency closed/open/half-open breaker that
//!   stops hammering a failing dependency and probes it after a cool-down.
//!
//! Neither uses background timers: buckets refill and breakers transition
//! lazily, on the next attempt.

pub mod circuit_breaker;
pub mod rate_limit;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter};
