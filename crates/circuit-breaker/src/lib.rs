//! Circuit breaker for calls to external dependencies.
//!
//! A breaker opens after a run of consecutive failures and rejects calls
//! outright until its reset timeout passes. The next call is then let through
//! as a trial call; enough consecutive trial successes close it again, and any
//! trial failure reopens it.

pub mod breaker;
pub mod registry;

pub use breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitError, CircuitSnapshot, CircuitState};
pub use registry::CircuitBreakerRegistry;
