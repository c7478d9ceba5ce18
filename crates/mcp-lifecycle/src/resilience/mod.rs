//! Resilience primitives
//!
//! - [`CircuitBreaker`]: per-server failure isolation with timeout racing
//! - [`AbortManager`]: hierarchical cancellation with guaranteed cleanup

pub mod abort;
pub mod circuit_breaker;

pub use abort::{AbortConfig, AbortManager, CleanupFn, CleanupHandle};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState, OperationRecord,
};
