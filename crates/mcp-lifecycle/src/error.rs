//! Error types for mcp-lifecycle
//!
//! Every fallible operation in this crate returns [`LifecycleError`]. The
//! variants map onto the failure classes callers act on differently:
//!
//! - **Configuration**: malformed [`ServerConfig`](crate::ServerConfig), raised at
//!   registration and never retried
//! - **Connection / Session / Protocol**: transient transport and call failures,
//!   recorded in the server's circuit breaker and returned to the caller
//! - **CircuitOpen**: fast-fail carrying the data needed for a backoff decision
//! - **OperationTimeout / Aborted**: the two independent timeout and cancellation layers

use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

/// Result type for lifecycle operations
pub type Result<T> = std::result::Result<T, LifecycleError>;

/// Main error type for mcp-lifecycle
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum LifecycleError {
    /// Server configuration failed validation
    #[error("Invalid configuration: {0}")]
    ConfigValidation(#[from] ConfigValidationError),

    /// Transport connect or disconnect failed
    #[error("Connection error for server '{server}': {message}")]
    Connection {
        /// Server the connection belongs to
        server: String,
        /// Human-readable failure description
        message: String,
    },

    /// A protocol call on an established session failed
    #[error("Session error for server '{server}': {message}")]
    Session {
        /// Server the session belongs to
        server: String,
        /// Human-readable failure description
        message: String,
    },

    /// The server answered with a JSON-RPC error object
    #[error("Server '{server}' returned error [{code}]: {message}")]
    Protocol {
        /// Server that produced the error
        server: String,
        /// JSON-RPC error code
        code: i64,
        /// JSON-RPC error message
        message: String,
    },

    /// The circuit breaker rejected the call without running it
    #[error(transparent)]
    CircuitOpen(#[from] CircuitBreakerOpenError),

    /// An operation exceeded its time limit
    ///
    /// Raised by the breaker's `operation_timeout`, a session's connect
    /// timeout, a JSON-RPC request timeout and a pool health probe. Counted as
    /// a breaker failure wherever the call was guarded.
    #[error("Operation '{operation}' timed out after {timeout:?}")]
    OperationTimeout {
        /// The operation that timed out
        operation: String,
        /// The timeout that was exceeded
        timeout: Duration,
    },

    /// The operation was cancelled through an abort scope
    #[error("Operation aborted: {reason}")]
    Aborted {
        /// Reason passed to `abort`
        reason: String,
    },

    /// No server is registered under this name
    #[error("Unknown server: '{0}'")]
    UnknownServer(String),

    /// The server is registered but disabled
    #[error("Server '{0}' is disabled")]
    ServerDisabled(String),

    /// A server with this name is already registered
    #[error("Server '{0}' is already registered; remove it before re-adding")]
    DuplicateServer(String),
}

impl LifecycleError {
    /// Create a connection error
    pub fn connection(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Create a session error
    pub fn session(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Session {
            server: server.into(),
            message: message.into(),
        }
    }

    /// Create an aborted error
    pub fn aborted(reason: impl Into<String>) -> Self {
        Self::Aborted {
            reason: reason.into(),
        }
    }

    /// Whether retrying later may succeed.
    ///
    /// Configuration and registry errors are permanent; transport failures,
    /// timeouts and open circuits are transient.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Session { .. }
                | Self::CircuitOpen(_)
                | Self::OperationTimeout { .. }
        )
    }
}

/// Fast-fail error returned while a circuit is open
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Circuit breaker is open after {failure_count} failures")]
pub struct CircuitBreakerOpenError {
    /// Consecutive failures recorded when the call was rejected
    pub failure_count: u32,
    /// When the most recent failure was recorded
    pub last_failure_time: Option<Instant>,
    /// When the circuit will admit a probe
    pub next_retry_time: Option<Instant>,
}

impl CircuitBreakerOpenError {
    /// Time remaining until the circuit admits a probe (zero if already due)
    #[must_use]
    pub fn retry_after(&self) -> Duration {
        self.next_retry_time
            .map(|at| at.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }
}

/// Reasons a [`ServerConfig`](crate::ServerConfig) is rejected at registration
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ConfigValidationError {
    /// The server name is empty or whitespace
    #[error("server name cannot be empty")]
    EmptyName,

    /// A stdio server has no command
    #[error("stdio command cannot be empty")]
    EmptyCommand,

    /// A remote URL failed to parse
    #[error("invalid url '{url}': {reason}")]
    InvalidUrl {
        /// The rejected URL
        url: String,
        /// Parser message
        reason: String,
    },

    /// A remote URL uses a scheme the transport cannot speak
    #[error("scheme '{scheme}' is not valid for {transport} transport (expected one of {expected:?})")]
    UnsupportedScheme {
        /// Transport name
        transport: &'static str,
        /// Scheme found in the URL
        scheme: String,
        /// Schemes the transport accepts
        expected: &'static [&'static str],
    },

    /// `timeout_ms` is outside the configured bounds
    #[error("timeout {timeout_ms}ms is outside the allowed range [{min_ms}ms, {max_ms}ms]")]
    TimeoutOutOfBounds {
        /// Requested timeout
        timeout_ms: u64,
        /// Lower bound
        min_ms: u64,
        /// Upper bound
        max_ms: u64,
    },

    /// A root URI is not a `file://` URI
    #[error("root uri '{0}' must use the file:// scheme")]
    InvalidRoot(String),

    /// Auth settings are incomplete
    #[error("invalid auth configuration: {0}")]
    InvalidAuth(String),

    /// The raw configuration does not match any transport variant
    #[error("malformed server configuration: {0}")]
    Malformed(String),
}
