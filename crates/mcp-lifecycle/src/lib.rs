//! # MCP Lifecycle
//!
//! Lifecycle and resilience layer for applications that talk to many MCP
//! (Model Context Protocol) servers at once. The protocol itself lives behind
//! the [`Session`] trait; this crate decides *when* sessions exist, *who* owns
//! them and *what happens* when a server misbehaves.
//!
//! ## Components
//!
//! - [`CircuitBreaker`]: per-server closed / open / half-open state machine
//!   that fails fast while a server is known to be broken
//! - [`AbortManager`]: hierarchical cancellation scopes with cleanup
//!   callbacks and timeouts
//! - [`ServerRegistry`]: named server configs, scoped (ephemeral) sessions and
//!   tracked persistent sessions
//! - [`ConnectionManager`]: one pooled connection per server with cached
//!   health, background monitoring and per-server isolation
//! - [`facade`]: one-call helpers such as [`gen_client`] and
//!   [`with_temporary_client`]
//!
//! ## Architecture
//!
//! ```text
//! Application
//!      ↓
//! facade (gen_client, connect, with_temporary_client, ...)
//!      ↓
//! ConnectionManager ──→ ServerRegistry ──→ SessionFactory → Session
//!      ↓                      ↓
//! CircuitBreaker         AbortManager
//! ```
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mcp_lifecycle::{ConnectionManager, GetConnectionOptions, ServerConfig, ServerRegistry};
//!
//! # async fn example() -> mcp_lifecycle::Result<()> {
//! let registry = Arc::new(ServerRegistry::new());
//! registry.add_server("files", ServerConfig::stdio("mcp-files", vec!["--root".into(), "/tmp".into()]))?;
//!
//! // Ephemeral session, disconnected when the closure returns
//! let tools = mcp_lifecycle::gen_client("files", &registry, None, None, |session| async move {
//!     session.get_tools().await
//! })
//! .await?;
//! println!("{} tools", tools.len());
//!
//! // Pooled session shared by every caller
//! let manager = ConnectionManager::new(registry.clone());
//! let connection = manager
//!     .get_server_connection("files", GetConnectionOptions::default())
//!     .await?;
//! let prompts = connection.list_prompts().await?;
//! println!("{} prompts", prompts.len());
//!
//! manager.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod facade;
pub mod manager;
pub mod registry;
pub mod resilience;
pub mod session;

pub use config::{AuthConfig, ConnectionMode, LifecycleSettings, Root, ServerConfig, TransportConfig};
pub use error::{CircuitBreakerOpenError, ConfigValidationError, LifecycleError, Result};
pub use facade::{
    ClientConnection, ConnectOptions, OwnedSession, TemporaryClientOptions, WaitOptions, connect,
    connect_enabled_servers, disconnect, gen_client, get_server_statuses, wait_for_server_health,
    with_temporary_client,
};
pub use manager::{
    ConnectionManager, ConnectionStatistics, GetConnectionOptions, ManagerConfig, PooledConnection,
};
pub use registry::{InitOptions, ServerOptions, ServerRegistry, TrackedSession};
pub use resilience::{
    AbortConfig, AbortManager, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats, CircuitState,
    CleanupHandle,
};
pub use session::{
    PromptDescriptor, ResourceDescriptor, RpcSessionFactory, Session, SessionFactory, SessionInitHook,
    ToolDescriptor, session_factory,
};

/// Commonly used items
pub mod prelude {
    pub use crate::{
        AbortManager, CircuitBreaker, ConnectionManager, GetConnectionOptions, LifecycleError, Result,
        ServerConfig, ServerRegistry, Session, SessionFactory, gen_client, with_temporary_client,
    };
}
