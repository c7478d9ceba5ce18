//! Convenience entry points
//!
//! Thin functions composing [`ServerRegistry`] and [`ConnectionManager`] for
//! the common acquisition patterns:
//!
//! | Function                    | Session ownership                          |
//! |-----------------------------|--------------------------------------------|
//! | [`gen_client`]              | ephemeral, released after the callback     |
//! | [`connect`] without manager | owned by the caller, who must disconnect   |
//! | [`connect`] with manager    | pool-owned, the caller only borrows        |
//! | [`with_temporary_client`]   | ephemeral, against an unregistered config  |

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use crate::config::{ConnectionMode, ServerConfig};
use crate::error::Result;
use crate::manager::{ConnectionManager, GetConnectionOptions, PooledConnection};
use crate::registry::{InitOptions, ServerRegistry};
use crate::session::{PromptDescriptor, ResourceDescriptor, Session, SessionFactory, ToolDescriptor};

/// Run `operation` with an ephemeral session for `server_name`
///
/// The session is disconnected exactly once when `operation` finishes.
///
/// # Errors
///
/// See [`ServerRegistry::initialize_server`].
pub async fn gen_client<F, Fut, T>(
    server_name: &str,
    registry: &ServerRegistry,
    factory: Option<Arc<dyn SessionFactory>>,
    session_id: Option<&str>,
    operation: F,
) -> Result<T>
where
    F: FnOnce(Arc<dyn Session>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let options = InitOptions {
        factory,
        session_id: session_id.map(str::to_string),
        ..InitOptions::default()
    };
    registry.initialize_server(server_name, options, operation).await
}

/// Options for [`connect`]
#[derive(Clone, Default)]
pub struct ConnectOptions {
    /// Factory for an owned session (ignored with a manager)
    pub factory: Option<Arc<dyn SessionFactory>>,
    /// Session id for an owned session
    pub session_id: Option<String>,
    /// Abort an owned session's connect after this long
    pub connect_timeout: Option<Duration>,
    /// Replace an unhealthy pooled connection
    pub require_healthy: bool,
}

/// A session the caller owns
pub struct OwnedSession {
    server_name: String,
    session: Arc<dyn Session>,
    released: bool,
}

impl std::fmt::Debug for OwnedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OwnedSession")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl OwnedSession {
    /// Server the session belongs to
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// The underlying session
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }

    /// Disconnect the session
    ///
    /// # Errors
    ///
    /// Returns the session's disconnect error.
    pub async fn disconnect(mut self) -> Result<()> {
        self.released = true;
        self.session.disconnect().await
    }
}

impl Drop for OwnedSession {
    fn drop(&mut self) {
        if !self.released {
            warn!(server = %self.server_name, "Owned session dropped without disconnect");
        }
    }
}

/// Result of [`connect`]
#[derive(Debug)]
pub enum ClientConnection {
    /// One-off session the caller must disconnect
    Owned(OwnedSession),
    /// Pooled session borrowed from a [`ConnectionManager`]
    Shared(Arc<PooledConnection>),
}

impl ClientConnection {
    /// Server the connection belongs to
    pub fn server_name(&self) -> &str {
        match self {
            Self::Owned(owned) => owned.server_name(),
            Self::Shared(pooled) => pooled.server_name(),
        }
    }

    /// Whether the session is pool-owned
    pub fn is_shared(&self) -> bool {
        matches!(self, Self::Shared(_))
    }

    /// List the server's tools
    ///
    /// # Errors
    ///
    /// Returns the session's error.
    pub async fn get_tools(&self) -> Result<Vec<ToolDescriptor>> {
        match self {
            Self::Owned(owned) => owned.session.get_tools().await,
            Self::Shared(pooled) => pooled.get_tools().await,
        }
    }

    /// List the server's prompts
    ///
    /// # Errors
    ///
    /// Returns the session's error.
    pub async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>> {
        match self {
            Self::Owned(owned) => owned.session.list_prompts().await,
            Self::Shared(pooled) => pooled.list_prompts().await,
        }
    }

    /// List the server's resources
    ///
    /// # Errors
    ///
    /// Returns the session's error.
    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        match self {
            Self::Owned(owned) => owned.session.list_resources().await,
            Self::Shared(pooled) => pooled.list_resources().await,
        }
    }

    /// Give the connection back
    ///
    /// Disconnects an owned session; only drops the borrow of a shared one.
    ///
    /// # Errors
    ///
    /// Returns the owned session's disconnect error.
    pub async fn release(self) -> Result<()> {
        match self {
            Self::Owned(owned) => owned.disconnect().await,
            Self::Shared(_) => Ok(()),
        }
    }
}

/// Connect to `server_name`
///
/// Without a manager the session is opened through the server's circuit
/// breaker and handed to the caller. With a manager the pooled connection is
/// returned and the manager's own registry is used; a different `registry`
/// argument is ignored with a warning.
///
/// # Errors
///
/// Registry errors, the breaker's rejection, or the connect error.
#[instrument(skip(registry, manager, options))]
pub async fn connect(
    server_name: &str,
    registry: &ServerRegistry,
    manager: Option<&ConnectionManager>,
    options: ConnectOptions,
) -> Result<ClientConnection> {
    if let Some(manager) = manager {
        if !std::ptr::eq(registry, Arc::as_ptr(manager.registry())) {
            warn!(
                server = %server_name,
                "Registry argument differs from the manager's registry and is ignored"
            );
        }
        let pooled = manager
            .get_server_connection(
                server_name,
                GetConnectionOptions {
                    require_healthy: options.require_healthy,
                },
            )
            .await?;
        return Ok(ClientConnection::Shared(pooled));
    }

    let init = InitOptions {
        factory: options.factory,
        session_id: options.session_id,
        connect_timeout: options.connect_timeout,
        ..InitOptions::default()
    };
    let session = registry.open_session(server_name, init).await?;
    Ok(ClientConnection::Owned(OwnedSession {
        server_name: server_name.to_string(),
        session,
        released: false,
    }))
}

/// Drop one pooled server, or shut the whole manager down
///
/// Returns whether anything was disconnected.
pub async fn disconnect(server_name: Option<&str>, manager: &ConnectionManager) -> bool {
    match server_name {
        Some(name) => manager.remove_server(name).await,
        None => {
            let had_connections = !manager.connected_servers().is_empty();
            manager.shutdown().await;
            had_connections
        }
    }
}

/// Options for [`with_temporary_client`]
#[derive(Clone, Default)]
pub struct TemporaryClientOptions {
    /// Abort the connect attempt after this long
    pub timeout: Option<Duration>,
    /// Factory overriding [`RpcSessionFactory`](crate::session::RpcSessionFactory)
    pub factory: Option<Arc<dyn SessionFactory>>,
}

/// Run `operation` against a server that is not registered anywhere
///
/// The config is validated, a session is connected (aborted past
/// `options.timeout`), `operation` runs, and the session is always
/// disconnected. Disconnect failures are only logged, so the result is
/// always `operation`'s own.
///
/// # Errors
///
/// Validation, connect or timeout errors, or `operation`'s error.
#[instrument(skip(config, operation, options))]
pub async fn with_temporary_client<F, Fut, T>(
    server_name: &str,
    config: ServerConfig,
    operation: F,
    options: TemporaryClientOptions,
) -> Result<T>
where
    F: FnOnce(Arc<dyn Session>) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut registry = ServerRegistry::new();
    if let Some(factory) = options.factory {
        registry = registry.with_session_factory(factory);
    }
    registry.add_server(server_name, config)?;

    let init = InitOptions {
        use_circuit_breaker: false,
        connect_timeout: options.timeout,
        ..InitOptions::default()
    };
    registry.initialize_server(server_name, init, operation).await
}

/// Recorded health of every pooled server
///
/// Stale entries are re-probed as in [`ConnectionManager::is_server_healthy`].
pub async fn get_server_statuses(manager: &ConnectionManager) -> HashMap<String, bool> {
    let names = manager.connected_servers();
    let health = futures::future::join_all(names.iter().map(|n| manager.is_server_healthy(n))).await;
    names.into_iter().zip(health).collect()
}

/// Options for [`wait_for_server_health`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    /// Give up after this long
    pub timeout: Duration,
    /// Delay between checks
    pub check_interval: Duration,
}

impl Default for WaitOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            check_interval: Duration::from_secs(1),
        }
    }
}

/// Poll until `server_name` is healthy
///
/// A server without a pooled connection gets a connection attempt on each
/// check. Returns `false` once `options.timeout` elapses; never errors.
pub async fn wait_for_server_health(server_name: &str, manager: &ConnectionManager, options: WaitOptions) -> bool {
    let deadline = Instant::now() + options.timeout;

    let poll = async {
        loop {
            if manager.connected_servers().iter().all(|n| n != server_name)
                && let Err(e) = manager
                    .get_server_connection(server_name, GetConnectionOptions::default())
                    .await
            {
                debug!(server = %server_name, error = %e, "Server not reachable yet");
            }

            if manager.is_server_healthy(server_name).await {
                return true;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::time::sleep(options.check_interval.min(remaining)).await;
        }
    };

    match tokio::time::timeout_at(deadline, poll).await {
        Ok(healthy) => healthy,
        Err(_) => {
            debug!(server = %server_name, timeout = ?options.timeout, "Gave up waiting for server health");
            false
        }
    }
}

/// Connect every enabled server in the manager's registry
///
/// Returns the names of the servers that connected. In
/// [`ConnectionMode::Lenient`] failures are logged and skipped. In
/// [`ConnectionMode::Strict`] the servers that did connect are removed again
/// and the first failure is returned.
///
/// # Errors
///
/// In strict mode, the first connection failure (in server-name order).
pub async fn connect_enabled_servers(manager: &ConnectionManager, mode: ConnectionMode) -> Result<Vec<String>> {
    let names = manager.registry().get_enabled_server_names();
    info!(servers = names.len(), ?mode, "Connecting enabled servers");

    let results = futures::future::join_all(
        names
            .iter()
            .map(|n| manager.get_server_connection(n, GetConnectionOptions::default())),
    )
    .await;

    let mut active = Vec::new();
    let mut first_failure = None;
    for (name, result) in names.into_iter().zip(results) {
        match result {
            Ok(_) => active.push(name),
            Err(e) => match mode {
                ConnectionMode::Lenient => {
                    warn!(server = %name, error = %e, "Server failed to connect, continuing without it");
                }
                ConnectionMode::Strict => {
                    error!(server = %name, error = %e, "Server failed to connect");
                    first_failure.get_or_insert(e);
                }
            },
        }
    }

    if let Some(e) = first_failure {
        for name in &active {
            manager.remove_server(name).await;
        }
        return Err(e);
    }
    Ok(active)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::LifecycleError;
    use crate::session::testing::MockFactory;
    use pretty_assertions::assert_eq;

    fn registry(factory: &Arc<MockFactory>, names: &[&str]) -> Arc<ServerRegistry> {
        let registry = ServerRegistry::new().with_session_factory(factory.clone());
        for name in names {
            registry
                .add_server(name, ServerConfig::stdio(format!("{name}-server"), vec![]))
                .unwrap();
        }
        Arc::new(registry)
    }

    #[tokio::test]
    async fn test_gen_client_passes_factory_through() {
        let default_factory = MockFactory::shared();
        let override_factory = MockFactory::shared();
        let registry = registry(&default_factory, &["alpha"]);

        let tools = gen_client(
            "alpha",
            &registry,
            Some(override_factory.clone()),
            Some("session-1"),
            |session| async move { session.get_tools().await },
        )
        .await
        .unwrap();

        assert_eq!(tools[0].name, "echo");
        assert!(default_factory.sessions().is_empty());
        assert_eq!(override_factory.last().disconnects(), 1);
    }

    #[tokio::test]
    async fn test_connect_without_manager_is_owned() {
        let factory = MockFactory::shared();
        let registry = registry(&factory, &["alpha"]);

        let connection = connect("alpha", &registry, None, ConnectOptions::default())
            .await
            .unwrap();
        assert!(!connection.is_shared());
        assert_eq!(connection.get_tools().await.unwrap().len(), 1);
        assert_eq!(factory.last().disconnects(), 0);

        connection.release().await.unwrap();
        assert_eq!(factory.last().disconnects(), 1);
    }

    #[tokio::test]
    async fn test_connect_with_manager_is_shared() {
        let factory = MockFactory::shared();
        let manager = ConnectionManager::new(registry(&factory, &["alpha"]));
        let registry = manager.registry().clone();

        let first = connect("alpha", &registry, Some(&manager), ConnectOptions::default())
            .await
            .unwrap();
        assert!(first.is_shared());
        first.release().await.unwrap();
        assert_eq!(factory.last().disconnects(), 0);

        let second = connect("alpha", &registry, Some(&manager), ConnectOptions::default())
            .await
            .unwrap();
        assert_eq!(second.server_name(), "alpha");
        assert_eq!(factory.sessions().len(), 1);

        assert!(disconnect(Some("alpha"), &manager).await);
        assert_eq!(factory.last().disconnects(), 1);
        assert!(!disconnect(None, &manager).await);
    }

    #[tokio::test]
    async fn test_connect_with_manager_ignores_other_registry() {
        let factory = MockFactory::shared();
        let manager = ConnectionManager::new(registry(&factory, &["alpha"]));
        let unrelated = ServerRegistry::new();

        let connection = connect("alpha", &unrelated, Some(&manager), ConnectOptions::default())
            .await
            .unwrap();
        assert!(connection.is_shared());
        assert_eq!(manager.connected_servers(), vec!["alpha"]);
        assert!(unrelated.is_empty());
        manager.shutdown().await;
    }

    #[tokio::test]
    async fn test_with_temporary_client_propagates_operation_error() {
        let factory = MockFactory::shared();
        factory
            .fail_disconnect
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let err = with_temporary_client(
            "scratch",
            ServerConfig::stdio("scratch-server", vec![]),
            |_| async { Err::<(), _>(LifecycleError::session("scratch", "operation failed")) },
            TemporaryClientOptions {
                factory: Some(factory.clone()),
                ..TemporaryClientOptions::default()
            },
        )
        .await
        .unwrap_err();

        assert!(err.to_string().contains("operation failed"));
        assert_eq!(factory.last().disconnects(), 1);
    }

    #[tokio::test]
    async fn test_with_temporary_client_rejects_invalid_config() {
        let factory = MockFactory::shared();
        let err = with_temporary_client(
            "scratch",
            ServerConfig::websocket("http://not-a-websocket"),
            |_| async { Ok(()) },
            TemporaryClientOptions {
                factory: Some(factory.clone()),
                ..TemporaryClientOptions::default()
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, LifecycleError::ConfigValidation(_)));
        assert!(factory.sessions().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_with_temporary_client_timeout() {
        let factory = MockFactory::shared();
        *factory.connect_delay.lock() = Some(Duration::from_secs(600));

        let err = with_temporary_client(
            "slow",
            ServerConfig::stdio("slow-server", vec![]),
            |_| async { Ok(()) },
            TemporaryClientOptions {
                timeout: Some(Duration::from_millis(250)),
                factory: Some(factory.clone()),
            },
        )
        .await
        .unwrap_err();

        assert!(matches!(err, LifecycleError::OperationTimeout { .. }));
        assert_eq!(factory.last().disconnects(), 1);
    }

    #[tokio::test]
    async fn test_server_statuses_and_wait() {
        let factory = MockFactory::shared();
        let manager = ConnectionManager::new(registry(&factory, &["alpha", "beta"]));

        let options = WaitOptions {
            timeout: Duration::from_secs(1),
            check_interval: Duration::from_millis(10),
        };
        assert!(wait_for_server_health("alpha", &manager, options).await);

        let statuses = get_server_statuses(&manager).await;
        assert_eq!(statuses, HashMap::from([("alpha".to_string(), true)]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_server_health_times_out() {
        let factory = MockFactory::shared();
        factory
            .fail_connect
            .store(true, std::sync::atomic::Ordering::SeqCst);
        let manager = ConnectionManager::new(registry(&factory, &["alpha"]));

        let healthy = wait_for_server_health(
            "alpha",
            &manager,
            WaitOptions {
                timeout: Duration::from_secs(2),
                check_interval: Duration::from_millis(500),
            },
        )
        .await;
        assert!(!healthy);
        assert!(!wait_for_server_health("unknown", &manager, WaitOptions::default()).await);
    }

    #[tokio::test]
    async fn test_connect_enabled_servers_modes() {
        let mocks = MockFactory::shared();
        let factory = {
            let mocks = mocks.clone();
            crate::session::session_factory(move |name: &str, id: Option<&str>| {
                if name == "bad" {
                    return Err(LifecycleError::connection(name, "spawn failed"));
                }
                mocks.create(name, id)
            })
        };
        let registry = ServerRegistry::new().with_session_factory(factory);
        registry.add_server("good", ServerConfig::stdio("good", vec![])).unwrap();
        registry.add_server("bad", ServerConfig::stdio("bad", vec![])).unwrap();

        let manager = ConnectionManager::new(Arc::new(registry));
        let active = connect_enabled_servers(&manager, ConnectionMode::Lenient)
            .await
            .unwrap();
        assert_eq!(active, vec!["good"]);

        manager.remove_server("good").await;
        let err = connect_enabled_servers(&manager, ConnectionMode::Strict)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Connection { .. }));
        assert!(manager.connected_servers().is_empty());
    }
}
