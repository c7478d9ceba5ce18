//! Persistent connection pool
//!
//! The [`ConnectionManager`] keeps at most one live [`PooledConnection`] per
//! server. Each server is its own fault domain:
//!
//! - creation runs through the server's [`CircuitBreaker`] and is serialized
//!   per server, never across servers, so a hung connect on one server does
//!   not delay another
//! - health probes and borrowed calls go through the same breaker as
//!   creation, so probe failures and operational failures are counted alike
//! - every connection owns a child of the manager's [`AbortManager`];
//!   removing the connection aborts its in-flight calls
//!
//! Borrowers receive `Arc<PooledConnection>`, which exposes the read-style
//! protocol calls only. Disconnecting is reserved to the manager.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as TokioMutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::{LifecycleError, Result};
use crate::registry::{ServerRegistry, TrackedSession};
use crate::resilience::{AbortConfig, AbortManager, CircuitBreaker};
use crate::session::{PromptDescriptor, ResourceDescriptor, ToolDescriptor};

/// Configuration for the connection manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// How long a recorded health result is trusted before re-probing
    pub health_cache_ttl: Duration,
    /// Interval between background health sweeps
    pub health_check_interval: Duration,
    /// Timeout for a single health probe
    pub health_check_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            health_cache_ttl: Duration::from_secs(30),
            health_check_interval: Duration::from_secs(30),
            health_check_timeout: Duration::from_secs(5),
        }
    }
}

impl ManagerConfig {
    /// Create a new manager configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

/// Options for [`ConnectionManager::get_server_connection`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetConnectionOptions {
    /// Replace the pooled connection if it is marked unhealthy
    pub require_healthy: bool,
}

/// Pool-wide counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatistics {
    /// Pooled connections
    pub total_connections: usize,
    /// Connections whose last recorded health is good
    pub healthy_connections: usize,
    /// Connections whose last recorded health is bad
    pub failed_connections: usize,
}

/// A pool-owned session lent to callers
pub struct PooledConnection {
    tracked: TrackedSession,
    breaker: Arc<CircuitBreaker>,
    scope: AbortManager,
    healthy: AtomicBool,
    last_health_check: Mutex<Instant>,
    created_at: Instant,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("server_name", &self.server_name())
            .field("healthy", &self.is_healthy())
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    fn new(tracked: TrackedSession, breaker: Arc<CircuitBreaker>, scope: AbortManager) -> Self {
        let now = Instant::now();
        Self {
            tracked,
            breaker,
            scope,
            healthy: AtomicBool::new(true),
            last_health_check: Mutex::new(now),
            created_at: now,
        }
    }

    /// Server this connection belongs to
    pub fn server_name(&self) -> &str {
        self.tracked.server_name()
    }

    /// Last recorded health
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Acquire)
    }

    /// When health was last recorded
    pub fn last_health_check(&self) -> Instant {
        *self.last_health_check.lock()
    }

    /// When the connection was established
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Token cancelled when the pool drops this connection
    pub fn closed_token(&self) -> CancellationToken {
        self.scope.token()
    }

    /// List the server's tools
    ///
    /// # Errors
    ///
    /// Returns the breaker's rejection, the session's error, or
    /// [`LifecycleError::Aborted`] if the pool removes the connection
    /// mid-call.
    pub async fn get_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.guarded(self.tracked.session().get_tools()).await
    }

    /// List the server's prompts
    ///
    /// # Errors
    ///
    /// As [`get_tools`](Self::get_tools).
    pub async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>> {
        self.guarded(self.tracked.session().list_prompts()).await
    }

    /// List the server's resources
    ///
    /// # Errors
    ///
    /// As [`get_tools`](Self::get_tools).
    pub async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        self.guarded(self.tracked.session().list_resources()).await
    }

    async fn guarded<T, Fut>(&self, call: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        let result = self
            .breaker
            .execute(|| async move {
                self.scope
                    .race(call, "connection closed")
                    .await
                    .and_then(|inner| inner)
            })
            .await;

        match &result {
            Ok(_) => self.record_health(true),
            // The server answered; the transport is fine
            Err(LifecycleError::Protocol { .. } | LifecycleError::Aborted { .. }) => {}
            Err(_) => self.record_health(false),
        }
        result
    }

    fn record_health(&self, healthy: bool) {
        let was = self.healthy.swap(healthy, Ordering::AcqRel);
        *self.last_health_check.lock() = Instant::now();
        match (was, healthy) {
            (false, true) => info!(server = %self.server_name(), "Connection recovered"),
            (true, false) => warn!(server = %self.server_name(), "Connection marked unhealthy"),
            _ => {}
        }
    }
}

/// Serializes creation for one server
#[derive(Default)]
struct CreationSlot {
    lock: TokioMutex<()>,
    /// Bumped by every external teardown; a creator that sees it move
    /// discards its connection instead of pooling it
    epoch: AtomicU64,
}

struct ManagerInner {
    registry: Arc<ServerRegistry>,
    config: ManagerConfig,
    pool: RwLock<HashMap<String, Arc<PooledConnection>>>,
    creation_slots: Mutex<HashMap<String, Arc<CreationSlot>>>,
    root: AbortManager,
}

impl ManagerInner {
    fn lookup(&self, name: &str) -> Option<Arc<PooledConnection>> {
        self.pool.read().get(name).cloned()
    }

    async fn probe(&self, connection: &PooledConnection) -> bool {
        let timeout = self.config.health_check_timeout;
        let probe = async {
            tokio::time::timeout(timeout, connection.tracked.session().get_tools())
                .await
                .map_err(|_| LifecycleError::OperationTimeout {
                    operation: format!("health probe of '{}'", connection.server_name()),
                    timeout,
                })?
        };

        match connection.guarded(probe).await {
            Ok(tools) => {
                debug!(server = %connection.server_name(), tools = tools.len(), "Health probe succeeded");
                true
            }
            Err(e) => {
                debug!(server = %connection.server_name(), error = %e, "Health probe failed");
                false
            }
        }
    }

    async fn teardown(&self, connection: &PooledConnection, reason: &str) {
        connection.scope.abort(reason);
        self.registry.release_session(&connection.tracked).await;
    }
}

/// One persistent connection per server
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
    health_check_task: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.inner.config)
            .field("connections", &self.connected_servers())
            .finish_non_exhaustive()
    }
}

impl ConnectionManager {
    /// Manager over `registry` with default configuration
    pub fn new(registry: Arc<ServerRegistry>) -> Self {
        Self::with_config(registry, ManagerConfig::default())
    }

    /// Manager over `registry`
    pub fn with_config(registry: Arc<ServerRegistry>, config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(ManagerInner {
                registry,
                config,
                pool: RwLock::new(HashMap::new()),
                creation_slots: Mutex::new(HashMap::new()),
                root: AbortManager::new(AbortConfig::labeled("connection-manager")),
            }),
            health_check_task: Mutex::new(None),
        }
    }

    /// Registry backing this pool
    pub fn registry(&self) -> &Arc<ServerRegistry> {
        &self.inner.registry
    }

    /// Manager configuration
    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Get the pooled connection for `name`, creating it if needed
    ///
    /// An existing connection is returned as long as it is healthy or
    /// `require_healthy` is off; otherwise it is replaced.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::UnknownServer`], the breaker's
    /// [`LifecycleError::CircuitOpen`], the connect error, or
    /// [`LifecycleError::Aborted`] after [`shutdown`](Self::shutdown) or when
    /// the server is removed while its connection is being created.
    #[instrument(skip(self))]
    pub async fn get_server_connection(
        &self,
        name: &str,
        options: GetConnectionOptions,
    ) -> Result<Arc<PooledConnection>> {
        let usable = |c: &PooledConnection| !options.require_healthy || c.is_healthy();

        if let Some(connection) = self.inner.lookup(name)
            && usable(connection.as_ref())
        {
            return Ok(connection);
        }

        let breaker = self
            .inner
            .registry
            .circuit_breaker(name)
            .ok_or_else(|| LifecycleError::UnknownServer(name.to_string()))?;

        let slot = self
            .inner
            .creation_slots
            .lock()
            .entry(name.to_string())
            .or_default()
            .clone();
        let _creating = slot.lock.lock().await;

        if let Some(connection) = self.inner.lookup(name) {
            if usable(connection.as_ref()) {
                return Ok(connection);
            }
            info!(server = %name, "Replacing unhealthy connection");
            self.evict(name, &connection).await;
        }

        if self.inner.root.is_aborted() {
            return Err(LifecycleError::aborted("connection manager is shut down"));
        }

        let epoch = slot.epoch.load(Ordering::Acquire);
        let tracked = breaker
            .execute(|| self.inner.registry.start_server(name, None))
            .await?;

        // Admission and teardown both hold the pool lock, so a teardown that
        // started while connecting is always observed here
        let admitted = {
            let mut pool = self.inner.pool.write();
            if self.inner.root.is_aborted() {
                Err("connection manager is shut down".to_string())
            } else if slot.epoch.load(Ordering::Acquire) != epoch {
                Err(format!("server '{name}' was removed while connecting"))
            } else {
                let scope = self
                    .inner
                    .root
                    .create_child(AbortConfig::labeled(format!("pool:{name}")));
                let connection = Arc::new(PooledConnection::new(tracked.clone(), breaker, scope));
                let displaced = pool.insert(name.to_string(), connection.clone());
                Ok((connection, displaced))
            }
        };

        let (connection, displaced) = match admitted {
            Ok(admitted) => admitted,
            Err(reason) => {
                info!(server = %name, reason = %reason, "Discarding connection created during teardown");
                self.inner.registry.release_session(&tracked).await;
                return Err(LifecycleError::aborted(reason));
            }
        };
        if let Some(old) = displaced.filter(|old| !Arc::ptr_eq(old, &connection)) {
            warn!(server = %name, "Pooled connection displaced by a concurrent creator");
            self.inner.teardown(&old, "connection replaced").await;
        }

        info!(server = %name, "Pooled connection established");
        Ok(connection)
    }

    /// Whether `name` has a healthy pooled connection
    ///
    /// Returns the recorded health while it is fresher than
    /// `health_cache_ttl`, otherwise probes. Never errors; a server without a
    /// pooled connection is reported unhealthy.
    pub async fn is_server_healthy(&self, name: &str) -> bool {
        let Some(connection) = self.inner.lookup(name) else {
            return false;
        };
        if connection.last_health_check().elapsed() < self.inner.config.health_cache_ttl {
            return connection.is_healthy();
        }
        self.inner.probe(&connection).await
    }

    /// Probe `name` now, bypassing the health cache
    ///
    /// The probe runs through the server's circuit breaker. Never errors.
    pub async fn probe_server_health(&self, name: &str) -> bool {
        match self.inner.lookup(name) {
            Some(connection) => self.inner.probe(&connection).await,
            None => false,
        }
    }

    /// Recorded health of every pooled connection
    pub fn health_snapshot(&self) -> HashMap<String, bool> {
        self.inner
            .pool
            .read()
            .iter()
            .map(|(name, c)| (name.clone(), c.is_healthy()))
            .collect()
    }

    /// Disconnect and drop the pooled connection for `name`
    ///
    /// Returns `false` if there was none.
    pub async fn remove_server(&self, name: &str) -> bool {
        if let Some(slot) = self.inner.creation_slots.lock().get(name) {
            slot.epoch.fetch_add(1, Ordering::AcqRel);
        }
        let removed = self.inner.pool.write().remove(name);

        match removed {
            Some(connection) => {
                self.inner.teardown(&connection, "server removed").await;
                info!(server = %name, "Pooled connection removed");
                true
            }
            None => false,
        }
    }

    /// Disconnect every pooled connection and stop the manager
    ///
    /// Later calls to [`get_server_connection`](Self::get_server_connection)
    /// fail with [`LifecycleError::Aborted`]; a connection still being created
    /// is disconnected instead of pooled.
    pub async fn shutdown(&self) {
        self.stop_health_monitoring();
        self.inner.root.abort("connection manager shut down");

        let connections: Vec<Arc<PooledConnection>> = self
            .inner
            .pool
            .write()
            .drain()
            .map(|(_, c)| c)
            .collect();
        info!(connections = connections.len(), "Shutting down connection manager");

        futures::future::join_all(
            connections
                .iter()
                .map(|c| self.inner.registry.release_session(&c.tracked)),
        )
        .await;
        self.inner.creation_slots.lock().clear();
    }

    /// Pool-wide counters
    pub fn statistics(&self) -> ConnectionStatistics {
        let pool = self.inner.pool.read();
        let healthy = pool.values().filter(|c| c.is_healthy()).count();
        ConnectionStatistics {
            total_connections: pool.len(),
            healthy_connections: healthy,
            failed_connections: pool.len() - healthy,
        }
    }

    /// Names of servers with a pooled connection, sorted
    pub fn connected_servers(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.pool.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Start probing every pooled connection periodically
    ///
    /// Has no effect if monitoring is already running.
    pub fn start_health_monitoring(&self) {
        let mut task = self.health_check_task.lock();
        if task.is_some() {
            return;
        }

        let inner = Arc::clone(&self.inner);
        let interval = inner.config.health_check_interval;
        *task = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = inner.root.aborted() => break,
                    _ = ticker.tick() => {}
                }

                let connections: Vec<Arc<PooledConnection>> =
                    inner.pool.read().values().cloned().collect();
                let results = futures::future::join_all(
                    connections.iter().map(|c| inner.probe(c)),
                )
                .await;

                let unhealthy = results.iter().filter(|ok| !**ok).count();
                debug!(
                    checked = connections.len(),
                    unhealthy, "Health sweep completed"
                );
            }
            debug!("Health monitoring stopped");
        }));
    }

    /// Stop background health monitoring
    pub fn stop_health_monitoring(&self) {
        if let Some(task) = self.health_check_task.lock().take() {
            task.abort();
        }
    }

    async fn evict(&self, name: &str, stale: &Arc<PooledConnection>) {
        let removed = {
            let mut pool = self.inner.pool.write();
            match pool.get(name) {
                Some(current) if Arc::ptr_eq(current, stale) => pool.remove(name),
                _ => None,
            }
        };
        if let Some(connection) = removed {
            self.inner.teardown(&connection, "connection replaced").await;
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.stop_health_monitoring();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::resilience::{CircuitBreakerConfig, CircuitState};
    use crate::session::testing::MockFactory;
    use pretty_assertions::assert_eq;

    fn setup(names: &[&str]) -> (Arc<MockFactory>, ConnectionManager) {
        let factory = MockFactory::shared();
        let registry = ServerRegistry::new()
            .with_session_factory(factory.clone())
            .with_circuit_breaker_config(CircuitBreakerConfig {
                failure_threshold: 2,
                ..CircuitBreakerConfig::default()
            });
        for name in names {
            registry
                .add_server(name, ServerConfig::stdio(format!("{name}-server"), vec![]))
                .unwrap();
        }
        (factory, ConnectionManager::new(Arc::new(registry)))
    }

    #[test]
    fn test_manager_config_defaults() {
        let config = ManagerConfig::default();
        assert_eq!(config.health_cache_ttl, Duration::from_secs(30));
        assert_eq!(config.health_check_timeout, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_pool_reuses_connection() {
        let (factory, manager) = setup(&["alpha"]);

        let first = manager
            .get_server_connection("alpha", GetConnectionOptions::default())
            .await
            .unwrap();
        let second = manager
            .get_server_connection("alpha", GetConnectionOptions::default())
            .await
            .unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(factory.sessions().len(), 1);
        assert_eq!(manager.connected_servers(), vec!["alpha"]);
    }

    #[tokio::test]
    async fn test_remove_server_forces_new_connection() {
        let (factory, manager) = setup(&["alpha"]);

        let first = manager
            .get_server_connection("alpha", GetConnectionOptions::default())
            .await
            .unwrap();
        assert!(manager.remove_server("alpha").await);
        assert!(first.closed_token().is_cancelled());
        assert_eq!(factory.sessions()[0].disconnects(), 1);

        let second = manager
            .get_server_connection("alpha", GetConnectionOptions::default())
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(!manager.remove_server("beta").await);
    }

    #[tokio::test]
    async fn test_require_healthy_replaces_unhealthy_connection() {
        let (factory, manager) = setup(&["alpha"]);
        let first = manager
            .get_server_connection("alpha", GetConnectionOptions::default())
            .await
            .unwrap();

        factory.sessions()[0].fail_tools.store(true, Ordering::SeqCst);
        assert!(first.get_tools().await.is_err());
        assert!(!first.is_healthy());

        let lenient = manager
            .get_server_connection("alpha", GetConnectionOptions::default())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &lenient));

        let fresh = manager
            .get_server_connection("alpha", GetConnectionOptions { require_healthy: true })
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert_eq!(factory.sessions()[0].disconnects(), 1);
        assert_eq!(factory.sessions().len(), 2);
    }

    #[tokio::test]
    async fn test_health_probe_failures_open_the_circuit() {
        let (factory, manager) = setup(&["alpha"]);
        manager
            .get_server_connection("alpha", GetConnectionOptions::default())
            .await
            .unwrap();
        assert!(manager.probe_server_health("alpha").await);

        factory.sessions()[0].fail_tools.store(true, Ordering::SeqCst);
        assert!(!manager.probe_server_health("alpha").await);
        assert!(!manager.probe_server_health("alpha").await);

        let breaker = manager.registry().circuit_breaker("alpha").unwrap();
        assert_eq!(breaker.state(), CircuitState::Open);
        assert!(!manager.is_server_healthy("alpha").await);
        assert!(!manager.is_server_healthy("unknown").await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_is_server_healthy_uses_cache_then_probes() {
        let (factory, manager) = setup(&["alpha"]);
        manager
            .get_server_connection("alpha", GetConnectionOptions::default())
            .await
            .unwrap();
        let session = factory.last();

        assert!(manager.is_server_healthy("alpha").await);
        assert_eq!(session.tool_calls.load(Ordering::SeqCst), 0);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(manager.is_server_healthy("alpha").await);
        assert_eq!(session.tool_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_statistics() {
        let (factory, manager) = setup(&["alpha", "beta"]);
        for name in ["alpha", "beta"] {
            manager
                .get_server_connection(name, GetConnectionOptions::default())
                .await
                .unwrap();
        }
        factory.sessions()[1].fail_tools.store(true, Ordering::SeqCst);
        manager.probe_server_health("beta").await;

        assert_eq!(
            manager.statistics(),
            ConnectionStatistics {
                total_connections: 2,
                healthy_connections: 1,
                failed_connections: 1,
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_server_does_not_block_others() {
        let (factory, manager) = setup(&["slow", "fast"]);
        let manager = Arc::new(manager);
        *factory.connect_delay.lock() = Some(Duration::from_secs(3600));

        let slow = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager
                    .get_server_connection("slow", GetConnectionOptions::default())
                    .await
            })
        };
        tokio::task::yield_now().await;

        *factory.connect_delay.lock() = None;
        let fast = tokio::time::timeout(
            Duration::from_secs(1),
            manager.get_server_connection("fast", GetConnectionOptions::default()),
        )
        .await;
        assert!(matches!(fast, Ok(Ok(_))));
        assert!(!slow.is_finished());
        slow.abort();
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_and_rejects() {
        let (factory, manager) = setup(&["alpha", "beta"]);
        for name in ["alpha", "beta"] {
            manager
                .get_server_connection(name, GetConnectionOptions::default())
                .await
                .unwrap();
        }

        manager.shutdown().await;
        assert!(factory.sessions().iter().all(|s| s.disconnects() == 1));
        assert_eq!(manager.statistics().total_connections, 0);

        let err = manager
            .get_server_connection("alpha", GetConnectionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Aborted { .. }));
    }

    #[tokio::test]
    async fn test_unknown_server() {
        let (_, manager) = setup(&[]);
        let err = manager
            .get_server_connection("ghost", GetConnectionOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::UnknownServer(_)));
        assert!(manager.inner.creation_slots.lock().is_empty());
    }

    fn spawn_get(manager: &Arc<ConnectionManager>) -> JoinHandle<Result<Arc<PooledConnection>>> {
        let manager = Arc::clone(manager);
        tokio::spawn(async move {
            manager
                .get_server_connection("alpha", GetConnectionOptions::default())
                .await
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_creation_releases_new_session() {
        let (factory, manager) = setup(&["alpha"]);
        *factory.connect_delay.lock() = Some(Duration::from_secs(1));
        let manager = Arc::new(manager);

        let creating = spawn_get(&manager);
        tokio::time::sleep(Duration::from_millis(100)).await;
        manager.shutdown().await;

        let err = creating.await.unwrap().unwrap_err();
        assert!(matches!(err, LifecycleError::Aborted { .. }));
        assert!(manager.connected_servers().is_empty());
        assert_eq!(manager.registry().tracked_session_count(), 0);
        assert_eq!(factory.sessions().len(), 1);
        assert_eq!(factory.last().disconnects(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remove_during_creation_keeps_single_connection() {
        let (factory, manager) = setup(&["alpha"]);
        *factory.connect_delay.lock() = Some(Duration::from_secs(1));
        let manager = Arc::new(manager);

        let first = spawn_get(&manager);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!manager.remove_server("alpha").await);
        let second = spawn_get(&manager);

        let err = first.await.unwrap().unwrap_err();
        assert!(matches!(err, LifecycleError::Aborted { ref reason } if reason.contains("removed")));
        let pooled = second.await.unwrap().unwrap();

        let sessions = factory.sessions();
        assert_eq!(sessions.len(), 2);
        assert_eq!(sessions[0].disconnects(), 1);
        assert_eq!(sessions[1].disconnects(), 0);
        assert_eq!(manager.registry().tracked_session_count(), 1);

        let again = manager
            .get_server_connection("alpha", GetConnectionOptions::default())
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&pooled, &again));

        manager.shutdown().await;
        assert!(factory.sessions().iter().all(|s| s.disconnects() == 1));
    }
}
