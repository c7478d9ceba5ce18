//! Server registry
//!
//! The [`ServerRegistry`] owns every registered server's configuration, its
//! enabled flag, an optional init hook and its [`CircuitBreaker`]. It hands
//! out sessions in two shapes:
//!
//! - **Ephemeral**: [`initialize_server`](ServerRegistry::initialize_server)
//!   lends one connected session to a callback and disconnects it exactly
//!   once afterwards, however the callback exits.
//! - **Persistent**: [`start_server`](ServerRegistry::start_server) returns a
//!   connected [`TrackedSession`] that stays open until
//!   [`release_session`](ServerRegistry::release_session) or
//!   [`shutdown`](ServerRegistry::shutdown).

use std::collections::HashMap;
use std::future::Future;
use std::panic::{AssertUnwindSafe, resume_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, instrument, warn};

use crate::config::{LifecycleSettings, ServerConfig};
use crate::error::{ConfigValidationError, LifecycleError, Result};
use crate::resilience::{AbortConfig, AbortManager, CircuitBreaker, CircuitBreakerConfig};
use crate::session::{RpcSessionFactory, Session, SessionFactory, SessionInitHook};

/// Per-server registration options
#[derive(Clone)]
pub struct ServerOptions {
    /// Whether the server accepts new sessions
    pub enabled: bool,
    /// Hook run on every new session before connect
    pub init_hook: Option<Arc<dyn SessionInitHook>>,
    /// Breaker config overriding the registry default
    pub circuit_breaker: Option<CircuitBreakerConfig>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            init_hook: None,
            circuit_breaker: None,
        }
    }
}

/// Options for acquiring a session
#[derive(Clone)]
pub struct InitOptions {
    /// Factory overriding the registry default
    pub factory: Option<Arc<dyn SessionFactory>>,
    /// Hook overriding the server's registered hook
    pub init_hook: Option<Arc<dyn SessionInitHook>>,
    /// Session id passed to the factory
    pub session_id: Option<String>,
    /// Route connect through the server's circuit breaker
    pub use_circuit_breaker: bool,
    /// Abort the connect attempt after this long
    pub connect_timeout: Option<Duration>,
    /// Scope the connect attempt is tied to
    pub abort: Option<AbortManager>,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            factory: None,
            init_hook: None,
            session_id: None,
            use_circuit_breaker: true,
            connect_timeout: None,
            abort: None,
        }
    }
}

impl InitOptions {
    /// Options using `factory`
    pub fn with_factory(factory: Arc<dyn SessionFactory>) -> Self {
        Self {
            factory: Some(factory),
            ..Self::default()
        }
    }
}

struct ServerEntry {
    config: Arc<ServerConfig>,
    enabled: bool,
    init_hook: Option<Arc<dyn SessionInitHook>>,
    circuit_breaker: Arc<CircuitBreaker>,
}

struct ResolvedServer {
    config: Arc<ServerConfig>,
    init_hook: Option<Arc<dyn SessionInitHook>>,
    circuit_breaker: Arc<CircuitBreaker>,
}

/// A persistent session tracked by the registry
#[derive(Clone)]
pub struct TrackedSession {
    id: u64,
    server_name: String,
    session: Arc<dyn Session>,
}

impl std::fmt::Debug for TrackedSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedSession")
            .field("id", &self.id)
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl TrackedSession {
    /// Registry-assigned id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Server the session belongs to
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    /// The connected session
    pub fn session(&self) -> &Arc<dyn Session> {
        &self.session
    }
}

/// Disconnects a session once, on explicit release or on drop
struct SessionRelease {
    server: String,
    session: Option<Arc<dyn Session>>,
}

impl SessionRelease {
    fn new(server: &str, session: Arc<dyn Session>) -> Self {
        Self {
            server: server.to_string(),
            session: Some(session),
        }
    }

    fn disarm(mut self) {
        self.session = None;
    }

    async fn release(mut self) {
        if let Some(session) = self.session.take() {
            disconnect_quietly(&self.server, session.as_ref()).await;
        }
    }
}

impl Drop for SessionRelease {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        let server = std::mem::take(&mut self.server);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(server = %server, "Session scope dropped, releasing in background");
                handle.spawn(async move {
                    disconnect_quietly(&server, session.as_ref()).await;
                });
            }
            Err(_) => {
                warn!(server = %server, "Session scope dropped outside a runtime; disconnect skipped");
            }
        }
    }
}

/// Disconnect `session`, logging instead of propagating failures
pub(crate) async fn disconnect_quietly(server: &str, session: &dyn Session) {
    match session.disconnect().await {
        Ok(()) => debug!(server = %server, "Session disconnected"),
        Err(e) => warn!(server = %server, error = %e, "Error during session disconnect"),
    }
}

/// Registered servers and the sessions opened against them
pub struct ServerRegistry {
    entries: RwLock<HashMap<String, ServerEntry>>,
    sessions: Mutex<HashMap<u64, TrackedSession>>,
    next_session_id: AtomicU64,
    default_factory: Arc<dyn SessionFactory>,
    breaker_config: CircuitBreakerConfig,
    settings: LifecycleSettings,
}

impl std::fmt::Debug for ServerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerRegistry")
            .field("servers", &self.get_server_names())
            .field("tracked_sessions", &self.tracked_session_count())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Default for ServerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerRegistry {
    /// Empty registry using [`RpcSessionFactory`] and default settings
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            next_session_id: AtomicU64::new(1),
            default_factory: Arc::new(RpcSessionFactory::default()),
            breaker_config: CircuitBreakerConfig::default(),
            settings: LifecycleSettings::default(),
        }
    }

    /// Use `settings` for validation and timeout defaults
    #[must_use]
    pub fn with_settings(mut self, settings: LifecycleSettings) -> Self {
        self.settings = settings;
        self
    }

    /// Use `factory` when no per-call factory is given
    #[must_use]
    pub fn with_session_factory(mut self, factory: Arc<dyn SessionFactory>) -> Self {
        self.default_factory = factory;
        self
    }

    /// Breaker config for servers registered without an override
    #[must_use]
    pub fn with_circuit_breaker_config(mut self, config: CircuitBreakerConfig) -> Self {
        self.breaker_config = config;
        self
    }

    /// Settings in effect
    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    /// Register a server with default options
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::ConfigValidation`] for an invalid name or
    /// config and [`LifecycleError::DuplicateServer`] if `name` is taken.
    pub fn add_server(&self, name: &str, config: ServerConfig) -> Result<()> {
        self.add_server_with(name, config, ServerOptions::default())
    }

    /// Register a server
    ///
    /// The stored config is an immutable snapshot; an unset timeout is
    /// filled from the registry settings.
    ///
    /// # Errors
    ///
    /// Same as [`add_server`](Self::add_server).
    pub fn add_server_with(&self, name: &str, config: ServerConfig, options: ServerOptions) -> Result<()> {
        if name.trim().is_empty() {
            return Err(ConfigValidationError::EmptyName.into());
        }
        config.validate(&self.settings)?;

        let breaker_config = options
            .circuit_breaker
            .unwrap_or_else(|| self.breaker_config.clone());
        let transport = config.transport.kind();

        let mut entries = self.entries.write();
        if entries.contains_key(name) {
            return Err(LifecycleError::DuplicateServer(name.to_string()));
        }
        entries.insert(
            name.to_string(),
            ServerEntry {
                config: Arc::new(config.resolved(&self.settings)),
                enabled: options.enabled,
                init_hook: options.init_hook,
                circuit_breaker: Arc::new(CircuitBreaker::new(format!("server:{name}"), breaker_config)),
            },
        );
        drop(entries);

        info!(server = %name, transport, enabled = options.enabled, "Server registered");
        Ok(())
    }

    /// Register a server from raw JSON
    ///
    /// # Errors
    ///
    /// Returns [`ConfigValidationError::Malformed`] if `value` matches no
    /// transport, otherwise as [`add_server`](Self::add_server).
    pub fn add_server_json(&self, name: &str, value: serde_json::Value) -> Result<()> {
        let config = ServerConfig::from_json(value)?;
        self.add_server(name, config)
    }

    /// Unregister a server and disconnect its tracked sessions
    ///
    /// Returns `false` if no such server was registered.
    pub async fn remove_server(&self, name: &str) -> bool {
        let removed = self.entries.write().remove(name).is_some();

        let orphaned: Vec<TrackedSession> = {
            let mut sessions = self.sessions.lock();
            let ids: Vec<u64> = sessions
                .values()
                .filter(|s| s.server_name == name)
                .map(|s| s.id)
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for tracked in orphaned {
            disconnect_quietly(name, tracked.session.as_ref()).await;
        }

        if removed {
            info!(server = %name, "Server removed");
        }
        removed
    }

    /// Config snapshot for `name`
    pub fn get_server_config(&self, name: &str) -> Option<Arc<ServerConfig>> {
        self.entries.read().get(name).map(|e| e.config.clone())
    }

    /// All registered server names, sorted
    pub fn get_server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.entries.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Enabled server names, sorted
    pub fn get_enabled_server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .iter()
            .filter(|(_, e)| e.enabled)
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    /// Enable or disable a server
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::UnknownServer`] if `name` is not registered.
    pub fn set_server_enabled(&self, name: &str, enabled: bool) -> Result<()> {
        let mut entries = self.entries.write();
        let entry = entries
            .get_mut(name)
            .ok_or_else(|| LifecycleError::UnknownServer(name.to_string()))?;
        entry.enabled = enabled;
        debug!(server = %name, enabled, "Server enabled flag changed");
        Ok(())
    }

    /// Whether `name` is registered and enabled
    pub fn is_server_enabled(&self, name: &str) -> bool {
        self.entries.read().get(name).is_some_and(|e| e.enabled)
    }

    /// The server's circuit breaker
    pub fn circuit_breaker(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.entries.read().get(name).map(|e| e.circuit_breaker.clone())
    }

    /// Whether `name` is registered
    pub fn contains(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }

    /// Number of registered servers
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether no servers are registered
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Number of open persistent sessions
    pub fn tracked_session_count(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Lend one connected session to `operation`
    ///
    /// The session is disconnected exactly once after `operation` finishes,
    /// whether it returns `Ok`, returns `Err`, panics (the panic resumes
    /// after release) or is dropped mid-flight (release is spawned onto the
    /// current runtime). Disconnect failures are logged and never replace
    /// `operation`'s result.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::UnknownServer`] / [`LifecycleError::ServerDisabled`]
    /// for unusable servers, the breaker's [`LifecycleError::CircuitOpen`],
    /// any connect or init-hook error, or `operation`'s own error.
    #[instrument(skip(self, options, operation))]
    pub async fn initialize_server<F, Fut, T>(&self, name: &str, options: InitOptions, operation: F) -> Result<T>
    where
        F: FnOnce(Arc<dyn Session>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let server = self.resolve(name)?;
        if options.use_circuit_breaker {
            server.circuit_breaker.check()?;
        }
        let session = self.create_session(name, &options)?;
        let release = SessionRelease::new(name, session.clone());

        let outcome = match self.prepare_session(name, &server, &session, &options).await {
            Ok(()) => AssertUnwindSafe(operation(session)).catch_unwind().await,
            Err(e) => Ok(Err(e)),
        };

        release.release().await;
        match outcome {
            Ok(result) => result,
            Err(panic) => {
                warn!(server = %name, "Session operation panicked; session released");
                resume_unwind(panic)
            }
        }
    }

    /// Open a session the caller owns
    ///
    /// The session is connected (through the breaker unless disabled in
    /// `options`) but not tracked; the caller must disconnect it.
    ///
    /// # Errors
    ///
    /// As [`initialize_server`](Self::initialize_server), minus the operation.
    #[instrument(skip(self, options))]
    pub async fn open_session(&self, name: &str, options: InitOptions) -> Result<Arc<dyn Session>> {
        let server = self.resolve(name)?;
        if options.use_circuit_breaker {
            server.circuit_breaker.check()?;
        }
        let session = self.create_session(name, &options)?;
        let release = SessionRelease::new(name, session.clone());

        match self.prepare_session(name, &server, &session, &options).await {
            Ok(()) => {
                release.disarm();
                Ok(session)
            }
            Err(e) => {
                release.release().await;
                Err(e)
            }
        }
    }

    /// Start a persistent, tracked session
    ///
    /// Connects without the circuit breaker; the connection manager applies
    /// it around this call.
    ///
    /// # Errors
    ///
    /// Returns registry errors, factory and hook errors, or the connect error.
    #[instrument(skip(self, factory))]
    pub async fn start_server(&self, name: &str, factory: Option<Arc<dyn SessionFactory>>) -> Result<TrackedSession> {
        let options = InitOptions {
            factory,
            use_circuit_breaker: false,
            ..InitOptions::default()
        };
        let session = self.open_session(name, options).await?;

        let tracked = TrackedSession {
            id: self.next_session_id.fetch_add(1, Ordering::Relaxed),
            server_name: name.to_string(),
            session,
        };
        self.sessions.lock().insert(tracked.id, tracked.clone());
        info!(server = %name, session_id = tracked.id, "Persistent session started");
        Ok(tracked)
    }

    /// Disconnect and untrack a persistent session
    pub async fn release_session(&self, tracked: &TrackedSession) {
        let removed = self.sessions.lock().remove(&tracked.id);
        if removed.is_some() {
            disconnect_quietly(&tracked.server_name, tracked.session.as_ref()).await;
        }
    }

    /// Disconnect every tracked session and clear all registrations
    pub async fn shutdown(&self) {
        let sessions: Vec<TrackedSession> = self.sessions.lock().drain().map(|(_, s)| s).collect();
        info!(sessions = sessions.len(), "Shutting down server registry");

        futures::future::join_all(
            sessions
                .iter()
                .map(|s| disconnect_quietly(&s.server_name, s.session.as_ref())),
        )
        .await;

        self.entries.write().clear();
    }

    fn resolve(&self, name: &str) -> Result<ResolvedServer> {
        let entries = self.entries.read();
        let entry = entries
            .get(name)
            .ok_or_else(|| LifecycleError::UnknownServer(name.to_string()))?;
        if !entry.enabled {
            return Err(LifecycleError::ServerDisabled(name.to_string()));
        }
        Ok(ResolvedServer {
            config: entry.config.clone(),
            init_hook: entry.init_hook.clone(),
            circuit_breaker: entry.circuit_breaker.clone(),
        })
    }

    fn create_session(&self, name: &str, options: &InitOptions) -> Result<Arc<dyn Session>> {
        let factory = options.factory.as_ref().unwrap_or(&self.default_factory);
        factory.create(name, options.session_id.as_deref())
    }

    async fn prepare_session(
        &self,
        name: &str,
        server: &ResolvedServer,
        session: &Arc<dyn Session>,
        options: &InitOptions,
    ) -> Result<()> {
        if let Some(hook) = options.init_hook.as_ref().or(server.init_hook.as_ref()) {
            hook.on_session_created(session, name).await?;
        }

        let result = if options.use_circuit_breaker {
            server
                .circuit_breaker
                .execute(|| connect_within_scope(name, server, session, options))
                .await
        } else {
            connect_within_scope(name, server, session, options).await
        };
        if let Err(ref e) = result {
            debug!(server = %name, error = %e, "Connect attempt failed");
        }
        result
    }
}

/// Connect `session`, bounded by the connect timeout and parent scope
///
/// A lost timeout race surfaces as [`LifecycleError::OperationTimeout`] so the
/// breaker counts it; an aborted parent stays [`LifecycleError::Aborted`].
async fn connect_within_scope(
    name: &str,
    server: &ResolvedServer,
    session: &Arc<dyn Session>,
    options: &InitOptions,
) -> Result<()> {
    if options.connect_timeout.is_none() && options.abort.is_none() {
        return session.connect(&server.config, name).await;
    }

    let config = AbortConfig::labeled(format!("connect:{name}"));
    let scope = match &options.abort {
        Some(parent) => parent.create_child(config),
        None => AbortManager::new(config),
    };
    if let Some(timeout) = options.connect_timeout {
        scope.with_timeout(timeout);
    }

    let result = scope
        .race(session.connect(&server.config, name), "connect aborted")
        .await;
    scope.dispose();
    let parent_aborted = options.abort.as_ref().is_some_and(AbortManager::is_aborted);
    match (result, options.connect_timeout) {
        (Err(LifecycleError::Aborted { .. }), Some(timeout)) if !parent_aborted => {
            Err(LifecycleError::OperationTimeout {
                operation: format!("connect to '{name}'"),
                timeout,
            })
        }
        (result, _) => result.and_then(|inner| inner),
    }
}
