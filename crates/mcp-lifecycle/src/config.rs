//! Server configuration types and validation
//!
//! A [`ServerConfig`] is a transport-discriminated union plus the fields every
//! transport shares. The JSON shape is flat, with the variant selected by the
//! `"transport"` key:
//!
//! ```json
//! { "transport": "stdio", "command": "npx", "args": ["-y", "server-fs"], "timeout": 30000 }
//! { "transport": "http", "url": "https://tools.example.com/mcp", "auth": { "type": "bearer", "token": "..." } }
//! ```
//!
//! Configs are validated once, at registration, against [`LifecycleSettings`];
//! a rejected config never enters the registry.

use std::collections::HashMap;
use std::time::Duration;

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::error::ConfigValidationError;

/// Default per-server timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;
/// Lower bound for per-server timeouts in milliseconds
pub const MIN_TIMEOUT_MS: u64 = 5_000;
/// Upper bound for per-server timeouts in milliseconds
pub const MAX_TIMEOUT_MS: u64 = 300_000;

const HTTP_SCHEMES: &[&str] = &["http", "https"];
const WS_SCHEMES: &[&str] = &["ws", "wss"];

/// Configuration for one MCP server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Transport selection and transport-specific settings
    #[serde(flatten)]
    pub transport: TransportConfig,

    /// Request timeout in milliseconds; `None` takes the registry default
    #[serde(rename = "timeout", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,

    /// Optional credentials for remote transports
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    /// Filesystem roots advertised to the server
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roots: Vec<Root>,
}

/// Transport-specific configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Child process speaking newline-delimited JSON over stdin/stdout
    Stdio {
        /// Command to execute (e.g., "npx", "python")
        command: String,
        /// Command arguments
        #[serde(default)]
        args: Vec<String>,
        /// Extra environment variables
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        env: HashMap<String, String>,
        /// Working directory
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<String>,
    },
    /// Legacy HTTP + Server-Sent Events transport
    Sse {
        /// Event stream URL
        url: String,
        /// Extra request headers
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    /// Streamable HTTP transport
    Http {
        /// Endpoint URL
        url: String,
        /// Extra request headers
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
    /// WebSocket transport
    Websocket {
        /// WebSocket URL (ws:// or wss://)
        url: String,
        /// Extra handshake headers
        #[serde(default, skip_serializing_if = "HashMap::is_empty")]
        headers: HashMap<String, String>,
    },
}

/// Credentials for remote transports
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum AuthConfig {
    /// `Authorization: Bearer <token>`
    Bearer {
        /// Bearer token
        token: String,
    },
    /// `Authorization: Basic <base64(username:password)>`
    Basic {
        /// User name
        username: String,
        /// Password
        password: String,
    },
}

/// A filesystem root the client exposes to the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Root {
    /// `file://` URI of the root
    pub uri: String,
    /// Display name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl TransportConfig {
    /// Short transport name, matching the serialized tag
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Stdio { .. } => "stdio",
            Self::Sse { .. } => "sse",
            Self::Http { .. } => "http",
            Self::Websocket { .. } => "websocket",
        }
    }
}

impl AuthConfig {
    /// Value of the `Authorization` header
    pub fn header_value(&self) -> String {
        match self {
            Self::Bearer { token } => format!("Bearer {token}"),
            Self::Basic { username, password } => {
                format!("Basic {}", STANDARD.encode(format!("{username}:{password}")))
            }
        }
    }
}

impl ServerConfig {
    /// Stdio server with default timeout
    pub fn stdio(command: impl Into<String>, args: Vec<String>) -> Self {
        Self::from_transport(TransportConfig::Stdio {
            command: command.into(),
            args,
            env: HashMap::new(),
            cwd: None,
        })
    }

    /// Streamable HTTP server with default timeout
    pub fn http(url: impl Into<String>) -> Self {
        Self::from_transport(TransportConfig::Http {
            url: url.into(),
            headers: HashMap::new(),
        })
    }

    /// SSE server with default timeout
    pub fn sse(url: impl Into<String>) -> Self {
        Self::from_transport(TransportConfig::Sse {
            url: url.into(),
            headers: HashMap::new(),
        })
    }

    /// WebSocket server with default timeout
    pub fn websocket(url: impl Into<String>) -> Self {
        Self::from_transport(TransportConfig::Websocket {
            url: url.into(),
            headers: HashMap::new(),
        })
    }

    fn from_transport(transport: TransportConfig) -> Self {
        Self {
            transport,
            timeout_ms: None,
            auth: None,
            roots: Vec::new(),
        }
    }

    /// Set the request timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    /// Set credentials
    #[must_use]
    pub fn with_auth(mut self, auth: AuthConfig) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Add a filesystem root
    #[must_use]
    pub fn with_root(mut self, uri: impl Into<String>, name: Option<String>) -> Self {
        self.roots.push(Root {
            uri: uri.into(),
            name,
        });
        self
    }

    /// Request timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(DEFAULT_TIMEOUT_MS))
    }

    /// Copy of this config with an unset timeout filled from `settings`
    #[must_use]
    pub fn resolved(&self, settings: &LifecycleSettings) -> Self {
        let mut config = self.clone();
        config
            .timeout_ms
            .get_or_insert(settings.default_timeout.as_millis() as u64);
        config
    }

    /// Parse a raw JSON value into a config
    ///
    /// # Errors
    ///
    /// Returns [`ConfigValidationError::Malformed`] if the value does not match
    /// any transport variant. The parsed config is not yet bounds-checked; see
    /// [`ServerConfig::validate`].
    pub fn from_json(value: serde_json::Value) -> Result<Self, ConfigValidationError> {
        serde_json::from_value(value).map_err(|e| ConfigValidationError::Malformed(e.to_string()))
    }

    /// Validate the config against the given settings
    ///
    /// # Errors
    ///
    /// Returns the first problem found: empty command, unparsable URL, wrong URL
    /// scheme for the transport, timeout outside `[min_timeout, max_timeout]`,
    /// incomplete auth, or a non-`file://` root.
    pub fn validate(&self, settings: &LifecycleSettings) -> Result<(), ConfigValidationError> {
        match &self.transport {
            TransportConfig::Stdio { command, .. } => {
                if command.trim().is_empty() {
                    return Err(ConfigValidationError::EmptyCommand);
                }
            }
            TransportConfig::Sse { url, .. } => validate_url(url, "sse", HTTP_SCHEMES)?,
            TransportConfig::Http { url, .. } => validate_url(url, "http", HTTP_SCHEMES)?,
            TransportConfig::Websocket { url, .. } => {
                validate_url(url, "websocket", WS_SCHEMES)?;
            }
        }

        let min_ms = settings.min_timeout.as_millis() as u64;
        let max_ms = settings.max_timeout.as_millis() as u64;
        if let Some(timeout_ms) = self.timeout_ms
            && (timeout_ms < min_ms || timeout_ms > max_ms)
        {
            return Err(ConfigValidationError::TimeoutOutOfBounds {
                timeout_ms,
                min_ms,
                max_ms,
            });
        }

        match &self.auth {
            Some(AuthConfig::Bearer { token }) if token.is_empty() => {
                return Err(ConfigValidationError::InvalidAuth(
                    "bearer token cannot be empty".to_string(),
                ));
            }
            Some(AuthConfig::Basic { username, .. }) if username.is_empty() => {
                return Err(ConfigValidationError::InvalidAuth(
                    "basic auth username cannot be empty".to_string(),
                ));
            }
            _ => {}
        }

        for root in &self.roots {
            if !root.uri.starts_with("file://") {
                return Err(ConfigValidationError::InvalidRoot(root.uri.clone()));
            }
        }

        Ok(())
    }
}

fn validate_url(
    raw: &str,
    transport: &'static str,
    expected: &'static [&'static str],
) -> Result<(), ConfigValidationError> {
    let url = Url::parse(raw).map_err(|e| ConfigValidationError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;

    if !expected.contains(&url.scheme()) {
        return Err(ConfigValidationError::UnsupportedScheme {
            transport,
            scheme: url.scheme().to_string(),
            expected,
        });
    }
    Ok(())
}

/// Policy applied when a server fails to connect during startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionMode {
    /// A connect failure aborts the whole startup
    #[default]
    Strict,
    /// A connect failure is logged and the server is left out of the active set
    Lenient,
}

impl std::str::FromStr for ConnectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lenient" => Ok(Self::Lenient),
            other => Err(format!("unknown connection mode '{other}'")),
        }
    }
}

/// Process-wide tunables consumed by the registry and facade
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleSettings {
    /// Smallest accepted per-server timeout
    pub min_timeout: Duration,
    /// Largest accepted per-server timeout
    pub max_timeout: Duration,
    /// Timeout applied when a config omits one
    pub default_timeout: Duration,
    /// Startup failure policy
    pub connection_mode: ConnectionMode,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            min_timeout: Duration::from_millis(MIN_TIMEOUT_MS),
            max_timeout: Duration::from_millis(MAX_TIMEOUT_MS),
            default_timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            connection_mode: ConnectionMode::Strict,
        }
    }
}

impl LifecycleSettings {
    /// Environment variable for the lower timeout bound (milliseconds)
    pub const ENV_TIMEOUT_MIN: &'static str = "MCP_TIMEOUT_MIN_MS";
    /// Environment variable for the upper timeout bound (milliseconds)
    pub const ENV_TIMEOUT_MAX: &'static str = "MCP_TIMEOUT_MAX_MS";
    /// Environment variable for the default timeout (milliseconds)
    pub const ENV_DEFAULT_TIMEOUT: &'static str = "MCP_DEFAULT_TIMEOUT_MS";
    /// Environment variable for the connection mode (`strict` or `lenient`)
    pub const ENV_CONNECTION_MODE: &'static str = "MCP_CONNECTION_MODE";

    /// Create settings with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Read settings from the environment, falling back to defaults
    ///
    /// Unparsable values and inverted bounds are logged and ignored.
    pub fn from_env() -> Self {
        let mut settings = Self::default();

        if let Some(ms) = env_millis(Self::ENV_TIMEOUT_MIN) {
            settings.min_timeout = ms;
        }
        if let Some(ms) = env_millis(Self::ENV_TIMEOUT_MAX) {
            settings.max_timeout = ms;
        }
        if settings.min_timeout > settings.max_timeout {
            warn!(
                min_ms = settings.min_timeout.as_millis() as u64,
                max_ms = settings.max_timeout.as_millis() as u64,
                "Timeout bounds are inverted, using defaults"
            );
            settings.min_timeout = Duration::from_millis(MIN_TIMEOUT_MS);
            settings.max_timeout = Duration::from_millis(MAX_TIMEOUT_MS);
        }
        if let Some(ms) = env_millis(Self::ENV_DEFAULT_TIMEOUT) {
            settings.default_timeout = ms;
        }
        settings.default_timeout = settings
            .default_timeout
            .clamp(settings.min_timeout, settings.max_timeout);

        if let Ok(raw) = std::env::var(Self::ENV_CONNECTION_MODE) {
            match raw.parse() {
                Ok(mode) => settings.connection_mode = mode,
                Err(e) => warn!(error = %e, "Ignoring {}", Self::ENV_CONNECTION_MODE),
            }
        }

        settings
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            warn!(key, value = %raw, error = %e, "Ignoring unparsable timeout");
            None
        }
    }
}
