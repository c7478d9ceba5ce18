//! Protocol session capability
//!
//! The lifecycle layer never speaks MCP itself. It drives sessions through the
//! [`Session`] trait and obtains them from a [`SessionFactory`]. When no
//! factory is injected the registry falls back to [`RpcSessionFactory`], a
//! thin JSON-RPC client for stdio, HTTP and WebSocket servers.

pub mod child_process;
pub mod rpc;
#[cfg(test)]
pub(crate) mod testing;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::ServerConfig;
use crate::error::Result;

pub use child_process::{ChildProcess, ChildProcessConfig};
pub use rpc::{RpcSession, RpcSessionFactory};

/// Tool advertised by a server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
    /// Tool name
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema of the tool's arguments
    #[serde(default)]
    pub input_schema: Value,
}

impl ToolDescriptor {
    /// Tool with a name and an empty object schema
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            input_schema: serde_json::json!({ "type": "object" }),
        }
    }
}

/// Argument accepted by a prompt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptArgument {
    /// Argument name
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Whether the argument must be supplied
    #[serde(default)]
    pub required: bool,
}

/// Prompt advertised by a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptDescriptor {
    /// Prompt name
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Accepted arguments
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgument>,
}

/// Resource advertised by a server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDescriptor {
    /// Resource URI
    pub uri: String,
    /// Display name
    pub name: String,
    /// Human-readable description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// MIME type of the resource contents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// A protocol session with one MCP server
///
/// Implementations must tolerate `disconnect` on a session that never
/// connected or already disconnected.
#[async_trait]
pub trait Session: Send + Sync {
    /// Open the transport and perform the protocol handshake
    async fn connect(&self, config: &ServerConfig, server_name: &str) -> Result<()>;

    /// Close the transport
    async fn disconnect(&self) -> Result<()>;

    /// List the server's tools
    async fn get_tools(&self) -> Result<Vec<ToolDescriptor>>;

    /// List the server's prompts
    async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>>;

    /// List the server's resources
    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>>;
}

/// Produces unconnected sessions
pub trait SessionFactory: Send + Sync {
    /// Create a session for `server_name`
    ///
    /// # Errors
    ///
    /// Returns an error if the session cannot be constructed.
    fn create(&self, server_name: &str, session_id: Option<&str>) -> Result<Arc<dyn Session>>;
}

impl<F> SessionFactory for F
where
    F: Fn(&str, Option<&str>) -> Result<Arc<dyn Session>> + Send + Sync,
{
    fn create(&self, server_name: &str, session_id: Option<&str>) -> Result<Arc<dyn Session>> {
        self(server_name, session_id)
    }
}

/// Wrap a closure as a shared [`SessionFactory`]
pub fn session_factory<F>(factory: F) -> Arc<dyn SessionFactory>
where
    F: Fn(&str, Option<&str>) -> Result<Arc<dyn Session>> + Send + Sync + 'static,
{
    Arc::new(factory)
}

/// Hook run on a freshly created session before it connects
#[async_trait]
pub trait SessionInitHook: Send + Sync {
    /// Prepare `session` for `server_name`
    ///
    /// # Errors
    ///
    /// An error aborts the acquisition; the session is never connected.
    async fn on_session_created(&self, session: &Arc<dyn Session>, server_name: &str) -> Result<()>;
}
