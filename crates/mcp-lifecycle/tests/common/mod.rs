//! Common test utilities for integration tests
//!
//! Scripted in-memory sessions and a factory that records every session it
//! hands out, so tests can assert connect/disconnect counts.

#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mcp_lifecycle::{
    LifecycleError, PromptDescriptor, ResourceDescriptor, Result, ServerConfig, Session, SessionFactory,
    ToolDescriptor,
};
use parking_lot::Mutex;

/// How a scripted server behaves
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    pub fail_connect: bool,
    pub fail_disconnect: bool,
    pub fail_tools: bool,
    pub connect_delay: Option<Duration>,
    pub tools: Vec<&'static str>,
}

pub struct ScriptedSession {
    pub server: String,
    pub behavior: Behavior,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub tool_calls: AtomicUsize,
}

impl ScriptedSession {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Session for ScriptedSession {
    async fn connect(&self, _config: &ServerConfig, server_name: &str) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.behavior.connect_delay {
            tokio::time::sleep(delay).await;
        }
        if self.behavior.fail_connect {
            return Err(LifecycleError::connection(server_name, "connection refused"));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.behavior.fail_disconnect {
            return Err(LifecycleError::connection(&self.server, "broken pipe"));
        }
        Ok(())
    }

    async fn get_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.tool_calls.fetch_add(1, Ordering::SeqCst);
        if self.behavior.fail_tools {
            return Err(LifecycleError::session(&self.server, "tools/list failed"));
        }
        Ok(self.behavior.tools.iter().map(|name| ToolDescriptor::new(*name)).collect())
    }

    async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>> {
        Ok(Vec::new())
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        Ok(Vec::new())
    }
}

/// Factory handing out [`ScriptedSession`]s, per-server behavior overridable
#[derive(Default)]
pub struct ScriptedFactory {
    default: Behavior,
    overrides: Mutex<Vec<(String, Behavior)>>,
    created: Mutex<Vec<Arc<ScriptedSession>>>,
}

impl ScriptedFactory {
    pub fn new(default: Behavior) -> Arc<Self> {
        Arc::new(Self {
            default,
            ..Self::default()
        })
    }

    pub fn healthy() -> Arc<Self> {
        Self::new(Behavior {
            tools: vec!["echo"],
            ..Behavior::default()
        })
    }

    pub fn set_behavior(&self, server: &str, behavior: Behavior) {
        let mut overrides = self.overrides.lock();
        overrides.retain(|(name, _)| name != server);
        overrides.push((server.to_string(), behavior));
    }

    pub fn sessions(&self) -> Vec<Arc<ScriptedSession>> {
        self.created.lock().clone()
    }

    pub fn sessions_for(&self, server: &str) -> Vec<Arc<ScriptedSession>> {
        self.created
            .lock()
            .iter()
            .filter(|s| s.server == server)
            .cloned()
            .collect()
    }

    pub fn created_servers(&self) -> HashSet<String> {
        self.created.lock().iter().map(|s| s.server.clone()).collect()
    }

    pub fn total_disconnects(&self) -> usize {
        self.created.lock().iter().map(|s| s.disconnects()).sum()
    }
}

impl SessionFactory for ScriptedFactory {
    fn create(&self, server_name: &str, _session_id: Option<&str>) -> Result<Arc<dyn Session>> {
        let behavior = self
            .overrides
            .lock()
            .iter()
            .find(|(name, _)| name == server_name)
            .map(|(_, b)| b.clone())
            .unwrap_or_else(|| self.default.clone());
        let session = Arc::new(ScriptedSession {
            server: server_name.to_string(),
            behavior,
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
            tool_calls: AtomicUsize::new(0),
        });
        self.created.lock().push(session.clone());
        Ok(session)
    }
}

/// Stdio config that is never actually spawned by scripted factories
pub fn stdio(name: &str) -> ServerConfig {
    ServerConfig::stdio(format!("{name}-mcp"), vec![])
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("mcp_lifecycle=debug")
        .try_init();
}
