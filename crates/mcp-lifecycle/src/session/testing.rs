//! In-memory sessions for unit tests

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::{PromptDescriptor, ResourceDescriptor, Session, SessionFactory, ToolDescriptor};
use crate::config::ServerConfig;
use crate::error::{LifecycleError, Result};

#[derive(Default)]
pub(crate) struct MockSession {
    pub server: String,
    pub connects: AtomicUsize,
    pub disconnects: AtomicUsize,
    pub tool_calls: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub fail_tools: AtomicBool,
    pub fail_disconnect: AtomicBool,
    pub connect_delay: Mutex<Option<Duration>>,
}

impl MockSession {
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnects(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Session for MockSession {
    async fn connect(&self, _config: &ServerConfig, server_name: &str) -> Result<()> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let delay = *self.connect_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(LifecycleError::connection(server_name, "connection refused"));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(LifecycleError::connection(&self.server, "broken pipe"));
        }
        Ok(())
    }

    async fn get_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.tool_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_tools.load(Ordering::SeqCst) {
            return Err(LifecycleError::session(&self.server, "tools/list failed"));
        }
        Ok(vec![ToolDescriptor::new("echo")])
    }

    async fn list_prompts(&self) -> Result<Vec<PromptDescriptor>> {
        Ok(Vec::new())
    }

    async fn list_resources(&self) -> Result<Vec<ResourceDescriptor>> {
        Ok(Vec::new())
    }
}

/// Factory recording every session it creates
#[derive(Default)]
pub(crate) struct MockFactory {
    pub created: Mutex<Vec<Arc<MockSession>>>,
    pub fail_connect: AtomicBool,
    pub fail_disconnect: AtomicBool,
    pub connect_delay: Mutex<Option<Duration>>,
}

impl MockFactory {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn sessions(&self) -> Vec<Arc<MockSession>> {
        self.created.lock().clone()
    }

    pub fn last(&self) -> Arc<MockSession> {
        self.created.lock().last().cloned().expect("no session created")
    }
}

impl SessionFactory for MockFactory {
    fn create(&self, server_name: &str, _session_id: Option<&str>) -> Result<Arc<dyn Session>> {
        let session = Arc::new(MockSession {
            server: server_name.to_string(),
            ..MockSession::default()
        });
        session
            .fail_connect
            .store(self.fail_connect.load(Ordering::SeqCst), Ordering::SeqCst);
        session
            .fail_disconnect
            .store(self.fail_disconnect.load(Ordering::SeqCst), Ordering::SeqCst);
        *session.connect_delay.lock() = *self.connect_delay.lock();
        self.created.lock().push(session.clone());
        Ok(session)
    }
}
