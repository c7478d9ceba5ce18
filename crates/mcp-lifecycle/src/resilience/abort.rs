//! Hierarchical cancellation with guaranteed cleanup
//!
//! An [`AbortManager`] is one node in a cancellation tree. Each node owns a
//! [`CancellationToken`], an ordered list of cleanup callbacks and its live
//! children. Aborting a node:
//!
//! 1. stops its timeout timer,
//! 2. cancels its token,
//! 3. aborts every child, depth-first,
//! 4. runs its own cleanups, each isolated so one failing callback never
//!    prevents the others from running.
//!
//! `abort` is idempotent: the first reason wins and later calls are no-ops.

use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

use crate::error::{LifecycleError, Result};

static NEXT_NODE_ID: AtomicU64 = AtomicU64::new(1);

/// Cleanup callback run when a scope is aborted
pub type CleanupFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// Configuration for an abort scope
#[derive(Debug, Clone, Default)]
pub struct AbortConfig {
    /// Label used in log events
    pub label: Option<String>,
    /// Abort automatically after this long
    pub timeout: Option<Duration>,
    /// Run cleanups newest-first instead of registration order
    pub reverse_cleanup: bool,
}

impl AbortConfig {
    /// Config with a label
    pub fn labeled(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
            ..Self::default()
        }
    }

    /// Set the auto-abort timeout
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[derive(Default)]
struct NodeState {
    aborted: bool,
    reason: Option<String>,
    next_cleanup_id: u64,
    cleanups: Vec<(u64, CleanupFn)>,
    children: Vec<(u64, AbortManager)>,
    timer: Option<JoinHandle<()>>,
    detached: bool,
    /// Cleanups this scope registered on the scopes it was combined from
    links: Vec<CleanupHandle>,
}

struct AbortNode {
    id: u64,
    label: String,
    reverse_cleanup: bool,
    token: CancellationToken,
    parent: Option<Weak<AbortNode>>,
    state: Mutex<NodeState>,
}

impl Drop for AbortNode {
    fn drop(&mut self) {
        for link in std::mem::take(&mut self.state.get_mut().links) {
            link.dispose();
        }
    }
}

/// Node in a cancellation tree
///
/// Cloning is cheap and yields a handle to the same node.
#[derive(Clone)]
pub struct AbortManager {
    node: Arc<AbortNode>,
}

impl std::fmt::Debug for AbortManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.node.state.lock();
        f.debug_struct("AbortManager")
            .field("label", &self.node.label)
            .field("aborted", &state.aborted)
            .field("reason", &state.reason)
            .field("children", &state.children.len())
            .field("cleanups", &state.cleanups.len())
            .finish()
    }
}

/// Handle returned by [`AbortManager::add_cleanup`]
///
/// Disposing removes the callback without running it.
#[derive(Debug)]
pub struct CleanupHandle {
    node: Weak<AbortNode>,
    id: u64,
}

impl CleanupHandle {
    /// Remove the callback; returns `false` if it already ran or was removed
    pub fn dispose(self) -> bool {
        let Some(node) = self.node.upgrade() else {
            return false;
        };
        let mut state = node.state.lock();
        let before = state.cleanups.len();
        state.cleanups.retain(|(id, _)| *id != self.id);
        state.cleanups.len() != before
    }
}

impl Default for AbortManager {
    fn default() -> Self {
        Self::new(AbortConfig::default())
    }
}

impl AbortManager {
    /// Create a root scope
    ///
    /// A configured timeout spawns a timer, so this must run inside a Tokio
    /// runtime when `config.timeout` is set.
    pub fn new(config: AbortConfig) -> Self {
        Self::build(config, CancellationToken::new(), None)
    }

    fn build(config: AbortConfig, token: CancellationToken, parent: Option<Weak<AbortNode>>) -> Self {
        let id = NEXT_NODE_ID.fetch_add(1, Ordering::Relaxed);
        let manager = Self {
            node: Arc::new(AbortNode {
                id,
                label: config.label.unwrap_or_else(|| format!("scope-{id}")),
                reverse_cleanup: config.reverse_cleanup,
                token,
                parent,
                state: Mutex::new(NodeState::default()),
            }),
        };
        if let Some(timeout) = config.timeout {
            manager.arm_timer(timeout);
        }
        manager
    }

    /// Label used in log events
    pub fn label(&self) -> &str {
        &self.node.label
    }

    /// Cancellation token that fires when this scope aborts
    pub fn token(&self) -> CancellationToken {
        self.node.token.clone()
    }

    /// Whether the scope has been aborted
    pub fn is_aborted(&self) -> bool {
        self.node.state.lock().aborted
    }

    /// Reason passed to the first `abort` call
    pub fn reason(&self) -> Option<String> {
        self.node.state.lock().reason.clone()
    }

    /// Number of live children
    pub fn child_count(&self) -> usize {
        self.node.state.lock().children.len()
    }

    /// Resolves once the scope is aborted
    pub async fn aborted(&self) {
        self.node.token.cancelled().await;
    }

    /// Abort this scope and all of its descendants
    ///
    /// Cleanup errors and panics are logged and never propagated.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        let (timer, children, mut cleanups, links) = {
            let mut state = self.node.state.lock();
            if state.aborted {
                trace!(scope = %self.node.label, "Abort ignored, scope already aborted");
                return;
            }
            state.aborted = true;
            state.reason = Some(reason.clone());
            (
                state.timer.take(),
                std::mem::take(&mut state.children),
                std::mem::take(&mut state.cleanups),
                std::mem::take(&mut state.links),
            )
        };

        debug!(scope = %self.node.label, reason = %reason, children = children.len(), "Aborting scope");

        if let Some(timer) = timer {
            timer.abort();
        }
        self.node.token.cancel();
        for link in links {
            link.dispose();
        }

        for (_, child) in children {
            child.abort(reason.clone());
        }

        if self.node.reverse_cleanup {
            cleanups.reverse();
        }
        for (_, cleanup) in cleanups {
            self.run_cleanup(cleanup);
        }
    }

    /// Register a cleanup to run on abort
    ///
    /// Runs `cleanup` immediately if the scope is already aborted.
    pub fn add_cleanup<F>(&self, cleanup: F) -> CleanupHandle
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        let id = {
            let mut state = self.node.state.lock();
            let id = state.next_cleanup_id;
            state.next_cleanup_id += 1;
            if !state.aborted {
                state.cleanups.push((id, Box::new(cleanup)));
                return CleanupHandle {
                    node: Arc::downgrade(&self.node),
                    id,
                };
            }
            id
        };

        self.run_cleanup(Box::new(cleanup));
        CleanupHandle {
            node: Weak::new(),
            id,
        }
    }

    /// Create a child scope that aborts with this one
    ///
    /// The child deregisters itself from this scope when it is aborted or
    /// disposed. A child of an already-aborted scope starts aborted.
    pub fn create_child(&self, config: AbortConfig) -> AbortManager {
        let child = Self::build(
            config,
            self.node.token.child_token(),
            Some(Arc::downgrade(&self.node)),
        );

        let parent_reason = {
            let mut state = self.node.state.lock();
            if state.aborted {
                state.reason.clone()
            } else {
                state.children.push((child.node.id, child.clone()));
                None
            }
        };

        match parent_reason {
            Some(reason) => child.abort(reason),
            None => {
                let parent = Arc::downgrade(&self.node);
                let child_id = child.node.id;
                child.add_cleanup(move || {
                    if let Some(parent) = parent.upgrade() {
                        parent.state.lock().children.retain(|(id, _)| *id != child_id);
                    }
                    Ok(())
                });
            }
        }
        child
    }

    /// Release the scope after normal completion
    ///
    /// Stops the timer, drops pending cleanups without running them and
    /// detaches from the parent and from any combined sources. Has no effect
    /// on an aborted scope.
    pub fn dispose(&self) {
        let (timer, links) = {
            let mut state = self.node.state.lock();
            if state.aborted || state.detached {
                return;
            }
            state.detached = true;
            state.cleanups.clear();
            (state.timer.take(), std::mem::take(&mut state.links))
        };
        if let Some(timer) = timer {
            timer.abort();
        }
        for link in links {
            link.dispose();
        }
        if let Some(parent) = self.node.parent.as_ref().and_then(Weak::upgrade) {
            parent
                .state
                .lock()
                .children
                .retain(|(id, _)| *id != self.node.id);
        }
    }

    /// Run `operation` inside the scope
    ///
    /// `cleanup`, if given, is registered for the duration of the call and
    /// runs only if the scope aborts while the call is in flight.
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Aborted`] if the scope is already aborted or
    /// aborts before `operation` completes; otherwise `operation`'s result.
    pub async fn execute<Fut, T, C>(&self, operation: Fut, cleanup: Option<C>) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
        C: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        if let Some(reason) = self.abort_reason() {
            return Err(LifecycleError::aborted(reason));
        }

        let handle = cleanup.map(|c| self.add_cleanup(c));
        let result = self.race(operation, "operation aborted").await;
        if let Some(handle) = handle {
            handle.dispose();
        }
        result.and_then(|inner| inner)
    }

    /// Race `future` against this scope's abort
    ///
    /// # Errors
    ///
    /// Returns [`LifecycleError::Aborted`] with the abort reason (or `message`
    /// if none was recorded) when the scope aborts first.
    pub async fn race<Fut, T>(&self, future: Fut, message: &str) -> Result<T>
    where
        Fut: Future<Output = T>,
    {
        tokio::select! {
            biased;
            () = self.node.token.cancelled() => {
                Err(LifecycleError::aborted(self.inherited_reason().unwrap_or_else(|| message.to_string())))
            }
            value = future => Ok(value),
        }
    }

    /// Scope that aborts as soon as any of `managers` aborts
    ///
    /// The hooks placed on the sources are removed once the combined scope
    /// aborts, is disposed or is dropped.
    pub fn combine(managers: &[AbortManager]) -> AbortManager {
        let combined = AbortManager::new(AbortConfig::labeled("combined"));
        let mut links = Vec::with_capacity(managers.len());

        for source in managers {
            let target = Arc::downgrade(&combined.node);
            let origin = Arc::downgrade(&source.node);
            links.push(source.add_cleanup(move || {
                if let Some(target) = target.upgrade() {
                    let reason = origin
                        .upgrade()
                        .and_then(|o| o.state.lock().reason.clone())
                        .unwrap_or_else(|| "combined source aborted".to_string());
                    AbortManager { node: target }.abort(reason);
                }
                Ok(())
            }));
            if combined.is_aborted() {
                break;
            }
        }

        let stale = {
            let mut state = combined.node.state.lock();
            if state.aborted {
                links
            } else {
                state.links.extend(links);
                Vec::new()
            }
        };
        for link in stale {
            link.dispose();
        }
        combined
    }

    /// Abort automatically after `timeout`
    ///
    /// Replaces any timer already armed on this scope.
    pub fn with_timeout(&self, timeout: Duration) -> &Self {
        self.arm_timer(timeout);
        self
    }

    fn arm_timer(&self, timeout: Duration) {
        let weak = Arc::downgrade(&self.node);
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(node) = weak.upgrade() {
                AbortManager { node }.abort(format!("timed out after {timeout:?}"));
            }
        });

        let previous = {
            let mut state = self.node.state.lock();
            if state.aborted {
                timer.abort();
                return;
            }
            state.timer.replace(timer)
        };
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Own reason, or the nearest aborted ancestor's while its abort is
    /// still cascading down to this scope
    fn inherited_reason(&self) -> Option<String> {
        if let Some(reason) = self.reason() {
            return Some(reason);
        }
        let mut ancestor = self.node.parent.as_ref().and_then(Weak::upgrade);
        while let Some(node) = ancestor {
            if let Some(reason) = node.state.lock().reason.clone() {
                return Some(reason);
            }
            ancestor = node.parent.as_ref().and_then(Weak::upgrade);
        }
        None
    }

    fn abort_reason(&self) -> Option<String> {
        let state = self.node.state.lock();
        state.aborted.then(|| state.reason.clone().unwrap_or_default())
    }

    fn run_cleanup(&self, cleanup: CleanupFn) {
        match catch_unwind(AssertUnwindSafe(cleanup)) {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                error!(scope = %self.node.label, error = %e, "Cleanup callback failed");
            }
            Err(_) => {
                error!(scope = %self.node.label, "Cleanup callback panicked");
            }
        }
    }
}
