//! In-memory backend plugin
//!
//! Keeps workspace state and locks in a process-local map. Nothing is durable;
//! this exists for tests and for embedding Drydock without a plugin process.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;

use super::BackendPlugin;
use super::protocol::ops;
use crate::backend::{BackendError, BackendResult, DEFAULT_WORKSPACE};
use crate::lock::LockInfo;
use crate::state::{StateFile, StatePayload};

/// In-memory implementation of [`BackendPlugin`]
///
/// Every call yields to the runtime before touching the map, so concurrent
/// callers interleave the way they would against a remote store.
#[derive(Default)]
pub struct MemoryPlugin {
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    states: BTreeMap<String, Vec<u8>>,
    locks: HashMap<String, HeldLock>,
    config: Option<HashMap<String, String>>,
    puts: usize,
}

struct HeldLock {
    token: String,
    info: LockInfo,
}

impl MemoryPlugin {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a state document directly, bypassing locks
    pub fn insert_state(&self, workspace: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.inner().states.insert(workspace.into(), data.into());
    }

    /// The stored state document for a workspace
    pub fn state(&self, workspace: &str) -> Option<Vec<u8>> {
        self.inner().states.get(workspace).cloned()
    }

    /// How many successful `put_state` calls have been made
    pub fn put_count(&self) -> usize {
        self.inner().puts
    }

    /// Who holds the lock on a workspace, if anyone
    pub fn lock_holder(&self, workspace: &str) -> Option<LockInfo> {
        self.inner()
            .locks
            .get(workspace)
            .map(|held| held.info.clone())
    }

    /// The configuration passed to `configure`, if it has been called
    pub fn configuration(&self) -> Option<HashMap<String, String>> {
        self.inner().config.clone()
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        // A panic while holding the guard cannot leave the map half-updated
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl BackendPlugin for MemoryPlugin {
    async fn list_workspaces(&self) -> BackendResult<Vec<String>> {
        tokio::task::yield_now().await;
        Ok(self.inner().states.keys().cloned().collect())
    }

    async fn delete_workspace(&self, workspace: &str, force: bool) -> BackendResult<()> {
        tokio::task::yield_now().await;
        let mut inner = self.inner();

        if workspace == DEFAULT_WORKSPACE {
            return Err(BackendError::protocol(
                ops::DELETE_WORKSPACE,
                "cannot delete the default workspace",
            ));
        }
        if let Some(held) = inner.locks.get(workspace) {
            return Err(BackendError::locked(workspace, &held.info));
        }
        let Some(data) = inner.states.get(workspace) else {
            return Err(BackendError::protocol(
                ops::DELETE_WORKSPACE,
                format!("workspace {} does not exist", workspace),
            ));
        };
        let empty = StateFile::from_bytes(data)
            .map(|state| state.is_empty())
            .unwrap_or(false);
        if !empty && !force {
            return Err(BackendError::protocol(
                ops::DELETE_WORKSPACE,
                format!("workspace {} is not empty", workspace),
            ));
        }

        inner.states.remove(workspace);
        Ok(())
    }

    async fn configure(&self, config: &HashMap<String, String>) -> BackendResult<()> {
        tokio::task::yield_now().await;
        self.inner().config = Some(config.clone());
        Ok(())
    }

    async fn get_state_payload(&self, workspace: &str) -> BackendResult<Option<StatePayload>> {
        tokio::task::yield_now().await;
        Ok(self
            .inner()
            .states
            .get(workspace)
            .map(|data| StatePayload::new(data.clone())))
    }

    async fn put_state(&self, workspace: &str, data: &[u8]) -> BackendResult<()> {
        tokio::task::yield_now().await;
        let mut inner = self.inner();
        inner.states.insert(workspace.to_string(), data.to_vec());
        inner.puts += 1;
        Ok(())
    }

    async fn delete_state(&self, workspace: &str) -> BackendResult<()> {
        tokio::task::yield_now().await;
        self.inner().states.remove(workspace);
        Ok(())
    }

    async fn lock_state(&self, workspace: &str, info: &LockInfo) -> BackendResult<String> {
        tokio::task::yield_now().await;
        let mut inner = self.inner();

        if let Some(held) = inner.locks.get(workspace) {
            return Err(BackendError::locked(workspace, &held.info));
        }

        let token = uuid::Uuid::new_v4().to_string();
        inner.locks.insert(
            workspace.to_string(),
            HeldLock {
                token: token.clone(),
                info: info.clone(),
            },
        );
        Ok(token)
    }

    async fn unlock_state(&self, workspace: &str, token: &str) -> BackendResult<()> {
        tokio::task::yield_now().await;
        let mut inner = self.inner();

        let matches = match inner.locks.get(workspace) {
            Some(held) => held.token == token,
            None => return Err(BackendError::lock(workspace, "no lock is held")),
        };
        if !matches {
            return Err(BackendError::lock(
                workspace,
                format!("lock token mismatch: {} does not hold the lock", token),
            ));
        }

        inner.locks.remove(workspace);
        Ok(())
    }
}
