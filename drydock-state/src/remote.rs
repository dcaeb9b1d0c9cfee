//! Remote state manager
//!
//! [`StateClient`] is the per-workspace get/put/delete/lock/unlock contract a
//! storage backend fulfils. [`RemoteState`] layers an in-memory copy of the
//! state document on top of it, the way the rest of Drydock consumes state:
//! refresh, inspect, write, persist.

use async_trait::async_trait;
use log::{debug, error, info};

use crate::backend::{BackendError, BackendResult};
use crate::lock::LockInfo;
use crate::state::{StatePayload, content_hash};

/// Per-workspace access to stored state
#[async_trait]
pub trait StateClient: Send + Sync {
    /// Name of the workspace this client is bound to
    fn workspace(&self) -> &str;

    /// Fetch the stored state; `None` when nothing has been written
    async fn get(&self) -> BackendResult<Option<StatePayload>>;

    /// Replace the stored state
    async fn put(&self, data: &[u8]) -> BackendResult<()>;

    /// Remove the stored state
    async fn delete(&self) -> BackendResult<()>;

    /// Lock the workspace, returning the token needed to unlock it
    async fn lock(&self, info: &LockInfo) -> BackendResult<String>;

    /// Release a lock using the token returned by [`StateClient::lock`]
    async fn unlock(&self, token: &str) -> BackendResult<()>;
}

/// State manager for one workspace
pub struct RemoteState {
    client: Box<dyn StateClient>,
    /// In-memory copy of the state document
    data: Option<Vec<u8>>,
    /// Hash of what the store holds, as of the last refresh or persist
    stored_hash: Option<Vec<u8>>,
}

impl RemoteState {
    pub fn new(client: Box<dyn StateClient>) -> Self {
        Self {
            client,
            data: None,
            stored_hash: None,
        }
    }

    pub fn workspace(&self) -> &str {
        self.client.workspace()
    }

    /// Replace the in-memory copy with what the store currently holds
    pub async fn refresh_state(&mut self) -> BackendResult<()> {
        match self.client.get().await? {
            Some(payload) => {
                if !payload.verify() {
                    return Err(BackendError::state_io(
                        self.workspace(),
                        "refresh",
                        "state checksum mismatch",
                    ));
                }
                self.stored_hash = Some(payload.hash);
                self.data = Some(payload.data);
            }
            None => {
                self.stored_hash = None;
                self.data = None;
            }
        }
        Ok(())
    }

    /// The in-memory state document, if there is one
    pub fn state(&self) -> Option<&[u8]> {
        self.data.as_deref()
    }

    /// Replace the in-memory state document; call [`persist_state`] to store it
    ///
    /// [`persist_state`]: RemoteState::persist_state
    pub fn write_state(&mut self, data: Vec<u8>) {
        self.data = Some(data);
    }

    /// Store the in-memory state document
    ///
    /// Does nothing when there is no document or the store already holds
    /// exactly these bytes.
    pub async fn persist_state(&mut self) -> BackendResult<()> {
        let Some(data) = &self.data else {
            return Ok(());
        };

        let hash = content_hash(data);
        if self.stored_hash.as_ref() == Some(&hash) {
            debug!("state for workspace {} unchanged, skipping write", self.workspace());
            return Ok(());
        }

        self.client.put(data).await?;
        self.stored_hash = Some(hash);
        Ok(())
    }

    /// Delete the stored state and forget the in-memory copy
    pub async fn delete(&mut self) -> BackendResult<()> {
        self.client.delete().await?;
        self.data = None;
        self.stored_hash = None;
        Ok(())
    }

    pub async fn lock(&self, info: &LockInfo) -> BackendResult<String> {
        self.client.lock(info).await
    }

    pub async fn unlock(&self, token: &str) -> BackendResult<()> {
        self.client.unlock(token).await
    }

    /// Write an initial state document unless one already exists
    ///
    /// Takes the workspace lock (tagged with `operation`, with the workspace
    /// name as its path), re-reads the state under it, writes `initial()`
    /// only if nothing is stored, then releases the lock. Another actor that
    /// got there first wins: its state is kept.
    ///
    /// A lock failure is returned as-is before anything is touched. An unlock
    /// failure is returned in preference to any earlier read/write failure.
    /// Returns whether this call wrote the state.
    pub async fn ensure_initialized<F>(&mut self, operation: &str, initial: F) -> BackendResult<bool>
    where
        F: FnOnce() -> BackendResult<Vec<u8>> + Send,
    {
        let info = LockInfo::new(operation).with_path(self.workspace());
        let token = self.lock(&info).await?;

        let result = self.initialize_if_absent(initial).await;

        if let Err(unlock_err) = self.unlock(&token).await {
            if let Err(err) = &result {
                error!(
                    "failed to initialize workspace {} before unlock failed: {}",
                    self.workspace(),
                    err
                );
            }
            return Err(unlock_err);
        }
        result
    }

    async fn initialize_if_absent<F>(&mut self, initial: F) -> BackendResult<bool>
    where
        F: FnOnce() -> BackendResult<Vec<u8>> + Send,
    {
        self.refresh_state().await?;
        if self.state().is_some() {
            debug!("workspace {} already has state", self.workspace());
            return Ok(false);
        }

        self.write_state(initial()?);
        self.persist_state().await?;
        info!("initialized state for workspace {}", self.workspace());
        Ok(true)
    }
}
