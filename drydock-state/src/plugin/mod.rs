//! Backend plugins: the operation set, its RPC transport and an in-memory fake
//!
//! A plugin is an external process that owns the actual storage and locking
//! of workspace state. [`BackendPlugin`] is the fixed set of operations it
//! exposes. [`RpcPlugin`] talks to a spawned plugin process, [`serve`] is the
//! plugin-side counterpart, and [`MemoryPlugin`] keeps everything in memory.

mod memory;
pub mod protocol;
mod rpc;
mod server;

pub use memory::MemoryPlugin;
pub use rpc::RpcPlugin;
pub use server::{serve, serve_io};

use std::collections::HashMap;

use async_trait::async_trait;

use crate::backend::BackendResult;
use crate::lock::LockInfo;
use crate::state::StatePayload;

/// Operations a backend plugin provides
///
/// Calls are independent: nothing is cached between them, and a failed call
/// is never retried.
#[async_trait]
pub trait BackendPlugin: Send + Sync {
    /// List the workspaces the plugin stores, in the plugin's own order
    async fn list_workspaces(&self) -> BackendResult<Vec<String>>;

    /// Delete a workspace; the plugin decides what `force` allows
    async fn delete_workspace(&self, workspace: &str, force: bool) -> BackendResult<()>;

    /// Apply the plugin-specific configuration
    async fn configure(&self, config: &HashMap<String, String>) -> BackendResult<()>;

    /// Fetch a workspace's state
    ///
    /// Returns `None` when the workspace has no state document.
    async fn get_state_payload(&self, workspace: &str) -> BackendResult<Option<StatePayload>>;

    /// Replace a workspace's state document
    async fn put_state(&self, workspace: &str, data: &[u8]) -> BackendResult<()>;

    /// Remove a workspace's state document
    async fn delete_state(&self, workspace: &str) -> BackendResult<()>;

    /// Lock a workspace, returning the token needed to unlock it
    async fn lock_state(&self, workspace: &str, info: &LockInfo) -> BackendResult<String>;

    /// Release a lock previously returned by [`BackendPlugin::lock_state`]
    async fn unlock_state(&self, workspace: &str, token: &str) -> BackendResult<()>;

    /// Release whatever the connection to the plugin holds
    async fn close(&self) -> BackendResult<()> {
        Ok(())
    }
}
