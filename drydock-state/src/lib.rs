//! Drydock State Management
//!
//! This crate provides workspace-scoped state management for the Drydock
//! infrastructure tool. Storage and locking are delegated to a backend plugin:
//! an external process speaking a small JSON-RPC protocol over stdio.
//!
//! # Overview
//!
//! - **Backend**: workspace enumeration, lazy workspace creation and deletion
//! - **PluginBackend**: a Backend that starts and owns a plugin process
//! - **BackendPlugin**: the operation set a plugin exposes (RPC client,
//!   in-memory fake, and a server loop for writing plugins)
//! - **RemoteState**: the per-workspace state manager handed to callers
//! - **LockInfo**: description of a lock request
//!
//! # Example
//!
//! ```ignore
//! use drydock_state::{Backend, BackendConfig, PluginBackend};
//!
//! let config = BackendConfig::new("drydock-plugin-fs").with_setting("path", "/srv/state");
//! let backend = PluginBackend::configure(config).await?;
//!
//! // Always contains "default"
//! let workspaces = backend.workspaces().await?;
//!
//! // Creates "staging" with an empty state if it does not exist yet
//! let mut state = backend.state_mgr("staging").await?;
//! state.refresh_state().await?;
//!
//! backend.close().await?;
//! ```

pub mod backend;
pub mod backends;
pub mod lock;
pub mod plugin;
pub mod remote;
pub mod state;

// Re-export main types for convenience
pub use backend::{Backend, BackendConfig, BackendError, BackendResult, DEFAULT_WORKSPACE};
pub use backends::{PluginBackend, PluginStateClient};
pub use lock::LockInfo;
pub use plugin::{BackendPlugin, MemoryPlugin, RpcPlugin};
pub use remote::{RemoteState, StateClient};
pub use state::{StateFile, StatePayload};
