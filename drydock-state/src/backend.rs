//! Backend trait, configuration and error types

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

use crate::lock::LockInfo;
use crate::remote::RemoteState;

/// Name of the workspace every backend reports, whether or not it is stored
pub const DEFAULT_WORKSPACE: &str = "default";

/// Errors that can occur when interacting with a state backend
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BackendError {
    /// Missing or malformed backend configuration
    #[error("Backend configuration error: {0}")]
    Configuration(String),

    /// The plugin process could not be started, or the session was lost
    #[error("Plugin connection error: {0}")]
    Connection(String),

    /// A plugin call failed in a way not covered by the other kinds
    #[error("Plugin call {operation} failed: {message}")]
    Protocol { operation: String, message: String },

    /// The workspace is locked by someone else
    #[error(
        "Workspace {workspace} is locked by {who} (lock ID: {lock_id}, operation: {operation})"
    )]
    Locked {
        workspace: String,
        lock_id: String,
        who: String,
        operation: String,
    },

    /// Acquiring or releasing a lock failed
    #[error("Lock error on workspace {workspace}: {message}")]
    Lock { workspace: String, message: String },

    /// Reading, writing or deleting state failed
    #[error("State {operation} failed for workspace {workspace}: {message}")]
    StateIo {
        workspace: String,
        operation: String,
        message: String,
    },
}

impl BackendError {
    /// Create a Locked error from the holder's LockInfo
    pub fn locked(workspace: impl Into<String>, holder: &LockInfo) -> Self {
        Self::Locked {
            workspace: workspace.into(),
            lock_id: holder.id.clone(),
            who: holder.who.clone(),
            operation: holder.operation.clone(),
        }
    }

    /// Create a configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection(message.into())
    }

    /// Create a protocol error for a named plugin call
    pub fn protocol(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Protocol {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Create a lock acquisition/release error
    pub fn lock(workspace: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Lock {
            workspace: workspace.into(),
            message: message.into(),
        }
    }

    /// Create a state I/O error
    pub fn state_io(
        workspace: impl Into<String>,
        operation: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::StateIo {
            workspace: workspace.into(),
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Whether this error came from acquiring or releasing a lock
    pub fn is_lock_error(&self) -> bool {
        matches!(self, Self::Locked { .. } | Self::Lock { .. })
    }
}

/// Result type for backend operations
pub type BackendResult<T> = Result<T, BackendError>;

/// Workspace-level operations a backend offers to its callers
#[async_trait]
pub trait Backend: Send + Sync {
    /// List all workspaces; always includes [`DEFAULT_WORKSPACE`] exactly once
    async fn workspaces(&self) -> BackendResult<Vec<String>>;

    /// Get a state manager for a workspace, creating the workspace if needed
    async fn state_mgr(&self, workspace: &str) -> BackendResult<RemoteState>;

    /// Delete a workspace
    ///
    /// What `force` permits is up to the backend implementation.
    async fn delete_workspace(&self, workspace: &str, force: bool) -> BackendResult<()>;
}

/// Configuration for a plugin-backed state backend
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct BackendConfig {
    /// Shell command that starts the plugin process
    pub source: String,
    /// Requested plugin version (reserved, currently ignored)
    #[serde(default)]
    pub version: Option<String>,
    /// Plugin-specific settings, forwarded verbatim
    #[serde(default)]
    pub config: HashMap<String, String>,
}

impl BackendConfig {
    /// Create a configuration for the given plugin command
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            version: None,
            config: HashMap::new(),
        }
    }

    /// Add a plugin setting
    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.config.insert(key.into(), value.into());
        self
    }

    /// Check the fields this layer interprets
    pub fn validate(&self) -> BackendResult<()> {
        if self.source.trim().is_empty() {
            return Err(BackendError::configuration(
                "Missing required attribute: source",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_error_locked() {
        let lock = LockInfo::new("apply");
        let error = BackendError::locked("dev", &lock);

        match &error {
            BackendError::Locked {
                workspace,
                lock_id,
                who,
                operation,
            } => {
                assert_eq!(workspace, "dev");
                assert_eq!(lock_id, &lock.id);
                assert_eq!(who, &lock.who);
                assert_eq!(operation, "apply");
            }
            _ => panic!("Expected Locked error"),
        }
        assert!(error.is_lock_error());
    }

    #[test]
    fn test_backend_error_display() {
        let error = BackendError::configuration("Missing required attribute: source");
        assert_eq!(
            error.to_string(),
            "Backend configuration error: Missing required attribute: source"
        );

        let error = BackendError::state_io("dev", "put", "disk full");
        assert_eq!(
            error.to_string(),
            "State put failed for workspace dev: disk full"
        );
        assert!(!error.is_lock_error());
    }

    #[test]
    fn test_config_validate() {
        assert!(BackendConfig::new("./plugin").validate().is_ok());

        let err = BackendConfig::new("   ").validate().unwrap_err();
        assert!(matches!(err, BackendError::Configuration(_)));
    }

    #[test]
    fn test_config_deserialize() {
        let json = r#"{
            "source": "drydock-plugin-fs",
            "config": {"path": "/tmp/state"}
        }"#;
        let config: BackendConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.source, "drydock-plugin-fs");
        assert_eq!(config.version, None);
        assert_eq!(config.config.get("path").map(String::as_str), Some("/tmp/state"));
    }

    #[test]
    fn test_config_requires_config_map() {
        let json = r#"{"source": "drydock-plugin-fs"}"#;
        assert!(serde_json::from_str::<BackendConfig>(json).is_err());
    }
}
