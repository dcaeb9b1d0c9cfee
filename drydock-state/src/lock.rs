//! Lock information for workspace state locking

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Operation name used when a workspace is being initialized
pub const INIT_OPERATION: &str = "init";

/// Description of a lock request
///
/// The store hands back an opaque token when the lock is granted; that token,
/// not the `id` here, is what must be passed back to release the lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    /// Unique identifier for this lock request
    pub id: String,
    /// The operation being performed (e.g., "init", "apply", "plan")
    pub operation: String,
    /// Free-form extra information shown to whoever finds the lock held
    #[serde(default)]
    pub info: String,
    /// Who acquired the lock (username@hostname)
    pub who: String,
    /// Version of Drydock that requested the lock
    pub version: String,
    /// When the lock was created
    pub created: DateTime<Utc>,
    /// Path of the state being locked, if the caller knows one
    #[serde(default)]
    pub path: String,
}

impl LockInfo {
    /// Create a new lock request for an operation
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation: operation.into(),
            info: String::new(),
            who: get_lock_owner(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            created: Utc::now(),
            path: String::new(),
        }
    }

    /// Attach the path of the locked state
    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = path.into();
        self
    }
}

/// Get the lock owner string (username@hostname)
fn get_lock_owner() -> String {
    let username = std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string());

    let hostname = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string());

    format!("{}@{}", username, hostname)
}
