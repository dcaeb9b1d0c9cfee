//! Wire protocol spoken between Drydock and backend plugins
//!
//! Newline-delimited JSON-RPC 2.0 over the plugin's stdin/stdout. Before the
//! first request the plugin prints a single handshake line announcing the
//! protocol versions it speaks; the host then dispenses the `backend`
//! service and only after that may backend methods be called.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::backend::BackendError;
use crate::lock::LockInfo;
use crate::state::StatePayload;

/// Environment variable the host sets so a plugin knows it was launched by Drydock
pub const MAGIC_COOKIE_KEY: &str = "DRYDOCK_BACKEND_PLUGIN";
/// Expected value of [`MAGIC_COOKIE_KEY`]
pub const MAGIC_COOKIE_VALUE: &str = "6a4c3f0e-85d1-4bb6-9f41-0c2e9b7d51aa";

/// Version of the handshake/framing layer
pub const CORE_PROTOCOL_VERSION: u32 = 1;
/// Version of the backend method set
pub const APP_PROTOCOL_VERSION: u32 = 1;

/// Name of the service a plugin dispenses
pub const PLUGIN_NAME: &str = "backend";

/// Wire method used to dispense a service
pub const DISPENSE_METHOD: &str = "plugin.dispense";

/// Prefix of every backend method on the wire
const BACKEND_PREFIX: &str = "backend.";

/// Backend operations, named as they appear after the `backend.` prefix
pub mod ops {
    pub const LIST_WORKSPACES: &str = "list_workspaces";
    pub const DELETE_WORKSPACE: &str = "delete_workspace";
    pub const CONFIGURE: &str = "configure";
    pub const GET_STATE_PAYLOAD: &str = "get_state_payload";
    pub const PUT_STATE: &str = "put_state";
    pub const DELETE_STATE: &str = "delete_state";
    pub const LOCK_STATE: &str = "lock_state";
    pub const UNLOCK_STATE: &str = "unlock_state";
}

/// Wire method name for a backend operation
pub fn method_name(operation: &str) -> String {
    format!("{}{}", BACKEND_PREFIX, operation)
}

/// Backend operation named by a wire method, if it is one
pub fn operation_name(method: &str) -> Option<&str> {
    method.strip_prefix(BACKEND_PREFIX)
}

/// JSON-RPC and application error codes
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;

    pub const CONFIGURATION: i32 = -32010;
    pub const PROTOCOL: i32 = -32011;
    pub const LOCKED: i32 = -32020;
    pub const LOCK: i32 = -32021;
    pub const STATE_IO: i32 = -32030;
}

// ---------------------------------------------------------------------------
// Handshake
// ---------------------------------------------------------------------------

/// The line a plugin prints on startup: `CORE|APP|stdio|jsonrpc`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub core_version: u32,
    pub app_version: u32,
}

impl Handshake {
    /// The handshake this build speaks
    pub fn current() -> Self {
        Self {
            core_version: CORE_PROTOCOL_VERSION,
            app_version: APP_PROTOCOL_VERSION,
        }
    }

    /// Parse a handshake line
    pub fn parse(line: &str) -> Result<Self, String> {
        let parts: Vec<&str> = line.trim().split('|').collect();
        if parts.len() != 4 {
            return Err(format!("malformed handshake line: {:?}", line.trim()));
        }
        if parts[2] != "stdio" || parts[3] != "jsonrpc" {
            return Err(format!(
                "unsupported transport {}/{}, expected stdio/jsonrpc",
                parts[2], parts[3]
            ));
        }
        let core_version = parts[0]
            .parse()
            .map_err(|_| format!("invalid core protocol version: {:?}", parts[0]))?;
        let app_version = parts[1]
            .parse()
            .map_err(|_| format!("invalid app protocol version: {:?}", parts[1]))?;
        Ok(Self {
            core_version,
            app_version,
        })
    }

    /// Check that the peer speaks the same protocol versions
    pub fn check_compatible(&self) -> Result<(), String> {
        let current = Self::current();
        if self.core_version != current.core_version {
            return Err(format!(
                "incompatible plugin core protocol version {} (expected {})",
                self.core_version, current.core_version
            ));
        }
        if self.app_version != current.app_version {
            return Err(format!(
                "incompatible plugin backend protocol version {} (expected {})",
                self.app_version, current.app_version
            ));
        }
        Ok(())
    }
}

impl fmt::Display for Handshake {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}|stdio|jsonrpc", self.core_version, self.app_version)
    }
}

// ---------------------------------------------------------------------------
// JSON-RPC envelopes
// ---------------------------------------------------------------------------

/// Outgoing request
#[derive(Debug, Serialize, Deserialize)]
pub struct Request {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    pub fn new(id: u64, method: impl Into<String>, params: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// Response to a request
#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub jsonrpc: String,
    pub id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    pub fn success(id: u64, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id: Some(id),
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<u64>, error: RpcError) -> Self {
        Self {
            jsonrpc: "2.0".into(),
            id,
            result: None,
            error: Some(error),
        }
    }
}

/// JSON-RPC error object
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Identity of a lock holder, carried in the `data` of a LOCKED error
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockHolder {
    id: String,
    who: String,
    operation: String,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Encode a backend error for the wire
    ///
    /// Only the bare message travels; the receiving side supplies its own
    /// workspace and operation context when it rebuilds the error.
    pub fn from_backend(error: &BackendError) -> Self {
        match error {
            BackendError::Configuration(message) => Self::new(codes::CONFIGURATION, message),
            BackendError::Connection(message) => Self::new(codes::PROTOCOL, message),
            BackendError::Protocol { message, .. } => Self::new(codes::PROTOCOL, message),
            BackendError::Locked {
                lock_id,
                who,
                operation,
                ..
            } => Self {
                code: codes::LOCKED,
                message: error.to_string(),
                data: serde_json::to_value(LockHolder {
                    id: lock_id.clone(),
                    who: who.clone(),
                    operation: operation.clone(),
                })
                .ok(),
            },
            BackendError::Lock { message, .. } => Self::new(codes::LOCK, message),
            BackendError::StateIo { message, .. } => Self::new(codes::STATE_IO, message),
        }
    }

    /// Rebuild the backend error a plugin reported for `operation`
    pub fn into_backend(self, operation: &str, workspace: Option<&str>) -> BackendError {
        let workspace = workspace.unwrap_or_default();
        match self.code {
            codes::CONFIGURATION => BackendError::Configuration(self.message),
            codes::LOCKED => match self
                .data
                .and_then(|data| serde_json::from_value::<LockHolder>(data).ok())
            {
                Some(holder) => BackendError::Locked {
                    workspace: workspace.to_string(),
                    lock_id: holder.id,
                    who: holder.who,
                    operation: holder.operation,
                },
                None => BackendError::lock(workspace, self.message),
            },
            codes::LOCK => BackendError::lock(workspace, self.message),
            codes::STATE_IO => BackendError::state_io(workspace, operation, self.message),
            _ => BackendError::protocol(operation, self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// Method parameters
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
pub struct DispenseParams {
    pub name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct WorkspaceParams {
    pub workspace: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DeleteWorkspaceParams {
    pub workspace: String,
    pub force: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ConfigureParams {
    pub config: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutStateParams {
    pub workspace: String,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LockStateParams {
    pub workspace: String,
    pub info: LockInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnlockStateParams {
    pub workspace: String,
    pub token: String,
}

/// A state payload as it travels on the wire
#[derive(Debug, Serialize, Deserialize)]
pub struct WirePayload {
    #[serde(with = "base64_bytes")]
    pub hash: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl From<StatePayload> for WirePayload {
    fn from(payload: StatePayload) -> Self {
        Self {
            hash: payload.hash,
            data: payload.data,
        }
    }
}

impl From<WirePayload> for StatePayload {
    fn from(payload: WirePayload) -> Self {
        Self {
            hash: payload.hash,
            data: payload.data,
        }
    }
}

mod base64_bytes {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD
            .decode(encoded.as_bytes())
            .map_err(serde::de::Error::custom)
    }
}
