//! State documents and the payloads that carry them

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A stored state document together with its content hash
///
/// The backend never looks inside `data`; the hash lets readers detect a
/// document that changed or was truncated on the way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatePayload {
    /// SHA-256 digest of `data`
    pub hash: Vec<u8>,
    /// Raw state document bytes
    pub data: Vec<u8>,
}

impl StatePayload {
    /// Build a payload, computing the hash of `data`
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            hash: content_hash(&data),
            data,
        }
    }

    /// Check that the hash matches the data
    pub fn verify(&self) -> bool {
        self.hash == content_hash(&self.data)
    }
}

/// SHA-256 digest of a state document
pub fn content_hash(data: &[u8]) -> Vec<u8> {
    Sha256::digest(data).to_vec()
}

/// The state document Drydock writes when it initializes a workspace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateFile {
    /// State file format version
    pub version: u32,
    /// Monotonically increasing number for each state modification
    pub serial: u64,
    /// Unique identifier for this state lineage
    pub lineage: String,
    /// Version of Drydock that wrote this state
    pub drydock_version: String,
    /// Managed resources, kept opaque
    #[serde(default)]
    pub resources: Vec<serde_json::Value>,
}

impl StateFile {
    /// Current state file format version
    pub const CURRENT_VERSION: u32 = 1;

    /// Create a new empty state file
    pub fn new() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            serial: 0,
            lineage: uuid::Uuid::new_v4().to_string(),
            drydock_version: env!("CARGO_PKG_VERSION").to_string(),
            resources: Vec::new(),
        }
    }

    /// Whether the state tracks no resources
    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }

    /// Serialize to the stored JSON form
    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec_pretty(self)
    }

    /// Parse the stored JSON form
    pub fn from_bytes(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

impl Default for StateFile {
    fn default() -> Self {
        Self::new()
    }
}
