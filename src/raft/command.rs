//! Commands that flow through the replicated log.

use serde::{Deserialize, Serialize};

/// A membership mutation, serialized as JSON so every replica decodes the
/// exact same bytes the leader appended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RaftCommand {
    pub operation: Operation,
    pub key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Insert,
    Remove,
}

impl RaftCommand {
    pub fn insert(key: impl Into<String>) -> Self {
        Self {
            operation: Operation::Insert,
            key: key.into(),
        }
    }

    pub fn remove(key: impl Into<String>) -> Self {
        Self {
            operation: Operation::Remove,
            key: key.into(),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
