//! Typed payloads for packets that carry more than a single data-model value.

use serde::{Deserialize, Serialize};

use conclave_types::NodeKind;

/// First packet a node sends on the dispatcher's master port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRequest {
    pub kind: NodeKind,
}

/// The dispatcher's answer: the node's identifier and its dedicated port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAssignment {
    pub node_id: u64,
    pub port: u16,
}

/// Body of a trace or test pull.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Stop adding items once the next one would exceed this many bytes.
    /// At least one item is returned when any is queued.
    pub max_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NextTarget {
    pub name: String,
}
