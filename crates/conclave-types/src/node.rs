use std::fmt;

use serde::{Deserialize, Serialize};

/// Which kind of worker pool a node supervises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    Vm,
    Svm,
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Vm  => write!(f, "vm"),
            Self::Svm => write!(f, "svm"),
        }
    }
}

/// Free-text diagnostic recorded when a pipeline enters its error state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeError {
    pub log: String,
}

impl NodeError {
    pub fn new(log: impl Into<String>) -> Self {
        Self { log: log.into() }
    }
}

/// Snapshot of a node's state as reported to the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub kind: NodeKind,
    pub node_id: u64,
    pub commenced: bool,
    /// At least one pipeline did work (or is waiting on a worker) this tick.
    pub active: bool,
    pub slots: u32,
    pub pipelines_in_error: u32,
    pub traces: u32,
    pub tests: u32,
    pub errors: u32,
    /// VM nodes only: the dispatcher announced an image the node does not
    /// hold yet.
    pub image_outdated: bool,
    pub target: Option<String>,
}
