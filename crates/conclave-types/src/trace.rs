//! Execution traces produced by VM pipelines and consumed by SVM pipelines.

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A packaged record of one target execution under one test case.
///
/// `data` is the `.tar.gz` archive of the VM's capture directory. The `id` is
/// assigned once, at creation, and names the trace's private directory on the
/// SVM node that eventually replays it.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    id: Uuid,
    pub data: Vec<u8>,
}

impl Trace {
    /// Wrap an archived capture under a freshly generated identifier.
    pub fn new(data: Vec<u8>) -> Self {
        Self::with_id(Uuid::new_v4(), data)
    }

    /// Wrap an archive that was packaged under an already assigned identifier.
    pub fn with_id(id: Uuid, data: Vec<u8>) -> Self {
        Self { id, data }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Payload size in bytes, used for bandwidth accounting.
    pub fn size(&self) -> usize {
        self.data.len()
    }
}

impl fmt::Debug for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Trace")
            .field("id", &self.id)
            .field("bytes", &self.data.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_per_trace() {
        let a = Trace::new(vec![1, 2, 3]);
        let b = Trace::new(vec![1, 2, 3]);
        assert_ne!(a.id(), b.id());
        assert_eq!(a.size(), 3);
    }

    #[test]
    fn debug_omits_payload() {
        let t = Trace::new(vec![0xAB; 4096]);
        let rendered = format!("{t:?}");
        assert!(rendered.contains("bytes: 4096"));
        assert!(rendered.len() < 128);
    }
}
