//! The node surface shared by VM and SVM nodes.
//!
//! A node owns a fixed pool of pipelines and its work queues behind a single
//! mutex. The driver's node loop calls [`Node::poll`]; the listener only uses
//! the push/pop/status methods. Requests that make no sense for a node kind
//! (pushing traces to a VM node, say) return [`PipelineError::Unsupported`].

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use conclave_types::{ImageInfo, NodeError, NodeKind, NodeStatus, OSImage, RunConfig, TestCase, Trace};
use tracing::warn;

use crate::error::{PipelineError, Result};
use crate::queue::Queues;

pub trait Node: Send + Sync {
    fn kind(&self) -> NodeKind;

    /// One scheduling pass over every pipeline. Returns whether any pipeline
    /// did work; the driver sleeps between idle passes.
    fn poll(&self) -> Result<bool>;

    fn status(&self) -> NodeStatus;

    fn set_node_id(&self, node_id: u64);

    /// Start ticking pipelines.
    fn commence(&self);

    /// Terminate commenced pipelines, rebuild the pool and clear the trace
    /// and test queues. Errors stay queued for harvesting.
    fn reset(&self) -> Result<()>;

    /// Reset and record the next target's name.
    fn next_target(&self, name: String) -> Result<()>;

    fn push_config(&self, config: RunConfig) -> Result<()>;

    /// Drain the error queue.
    fn pop_errors(&self) -> Vec<NodeError>;

    /// Kill every supervised process. Used on shutdown.
    fn terminate(&self);

    fn push_traces(&self, _traces: Vec<Trace>) -> Result<()> {
        Err(PipelineError::Unsupported("trace push"))
    }

    /// Pop traces up to `max_bytes` (0 means the configured cap).
    fn pop_traces(&self, _max_bytes: u64) -> Result<Vec<Trace>> {
        Err(PipelineError::Unsupported("trace pull"))
    }

    fn push_tests(&self, _tests: Vec<TestCase>) -> Result<()> {
        Err(PipelineError::Unsupported("test push"))
    }

    /// Pop tests up to `max_bytes` (0 means the configured cap).
    fn pop_tests(&self, _max_bytes: u64) -> Result<Vec<TestCase>> {
        Err(PipelineError::Unsupported("test pull"))
    }

    fn image_info(&self) -> Result<Option<ImageInfo>> {
        Err(PipelineError::Unsupported("image info"))
    }

    fn push_image_info(&self, _info: ImageInfo) -> Result<()> {
        Err(PipelineError::Unsupported("image info push"))
    }

    fn push_image(&self, _image: OSImage) -> Result<()> {
        Err(PipelineError::Unsupported("image push"))
    }
}

// ── Shared helpers ────────────────────────────────────────────────────────────

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn byte_cap(requested: u64, configured: u64) -> u64 {
    if requested == 0 {
        configured
    } else {
        requested
    }
}

/// Queue a `NodeError` for a failed pipeline and append it to the on-disk
/// error log. Returns any test cases salvaged from a symbolic failure.
pub(crate) fn record_failure(
    queues: &mut Queues,
    error_log: &Path,
    origin: &str,
    err: PipelineError,
) -> Vec<TestCase> {
    let log = format!("{origin}: {err}");
    if let Err(e) = append_error_log(error_log, &log) {
        warn!(path = %error_log.display(), error = %e, "failed to write error log");
    }
    queues.errors.push(NodeError::new(log));

    match err {
        PipelineError::Symbolic { salvaged, .. } => salvaged,
        _ => Vec::new(),
    }
}

fn append_error_log(path: &Path, line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{} {}", chrono::Utc::now().to_rfc3339(), line.replace('\n', " "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_types::TestCaseElement;

    #[test]
    fn failure_is_queued_and_logged() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("errors.log");
        let mut queues = Queues::default();

        let salvaged = record_failure(
            &mut queues,
            &log,
            "vm slot 0",
            PipelineError::WorkerDied("exited mid-test\nkernel panic".into()),
        );
        assert!(salvaged.is_empty());

        let error = queues.errors.pop().unwrap();
        assert!(error.log.starts_with("vm slot 0: worker died"));
        let on_disk = std::fs::read_to_string(&log).unwrap();
        assert_eq!(on_disk.lines().count(), 1);
        assert!(on_disk.contains("kernel panic"));
    }

    #[test]
    fn symbolic_failure_hands_back_salvage() {
        let dir = tempfile::tempdir().unwrap();
        let mut queues = Queues::default();
        let tests = vec![TestCase::new(vec![TestCaseElement::new("stdin", b"x".to_vec())])];
        let salvaged = record_failure(
            &mut queues,
            &dir.path().join("errors.log"),
            "svm slot 1",
            PipelineError::Symbolic { log: "solver crashed".into(), salvaged: tests.clone() },
        );
        assert_eq!(salvaged, tests);
        assert!(queues.errors.pop().unwrap().log.contains("1 tests salvaged"));
    }

    #[test]
    fn zero_cap_means_configured() {
        assert_eq!(byte_cap(0, 64), 64);
        assert_eq!(byte_cap(10, 64), 10);
    }
}
