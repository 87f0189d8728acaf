//! On-disk layout of a node's working directory.
//!
//! ```text
//! <root>/
//!   log/errors.log          pipeline faults, one line per NodeError
//!   image/                  stored image archive + fingerprint (VM nodes)
//!   staging/                scratch space for archive packaging
//!   run_config.xml          last pushed target configuration
//!   vm-<slot>/              one per VM slot
//!     hostfile/             test injection, handshake and completion markers
//!     trace/                capture written by the VM during a run
//!     image/                the slot's private copy of the disk image
//!     log/
//!   <trace-uuid>/           one per in-flight trace (SVM nodes)
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct NodeLayout {
    root: PathBuf,
}

impl NodeLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create the node-level directories.
    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(self.log_dir())?;
        fs::create_dir_all(self.image_dir())?;
        fs::create_dir_all(self.staging_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn error_log(&self) -> PathBuf {
        self.log_dir().join("errors.log")
    }

    pub fn image_dir(&self) -> PathBuf {
        self.root.join("image")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    /// Last target configuration pushed by the dispatcher.
    pub fn run_config_file(&self) -> PathBuf {
        self.root.join("run_config.xml")
    }

    pub fn slot(&self, slot: usize) -> SlotLayout {
        SlotLayout {
            root: self.root.join(format!("vm-{slot}")),
        }
    }

    /// Private directory for one trace on an SVM node.
    pub fn trace_dir(&self, id: Uuid) -> PathBuf {
        self.root.join(id.to_string())
    }
}

/// Directories and marker files of a single VM slot.
#[derive(Debug, Clone)]
pub struct SlotLayout {
    root: PathBuf,
}

impl SlotLayout {
    pub fn create(&self) -> Result<()> {
        fs::create_dir_all(self.hostfile_dir())?;
        fs::create_dir_all(self.trace_dir())?;
        fs::create_dir_all(self.log_dir())?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn hostfile_dir(&self) -> PathBuf {
        self.root.join("hostfile")
    }

    pub fn trace_dir(&self) -> PathBuf {
        self.root.join("trace")
    }

    pub fn image_dir(&self) -> PathBuf {
        self.root.join("image")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.root.join("staging")
    }

    /// Fingerprint of the image currently unpacked in [`Self::image_dir`].
    pub fn image_info_file(&self) -> PathBuf {
        self.root.join("image.json")
    }

    pub fn vm_log(&self) -> PathBuf {
        self.log_dir().join("vm.log")
    }

    // ── Hostfile protocol ────────────────────────────────────────────────

    /// Written by the VM once it has resumed and is ready for tests.
    pub fn ready_marker(&self) -> PathBuf {
        self.hostfile_dir().join("ready")
    }

    /// Written by the node to start a run.
    pub fn run_marker(&self) -> PathBuf {
        self.hostfile_dir().join("run")
    }

    /// Written by the VM after its capture under `trace/` is complete.
    pub fn finished_marker(&self) -> PathBuf {
        self.hostfile_dir().join("finished")
    }

    pub fn test_case_file(&self) -> PathBuf {
        self.hostfile_dir().join("test_case.bin")
    }

    /// Target configuration handed to the guest.
    pub fn run_config_file(&self) -> PathBuf {
        self.hostfile_dir().join("run_config.xml")
    }

    /// Declared inputs reported back by the guest.
    pub fn guest_config_file(&self) -> PathBuf {
        self.hostfile_dir().join("guest_config.xml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_paths_are_disjoint() {
        let layout = NodeLayout::new("/work");
        let a = layout.slot(0);
        let b = layout.slot(1);
        assert_ne!(a.hostfile_dir(), b.hostfile_dir());
        assert_eq!(a.run_marker(), PathBuf::from("/work/vm-0/hostfile/run"));
    }

    #[test]
    fn trace_dir_is_named_by_uuid() {
        let layout = NodeLayout::new("/work");
        let id = Uuid::nil();
        assert_eq!(
            layout.trace_dir(id),
            PathBuf::from("/work/00000000-0000-0000-0000-000000000000")
        );
    }

    #[test]
    fn create_builds_directories() {
        let dir = tempfile::tempdir().unwrap();
        let layout = NodeLayout::new(dir.path());
        layout.create().unwrap();
        layout.slot(3).create().unwrap();
        assert!(layout.log_dir().is_dir());
        assert!(layout.slot(3).trace_dir().is_dir());
    }
}
