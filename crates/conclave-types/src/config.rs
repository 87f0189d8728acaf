// Configuration documents: per-process node options and the target
// configuration pushed by the dispatcher. Both travel as XML.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, TypesError};
use crate::test_case::{TestCase, TestCaseElement};

// ── XML helpers ───────────────────────────────────────────────────────────────

/// Serialize a configuration document to its tagged XML form.
pub fn to_xml<T: Serialize>(value: &T) -> Result<String> {
    quick_xml::se::to_string(value).map_err(|e| TypesError::Xml(e.to_string()))
}

/// Parse a configuration document from its tagged XML form.
pub fn from_xml<T: DeserializeOwned>(text: &str) -> Result<T> {
    quick_xml::de::from_str(text).map_err(|e| TypesError::Xml(e.to_string()))
}

// ── Mode ──────────────────────────────────────────────────────────────────────

/// How a node is deployed. Decides the fault-recovery policy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    /// Driven by a dispatcher: failed pipelines are rebuilt and restarted.
    #[default]
    Distributed,
    /// Stand-alone debugging: the node commences on its own and a failed
    /// slot is terminated so its state can be inspected.
    Developer,
}

// ── Node options ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeOptions {
    /// `host:port` of the dispatcher's master port.
    pub dispatcher: String,
    pub mode: Mode,
    /// Root of the node's filesystem layout.
    pub work_dir: PathBuf,
    /// Sleep between scheduling passes when no pipeline is active.
    pub tick_interval_ms: u64,
    /// Default byte cap for trace/test pulls that do not carry their own.
    pub bandwidth_cap_bytes: u64,
    pub vm: VmOptions,
    pub svm: SvmOptions,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            dispatcher: "127.0.0.1:10012".into(),
            mode: Mode::Distributed,
            work_dir: PathBuf::from("conclave-work"),
            tick_interval_ms: 50,
            bandwidth_cap_bytes: 64 * 1024 * 1024,
            vm: VmOptions::default(),
            svm: SvmOptions::default(),
        }
    }
}

impl NodeOptions {
    /// Read options from an XML file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        from_xml(&fs::read_to_string(path)?)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmOptions {
    pub executable: PathBuf,
    /// Extra arguments placed before the image and resume-point arguments.
    pub args: Vec<String>,
    /// Name of the disk image file inside the image archive.
    pub image_file: String,
    /// Snapshot the VM resumes from on every launch.
    pub snapshot: String,
    pub slots: u32,
    pub handshake_timeout_secs: u64,
    /// Zero disables the per-test timeout.
    pub test_timeout_secs: u64,
}

impl Default for VmOptions {
    fn default() -> Self {
        Self {
            executable: PathBuf::from("qemu-system-x86_64"),
            args: Vec::new(),
            image_file: "guest.img".into(),
            snapshot: "test".into(),
            slots: 1,
            handshake_timeout_secs: 120,
            test_timeout_secs: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SvmOptions {
    pub translator: PathBuf,
    pub translator_args: Vec<String>,
    /// File the translator must leave in the trace directory.
    pub translated_unit: String,
    pub symbolic: PathBuf,
    pub concolic_args: Vec<String>,
    pub symbolic_args: Vec<String>,
    /// Directory (relative to the trace directory) the engine writes
    /// generated `*.test` files into.
    pub test_dir: String,
    pub slots: u32,
    /// Zero disables the symbolic timeout.
    pub symbolic_timeout_secs: u64,
}

impl Default for SvmOptions {
    fn default() -> Self {
        Self {
            translator: PathBuf::from("conclave-translate"),
            translator_args: Vec::new(),
            translated_unit: "run.bc".into(),
            symbolic: PathBuf::from("conclave-symbolic"),
            concolic_args: vec!["--concolic".into()],
            symbolic_args: vec!["--symbolic".into()],
            test_dir: "tests".into(),
            slots: 1,
            symbolic_timeout_secs: 0,
        }
    }
}

// ── Target configuration ──────────────────────────────────────────────────────

/// The target program and its declared inputs. Pushed by the dispatcher and
/// reported back by the guest during the VM handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunConfig {
    pub executable: String,
    #[serde(default)]
    pub arguments: Vec<ArgumentSpec>,
    #[serde(default)]
    pub files: Vec<FileSpec>,
    #[serde(default)]
    pub stdin_size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgumentSpec {
    pub index: u32,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub concolic: bool,
    /// Symbolic width in bytes. Zero means the concrete value's length.
    #[serde(default)]
    pub size: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    pub path: String,
    pub size: u32,
    #[serde(default)]
    pub concolic: bool,
}

impl RunConfig {
    /// Build the seed test case from the declared concolic inputs.
    ///
    /// Argument values are zero-padded (or truncated) to their declared size;
    /// files and stdin start as zero bytes.
    pub fn initial_test_case(&self) -> TestCase {
        let mut elements = Vec::new();

        for arg in self.arguments.iter().filter(|a| a.concolic) {
            let mut data = arg.value.as_bytes().to_vec();
            if arg.size > 0 {
                data.resize(arg.size as usize, 0);
            }
            elements.push(TestCaseElement::new(format!("argv_{}", arg.index), data));
        }

        for file in self.files.iter().filter(|f| f.concolic) {
            let name = Path::new(&file.path)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| file.path.clone());
            elements.push(TestCaseElement::new(
                format!("file_{name}"),
                vec![0u8; file.size as usize],
            ));
        }

        if self.stdin_size > 0 {
            elements.push(TestCaseElement::new("stdin", vec![0u8; self.stdin_size as usize]));
        }

        TestCase::new(elements)
    }

    pub fn load(path: &Path) -> Result<Self> {
        from_xml(&fs::read_to_string(path)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, to_xml(self)?)?;
        Ok(())
    }
}
