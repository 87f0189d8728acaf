//! `conclave-pipeline` — worker supervision for VM and SVM nodes.
//!
//! Each worker slot is driven by a pipeline: a flat state machine ticked by
//! the node loop that never blocks on its worker. Slow steps run as
//! [`AsyncTask`]s and are polled on later ticks.
//!
//! ```text
//!             ┌──────── VmNode ────────┐          ┌──────── SvmNode ───────┐
//!  tests ───▶ │ queue ─▶ VmPipeline × n │ ─trace─▶ │ queue ─▶ SvmPipeline × n│ ─▶ tests
//!             └────────────────────────┘          └────────────────────────┘
//! ```
//!
//! Failed pipelines are reported as `NodeError`s and either replaced or left
//! terminated, depending on the node's [`Mode`](conclave_types::Mode).

pub mod error;
pub mod node;
pub mod process;
pub mod queue;
pub mod region;
pub mod svm;
pub mod svm_node;
pub mod task;
pub mod vm;
pub mod vm_node;

// ── Public re-exports ────────────────────────────────────────────────────────

pub use error::{PipelineError, Result};
pub use node::Node;
pub use process::{ProcessSpec, WorkerProcess};
pub use queue::{Payload, Queues, WorkQueue};
pub use region::{Fault, Liveness, Recovery};
pub use svm::{SvmContext, SvmPipeline, SvmState};
pub use svm_node::SvmNode;
pub use task::{AsyncTask, TaskPoll, TaskSlot};
pub use vm::{VmContext, VmEnv, VmPipeline, VmState};
pub use vm_node::VmNode;
