//! `conclave-types` — the data model shared by nodes and the dispatcher.
//!
//! Traces, test cases and disk images are the units of work that move
//! between nodes; `NodeStatus` and `NodeError` are what a node reports; the
//! `config` module holds the XML configuration documents.

pub mod config;
pub mod error;
pub mod image;
pub mod node;
pub mod test_case;
pub mod trace;

pub use config::{Mode, NodeOptions, RunConfig, SvmOptions, VmOptions};
pub use error::TypesError;
pub use image::{ImageInfo, OSImage};
pub use node::{NodeError, NodeKind, NodeStatus};
pub use test_case::{TestCase, TestCaseElement};
pub use trace::Trace;
