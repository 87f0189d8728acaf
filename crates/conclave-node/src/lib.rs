//! `conclave-node` — one VM or SVM node process.
//!
//! [`NodeDriver`] runs the node loop and the dispatcher link; the
//! [`listener`] module maps dispatcher requests onto the node.

pub mod driver;
pub mod listener;

pub use driver::NodeDriver;
