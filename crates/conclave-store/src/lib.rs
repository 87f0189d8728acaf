//! `conclave-store` — everything a node keeps on disk.
//!
//! - [`archive`]: `.tar.gz` packaging of traces and disk images
//! - [`layout`]:  the node's working-directory layout
//! - [`image`]:   stored vs. announced disk image fingerprints

pub mod archive;
pub mod error;
pub mod image;
pub mod layout;

pub use error::{Result, StoreError};
pub use image::{ImageStore, StagedImage};
pub use layout::{NodeLayout, SlotLayout};
