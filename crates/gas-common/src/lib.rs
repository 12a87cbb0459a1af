//! Common types for the GPU-aware scheduler extender: errors, well-known
//! labels and annotations, and resource arithmetic.

#![deny(missing_docs)]

pub mod error;
pub mod labels;
pub mod resources;

pub use error::Error;
pub use resources::{NodeResources, NodeTiles, ResourceMap};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
