//! Work partitioning and data locality for distributed fast multipole methods.
//!
//! The boxes of an FMM tree are split into contiguous ranges, one per rank.
//! Every rank receives the particles of its boxes and of the boxes they depend
//! on, evaluates its local contribution with an [wrangler::ExpansionWrangler]
//! and sends the result back to the coordinating rank, which assembles the
//! potential at every target. The entry point is
//! [coordinator::DistributedFmm].
#![cfg_attr(feature = "strict", deny(warnings), deny(unused_crate_dependencies))]
#![warn(missing_docs)]

pub mod assignment;
pub mod config;
pub mod constants;
pub mod coordinator;
pub mod device;
pub mod geometry;
pub mod locality;
pub mod partition;
pub mod scan;
pub mod tools;
pub mod transport;
pub mod tree;
pub mod types;
pub mod wrangler;

pub use config::DistributedConfig;
pub use coordinator::{DistributedFmm, FmmInput};
pub use types::{BoxRange, DfmmError, IdWidth, Phase, RunError, TransportError};
