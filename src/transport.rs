//! Message passing between ranks.
//!
//! The distributed layer only needs typed point to point messages, a broadcast
//! of run parameters and a gather of partial results to the root. Every
//! operation reports failures as a [TransportError], never as lost data.
mod local;
#[cfg(feature = "mpi")]
mod mpi_transport;

pub use local::LocalTransport;
#[cfg(feature = "mpi")]
pub use mpi_transport::MpiTransport;

use std::time::Duration;

use crate::types::TransportError;

/// Identifies the content of a point to point message.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageTag {
    /// Broadcast run parameters.
    Parameters = 1,
    /// Assignment header.
    Header = 2,
    /// Local box ids and spans.
    Boxes = 3,
    /// Dependency lists of the owned boxes.
    Dependencies = 4,
    /// Source coordinates.
    Sources = 5,
    /// Source weights.
    Weights = 6,
    /// Target coordinates.
    Targets = 7,
    /// Outcome of the local evaluation.
    Status = 8,
    /// Gathered partial potentials.
    Potentials = 9,
}

impl MessageTag {
    /// A human readable description of the message.
    pub fn describe(&self) -> &'static str {
        match self {
            MessageTag::Parameters => "run parameters",
            MessageTag::Header => "assignment header",
            MessageTag::Boxes => "local boxes",
            MessageTag::Dependencies => "dependency lists",
            MessageTag::Sources => "source coordinates",
            MessageTag::Weights => "source weights",
            MessageTag::Targets => "target coordinates",
            MessageTag::Status => "evaluation status",
            MessageTag::Potentials => "partial potentials",
        }
    }
}

/// Interface for the transport between ranks.
pub trait Transport {
    /// Rank of the calling process.
    fn rank(&self) -> usize;

    /// Number of ranks in the process group.
    fn size(&self) -> usize;

    /// Send an index array to `dest`.
    fn send_indices(&self, dest: usize, tag: MessageTag, data: &[u64])
        -> Result<(), TransportError>;

    /// Receive an index array from `source`.
    fn receive_indices(&self, source: usize, tag: MessageTag) -> Result<Vec<u64>, TransportError>;

    /// Send a value array to `dest`.
    fn send_values(&self, dest: usize, tag: MessageTag, data: &[f64])
        -> Result<(), TransportError>;

    /// Receive a value array from `source`.
    fn receive_values(&self, source: usize, tag: MessageTag) -> Result<Vec<f64>, TransportError>;

    /// Broadcast `data` from `root` to all ranks.
    ///
    /// Must be called by every rank with a buffer of the same length.
    fn broadcast_indices(&self, root: usize, data: &mut [u64]) -> Result<(), TransportError>;

    /// Gather the local arrays of all ranks on `root`.
    ///
    /// Must be called by every rank. The root receives the concatenation of all
    /// arrays in rank order together with the length contributed by each rank.
    /// All other ranks receive `None`.
    fn gather_values(
        &self,
        root: usize,
        local: &[f64],
    ) -> Result<Option<(Vec<f64>, Vec<usize>)>, TransportError>;

    /// Set the liveness timeout of blocking receives.
    ///
    /// Transports without a timeout ignore this.
    fn set_timeout(&mut self, _timeout: Duration) {}

    /// True if the calling rank is `root`.
    fn is_root(&self, root: usize) -> bool {
        self.rank() == root
    }
}

/// Check that `rank` addresses a member of a group with `size` ranks.
pub(crate) fn check_rank(rank: usize, size: usize) -> Result<(), TransportError> {
    if rank < size {
        Ok(())
    } else {
        Err(TransportError::UnknownRank(rank))
    }
}
