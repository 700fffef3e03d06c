//! Shared types and errors.
use std::{fmt, ops::Range, time::Duration};

use thiserror::Error;

/// A half-open interval `[lo, hi)` of box ids assigned exclusively to `rank`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Default)]
pub struct BoxRange {
    /// The owning rank.
    pub rank: usize,
    /// First box id of the range.
    pub lo: usize,
    /// One past the last box id of the range.
    pub hi: usize,
}

impl BoxRange {
    /// Create a new box range.
    pub fn new(rank: usize, lo: usize, hi: usize) -> Self {
        debug_assert!(lo <= hi);
        Self { rank, lo, hi }
    }

    /// Number of boxes in the range.
    pub fn len(&self) -> usize {
        self.hi - self.lo
    }

    /// True if the range holds no boxes.
    pub fn is_empty(&self) -> bool {
        self.lo == self.hi
    }

    /// True if `box_id` lies in the range.
    pub fn contains(&self, box_id: usize) -> bool {
        self.lo <= box_id && box_id < self.hi
    }

    /// The box ids of the range.
    pub fn boxes(&self) -> Range<usize> {
        self.lo..self.hi
    }
}

impl fmt::Display for BoxRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(rank: {}, boxes: [{}, {}))", self.rank, self.lo, self.hi)
    }
}

/// Bit width of box and particle ids chosen by the tree producer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum IdWidth {
    /// 8 bit ids.
    U8,
    /// 16 bit ids.
    U16,
    /// 32 bit ids.
    U32,
    /// 64 bit ids.
    U64,
}

impl IdWidth {
    /// Number of bits.
    pub fn bits(&self) -> u64 {
        match self {
            IdWidth::U8 => 8,
            IdWidth::U16 => 16,
            IdWidth::U32 => 32,
            IdWidth::U64 => 64,
        }
    }

    /// Largest id representable with this width.
    pub fn max_value(&self) -> u64 {
        match self {
            IdWidth::U8 => u8::MAX as u64,
            IdWidth::U16 => u16::MAX as u64,
            IdWidth::U32 => u32::MAX as u64,
            IdWidth::U64 => u64::MAX,
        }
    }

    /// Get the width from a number of bits.
    pub fn from_bits(bits: u64) -> Option<Self> {
        match bits {
            8 => Some(IdWidth::U8),
            16 => Some(IdWidth::U16),
            32 => Some(IdWidth::U32),
            64 => Some(IdWidth::U64),
            _ => None,
        }
    }
}

impl fmt::Display for IdWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "u{}", self.bits())
    }
}

/// The phases of a distributed run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Validation and parameter broadcast on the coordinator.
    Init,
    /// Splitting the boxes across ranks.
    Partition,
    /// Computing the particle sets of every rank.
    Select,
    /// Sending assignments to the workers.
    Distribute,
    /// Workers waiting for parameters and their assignment.
    AwaitAssignment,
    /// Evaluation of the local contribution.
    LocalCompute,
    /// Gathering partial potentials on the coordinator.
    Reduce,
    /// Terminal state.
    Done,
}

impl Phase {
    const ALL: [Phase; 8] = [
        Phase::Init,
        Phase::Partition,
        Phase::Select,
        Phase::Distribute,
        Phase::AwaitAssignment,
        Phase::LocalCompute,
        Phase::Reduce,
        Phase::Done,
    ];

    /// Encode the phase for a status message.
    pub fn code(&self) -> u64 {
        Self::ALL
            .iter()
            .position(|phase| phase == self)
            .unwrap_or_default() as u64
    }

    /// Decode a phase from a status message.
    pub fn from_code(code: u64) -> Option<Self> {
        Self::ALL.get(code as usize).copied()
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Init => "Init",
            Phase::Partition => "Partition",
            Phase::Select => "Select",
            Phase::Distribute => "Distribute",
            Phase::AwaitAssignment => "AwaitAssignment",
            Phase::LocalCompute => "LocalCompute",
            Phase::Reduce => "Reduce",
            Phase::Done => "Done",
        };
        write!(f, "{}", name)
    }
}

/// Failures of the message transport.
#[derive(Debug, Error)]
pub enum TransportError {
    /// A message could not be delivered.
    #[error("failed to send {what} to rank {rank}")]
    Send {
        /// Destination rank.
        rank: usize,
        /// Description of the message.
        what: String,
    },

    /// A message could not be received.
    #[error("failed to receive {what} from rank {rank}")]
    Receive {
        /// Source rank.
        rank: usize,
        /// Description of the message.
        what: String,
    },

    /// No message arrived within the liveness timeout.
    #[error("timed out after {timeout:?} waiting for {what} from rank {rank}")]
    Timeout {
        /// Source rank.
        rank: usize,
        /// Description of the message.
        what: String,
        /// The timeout that expired.
        timeout: Duration,
    },

    /// A message arrived but its content is inconsistent.
    #[error("malformed {what} from rank {rank}: {reason}")]
    Malformed {
        /// Source rank.
        rank: usize,
        /// Description of the message.
        what: String,
        /// What is wrong with it.
        reason: String,
    },

    /// A rank outside of the process group was addressed.
    #[error("rank {0} is not part of the process group")]
    UnknownRank(usize),

    /// The peer told us to abandon the run.
    #[error("rank {0} aborted the run")]
    Aborted(usize),
}

/// Errors of the distributed layer.
#[derive(Debug, Error)]
pub enum DfmmError {
    /// Inconsistent run configuration or degenerate input.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Failure of the message transport.
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    /// A count does not fit the id width of the tree.
    #[error("{count} elements overflow the {width} id width")]
    Overflow {
        /// The offending count.
        count: u64,
        /// The declared id width.
        width: IdWidth,
    },

    /// The expansion wrangler failed.
    #[error("expansion wrangler failed: {0}")]
    Wrangler(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// Writing a VTK file failed.
    #[error("failed to export VTK file: {0}")]
    Export(#[from] vtkio::Error),
}

/// The error of a distributed run, tagged with the rank and phase that failed.
#[derive(Debug, Error)]
#[error("rank {rank} failed during {phase}: {source}")]
pub struct RunError {
    /// Rank that failed.
    pub rank: usize,
    /// Phase in which it failed.
    pub phase: Phase,
    /// The underlying error.
    #[source]
    pub source: DfmmError,
}

impl RunError {
    /// Create a new run error.
    pub fn new(rank: usize, phase: Phase, source: impl Into<DfmmError>) -> Self {
        Self {
            rank,
            phase,
            source: source.into(),
        }
    }
}
