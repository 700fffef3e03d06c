//! Crate wide constants.

use std::time::Duration;

/// Rank that coordinates a run unless configured otherwise.
pub const ROOT_RANK: usize = 0;

/// Default liveness timeout for blocking receives.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Number of elements scanned by one worker before block totals are combined.
pub const DEFAULT_SCAN_BLOCK_SIZE: usize = 4096;

/// Floating point width of coordinates, weights and potentials.
pub const PRECISION_BITS: u64 = 64;

/// Status word of a message that carries valid data.
pub const STATUS_OK: u64 = 1;

/// Status word of a message that tells the receiver to abandon the run.
pub const STATUS_ABORT: u64 = 0;

/// Number of entries in the broadcast run parameters.
pub const NPARAMETERS: usize = 8;

/// Number of entries in an assignment header.
pub const NHEADER: usize = 7;
