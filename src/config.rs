//! Configuration of a distributed run.
use std::time::Duration;

use crate::constants::{DEFAULT_TIMEOUT, ROOT_RANK};

/// Configuration of a distributed run.
///
/// All ranks of a run must use the same configuration.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DistributedConfig {
    /// The rank that holds the tree and coordinates the run.
    pub root_rank: usize,
    /// The number of ranks the run was set up for. If set, a run on a process
    /// group of a different size fails before any computation.
    pub expected_ranks: Option<usize>,
    /// Liveness timeout for transports that support one.
    pub timeout: Duration,
}

impl Default for DistributedConfig {
    fn default() -> Self {
        Self {
            root_rank: ROOT_RANK,
            expected_ranks: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl DistributedConfig {
    /// Set the coordinating rank.
    pub fn with_root_rank(mut self, root_rank: usize) -> Self {
        self.root_rank = root_rank;
        self
    }

    /// Set the number of ranks the run expects.
    pub fn with_expected_ranks(mut self, expected_ranks: usize) -> Self {
        self.expected_ranks = Some(expected_ranks);
        self
    }

    /// Set the liveness timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}
