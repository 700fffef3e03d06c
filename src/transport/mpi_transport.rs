//! Transport over an MPI communicator.
use itertools::Itertools;
use mpi::{
    datatype::PartitionMut,
    traits::{Communicator, CommunicatorCollectives, Destination, Root, Source},
    Count,
};

use super::{check_rank, MessageTag, Transport};
use crate::{
    scan::{exclusive_from_inclusive, inclusive_scan_serial, scan_total},
    types::TransportError,
};

/// A transport over an MPI communicator.
///
/// The MPI runtime aborts the job on communication failures, so the only errors
/// reported here are addressing errors and inconsistent message sizes. Receives
/// block until the message arrives; liveness is the responsibility of the MPI
/// launcher.
pub struct MpiTransport<'c, C> {
    comm: &'c C,
}

impl<'c, C: CommunicatorCollectives> MpiTransport<'c, C> {
    /// Create a new transport over `comm`.
    pub fn new(comm: &'c C) -> Self {
        Self { comm }
    }

    /// Return the communicator.
    pub fn comm(&self) -> &C {
        self.comm
    }
}

impl<C: CommunicatorCollectives> Transport for MpiTransport<'_, C> {
    fn rank(&self) -> usize {
        self.comm.rank() as usize
    }

    fn size(&self) -> usize {
        self.comm.size() as usize
    }

    fn send_indices(
        &self,
        dest: usize,
        tag: MessageTag,
        data: &[u64],
    ) -> Result<(), TransportError> {
        check_rank(dest, self.size())?;
        self.comm
            .process_at_rank(dest as i32)
            .send_with_tag(data, tag as i32);
        Ok(())
    }

    fn receive_indices(&self, source: usize, tag: MessageTag) -> Result<Vec<u64>, TransportError> {
        check_rank(source, self.size())?;
        let (data, _status) = self
            .comm
            .process_at_rank(source as i32)
            .receive_vec_with_tag::<u64>(tag as i32);
        Ok(data)
    }

    fn send_values(
        &self,
        dest: usize,
        tag: MessageTag,
        data: &[f64],
    ) -> Result<(), TransportError> {
        check_rank(dest, self.size())?;
        self.comm
            .process_at_rank(dest as i32)
            .send_with_tag(data, tag as i32);
        Ok(())
    }

    fn receive_values(&self, source: usize, tag: MessageTag) -> Result<Vec<f64>, TransportError> {
        check_rank(source, self.size())?;
        let (data, _status) = self
            .comm
            .process_at_rank(source as i32)
            .receive_vec_with_tag::<f64>(tag as i32);
        Ok(data)
    }

    fn broadcast_indices(&self, root: usize, data: &mut [u64]) -> Result<(), TransportError> {
        check_rank(root, self.size())?;
        self.comm.process_at_rank(root as i32).broadcast_into(data);
        Ok(())
    }

    fn gather_values(
        &self,
        root: usize,
        local: &[f64],
    ) -> Result<Option<(Vec<f64>, Vec<usize>)>, TransportError> {
        check_rank(root, self.size())?;

        let n = local.len() as Count;
        let root_process = self.comm.process_at_rank(root as i32);

        // We first communicate the length of the local arrays to root.

        if self.rank() == root {
            let mut counts = vec![0 as Count; self.size()];
            root_process.gather_into_root(&n, &mut counts[..]);

            // We now have all lengths at root and can do a varcount gather
            // to get the array elements.

            let offsets = inclusive_scan_serial(&counts);
            let mut gathered = vec![0_f64; scan_total(&offsets) as usize];
            let displs = exclusive_from_inclusive(&offsets);

            {
                let mut partition = PartitionMut::new(&mut gathered[..], &counts[..], &displs[..]);
                root_process.gather_varcount_into_root(local, &mut partition);
            }

            let counts = counts.iter().map(|&count| count as usize).collect_vec();
            Ok(Some((gathered, counts)))
        } else {
            root_process.gather_into(&n);
            root_process.gather_varcount_into(local);
            Ok(None)
        }
    }
}
