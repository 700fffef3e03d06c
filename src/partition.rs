//! Partitioning of tree boxes across ranks.
use crate::types::{BoxRange, DfmmError};

/// Split the box ids `0..nboxes` into `nranks` contiguous ranges.
///
/// Every rank receives `ceil(nboxes / nranks)` boxes, except the last rank which
/// receives the rest of the boxes. If there are fewer boxes than ranks the
/// trailing ranks receive empty ranges. The ranges are returned in rank order.
pub fn partition_work(nboxes: usize, nranks: usize) -> Result<Vec<BoxRange>, DfmmError> {
    if nranks == 0 {
        return Err(DfmmError::Configuration(
            "cannot partition boxes across zero ranks".to_string(),
        ));
    }

    let chunk = nboxes.div_ceil(nranks);

    let ranges = (0..nranks)
        .map(|rank| {
            let lo = (chunk * rank).min(nboxes);
            let hi = if rank == nranks - 1 {
                nboxes
            } else {
                (chunk * (rank + 1)).min(nboxes)
            };
            BoxRange::new(rank, lo, hi)
        })
        .collect();

    Ok(ranges)
}
