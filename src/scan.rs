//! Inclusive prefix sums.
//!
//! Every "how many of the first k satisfy P" question in this crate is answered by
//! marking the elements that satisfy P and scanning the marks. The routines here
//! are the building block beneath particle selection, box compaction and the
//! reduction of partial results.

use std::ops::Add;

use itertools::Itertools;
use num::traits::Zero;
use rayon::prelude::*;

use crate::types::{DfmmError, IdWidth};

/// Element type of a scan.
pub trait ScanElement: Zero + Add<Output = Self> + Copy + Send + Sync {}

impl<T: Zero + Add<Output = T> + Copy + Send + Sync> ScanElement for T {}

/// Sequential inclusive scan.
///
/// For the array `[1, 3, 5, 7]` the output will be `[1, 4, 9, 16]`.
pub fn inclusive_scan_serial<T: ScanElement>(arr: &[T]) -> Vec<T> {
    arr.iter()
        .scan(<T as Zero>::zero(), |state, x| {
            *state = *x + *state;
            Some(*state)
        })
        .collect_vec()
}

fn inclusive_scan_in_place<T: ScanElement>(arr: &mut [T]) {
    let mut state = T::zero();
    for elem in arr.iter_mut() {
        state = state + *elem;
        *elem = state;
    }
}

/// Parallel inclusive scan.
///
/// The array is cut into blocks of `block_size` elements. Each block is scanned by
/// its own worker, the block totals are scanned recursively and the resulting
/// offsets are added back to the blocks in parallel. The recursion gives a
/// combination depth logarithmic in the array length.
pub fn inclusive_scan_blocked<T: ScanElement>(arr: &[T], block_size: usize) -> Vec<T> {
    let block_size = block_size.max(2);

    if arr.len() <= block_size {
        return inclusive_scan_serial(arr);
    }

    let mut result = arr.to_vec();

    result
        .par_chunks_mut(block_size)
        .for_each(inclusive_scan_in_place);

    // Chunks are never empty, the last element of a scanned block is its total.
    let block_totals = result
        .chunks(block_size)
        .map(|block| block[block.len() - 1])
        .collect_vec();

    let block_offsets = inclusive_scan_blocked(&block_totals, block_size);

    result
        .par_chunks_mut(block_size)
        .skip(1)
        .zip(block_offsets.par_iter())
        .for_each(|(block, &offset)| {
            for elem in block.iter_mut() {
                *elem = *elem + offset;
            }
        });

    result
}

/// Turn an inclusive scan into the exclusive one.
///
/// For the inclusive scan `[3, 7, 12]` of the counts `[3, 4, 5]` the output is
/// `[0, 3, 7]`, the displacements of a varcount operation.
pub fn exclusive_from_inclusive<T: ScanElement>(scan: &[T]) -> Vec<T> {
    std::iter::once(T::zero())
        .chain(scan.iter().copied())
        .take(scan.len())
        .collect_vec()
}

/// The total of a scanned array, zero for an empty array.
pub fn scan_total<T: ScanElement>(scan: &[T]) -> T {
    scan.last().copied().unwrap_or_else(T::zero)
}

/// Check that `count` elements can be addressed with ids of the given width.
///
/// Must be called before scanning masks of `count` elements so that no scan
/// value can wrap around.
pub fn check_index_width(count: usize, width: IdWidth) -> Result<(), DfmmError> {
    if count as u64 > width.max_value() {
        Err(DfmmError::Overflow {
            count: count as u64,
            width,
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use itertools::Itertools;
    use rand::Rng;

    use super::{
        check_index_width, exclusive_from_inclusive, inclusive_scan_blocked,
        inclusive_scan_serial, scan_total,
    };
    use crate::{
        tools::seeded_rng,
        types::{DfmmError, IdWidth},
    };

    #[test]
    fn test_serial_scan() {
        assert_eq!(inclusive_scan_serial(&[1, 3, 5, 7]), vec![1, 4, 9, 16]);
        assert_eq!(inclusive_scan_serial::<usize>(&[]), Vec::<usize>::new());
        assert_eq!(inclusive_scan_serial(&[42_u64]), vec![42]);
    }

    #[test]
    fn test_blocked_scan_matches_serial() {
        let mut rng = seeded_rng(0);

        for n in [0, 1, 2, 3, 7, 8, 9, 63, 64, 65, 1000, 4097] {
            let arr = (0..n).map(|_| rng.gen_range(0..10_usize)).collect_vec();
            let expected = inclusive_scan_serial(&arr);

            for block_size in [2, 3, 8, 64] {
                let actual = inclusive_scan_blocked(&arr, block_size);
                assert_eq!(actual, expected, "n = {}, block size = {}", n, block_size);
            }
        }
    }

    #[test]
    fn test_scan_last_element_is_total() {
        let mut rng = seeded_rng(1);
        let arr = (0..5000).map(|_| rng.gen_range(0..3_u64)).collect_vec();

        let scan = inclusive_scan_blocked(&arr, 16);
        assert_eq!(scan_total(&scan), arr.iter().sum::<u64>());

        for (index, value) in scan.iter().enumerate() {
            assert_eq!(*value, arr[..=index].iter().sum::<u64>());
        }
    }

    #[test]
    fn test_exclusive_from_inclusive() {
        assert_eq!(exclusive_from_inclusive(&[3, 7, 12]), vec![0, 3, 7]);
        assert_eq!(exclusive_from_inclusive::<usize>(&[]), Vec::<usize>::new());
        assert_eq!(scan_total::<usize>(&[]), 0);

        // Varcount displacements from MPI style i32 counts.
        let counts = [3_i32, 0, 4, 5];
        let offsets = inclusive_scan_serial(&counts);
        assert_eq!(exclusive_from_inclusive(&offsets), vec![0, 3, 3, 7]);
        assert_eq!(scan_total(&offsets), 12);
    }

    #[test]
    fn test_check_index_width() {
        assert!(check_index_width(255, IdWidth::U8).is_ok());
        assert!(matches!(
            check_index_width(256, IdWidth::U8),
            Err(DfmmError::Overflow { count: 256, .. })
        ));
        assert!(check_index_width(usize::MAX, IdWidth::U64).is_ok());
    }
}
