//! Data parallel primitives.
//!
//! A device offers two synchronous operations: an elementwise `map` over an
//! index domain whose invocations write to disjoint memory, and an inclusive
//! `scan`. The calling thread blocks until the device is done, so a `map` that
//! fills a mask is always complete before the `scan` that consumes it.
use std::ops::Range;

use rayon::prelude::*;

use crate::{
    constants::DEFAULT_SCAN_BLOCK_SIZE,
    scan::{inclusive_scan_blocked, inclusive_scan_serial, ScanElement},
    types::DfmmError,
};

/// Interface for data parallel devices.
pub trait Device {
    /// A short name for logging.
    fn name(&self) -> &str;

    /// Apply `f` to every index in `domain`.
    ///
    /// Invocations may run concurrently and in any order. Callers must make sure
    /// that distinct invocations write to distinct memory.
    fn map<F>(&self, domain: Range<usize>, f: F)
    where
        F: Fn(usize) + Send + Sync;

    /// Inclusive prefix sum of `arr`.
    fn inclusive_scan<T: ScanElement>(&self, arr: &[T]) -> Vec<T>;
}

/// A device that runs everything on the calling thread.
///
/// Useful as a reference for the parallel devices.
#[derive(Copy, Clone, Debug, Default)]
pub struct SerialDevice;

impl Device for SerialDevice {
    fn name(&self) -> &str {
        "serial"
    }

    fn map<F>(&self, domain: Range<usize>, f: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        domain.for_each(f);
    }

    fn inclusive_scan<T: ScanElement>(&self, arr: &[T]) -> Vec<T> {
        inclusive_scan_serial(arr)
    }
}

/// A device backed by a rayon thread pool.
pub struct RayonDevice {
    pool: Option<rayon::ThreadPool>,
    block_size: usize,
}

impl RayonDevice {
    /// A device running on the global rayon pool.
    pub fn new() -> Self {
        Self {
            pool: None,
            block_size: DEFAULT_SCAN_BLOCK_SIZE,
        }
    }

    /// A device with its own pool of `nthreads` threads.
    pub fn with_threads(nthreads: usize) -> Result<Self, DfmmError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(nthreads)
            .build()
            .map_err(|e| DfmmError::Configuration(format!("cannot build thread pool: {}", e)))?;

        Ok(Self {
            pool: Some(pool),
            block_size: DEFAULT_SCAN_BLOCK_SIZE,
        })
    }

    /// Set the number of elements scanned by one worker.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    fn install<R: Send>(&self, op: impl FnOnce() -> R + Send) -> R {
        match &self.pool {
            Some(pool) => pool.install(op),
            None => op(),
        }
    }
}

impl Default for RayonDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for RayonDevice {
    fn name(&self) -> &str {
        "rayon"
    }

    fn map<F>(&self, domain: Range<usize>, f: F)
    where
        F: Fn(usize) + Send + Sync,
    {
        self.install(|| domain.into_par_iter().for_each(f));
    }

    fn inclusive_scan<T: ScanElement>(&self, arr: &[T]) -> Vec<T> {
        self.install(|| inclusive_scan_blocked(arr, self.block_size))
    }
}

/// A raw pointer that may be shared across the workers of a `map`.
///
/// Workers must only write to disjoint elements.
pub(crate) struct SendPtrMut<T> {
    raw: *mut T,
    len: usize,
}

unsafe impl<T> Sync for SendPtrMut<T> {}
unsafe impl<T> Send for SendPtrMut<T> {}

impl<T: Copy> SendPtrMut<T> {
    pub(crate) fn new(slice: &mut [T]) -> Self {
        Self {
            raw: slice.as_mut_ptr(),
            len: slice.len(),
        }
    }

    /// Write `value` to `[start, start + count)`.
    ///
    /// # Safety
    /// No other worker may access the span while it is written and the slice
    /// the pointer was created from must outlive the call.
    pub(crate) unsafe fn fill(&self, start: usize, count: usize, value: T) {
        assert!(start + count <= self.len);
        for index in start..start + count {
            *self.raw.add(index) = value;
        }
    }

    /// Write `value` to position `index`.
    ///
    /// # Safety
    /// See [SendPtrMut::fill].
    pub(crate) unsafe fn write(&self, index: usize, value: T) {
        assert!(index < self.len);
        *self.raw.add(index) = value;
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use itertools::Itertools;

    use super::{Device, RayonDevice, SendPtrMut, SerialDevice};

    fn check_device<D: Device>(device: &D) {
        let visits = AtomicUsize::new(0);
        device.map(3..103, |_| {
            visits.fetch_add(1, Ordering::Relaxed);
        });
        assert_eq!(visits.load(Ordering::Relaxed), 100);

        let mut squares = vec![0_usize; 50];
        let ptr = SendPtrMut::new(&mut squares);
        device.map(0..50, |index| unsafe { ptr.write(index, index * index) });
        assert_eq!(squares, (0..50).map(|i| i * i).collect_vec());

        let arr = (0..10_000).map(|i| i % 3).collect_vec();
        let scan = device.inclusive_scan(&arr);
        assert_eq!(scan.len(), arr.len());
        assert_eq!(*scan.last().unwrap(), arr.iter().sum::<usize>());
    }

    #[test]
    fn test_serial_device() {
        check_device(&SerialDevice);
    }

    #[test]
    fn test_rayon_device() {
        check_device(&RayonDevice::new().with_block_size(64));
        check_device(&RayonDevice::with_threads(3).unwrap().with_block_size(7));
    }
}
