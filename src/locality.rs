//! Selection of the boxes and particles each rank needs.
//!
//! Every selection follows the same pattern: mark the wanted elements in a
//! mask, scan the mask, and use the scan to either count the elements (last
//! scan value) or compact them (marked element `i` goes to `scan[i] - 1`).
use std::sync::atomic::{AtomicUsize, Ordering};

use itertools::{izip, Itertools};
use log::debug;

use crate::{
    device::{Device, SendPtrMut},
    scan::{check_index_width, scan_total},
    tree::{Traversal, Tree},
    types::{BoxRange, DfmmError},
};

/// A particle mask together with its inclusive scan.
#[derive(Clone, Debug)]
pub struct ParticleSelection {
    /// One flag per particle, `1` if the particle is selected.
    pub mask: Vec<usize>,
    /// Inclusive prefix sum of the mask.
    pub scan: Vec<usize>,
    /// Number of selected particles.
    pub count: usize,
}

/// Mark the non-child particles of `boxes` and scan the marks.
///
/// One worker is launched per box. The boxes must be distinct and their spans
/// must come from a validated [Tree] so that workers write disjoint parts of the
/// mask.
fn mark_and_scan<D: Device>(
    boxes: &[usize],
    starts: &[usize],
    counts: &[usize],
    nparticles: usize,
    device: &D,
) -> ParticleSelection {
    let mut mask = vec![0_usize; nparticles];

    {
        let mask_ptr = SendPtrMut::new(&mut mask);
        device.map(0..boxes.len(), |index| {
            let box_id = boxes[index];
            // Safety: boxes are distinct and non-child spans of distinct boxes are
            // disjoint and in bounds, as checked by `Tree::new`.
            unsafe { mask_ptr.fill(starts[box_id], counts[box_id], 1) };
        });
    }

    let scan = device.inclusive_scan(&mask);
    let count = scan_total(&scan);

    ParticleSelection { mask, scan, count }
}

fn check_range(tree: &Tree, range: &BoxRange) -> Result<(), DfmmError> {
    if range.lo > range.hi || range.hi > tree.nboxes() {
        Err(DfmmError::Configuration(format!(
            "box range {} does not fit a tree with {} boxes",
            range,
            tree.nboxes()
        )))
    } else {
        Ok(())
    }
}

/// Select the sources stored directly in the boxes of `range`.
///
/// The returned count equals the sum of the non-child source counts of the
/// boxes in the range.
pub fn select_local_particles<D: Device>(
    tree: &Tree,
    range: &BoxRange,
    device: &D,
) -> Result<ParticleSelection, DfmmError> {
    check_range(tree, range)?;
    check_index_width(tree.nsources(), tree.id_width())?;

    let boxes = range.boxes().collect_vec();

    Ok(mark_and_scan(
        &boxes,
        tree.box_source_starts(),
        tree.box_source_counts_nonchild(),
        tree.nsources(),
        device,
    ))
}

/// Compact a selection into the sorted indices of the selected particles.
pub fn compact_indices<D: Device>(selection: &ParticleSelection, device: &D) -> Vec<usize> {
    let mut indices = vec![0_usize; selection.count];

    {
        let indices_ptr = SendPtrMut::new(&mut indices);
        let mask = &selection.mask;
        let scan = &selection.scan;
        device.map(0..mask.len(), |index| {
            if mask[index] == 1 {
                // Safety: the scan is strictly increasing over marked elements, so
                // every marked element has its own destination below `count`.
                unsafe { indices_ptr.write(scan[index] - 1, index) };
            }
        });
    }

    indices
}

/// Position of the first particle at or after `start` in the compacted array.
fn exclusive_prefix(scan: &[usize], start: usize) -> usize {
    if start == 0 {
        0
    } else {
        scan[start - 1]
    }
}

/// The boxes and box metadata a rank needs for its local evaluation.
///
/// Local boxes are the owned boxes of the rank plus the ghost boxes its owned
/// boxes depend on, sorted by global box id. Particle spans refer to the
/// compacted local particle arrays. Ghost boxes own no targets.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocalTree {
    /// The owned boxes.
    pub range: BoxRange,
    /// Sorted global ids of the owned and ghost boxes.
    pub box_ids: Vec<usize>,
    /// Start of the local source span of each local box.
    pub box_source_starts: Vec<usize>,
    /// Number of sources of each local box.
    pub box_source_counts: Vec<usize>,
    /// Start of the local target span of each local box.
    pub box_target_starts: Vec<usize>,
    /// Number of targets of each local box. Zero for ghost boxes.
    pub box_target_counts: Vec<usize>,
    /// Compressed dependency lists of the owned boxes, of length `range.len() + 1`.
    pub dependency_starts: Vec<usize>,
    /// Global ids of the dependencies of the owned boxes.
    pub dependency_lists: Vec<usize>,
}

impl LocalTree {
    /// Number of local boxes.
    pub fn nboxes(&self) -> usize {
        self.box_ids.len()
    }

    /// Number of local sources, ghosts included.
    pub fn nsources(&self) -> usize {
        self.box_source_counts.iter().sum()
    }

    /// Number of local targets.
    pub fn ntargets(&self) -> usize {
        self.box_target_counts.iter().sum()
    }

    /// Local index of a global box id.
    pub fn local_box_index(&self, box_id: usize) -> Option<usize> {
        self.box_ids.binary_search(&box_id).ok()
    }

    /// Global ids of the boxes an owned box depends on.
    ///
    /// Returns `None` if the rank does not own `box_id`.
    pub fn dependencies(&self, box_id: usize) -> Option<&[usize]> {
        if !self.range.contains(box_id) {
            return None;
        }
        let index = box_id - self.range.lo;
        let start = *self.dependency_starts.get(index)?;
        let end = *self.dependency_starts.get(index + 1)?;
        self.dependency_lists.get(start..end)
    }

    /// Check the internal consistency of a local tree.
    ///
    /// Returns a description of the first problem found.
    pub fn validate(&self, nboxes: usize, nsources: usize, ntargets: usize) -> Result<(), String> {
        let n = self.box_ids.len();

        if self.box_source_starts.len() != n
            || self.box_source_counts.len() != n
            || self.box_target_starts.len() != n
            || self.box_target_counts.len() != n
        {
            return Err("per box arrays differ in length".to_string());
        }

        if self.range.lo > self.range.hi || self.range.hi > nboxes {
            return Err(format!("range {} exceeds {} boxes", self.range, nboxes));
        }

        if self.box_ids.iter().tuple_windows().any(|(a, b)| a >= b)
            || self.box_ids.last().is_some_and(|&b| b >= nboxes)
        {
            return Err("box ids are not sorted, unique and in range".to_string());
        }

        if self.range.boxes().any(|b| self.local_box_index(b).is_none()) {
            return Err("an owned box is missing from the local boxes".to_string());
        }

        for (&start, &count) in izip!(&self.box_source_starts, &self.box_source_counts) {
            if start.checked_add(count).map_or(true, |end| end > nsources) {
                return Err(format!("source span exceeds {} local sources", nsources));
            }
        }

        for (&box_id, &start, &count) in izip!(
            &self.box_ids,
            &self.box_target_starts,
            &self.box_target_counts
        ) {
            if start.checked_add(count).map_or(true, |end| end > ntargets) {
                return Err(format!("target span exceeds {} local targets", ntargets));
            }
            if count > 0 && !self.range.contains(box_id) {
                return Err(format!("ghost box {} owns targets", box_id));
            }
        }

        if checked_total(&self.box_source_counts).is_none()
            || checked_total(&self.box_target_counts).is_none()
        {
            return Err("particle counts overflow".to_string());
        }

        if self.dependency_starts.len() != self.range.len() + 1
            || self.dependency_starts.first() != Some(&0)
            || self.dependency_starts.last() != Some(&self.dependency_lists.len())
            || self
                .dependency_starts
                .iter()
                .tuple_windows()
                .any(|(a, b)| a > b)
        {
            return Err("dependency starts are inconsistent".to_string());
        }

        if self
            .dependency_lists
            .iter()
            .any(|&b| self.local_box_index(b).is_none())
        {
            return Err("a dependency is missing from the local boxes".to_string());
        }

        Ok(())
    }
}

/// Sum of `counts`, or `None` on overflow.
fn checked_total(counts: &[usize]) -> Option<usize> {
    counts
        .iter()
        .try_fold(0usize, |total, &count| total.checked_add(count))
}

/// Everything the coordinator selects for one rank.
#[derive(Clone, Debug)]
pub struct RankSelection {
    /// Local boxes and spans.
    pub local_tree: LocalTree,
    /// Tree order indices of the local sources, ghosts included.
    pub source_ids: Vec<usize>,
    /// Tree order indices of the local targets.
    pub target_ids: Vec<usize>,
}

/// Select the owned and ghost boxes of `range`.
///
/// Returns the sorted global ids of all boxes in the range and of all boxes
/// they depend on.
pub fn select_local_boxes<D: Device>(
    traversal: &Traversal,
    range: &BoxRange,
    device: &D,
) -> Vec<usize> {
    let nboxes = traversal.nboxes();

    // Dependency lists of different boxes overlap, so marks are written atomically.
    let box_marks = (0..nboxes).map(|_| AtomicUsize::new(0)).collect_vec();
    device.map(range.boxes(), |box_id| {
        box_marks[box_id].store(1, Ordering::Relaxed);
        for &dependency in traversal.dependencies(box_id) {
            box_marks[dependency].store(1, Ordering::Relaxed);
        }
    });

    let box_mask = box_marks
        .into_iter()
        .map(AtomicUsize::into_inner)
        .collect_vec();

    let box_scan = device.inclusive_scan(&box_mask);
    compact_indices(
        &ParticleSelection {
            count: scan_total(&box_scan),
            mask: box_mask,
            scan: box_scan,
        },
        device,
    )
}

/// Select the boxes, sources and targets a rank needs to evaluate `range`.
///
/// Sources are taken from the owned boxes and from every box an owned box
/// depends on. Targets are taken from the owned boxes only, so each target is
/// selected for exactly one rank.
pub fn select_rank<D: Device>(
    tree: &Tree,
    traversal: &Traversal,
    range: &BoxRange,
    device: &D,
) -> Result<RankSelection, DfmmError> {
    check_range(tree, range)?;
    check_index_width(tree.nsources(), tree.id_width())?;
    check_index_width(tree.ntargets(), tree.id_width())?;

    if traversal.nboxes() != tree.nboxes() {
        return Err(DfmmError::Configuration(format!(
            "traversal over {} boxes does not match tree with {} boxes",
            traversal.nboxes(),
            tree.nboxes()
        )));
    }

    let box_ids = select_local_boxes(traversal, range, device);

    let sources = mark_and_scan(
        &box_ids,
        tree.box_source_starts(),
        tree.box_source_counts_nonchild(),
        tree.nsources(),
        device,
    );

    let owned_boxes = range.boxes().collect_vec();
    let targets = mark_and_scan(
        &owned_boxes,
        tree.box_target_starts(),
        tree.box_target_counts_nonchild(),
        tree.ntargets(),
        device,
    );

    let mut local_tree = LocalTree {
        range: *range,
        ..Default::default()
    };

    for &box_id in &box_ids {
        let source_start = tree.box_source_starts()[box_id];
        local_tree
            .box_source_starts
            .push(exclusive_prefix(&sources.scan, source_start));
        local_tree
            .box_source_counts
            .push(tree.box_source_counts_nonchild()[box_id]);

        let target_start = tree.box_target_starts()[box_id];
        local_tree
            .box_target_starts
            .push(exclusive_prefix(&targets.scan, target_start));
        local_tree.box_target_counts.push(if range.contains(box_id) {
            tree.box_target_counts_nonchild()[box_id]
        } else {
            0
        });
    }

    local_tree.dependency_starts.push(0);
    for box_id in range.boxes() {
        local_tree
            .dependency_lists
            .extend_from_slice(traversal.dependencies(box_id));
        local_tree
            .dependency_starts
            .push(local_tree.dependency_lists.len());
    }

    let source_ids = compact_indices(&sources, device);
    let target_ids = compact_indices(&targets, device);

    debug!(
        "Selected {} boxes ({} owned), {} sources and {} targets for rank {}.",
        box_ids.len(),
        range.len(),
        source_ids.len(),
        target_ids.len(),
        range.rank
    );

    local_tree.box_ids = box_ids;

    Ok(RankSelection {
        local_tree,
        source_ids,
        target_ids,
    })
}
