//! The tree and traversal consumed by the distributed layer.
//!
//! Both are produced by an external tree builder. They are validated once on
//! construction and immutable afterwards.
use itertools::{izip, Itertools};

use crate::{
    scan::check_index_width,
    types::{DfmmError, IdWidth},
};

/// A hierarchical decomposition of sources and targets into boxes.
///
/// Particles are stored in tree order. Each box stores a contiguous span
/// `[start, start + count)` of particles directly (its non-child particles).
/// Non-child spans of distinct boxes do not overlap.
#[derive(Clone, Debug)]
pub struct Tree {
    dim: usize,
    id_width: IdWidth,
    sources: Vec<f64>,
    targets: Vec<f64>,
    user_source_ids: Vec<usize>,
    user_target_ids: Vec<usize>,
    box_source_starts: Vec<usize>,
    box_source_counts_nonchild: Vec<usize>,
    box_target_starts: Vec<usize>,
    box_target_counts_nonchild: Vec<usize>,
}

/// Per box particle spans of a tree.
#[derive(Clone, Debug, Default)]
pub struct BoxSpans {
    /// Start of the non-child source span of each box.
    pub source_starts: Vec<usize>,
    /// Number of non-child sources of each box.
    pub source_counts_nonchild: Vec<usize>,
    /// Start of the non-child target span of each box.
    pub target_starts: Vec<usize>,
    /// Number of non-child targets of each box.
    pub target_counts_nonchild: Vec<usize>,
}

impl Tree {
    /// Create a new tree.
    ///
    /// # Arguments
    /// - `dim`: Spatial dimension.
    /// - `id_width`: Width of box and particle ids chosen by the producer.
    /// - `sources`, `targets`: Coordinates in tree order, point-major.
    /// - `user_source_ids`, `user_target_ids`: User index of each particle in tree order.
    /// - `spans`: The non-child particle spans of each box.
    pub fn new(
        dim: usize,
        id_width: IdWidth,
        sources: Vec<f64>,
        targets: Vec<f64>,
        user_source_ids: Vec<usize>,
        user_target_ids: Vec<usize>,
        spans: BoxSpans,
    ) -> Result<Self, DfmmError> {
        if dim == 0 {
            return Err(DfmmError::Configuration(
                "trees need at least one dimension".to_string(),
            ));
        }

        if sources.len() % dim != 0 || targets.len() % dim != 0 {
            return Err(DfmmError::Configuration(format!(
                "coordinate arrays are not a multiple of the dimension {}",
                dim
            )));
        }

        let nsources = sources.len() / dim;
        let ntargets = targets.len() / dim;
        let nboxes = spans.source_starts.len();

        if spans.source_counts_nonchild.len() != nboxes
            || spans.target_starts.len() != nboxes
            || spans.target_counts_nonchild.len() != nboxes
        {
            return Err(DfmmError::Configuration(
                "per box arrays differ in length".to_string(),
            ));
        }

        check_index_width(nsources, id_width)?;
        check_index_width(ntargets, id_width)?;
        check_index_width(nboxes, id_width)?;

        check_permutation(&user_source_ids, nsources, "source")?;
        check_permutation(&user_target_ids, ntargets, "target")?;

        check_spans(
            &spans.source_starts,
            &spans.source_counts_nonchild,
            nsources,
            "source",
        )?;
        check_spans(
            &spans.target_starts,
            &spans.target_counts_nonchild,
            ntargets,
            "target",
        )?;

        Ok(Self {
            dim,
            id_width,
            sources,
            targets,
            user_source_ids,
            user_target_ids,
            box_source_starts: spans.source_starts,
            box_source_counts_nonchild: spans.source_counts_nonchild,
            box_target_starts: spans.target_starts,
            box_target_counts_nonchild: spans.target_counts_nonchild,
        })
    }

    /// Spatial dimension.
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Width of box and particle ids.
    pub fn id_width(&self) -> IdWidth {
        self.id_width
    }

    /// Number of sources.
    pub fn nsources(&self) -> usize {
        self.user_source_ids.len()
    }

    /// Number of targets.
    pub fn ntargets(&self) -> usize {
        self.user_target_ids.len()
    }

    /// Number of boxes.
    pub fn nboxes(&self) -> usize {
        self.box_source_starts.len()
    }

    /// Source coordinates in tree order.
    pub fn sources(&self) -> &[f64] {
        &self.sources
    }

    /// Target coordinates in tree order.
    pub fn targets(&self) -> &[f64] {
        &self.targets
    }

    /// User index of each source in tree order.
    pub fn user_source_ids(&self) -> &[usize] {
        &self.user_source_ids
    }

    /// User index of each target in tree order.
    pub fn user_target_ids(&self) -> &[usize] {
        &self.user_target_ids
    }

    /// Start of the non-child source span of each box.
    pub fn box_source_starts(&self) -> &[usize] {
        &self.box_source_starts
    }

    /// Number of non-child sources of each box.
    pub fn box_source_counts_nonchild(&self) -> &[usize] {
        &self.box_source_counts_nonchild
    }

    /// Start of the non-child target span of each box.
    pub fn box_target_starts(&self) -> &[usize] {
        &self.box_target_starts
    }

    /// Number of non-child targets of each box.
    pub fn box_target_counts_nonchild(&self) -> &[usize] {
        &self.box_target_counts_nonchild
    }

    /// Reorder per source data given in user order into tree order.
    pub fn sources_to_tree_order<T: Copy>(&self, user_data: &[T]) -> Result<Vec<T>, DfmmError> {
        if user_data.len() != self.nsources() {
            return Err(DfmmError::Configuration(format!(
                "expected {} source values, got {}",
                self.nsources(),
                user_data.len()
            )));
        }
        Ok(self
            .user_source_ids
            .iter()
            .map(|&user_index| user_data[user_index])
            .collect_vec())
    }
}

fn check_permutation(ids: &[usize], n: usize, what: &str) -> Result<(), DfmmError> {
    if ids.len() != n {
        return Err(DfmmError::Configuration(format!(
            "{} {} ids for {} {}s",
            ids.len(),
            what,
            n,
            what
        )));
    }

    let mut seen = vec![false; n];
    for &id in ids {
        if id >= n || seen[id] {
            return Err(DfmmError::Configuration(format!(
                "user {} ids are not a permutation",
                what
            )));
        }
        seen[id] = true;
    }
    Ok(())
}

fn check_spans(starts: &[usize], counts: &[usize], n: usize, what: &str) -> Result<(), DfmmError> {
    for (box_id, (&start, &count)) in starts.iter().zip(counts).enumerate() {
        if start.checked_add(count).map_or(true, |end| end > n) {
            return Err(DfmmError::Configuration(format!(
                "{} span [{}, {}+{}) of box {} exceeds {} particles",
                what, start, start, count, box_id, n
            )));
        }
    }

    // Non-empty spans must not overlap. Sort them by start and compare neighbours.
    let sorted = izip!(starts, counts)
        .filter(|(_, &count)| count > 0)
        .map(|(&start, &count)| (start, start + count))
        .sorted_unstable()
        .collect_vec();

    for ((_, end), (next_start, _)) in sorted.iter().tuple_windows() {
        if next_start < end {
            return Err(DfmmError::Configuration(format!(
                "non-child {} spans of two boxes overlap at particle {}",
                what, next_start
            )));
        }
    }

    Ok(())
}

/// Per box interaction information computed by an external traversal.
///
/// For every box the traversal lists the boxes whose sources contribute to the
/// potential at the targets of that box. The lists are stored compressed:
/// the dependencies of box `b` are
/// `dependency_lists[dependency_starts[b]..dependency_starts[b + 1]]`.
#[derive(Clone, Debug)]
pub struct Traversal {
    dependency_starts: Vec<usize>,
    dependency_lists: Vec<usize>,
}

impl Traversal {
    /// Create a new traversal for a tree with `nboxes` boxes.
    pub fn new(
        nboxes: usize,
        dependency_starts: Vec<usize>,
        dependency_lists: Vec<usize>,
    ) -> Result<Self, DfmmError> {
        if dependency_starts.len() != nboxes + 1
            || dependency_starts.first() != Some(&0)
            || dependency_starts.last() != Some(&dependency_lists.len())
        {
            return Err(DfmmError::Configuration(format!(
                "dependency starts do not describe {} lists of total length {}",
                nboxes,
                dependency_lists.len()
            )));
        }

        if dependency_starts
            .iter()
            .tuple_windows()
            .any(|(first, second)| first > second)
        {
            return Err(DfmmError::Configuration(
                "dependency starts are not monotone".to_string(),
            ));
        }

        if let Some(&bad) = dependency_lists.iter().find(|&&b| b >= nboxes) {
            return Err(DfmmError::Configuration(format!(
                "dependency on box {} outside of {} boxes",
                bad, nboxes
            )));
        }

        Ok(Self {
            dependency_starts,
            dependency_lists,
        })
    }

    /// A traversal in which every box depends on every box.
    ///
    /// Evaluating with this traversal is a direct sum over all sources.
    pub fn all_pairs(nboxes: usize) -> Self {
        Self {
            dependency_starts: (0..=nboxes).map(|b| b * nboxes).collect(),
            dependency_lists: (0..nboxes)
                .flat_map(|_| 0..nboxes)
                .collect_vec(),
        }
    }

    /// Number of boxes.
    pub fn nboxes(&self) -> usize {
        self.dependency_starts.len() - 1
    }

    /// The boxes whose sources contribute to the targets of `box_id`.
    pub fn dependencies(&self, box_id: usize) -> &[usize] {
        &self.dependency_lists
            [self.dependency_starts[box_id]..self.dependency_starts[box_id + 1]]
    }
}
