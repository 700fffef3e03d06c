//! The interface to the expansion math.
//!
//! The distributed layer does not know about multipole or local expansions. It
//! hands every rank's local problem to an [ExpansionWrangler] and expects back
//! one potential per local target.
use std::f64::consts::PI;

use itertools::{izip, Itertools};
use rayon::prelude::*;
use thiserror::Error;

use crate::{
    locality::LocalTree,
    tree::{Traversal, Tree},
    types::DfmmError,
};

/// The data a rank evaluates.
pub struct LocalProblem<'a> {
    /// Spatial dimension.
    pub dim: usize,
    /// Local boxes and particle spans.
    pub tree: &'a LocalTree,
    /// Local source coordinates, point-major, ghosts included.
    pub sources: &'a [f64],
    /// Local source weights.
    pub weights: &'a [f64],
    /// Local target coordinates, point-major.
    pub targets: &'a [f64],
}

/// Interface for the numerical evaluation of a rank's local problem.
///
/// Implementations must not keep state across ranks. The result is aligned to
/// the local targets.
pub trait ExpansionWrangler {
    /// Error type of the evaluation.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Evaluate the potential at the local targets.
    fn evaluate(&self, problem: &LocalProblem) -> Result<Vec<f64>, Self::Error>;
}

/// Errors of the [DirectSumWrangler].
#[derive(Debug, Error)]
pub enum DirectSumError {
    /// The Laplace Green's function is only implemented in two and three dimensions.
    #[error("unsupported dimension {0}")]
    UnsupportedDimension(usize),

    /// A dependency of an owned box was not shipped to this rank.
    #[error("box {0} is not available locally")]
    MissingBox(usize),
}

/// The free space Laplace Green's function.
///
/// Coincident points do not interact.
pub fn laplace_green(dim: usize, source: &[f64], target: &[f64]) -> f64 {
    let r2 = izip!(source, target)
        .map(|(s, t)| (t - s) * (t - s))
        .sum::<f64>();

    if r2 == 0.0 {
        return 0.0;
    }

    match dim {
        2 => -0.5 * r2.ln() / (2.0 * PI),
        _ => 1.0 / (4.0 * PI * r2.sqrt()),
    }
}

/// Direct evaluation of all sources at all targets.
///
/// This is the reference result of an evaluation with an all pairs traversal.
pub fn evaluate_direct(dim: usize, sources: &[f64], weights: &[f64], targets: &[f64]) -> Vec<f64> {
    targets
        .par_chunks_exact(dim)
        .map(|target| {
            izip!(sources.chunks_exact(dim), weights)
                .map(|(source, weight)| weight * laplace_green(dim, source, target))
                .sum()
        })
        .collect()
}

/// Serial near field evaluation of a whole tree.
///
/// Sums, for every box, over the sources of the boxes it depends on. This is
/// what a distributed run with the [DirectSumWrangler] computes, evaluated on a
/// single rank. Weights and result are in user order.
pub fn evaluate_near_field(
    tree: &Tree,
    traversal: &Traversal,
    weights: &[f64],
) -> Result<Vec<f64>, DfmmError> {
    if traversal.nboxes() != tree.nboxes() {
        return Err(DfmmError::Configuration(format!(
            "traversal over {} boxes for a tree with {} boxes",
            traversal.nboxes(),
            tree.nboxes()
        )));
    }

    let dim = tree.dim();
    let tree_weights = tree.sources_to_tree_order(weights)?;

    let per_box = (0..tree.nboxes())
        .into_par_iter()
        .map(|box_id| {
            let target_start = tree.box_target_starts()[box_id];
            let target_count = tree.box_target_counts_nonchild()[box_id];
            let targets = &tree.targets()[dim * target_start..dim * (target_start + target_count)];

            let mut potentials = vec![0.0; target_count];
            for &dependency in traversal.dependencies(box_id) {
                let source_start = tree.box_source_starts()[dependency];
                let source_count = tree.box_source_counts_nonchild()[dependency];
                let sources =
                    &tree.sources()[dim * source_start..dim * (source_start + source_count)];
                let weights = &tree_weights[source_start..source_start + source_count];

                for (potential, contribution) in izip!(
                    potentials.iter_mut(),
                    evaluate_direct(dim, sources, weights, targets)
                ) {
                    *potential += contribution;
                }
            }

            (target_start, potentials)
        })
        .collect::<Vec<_>>();

    let mut result = vec![0.0; tree.ntargets()];
    for (target_start, potentials) in per_box {
        for (offset, potential) in potentials.into_iter().enumerate() {
            result[tree.user_target_ids()[target_start + offset]] = potential;
        }
    }

    Ok(result)
}

/// Evaluates the Laplace potential by summing directly over the sources of all
/// boxes a target box depends on.
#[derive(Copy, Clone, Debug, Default)]
pub struct DirectSumWrangler;

impl DirectSumWrangler {
    fn evaluate_box(
        &self,
        problem: &LocalProblem,
        box_id: usize,
    ) -> Result<(usize, Vec<f64>), DirectSumError> {
        let dim = problem.dim;
        let tree = problem.tree;
        let local = tree
            .local_box_index(box_id)
            .ok_or(DirectSumError::MissingBox(box_id))?;

        let target_start = tree.box_target_starts[local];
        let target_count = tree.box_target_counts[local];
        let targets = &problem.targets[dim * target_start..dim * (target_start + target_count)];

        let mut potentials = vec![0.0; target_count];

        let dependencies = tree
            .dependencies(box_id)
            .ok_or(DirectSumError::MissingBox(box_id))?;

        for &dependency in dependencies {
            let local = tree
                .local_box_index(dependency)
                .ok_or(DirectSumError::MissingBox(dependency))?;
            let source_start = tree.box_source_starts[local];
            let source_count = tree.box_source_counts[local];
            let sources =
                &problem.sources[dim * source_start..dim * (source_start + source_count)];
            let weights = &problem.weights[source_start..source_start + source_count];

            for (potential, target) in izip!(potentials.iter_mut(), targets.chunks_exact(dim)) {
                *potential += izip!(sources.chunks_exact(dim), weights)
                    .map(|(source, weight)| weight * laplace_green(dim, source, target))
                    .sum::<f64>();
            }
        }

        Ok((target_start, potentials))
    }
}

impl ExpansionWrangler for DirectSumWrangler {
    type Error = DirectSumError;

    fn evaluate(&self, problem: &LocalProblem) -> Result<Vec<f64>, Self::Error> {
        if !(2..=3).contains(&problem.dim) {
            return Err(DirectSumError::UnsupportedDimension(problem.dim));
        }

        let per_box = problem
            .tree
            .range
            .boxes()
            .collect_vec()
            .into_par_iter()
            .map(|box_id| self.evaluate_box(problem, box_id))
            .collect::<Result<Vec<_>, _>>()?;

        let mut potentials = vec![0.0; problem.tree.ntargets()];
        for (target_start, box_potentials) in per_box {
            potentials[target_start..target_start + box_potentials.len()]
                .copy_from_slice(&box_potentials);
        }

        Ok(potentials)
    }
}
