//! Sequencing of a distributed run.
//!
//! Every rank runs the same [DistributedFmm::run]. The rank named by
//! [DistributedConfig::root_rank] holds the tree and coordinates, all other
//! ranks are workers. A run is a state machine over the [Phase]s:
//!
//! ```text
//! coordinator: Init -> Partition -> Select -> Distribute -> LocalCompute -> Reduce -> Done
//! worker:      AwaitAssignment -> LocalCompute -> Reduce -> Done
//! ```
//!
//! Once the run parameters have been broadcast every rank goes through the
//! Reduce handshake, also after a failure, so that no rank is left waiting for
//! a peer that gave up.
use itertools::{izip, Itertools};
use log::{debug, info, warn};

use crate::{
    assignment::{Assignment, RunParameters},
    config::DistributedConfig,
    constants::{NPARAMETERS, PRECISION_BITS, STATUS_ABORT, STATUS_OK},
    device::{Device, SendPtrMut},
    locality::{select_rank, RankSelection},
    partition::partition_work,
    scan::exclusive_from_inclusive,
    transport::{MessageTag, Transport},
    tree::{Traversal, Tree},
    types::{BoxRange, DfmmError, Phase, RunError, TransportError},
    wrangler::{ExpansionWrangler, LocalProblem},
};

/// The input of a run, only needed on the coordinating rank.
#[derive(Copy, Clone)]
pub struct FmmInput<'a> {
    /// The tree.
    pub tree: &'a Tree,
    /// Dependency lists of the boxes of `tree`.
    pub traversal: &'a Traversal,
    /// Source weights in user order.
    pub weights: &'a [f64],
}

/// Validated input of the coordinator.
struct Plan<'a> {
    input: FmmInput<'a>,
    params: RunParameters,
    tree_weights: Vec<f64>,
}

/// What the coordinator needs to assemble the global potential.
struct Reduction {
    ntargets: usize,
    /// User indices of the targets owned by each rank, in local order.
    user_target_ids: Vec<Vec<usize>>,
}

enum State<'a> {
    Init(Option<FmmInput<'a>>),
    Partition(Plan<'a>),
    Select(Plan<'a>, Vec<BoxRange>),
    Distribute(Plan<'a>, Vec<RankSelection>),
    AwaitAssignment,
    LocalCompute {
        params: RunParameters,
        assignment: Assignment,
        reduction: Option<Reduction>,
    },
    Reduce {
        outcome: Result<Vec<f64>, RunError>,
        reduction: Option<Reduction>,
    },
    Done(Option<Vec<f64>>),
}

impl State<'_> {
    fn phase(&self) -> Phase {
        match self {
            State::Init(_) => Phase::Init,
            State::Partition(_) => Phase::Partition,
            State::Select(..) => Phase::Select,
            State::Distribute(..) => Phase::Distribute,
            State::AwaitAssignment => Phase::AwaitAssignment,
            State::LocalCompute { .. } => Phase::LocalCompute,
            State::Reduce { .. } => Phase::Reduce,
            State::Done(_) => Phase::Done,
        }
    }
}

/// A distributed FMM evaluation over a group of ranks.
pub struct DistributedFmm<T, D, W> {
    transport: T,
    device: D,
    wrangler: W,
    config: DistributedConfig,
}

impl<T, D, W> DistributedFmm<T, D, W>
where
    T: Transport,
    D: Device,
    W: ExpansionWrangler,
{
    /// Set up a run on the calling rank.
    ///
    /// Fails if the configuration does not fit the process group.
    pub fn new(
        mut transport: T,
        device: D,
        wrangler: W,
        config: DistributedConfig,
    ) -> Result<Self, RunError> {
        let rank = transport.rank();
        let size = transport.size();

        if config.root_rank >= size {
            return Err(RunError::new(
                rank,
                Phase::Init,
                DfmmError::Configuration(format!(
                    "root rank {} outside of a group of {} ranks",
                    config.root_rank, size
                )),
            ));
        }

        if let Some(expected) = config.expected_ranks {
            if expected != size {
                return Err(RunError::new(
                    rank,
                    Phase::Init,
                    DfmmError::Configuration(format!(
                        "run configured for {} ranks, but the group has {}",
                        expected, size
                    )),
                ));
            }
        }

        transport.set_timeout(config.timeout);

        Ok(Self {
            transport,
            device,
            wrangler,
            config,
        })
    }

    /// Rank of the calling process.
    pub fn rank(&self) -> usize {
        self.transport.rank()
    }

    /// True if the calling rank coordinates the run.
    pub fn is_coordinator(&self) -> bool {
        self.transport.is_root(self.config.root_rank)
    }

    /// The configuration of the run.
    pub fn config(&self) -> &DistributedConfig {
        &self.config
    }

    /// Run the evaluation.
    ///
    /// The coordinator passes the input and receives the potential at every
    /// target in user order. Workers pass `None` and receive `None`.
    pub fn run(&self, input: Option<FmmInput>) -> Result<Option<Vec<f64>>, RunError> {
        let mut state = if self.is_coordinator() {
            State::Init(input)
        } else {
            if input.is_some() {
                debug!("rank {}: ignoring input on a worker", self.rank());
            }
            State::AwaitAssignment
        };

        info!("rank {}: starting in {}", self.rank(), state.phase());

        loop {
            let from = state.phase();

            state = match state {
                State::Init(input) => self.init(input)?,
                State::Partition(plan) => self.partition(plan),
                State::Select(plan, ranges) => self.select(plan, ranges),
                State::Distribute(plan, selections) => self.distribute(plan, selections),
                State::AwaitAssignment => self.await_assignment()?,
                State::LocalCompute {
                    params,
                    assignment,
                    reduction,
                } => self.local_compute(params, assignment, reduction),
                State::Reduce { outcome, reduction } => self.reduce(outcome, reduction)?,
                State::Done(result) => return Ok(result),
            };

            info!("rank {}: {} -> {}", self.rank(), from, state.phase());
        }
    }

    fn root(&self) -> usize {
        self.config.root_rank
    }

    fn fail(&self, phase: Phase, source: impl Into<DfmmError>) -> RunError {
        RunError::new(self.rank(), phase, source)
    }

    /// Continue to the Reduce handshake with a failure.
    fn failed<'a>(&self, phase: Phase, source: impl Into<DfmmError>) -> State<'a> {
        let err = self.fail(phase, source);
        warn!("rank {}: {}", self.rank(), err);

        State::Reduce {
            outcome: Err(err),
            reduction: None,
        }
    }

    /// Send an abort header to every worker in `dests`.
    fn abort_workers(&self, dests: impl Iterator<Item = usize>) {
        for dest in dests.filter(|&dest| dest != self.root()) {
            if let Err(err) = Assignment::send_abort(&self.transport, dest) {
                warn!("rank {}: could not abort rank {}: {}", self.rank(), dest, err);
            }
        }
    }

    /// Tell every worker that no assignment will come and continue to Reduce.
    fn abandon<'a>(&self, phase: Phase, source: impl Into<DfmmError>) -> State<'a> {
        self.abort_workers(0..self.transport.size());
        self.failed(phase, source)
    }

    fn prepare<'a>(&self, input: Option<FmmInput<'a>>) -> Result<Plan<'a>, DfmmError> {
        let input = input.ok_or_else(|| {
            DfmmError::Configuration("the coordinating rank received no input".to_string())
        })?;
        let tree = input.tree;

        if input.traversal.nboxes() != tree.nboxes() {
            return Err(DfmmError::Configuration(format!(
                "traversal over {} boxes for a tree with {} boxes",
                input.traversal.nboxes(),
                tree.nboxes()
            )));
        }

        let tree_weights = tree.sources_to_tree_order(input.weights)?;
        let params = RunParameters::new(tree, self.transport.size());

        Ok(Plan {
            input,
            params,
            tree_weights,
        })
    }

    fn init<'a>(&self, input: Option<FmmInput<'a>>) -> Result<State<'a>, RunError> {
        match self.prepare(input) {
            Ok(plan) => {
                let mut message = plan.params.to_message();
                if let Err(err) = self.transport.broadcast_indices(self.root(), &mut message) {
                    // Ranks that got the parameters now wait for a header.
                    warn!("rank {}: parameter broadcast failed: {}", self.rank(), err);
                    self.abort_workers(0..self.transport.size());
                    return Err(self.fail(Phase::Init, err));
                }

                debug!(
                    "rank {}: broadcast parameters {:?}",
                    self.rank(),
                    plan.params
                );
                Ok(State::Partition(plan))
            }
            Err(err) => {
                warn!("rank {}: aborting run: {}", self.rank(), err);

                let mut message = RunParameters::abort_message();
                if let Err(abort_err) = self.transport.broadcast_indices(self.root(), &mut message)
                {
                    warn!(
                        "rank {}: could not broadcast abort: {}",
                        self.rank(),
                        abort_err
                    );
                }

                Err(self.fail(Phase::Init, err))
            }
        }
    }

    fn partition<'a>(&self, plan: Plan<'a>) -> State<'a> {
        match partition_work(plan.params.nboxes, plan.params.nranks) {
            Ok(ranges) => State::Select(plan, ranges),
            Err(err) => self.abandon(Phase::Partition, err),
        }
    }

    fn select<'a>(&self, plan: Plan<'a>, ranges: Vec<BoxRange>) -> State<'a> {
        let FmmInput {
            tree, traversal, ..
        } = plan.input;

        let selections = ranges
            .iter()
            .map(|range| select_rank(tree, traversal, range, &self.device))
            .collect::<Result<Vec<_>, _>>();

        match selections {
            Ok(selections) => {
                for selection in selections.iter() {
                    debug!(
                        "rank {}: {} owns {} boxes with {} ghosts, {} sources and {} targets",
                        self.rank(),
                        selection.local_tree.range,
                        selection.local_tree.range.len(),
                        selection.local_tree.nboxes() - selection.local_tree.range.len(),
                        selection.source_ids.len(),
                        selection.target_ids.len()
                    );
                }
                State::Distribute(plan, selections)
            }
            Err(err) => self.abandon(Phase::Select, err),
        }
    }

    fn distribute<'a>(&self, plan: Plan<'a>, selections: Vec<RankSelection>) -> State<'a> {
        let tree = plan.input.tree;
        let root = self.root();

        let reduction = Reduction {
            ntargets: tree.ntargets(),
            user_target_ids: selections
                .iter()
                .map(|selection| {
                    selection
                        .target_ids
                        .iter()
                        .map(|&index| tree.user_target_ids()[index])
                        .collect_vec()
                })
                .collect_vec(),
        };

        for (rank, selection) in selections.iter().enumerate() {
            if rank == root {
                continue;
            }

            let assignment = Assignment::from_selection(selection, tree, &plan.tree_weights);
            if let Err(err) = assignment.send(&self.transport, rank) {
                self.abort_workers(rank + 1..selections.len());
                return self.failed(Phase::Distribute, err);
            }
        }

        State::LocalCompute {
            params: plan.params,
            assignment: Assignment::from_selection(&selections[root], tree, &plan.tree_weights),
            reduction: Some(reduction),
        }
    }

    fn check_parameters(&self, params: &RunParameters) -> Result<(), DfmmError> {
        if params.nranks != self.transport.size() {
            return Err(DfmmError::Configuration(format!(
                "coordinator partitioned for {} ranks, but the group has {}",
                params.nranks,
                self.transport.size()
            )));
        }

        if params.precision_bits != PRECISION_BITS {
            return Err(DfmmError::Configuration(format!(
                "coordinator uses {} bit floats, this rank uses {} bit floats",
                params.precision_bits, PRECISION_BITS
            )));
        }

        if params.dim == 0 {
            return Err(DfmmError::Configuration(
                "coordinator announced a zero dimensional run".to_string(),
            ));
        }

        Ok(())
    }

    fn await_assignment<'a>(&self) -> Result<State<'a>, RunError> {
        let root = self.root();

        let mut message = [0; NPARAMETERS];
        self.transport
            .broadcast_indices(root, &mut message)
            .map_err(|err| self.fail(Phase::AwaitAssignment, err))?;

        let params = match RunParameters::from_message(&message, root) {
            Ok(params) => params,
            Err(TransportError::Aborted(rank)) => {
                warn!("rank {}: run aborted by rank {}", self.rank(), rank);
                return Err(self.fail(Phase::AwaitAssignment, TransportError::Aborted(rank)));
            }
            Err(err) => return Ok(self.failed(Phase::AwaitAssignment, err)),
        };

        if let Err(err) = self.check_parameters(&params) {
            return Ok(self.failed(Phase::AwaitAssignment, err));
        }

        match Assignment::receive(&self.transport, root, &params) {
            Ok(assignment) => {
                debug!(
                    "rank {}: received {} boxes, {} sources and {} targets",
                    self.rank(),
                    assignment.local_tree.nboxes(),
                    assignment.weights.len(),
                    assignment.ntargets()
                );
                Ok(State::LocalCompute {
                    params,
                    assignment,
                    reduction: None,
                })
            }
            Err(err) => Ok(self.failed(Phase::AwaitAssignment, err)),
        }
    }

    fn local_compute<'a>(
        &self,
        params: RunParameters,
        assignment: Assignment,
        reduction: Option<Reduction>,
    ) -> State<'a> {
        let problem = LocalProblem {
            dim: params.dim,
            tree: &assignment.local_tree,
            sources: &assignment.sources,
            weights: &assignment.weights,
            targets: &assignment.targets,
        };

        let outcome = self
            .wrangler
            .evaluate(&problem)
            .map_err(|err| DfmmError::Wrangler(Box::new(err)))
            .and_then(|potentials| {
                if potentials.len() == assignment.ntargets() {
                    Ok(potentials)
                } else {
                    Err(DfmmError::Wrangler(
                        format!(
                            "{} potentials for {} local targets",
                            potentials.len(),
                            assignment.ntargets()
                        )
                        .into(),
                    ))
                }
            });

        match outcome {
            Ok(potentials) => State::Reduce {
                outcome: Ok(potentials),
                reduction,
            },
            Err(err) => self.failed(Phase::LocalCompute, err),
        }
    }

    fn reduce<'a>(
        &self,
        outcome: Result<Vec<f64>, RunError>,
        reduction: Option<Reduction>,
    ) -> Result<State<'a>, RunError> {
        if self.is_coordinator() {
            self.collect(outcome, reduction)
        } else {
            self.report(outcome)
        }
    }

    /// The worker side of the Reduce handshake.
    fn report<'a>(&self, outcome: Result<Vec<f64>, RunError>) -> Result<State<'a>, RunError> {
        let root = self.root();

        let status = match &outcome {
            Ok(_) => [STATUS_OK, Phase::Done.code()],
            Err(err) => [STATUS_ABORT, err.phase.code()],
        };
        let partials = outcome.as_deref().unwrap_or(&[]);

        let sent = self
            .transport
            .send_indices(root, MessageTag::Status, &status)
            .and_then(|_| self.transport.gather_values(root, partials));

        match (outcome, sent) {
            (Err(err), _) => Err(err),
            (Ok(_), Err(err)) => Err(self.fail(Phase::Reduce, err)),
            (Ok(_), Ok(_)) => Ok(State::Done(None)),
        }
    }

    /// The coordinator side of the Reduce handshake.
    fn collect<'a>(
        &self,
        outcome: Result<Vec<f64>, RunError>,
        reduction: Option<Reduction>,
    ) -> Result<State<'a>, RunError> {
        let root = self.root();
        let mut failure = None;

        for source in (0..self.transport.size()).filter(|&source| source != root) {
            match self.transport.receive_indices(source, MessageTag::Status) {
                Ok(status) if status.first() == Some(&STATUS_OK) => {}
                Ok(status) => {
                    let phase = status
                        .get(1)
                        .copied()
                        .and_then(Phase::from_code)
                        .unwrap_or(Phase::LocalCompute);
                    warn!("rank {}: rank {} failed during {}", self.rank(), source, phase);
                    failure.get_or_insert(RunError::new(
                        source,
                        phase,
                        TransportError::Aborted(source),
                    ));
                }
                Err(err) => {
                    return Err(outcome.err().unwrap_or_else(|| self.fail(Phase::Reduce, err)));
                }
            }
        }

        let partials = outcome.as_deref().unwrap_or(&[]);
        let gathered = self.transport.gather_values(root, partials);

        outcome?;
        if let Some(failure) = failure {
            return Err(failure);
        }

        let (gathered, counts) = gathered
            .map_err(|err| self.fail(Phase::Reduce, err))?
            .ok_or_else(|| {
                self.fail(
                    Phase::Reduce,
                    DfmmError::Configuration("the root received no gathered data".to_string()),
                )
            })?;

        let reduction = reduction.ok_or_else(|| {
            self.fail(
                Phase::Reduce,
                DfmmError::Configuration("the coordinator has no target ownership".to_string()),
            )
        })?;

        let potentials = self
            .scatter(&reduction, &gathered, &counts)
            .map_err(|err| self.fail(Phase::Reduce, err))?;

        Ok(State::Done(Some(potentials)))
    }

    /// Write the gathered partial potentials to their user target positions.
    fn scatter(
        &self,
        reduction: &Reduction,
        gathered: &[f64],
        counts: &[usize],
    ) -> Result<Vec<f64>, DfmmError> {
        if counts.len() != reduction.user_target_ids.len() {
            return Err(DfmmError::Configuration(format!(
                "gathered from {} ranks, partitioned across {}",
                counts.len(),
                reduction.user_target_ids.len()
            )));
        }

        for (rank, (&count, ids)) in izip!(counts, &reduction.user_target_ids).enumerate() {
            if count != ids.len() {
                return Err(TransportError::Malformed {
                    rank,
                    what: MessageTag::Potentials.describe().to_string(),
                    reason: format!("expected {} potentials, got {}", ids.len(), count),
                }
                .into());
            }
        }

        let displacements = exclusive_from_inclusive(&self.device.inclusive_scan(counts));

        let mut potentials = vec![0.0; reduction.ntargets];
        let ptr = SendPtrMut::new(&mut potentials);

        self.device.map(0..counts.len(), |rank| {
            let partials = &gathered[displacements[rank]..displacements[rank] + counts[rank]];
            for (&user_index, &potential) in izip!(&reduction.user_target_ids[rank], partials) {
                // Every target is owned by exactly one rank.
                unsafe { ptr.write(user_index, potential) };
            }
        });

        Ok(potentials)
    }
}

#[cfg(test)]
mod test {
    use std::{thread, time::Duration};

    use approx::assert_relative_eq;
    use itertools::{izip, Itertools};
    use thiserror::Error;

    use super::{DistributedFmm, FmmInput};
    use crate::{
        assignment::RunParameters,
        config::DistributedConfig,
        device::{RayonDevice, SerialDevice},
        tools::{generate_random_particles, grid_neighbour_traversal, grid_tree, seeded_rng},
        transport::{LocalTransport, MessageTag, Transport},
        tree::{Traversal, Tree},
        types::{DfmmError, IdWidth, Phase, RunError, TransportError},
        wrangler::{
            evaluate_direct, evaluate_near_field, DirectSumWrangler, ExpansionWrangler,
            LocalProblem,
        },
    };

    type RunResult = Result<Option<Vec<f64>>, RunError>;

    fn run_threads<W>(
        nranks: usize,
        config: &DistributedConfig,
        wrangler: W,
        input: Option<FmmInput>,
    ) -> Vec<RunResult>
    where
        W: ExpansionWrangler + Clone + Send,
    {
        let _ = env_logger::builder().is_test(true).try_init();

        let group = LocalTransport::group(nranks, config.timeout);

        thread::scope(|s| {
            let handles = group
                .into_iter()
                .map(|transport| {
                    let input = if transport.rank() == config.root_rank {
                        input
                    } else {
                        None
                    };
                    let wrangler = wrangler.clone();
                    let config = config.clone();

                    s.spawn(move || -> RunResult {
                        let fmm =
                            DistributedFmm::new(transport, RayonDevice::new(), wrangler, config)?;
                        fmm.run(input)
                    })
                })
                .collect_vec();

            handles
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect_vec()
        })
    }

    struct Problem {
        dim: usize,
        sources: Vec<f64>,
        targets: Vec<f64>,
        weights: Vec<f64>,
        tree: Tree,
    }

    fn problem(dim: usize, nsources: usize, ntargets: usize, cells_per_dim: usize) -> Problem {
        let mut rng = seeded_rng(7);
        let sources = generate_random_particles(nsources, dim, &mut rng);
        let targets = generate_random_particles(ntargets, dim, &mut rng);
        let weights = (0..nsources).map(|i| 1.0 + (i % 3) as f64).collect_vec();
        let tree = grid_tree(&sources, &targets, dim, cells_per_dim, IdWidth::U32).unwrap();

        Problem {
            dim,
            sources,
            targets,
            weights,
            tree,
        }
    }

    fn assert_potentials_eq(actual: &[f64], expected: &[f64]) {
        assert_eq!(actual.len(), expected.len());
        for (a, e) in izip!(actual, expected) {
            assert_relative_eq!(a, e, epsilon = 1e-10, max_relative = 1e-10);
        }
    }

    fn config() -> DistributedConfig {
        DistributedConfig::default().with_timeout(Duration::from_secs(20))
    }

    #[test]
    fn test_all_pairs_matches_direct_sum() {
        let problem = problem(3, 400, 300, 3);
        let traversal = Traversal::all_pairs(problem.tree.nboxes());
        let expected = evaluate_direct(
            problem.dim,
            &problem.sources,
            &problem.weights,
            &problem.targets,
        );

        let input = FmmInput {
            tree: &problem.tree,
            traversal: &traversal,
            weights: &problem.weights,
        };

        for nranks in [1, 2, 3, 5] {
            let results = run_threads(nranks, &config(), DirectSumWrangler, Some(input));

            let potentials = results[0].as_ref().unwrap().as_ref().unwrap();
            assert_potentials_eq(potentials, &expected);
            assert!(results[1..]
                .iter()
                .all(|result| matches!(result, Ok(None))));
        }
    }

    #[test]
    fn test_neighbour_traversal_independent_of_rank_count() {
        let problem = problem(2, 500, 500, 4);
        let traversal = grid_neighbour_traversal(4, 2).unwrap();

        let input = FmmInput {
            tree: &problem.tree,
            traversal: &traversal,
            weights: &problem.weights,
        };

        let single = run_threads(1, &config(), DirectSumWrangler, Some(input))
            .remove(0)
            .unwrap()
            .unwrap();
        let reference =
            evaluate_near_field(&problem.tree, &traversal, &problem.weights).unwrap();
        assert_potentials_eq(&single, &reference);

        for nranks in [2, 3, 5] {
            let potentials = run_threads(nranks, &config(), DirectSumWrangler, Some(input))
                .remove(0)
                .unwrap()
                .unwrap();
            assert_potentials_eq(&potentials, &single);
        }
    }

    #[test]
    fn test_more_ranks_than_boxes() {
        // Four boxes on five ranks leaves the last rank without work.
        let problem = problem(2, 60, 40, 2);
        let traversal = Traversal::all_pairs(problem.tree.nboxes());
        let expected = evaluate_direct(
            problem.dim,
            &problem.sources,
            &problem.weights,
            &problem.targets,
        );

        let input = FmmInput {
            tree: &problem.tree,
            traversal: &traversal,
            weights: &problem.weights,
        };

        let results = run_threads(5, &config(), DirectSumWrangler, Some(input));
        assert_potentials_eq(results[0].as_ref().unwrap().as_ref().unwrap(), &expected);
    }

    #[test]
    fn test_non_zero_root() {
        let problem = problem(3, 100, 100, 2);
        let traversal = Traversal::all_pairs(problem.tree.nboxes());
        let expected = evaluate_direct(
            problem.dim,
            &problem.sources,
            &problem.weights,
            &problem.targets,
        );

        let input = FmmInput {
            tree: &problem.tree,
            traversal: &traversal,
            weights: &problem.weights,
        };

        let config = config().with_root_rank(2);
        let results = run_threads(3, &config, DirectSumWrangler, Some(input));

        assert!(matches!(results[0], Ok(None)));
        assert!(matches!(results[1], Ok(None)));
        assert_potentials_eq(results[2].as_ref().unwrap().as_ref().unwrap(), &expected);
    }

    #[test]
    fn test_configuration_mismatch() {
        let group = LocalTransport::group(2, Duration::from_secs(1));

        for transport in group {
            let config = config().with_expected_ranks(3);
            let err = DistributedFmm::new(transport, SerialDevice, DirectSumWrangler, config)
                .err()
                .unwrap();
            assert_eq!(err.phase, Phase::Init);
            assert!(matches!(err.source, DfmmError::Configuration(_)));
        }

        let mut group = LocalTransport::group(2, Duration::from_secs(1));
        let transport = group.pop().unwrap();
        let config = config().with_root_rank(4);
        assert!(DistributedFmm::new(transport, SerialDevice, DirectSumWrangler, config).is_err());
    }

    #[test]
    fn test_coordinator_abort() {
        let results = run_threads(3, &config(), DirectSumWrangler, None);

        let err = results[0].as_ref().unwrap_err();
        assert_eq!(err.rank, 0);
        assert_eq!(err.phase, Phase::Init);
        assert!(matches!(err.source, DfmmError::Configuration(_)));

        for (rank, result) in results.iter().enumerate().skip(1) {
            let err = result.as_ref().unwrap_err();
            assert_eq!(err.rank, rank);
            assert_eq!(err.phase, Phase::AwaitAssignment);
            assert!(matches!(
                err.source,
                DfmmError::Transport(TransportError::Aborted(0))
            ));
        }
    }

    #[test]
    fn test_inconsistent_weights_abort() {
        let problem = problem(3, 50, 50, 2);
        let traversal = Traversal::all_pairs(problem.tree.nboxes());
        let weights = vec![1.0; problem.tree.nsources() - 1];

        let input = FmmInput {
            tree: &problem.tree,
            traversal: &traversal,
            weights: &weights,
        };

        let results = run_threads(2, &config(), DirectSumWrangler, Some(input));
        assert_eq!(results[0].as_ref().unwrap_err().phase, Phase::Init);
        assert_eq!(results[1].as_ref().unwrap_err().phase, Phase::AwaitAssignment);
    }

    #[test]
    fn test_malformed_assignment() {
        let problem = problem(3, 50, 50, 2);
        let mut group = LocalTransport::group(2, Duration::from_secs(5));
        let worker = group.pop().unwrap();
        let root = group.pop().unwrap();

        // Play the coordinator by hand: valid parameters, then a truncated header.
        let mut message = RunParameters::new(&problem.tree, 2).to_message();
        root.broadcast_indices(0, &mut message).unwrap();
        root.send_indices(1, MessageTag::Header, &[1, 0, 4]).unwrap();

        let fmm = DistributedFmm::new(worker, SerialDevice, DirectSumWrangler, config()).unwrap();
        let err = fmm.run(None).unwrap_err();
        assert_eq!(err.rank, 1);
        assert_eq!(err.phase, Phase::AwaitAssignment);
        assert!(matches!(
            err.source,
            DfmmError::Transport(TransportError::Malformed { .. })
        ));

        // The worker still reports to the coordinator.
        let status = root.receive_indices(1, MessageTag::Status).unwrap();
        assert_eq!(status, vec![0, Phase::AwaitAssignment.code()]);
        let (gathered, counts) = root.gather_values(0, &[]).unwrap().unwrap();
        assert!(gathered.is_empty());
        assert_eq!(counts, vec![0, 0]);
    }

    #[test]
    fn test_worker_times_out() {
        let mut group = LocalTransport::group(2, Duration::from_secs(5));
        let worker = group.pop().unwrap();

        let config = config().with_timeout(Duration::from_millis(50));
        let fmm = DistributedFmm::new(worker, SerialDevice, DirectSumWrangler, config).unwrap();

        let err = fmm.run(None).unwrap_err();
        assert_eq!(err.phase, Phase::AwaitAssignment);
        assert!(matches!(
            err.source,
            DfmmError::Transport(TransportError::Timeout { rank: 0, .. })
        ));
    }

    #[derive(Debug, Error)]
    #[error("evaluation refused")]
    struct Refused;

    #[derive(Copy, Clone)]
    struct FailOnRank(usize);

    impl ExpansionWrangler for FailOnRank {
        type Error = Refused;

        fn evaluate(&self, problem: &LocalProblem) -> Result<Vec<f64>, Self::Error> {
            if problem.tree.range.rank == self.0 {
                Err(Refused)
            } else {
                DirectSumWrangler.evaluate(problem).map_err(|_| Refused)
            }
        }
    }

    #[test]
    fn test_wrangler_failure_reported_by_rank() {
        let problem = problem(3, 200, 200, 3);
        let traversal = grid_neighbour_traversal(3, 3).unwrap();

        let input = FmmInput {
            tree: &problem.tree,
            traversal: &traversal,
            weights: &problem.weights,
        };

        let results = run_threads(3, &config(), FailOnRank(1), Some(input));

        let err = results[0].as_ref().unwrap_err();
        assert_eq!(err.rank, 1);
        assert_eq!(err.phase, Phase::LocalCompute);

        let err = results[1].as_ref().unwrap_err();
        assert_eq!(err.rank, 1);
        assert_eq!(err.phase, Phase::LocalCompute);
        assert!(matches!(err.source, DfmmError::Wrangler(_)));

        assert!(matches!(results[2], Ok(None)));
    }

    /// A `LocalTransport` that cannot deliver assignment headers to one rank.
    struct HeaderRefused {
        inner: LocalTransport,
        dest: usize,
    }

    impl Transport for HeaderRefused {
        fn rank(&self) -> usize {
            self.inner.rank()
        }

        fn size(&self) -> usize {
            self.inner.size()
        }

        fn send_indices(
            &self,
            dest: usize,
            tag: MessageTag,
            data: &[u64],
        ) -> Result<(), TransportError> {
            if dest == self.dest && tag == MessageTag::Header {
                return Err(TransportError::Send {
                    rank: dest,
                    what: tag.describe().to_string(),
                });
            }
            self.inner.send_indices(dest, tag, data)
        }

        fn receive_indices(
            &self,
            source: usize,
            tag: MessageTag,
        ) -> Result<Vec<u64>, TransportError> {
            self.inner.receive_indices(source, tag)
        }

        fn send_values(
            &self,
            dest: usize,
            tag: MessageTag,
            data: &[f64],
        ) -> Result<(), TransportError> {
            self.inner.send_values(dest, tag, data)
        }

        fn receive_values(
            &self,
            source: usize,
            tag: MessageTag,
        ) -> Result<Vec<f64>, TransportError> {
            self.inner.receive_values(source, tag)
        }

        fn broadcast_indices(&self, root: usize, data: &mut [u64]) -> Result<(), TransportError> {
            self.inner.broadcast_indices(root, data)
        }

        fn gather_values(
            &self,
            root: usize,
            local: &[f64],
        ) -> Result<Option<(Vec<f64>, Vec<usize>)>, TransportError> {
            self.inner.gather_values(root, local)
        }

        fn set_timeout(&mut self, timeout: Duration) {
            self.inner.set_timeout(timeout);
        }
    }

    #[test]
    fn test_distribute_failure_aborts_workers() {
        let _ = env_logger::builder().is_test(true).try_init();

        let problem = problem(3, 200, 200, 3);
        let traversal = Traversal::all_pairs(problem.tree.nboxes());
        let input = FmmInput {
            tree: &problem.tree,
            traversal: &traversal,
            weights: &problem.weights,
        };

        let config = config().with_timeout(Duration::from_millis(500));
        let mut group = LocalTransport::group(3, config.timeout);
        let second = group.pop().unwrap();
        let first = group.pop().unwrap();
        let root = HeaderRefused {
            inner: group.pop().unwrap(),
            dest: 1,
        };

        let results: Vec<RunResult> = thread::scope(|s| {
            let config = &config;
            let root = s.spawn(move || -> RunResult {
                DistributedFmm::new(root, SerialDevice, DirectSumWrangler, config.clone())?
                    .run(Some(input))
            });
            let workers = [first, second].map(|transport| {
                s.spawn(move || -> RunResult {
                    DistributedFmm::new(transport, SerialDevice, DirectSumWrangler, config.clone())?
                        .run(None)
                })
            });

            [root]
                .into_iter()
                .chain(workers)
                .map(|handle| handle.join().unwrap())
                .collect_vec()
        });

        let err = results[0].as_ref().unwrap_err();
        assert_eq!(err.rank, 0);
        assert_eq!(err.phase, Phase::Distribute);
        assert!(matches!(
            err.source,
            DfmmError::Transport(TransportError::Send { rank: 1, .. })
        ));

        // The refused rank never hears from the root.
        let err = results[1].as_ref().unwrap_err();
        assert_eq!(err.phase, Phase::AwaitAssignment);
        assert!(matches!(
            err.source,
            DfmmError::Transport(TransportError::Timeout { rank: 0, .. })
        ));

        let err = results[2].as_ref().unwrap_err();
        assert_eq!(err.rank, 2);
        assert_eq!(err.phase, Phase::AwaitAssignment);
        assert!(matches!(
            err.source,
            DfmmError::Transport(TransportError::Aborted(0))
        ));

        assert!(results.iter().all(|result| !matches!(result, Ok(Some(_)))));
    }

    #[test]
    fn test_broadcast_failure_aborts_reached_workers() {
        let _ = env_logger::builder().is_test(true).try_init();

        let problem = problem(3, 100, 100, 2);
        let traversal = Traversal::all_pairs(problem.tree.nboxes());
        let input = FmmInput {
            tree: &problem.tree,
            traversal: &traversal,
            weights: &problem.weights,
        };

        let config = config();
        let mut group = LocalTransport::group(3, config.timeout);
        let last = group.pop().unwrap();
        drop(group.pop());
        let root = group.pop().unwrap();

        let (root_result, last_result) = thread::scope(|s| {
            let config = &config;
            let root = s.spawn(move || -> RunResult {
                DistributedFmm::new(root, SerialDevice, DirectSumWrangler, config.clone())?
                    .run(Some(input))
            });
            let last = s.spawn(move || -> RunResult {
                DistributedFmm::new(last, SerialDevice, DirectSumWrangler, config.clone())?
                    .run(None)
            });
            (root.join().unwrap(), last.join().unwrap())
        });

        let err = root_result.unwrap_err();
        assert_eq!(err.phase, Phase::Init);
        assert!(matches!(
            err.source,
            DfmmError::Transport(TransportError::Send { rank: 1, .. })
        ));

        let err = last_result.unwrap_err();
        assert_eq!(err.rank, 2);
        assert_eq!(err.phase, Phase::AwaitAssignment);
        assert!(matches!(
            err.source,
            DfmmError::Transport(TransportError::Aborted(0))
        ));
    }
}
