//! The messages exchanged between the coordinator and the workers.
//!
//! A run starts with a broadcast of the run parameters. Each worker then
//! receives its assignment as a header followed by the box data, the dependency
//! lists, the source coordinates, the source weights and the target
//! coordinates. Every message is checked against the header on receipt.
use itertools::Itertools;

use crate::{
    constants::{NHEADER, NPARAMETERS, PRECISION_BITS, STATUS_ABORT, STATUS_OK},
    locality::{LocalTree, RankSelection},
    transport::{MessageTag, Transport},
    tree::Tree,
    types::{BoxRange, IdWidth, TransportError},
};

/// Scalar parameters broadcast at the start of a run.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RunParameters {
    /// Spatial dimension.
    pub dim: usize,
    /// Global number of sources.
    pub nsources: usize,
    /// Global number of targets.
    pub ntargets: usize,
    /// Global number of boxes.
    pub nboxes: usize,
    /// Number of ranks the boxes are partitioned across.
    pub nranks: usize,
    /// Id width of the tree.
    pub id_width: IdWidth,
    /// Floating point width of coordinates and weights.
    pub precision_bits: u64,
}

impl RunParameters {
    /// Parameters of a run over `tree` with `nranks` ranks.
    pub fn new(tree: &Tree, nranks: usize) -> Self {
        Self {
            dim: tree.dim(),
            nsources: tree.nsources(),
            ntargets: tree.ntargets(),
            nboxes: tree.nboxes(),
            nranks,
            id_width: tree.id_width(),
            precision_bits: PRECISION_BITS,
        }
    }

    /// Encode the parameters for a broadcast.
    pub fn to_message(&self) -> [u64; NPARAMETERS] {
        [
            STATUS_OK,
            self.dim as u64,
            self.nsources as u64,
            self.ntargets as u64,
            self.nboxes as u64,
            self.nranks as u64,
            self.id_width.bits(),
            self.precision_bits,
        ]
    }

    /// The broadcast message that cancels a run.
    pub fn abort_message() -> [u64; NPARAMETERS] {
        let mut message = [0; NPARAMETERS];
        message[0] = STATUS_ABORT;
        message
    }

    /// Decode a broadcast from `root`.
    pub fn from_message(message: &[u64], root: usize) -> Result<Self, TransportError> {
        let malformed = |reason: String| TransportError::Malformed {
            rank: root,
            what: MessageTag::Parameters.describe().to_string(),
            reason,
        };

        if message.len() != NPARAMETERS {
            return Err(malformed(format!(
                "expected {} entries, got {}",
                NPARAMETERS,
                message.len()
            )));
        }

        if message[0] != STATUS_OK {
            return Err(TransportError::Aborted(root));
        }

        let id_width = IdWidth::from_bits(message[6])
            .ok_or_else(|| malformed(format!("unknown id width of {} bits", message[6])))?;

        Ok(Self {
            dim: message[1] as usize,
            nsources: message[2] as usize,
            ntargets: message[3] as usize,
            nboxes: message[4] as usize,
            nranks: message[5] as usize,
            id_width,
            precision_bits: message[7],
        })
    }
}

/// Everything a rank needs for its local evaluation.
#[derive(Clone, Debug, PartialEq)]
pub struct Assignment {
    /// Local boxes and spans.
    pub local_tree: LocalTree,
    /// Local source coordinates, ghosts included.
    pub sources: Vec<f64>,
    /// Local source weights.
    pub weights: Vec<f64>,
    /// Local target coordinates.
    pub targets: Vec<f64>,
}

fn gather_points(coords: &[f64], dim: usize, ids: &[usize]) -> Vec<f64> {
    ids.iter()
        .flat_map(|&index| coords[dim * index..dim * (index + 1)].iter().copied())
        .collect_vec()
}

fn to_indices(arr: &[usize]) -> impl Iterator<Item = u64> + '_ {
    arr.iter().map(|&elem| elem as u64)
}

fn to_usize(arr: &[u64]) -> Vec<usize> {
    arr.iter().map(|&elem| elem as usize).collect_vec()
}

impl Assignment {
    /// Assemble the assignment of a selected rank.
    ///
    /// `tree_weights` are the source weights in tree order.
    pub fn from_selection(selection: &RankSelection, tree: &Tree, tree_weights: &[f64]) -> Self {
        let dim = tree.dim();

        Self {
            local_tree: selection.local_tree.clone(),
            sources: gather_points(tree.sources(), dim, &selection.source_ids),
            weights: selection
                .source_ids
                .iter()
                .map(|&index| tree_weights[index])
                .collect_vec(),
            targets: gather_points(tree.targets(), dim, &selection.target_ids),
        }
    }

    /// Number of local targets.
    pub fn ntargets(&self) -> usize {
        self.local_tree.ntargets()
    }

    /// Send the assignment to `dest`.
    pub fn send<T: Transport>(&self, transport: &T, dest: usize) -> Result<(), TransportError> {
        let tree = &self.local_tree;

        let header = [
            STATUS_OK,
            tree.range.lo as u64,
            tree.range.hi as u64,
            tree.nboxes() as u64,
            self.weights.len() as u64,
            tree.ntargets() as u64,
            tree.dependency_lists.len() as u64,
        ];
        transport.send_indices(dest, MessageTag::Header, &header)?;

        let boxes = to_indices(&tree.box_ids)
            .chain(to_indices(&tree.box_source_starts))
            .chain(to_indices(&tree.box_source_counts))
            .chain(to_indices(&tree.box_target_starts))
            .chain(to_indices(&tree.box_target_counts))
            .collect_vec();
        transport.send_indices(dest, MessageTag::Boxes, &boxes)?;

        let dependencies = to_indices(&tree.dependency_starts)
            .chain(to_indices(&tree.dependency_lists))
            .collect_vec();
        transport.send_indices(dest, MessageTag::Dependencies, &dependencies)?;

        transport.send_values(dest, MessageTag::Sources, &self.sources)?;
        transport.send_values(dest, MessageTag::Weights, &self.weights)?;
        transport.send_values(dest, MessageTag::Targets, &self.targets)?;

        Ok(())
    }

    /// Tell `dest` that no assignment will come.
    pub fn send_abort<T: Transport>(transport: &T, dest: usize) -> Result<(), TransportError> {
        let mut header = [0; NHEADER];
        header[0] = STATUS_ABORT;
        transport.send_indices(dest, MessageTag::Header, &header)
    }

    /// Receive the assignment of the calling rank from `root`.
    pub fn receive<T: Transport>(
        transport: &T,
        root: usize,
        params: &RunParameters,
    ) -> Result<Self, TransportError> {
        let malformed = |tag: MessageTag, reason: String| TransportError::Malformed {
            rank: root,
            what: tag.describe().to_string(),
            reason,
        };

        let expect_len = |tag: MessageTag, actual: usize, expected: usize| {
            if actual == expected {
                Ok(())
            } else {
                Err(malformed(
                    tag,
                    format!("expected {} entries, got {}", expected, actual),
                ))
            }
        };

        let header = transport.receive_indices(root, MessageTag::Header)?;
        expect_len(MessageTag::Header, header.len(), NHEADER)?;

        if header[0] != STATUS_OK {
            return Err(TransportError::Aborted(root));
        }

        let header = to_usize(&header);
        let (lo, hi, nboxes, nsources, ntargets, ndependencies) =
            (header[1], header[2], header[3], header[4], header[5], header[6]);

        if lo > hi || hi > params.nboxes {
            return Err(malformed(
                MessageTag::Header,
                format!("invalid box range [{}, {})", lo, hi),
            ));
        }

        let overflow = || malformed(MessageTag::Header, "message sizes overflow".to_string());
        let dim = params.dim;
        let nbox_entries = nboxes.checked_mul(5).ok_or_else(overflow)?;
        let ndependency_entries = (hi - lo + 1)
            .checked_add(ndependencies)
            .ok_or_else(overflow)?;
        let nsource_coords = dim.checked_mul(nsources).ok_or_else(overflow)?;
        let ntarget_coords = dim.checked_mul(ntargets).ok_or_else(overflow)?;

        let boxes = to_usize(&transport.receive_indices(root, MessageTag::Boxes)?);
        expect_len(MessageTag::Boxes, boxes.len(), nbox_entries)?;

        let dependencies = to_usize(&transport.receive_indices(root, MessageTag::Dependencies)?);
        expect_len(
            MessageTag::Dependencies,
            dependencies.len(),
            ndependency_entries,
        )?;

        let sources = transport.receive_values(root, MessageTag::Sources)?;
        expect_len(MessageTag::Sources, sources.len(), nsource_coords)?;

        let weights = transport.receive_values(root, MessageTag::Weights)?;
        expect_len(MessageTag::Weights, weights.len(), nsources)?;

        let targets = transport.receive_values(root, MessageTag::Targets)?;
        expect_len(MessageTag::Targets, targets.len(), ntarget_coords)?;

        let mut chunks = boxes.chunks_exact(nboxes.max(1)).map(|chunk| chunk.to_vec());
        let mut next = || chunks.next().unwrap_or_default();

        let (dependency_starts, dependency_lists) = dependencies.split_at(hi - lo + 1);

        let local_tree = LocalTree {
            range: BoxRange::new(transport.rank(), lo, hi),
            box_ids: next(),
            box_source_starts: next(),
            box_source_counts: next(),
            box_target_starts: next(),
            box_target_counts: next(),
            dependency_starts: dependency_starts.to_vec(),
            dependency_lists: dependency_lists.to_vec(),
        };

        local_tree
            .validate(params.nboxes, nsources, ntargets)
            .map_err(|reason| malformed(MessageTag::Boxes, reason))?;

        if local_tree.nsources() != nsources || local_tree.ntargets() != ntargets {
            return Err(malformed(
                MessageTag::Boxes,
                "box spans do not cover the shipped particles".to_string(),
            ));
        }

        Ok(Self {
            local_tree,
            sources,
            weights,
            targets,
        })
    }
}
