//! Utility routines.

use std::path::Path;

use itertools::Itertools;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use vtkio::model::{
    Attribute, Attributes, ByteOrder, CellType, Cells, DataSet, UnstructuredGridPiece, Version,
    VertexNumbers, Vtk,
};

use crate::{
    geometry::BoundingBox,
    scan::{exclusive_from_inclusive, inclusive_scan_serial},
    tree::{BoxSpans, Traversal, Tree},
    types::{BoxRange, DfmmError, IdWidth},
};

/// Get a seeded rng
pub fn seeded_rng(seed: usize) -> ChaCha8Rng {
    ChaCha8Rng::seed_from_u64(seed as u64)
}

/// Generate `npoints` points uniformly distributed in the unit cube.
///
/// The points are returned point-major.
pub fn generate_random_particles<R: Rng>(npoints: usize, dim: usize, rng: &mut R) -> Vec<f64> {
    (0..npoints * dim).map(|_| rng.gen::<f64>()).collect_vec()
}

/// Generate `npoints` normally distributed points around `center`.
///
/// Clustered point sets give skewed box occupation, which is what uneven
/// workloads look like in practice.
pub fn generate_normal_particles<R: Rng>(
    npoints: usize,
    center: &[f64],
    std_dev: f64,
    rng: &mut R,
) -> Result<Vec<f64>, DfmmError> {
    let dist = Normal::new(0.0, std_dev).map_err(|e| {
        DfmmError::Configuration(format!("invalid standard deviation {}: {}", std_dev, e))
    })?;

    Ok((0..npoints)
        .flat_map(|_| {
            center
                .iter()
                .map(|&c| c + dist.sample(rng))
                .collect_vec()
        })
        .collect_vec())
}

/// Sort points into the cells of a uniform grid.
///
/// Returns the points in cell order, the original index of every sorted point
/// and the start and count of every cell.
fn sort_into_cells(
    points: &[f64],
    dim: usize,
    bounding_box: &BoundingBox,
    cells_per_dim: usize,
    ncells: usize,
) -> (Vec<f64>, Vec<usize>, Vec<usize>, Vec<usize>) {
    let cells = points
        .chunks_exact(dim)
        .map(|point| bounding_box.cell_index(point, cells_per_dim))
        .collect_vec();

    let order = (0..cells.len())
        .sorted_by_key(|&index| (cells[index], index))
        .collect_vec();

    let mut counts = vec![0; ncells];
    for &cell in cells.iter() {
        counts[cell] += 1;
    }
    let starts = exclusive_from_inclusive(&inclusive_scan_serial(&counts));

    let sorted = order
        .iter()
        .flat_map(|&index| points[dim * index..dim * (index + 1)].iter().copied())
        .collect_vec();

    (sorted, order, starts, counts)
}

/// A single level tree over a uniform grid of `cells_per_dim^dim` boxes.
///
/// The grid covers the bounding box of all sources and targets. Every box is a
/// leaf, so all its particles are non-child particles. Boxes are numbered with
/// the first axis varying fastest.
pub fn grid_tree(
    sources: &[f64],
    targets: &[f64],
    dim: usize,
    cells_per_dim: usize,
    id_width: IdWidth,
) -> Result<Tree, DfmmError> {
    if cells_per_dim == 0 {
        return Err(DfmmError::Configuration(
            "a grid needs at least one cell per dimension".to_string(),
        ));
    }

    let all_points = sources.iter().chain(targets).copied().collect_vec();
    let bounding_box = BoundingBox::from_points(&all_points, dim)?;

    if targets.len() % dim != 0 || sources.len() % dim != 0 {
        return Err(DfmmError::Configuration(format!(
            "coordinates are not a multiple of the dimension {}",
            dim
        )));
    }

    let ncells = cells_per_dim.pow(dim as u32);

    let (tree_sources, user_source_ids, source_starts, source_counts) =
        sort_into_cells(sources, dim, &bounding_box, cells_per_dim, ncells);
    let (tree_targets, user_target_ids, target_starts, target_counts) =
        sort_into_cells(targets, dim, &bounding_box, cells_per_dim, ncells);

    Tree::new(
        dim,
        id_width,
        tree_sources,
        tree_targets,
        user_source_ids,
        user_target_ids,
        BoxSpans {
            source_starts,
            source_counts_nonchild: source_counts,
            target_starts,
            target_counts_nonchild: target_counts,
        },
    )
}

/// The near field traversal of a uniform grid.
///
/// Every box depends on itself and on all boxes that touch it, so a direct
/// sum over the traversal is the near field part of an FMM evaluation.
pub fn grid_neighbour_traversal(cells_per_dim: usize, dim: usize) -> Result<Traversal, DfmmError> {
    if cells_per_dim == 0 || dim == 0 {
        return Err(DfmmError::Configuration(format!(
            "cannot build a grid with {} cells in {} dimensions",
            cells_per_dim, dim
        )));
    }

    let nboxes = cells_per_dim.pow(dim as u32);
    let strides = (0..dim).map(|axis| cells_per_dim.pow(axis as u32)).collect_vec();

    let mut dependency_starts = Vec::with_capacity(nboxes + 1);
    let mut dependency_lists = Vec::new();
    dependency_starts.push(0);

    for box_id in 0..nboxes {
        let neighbours = strides
            .iter()
            .map(|&stride| {
                let index = (box_id / stride) % cells_per_dim;
                index.saturating_sub(1)..=(index + 1).min(cells_per_dim - 1)
            })
            .multi_cartesian_product()
            .map(|index| {
                index
                    .iter()
                    .zip(strides.iter())
                    .map(|(i, stride)| i * stride)
                    .sum::<usize>()
            })
            .sorted()
            .collect_vec();

        dependency_lists.extend(neighbours);
        dependency_starts.push(dependency_lists.len());
    }

    Traversal::new(nboxes, dependency_starts, dependency_lists)
}

/// The rank owning each source of `tree`, in tree order.
///
/// Sources outside of the non-child spans of all boxes are marked with `-1`.
pub fn source_owners(tree: &Tree, ranges: &[BoxRange]) -> Vec<i32> {
    let mut owners = vec![-1; tree.nsources()];

    for range in ranges {
        for box_id in range.boxes().filter(|&box_id| box_id < tree.nboxes()) {
            let start = tree.box_source_starts()[box_id];
            let count = tree.box_source_counts_nonchild()[box_id];
            owners[start..start + count].fill(range.rank as i32);
        }
    }

    owners
}

/// Write the sources of `tree` to a legacy VTK file, colored by owning rank.
///
/// Each source becomes a vertex cell with a `rank` point attribute. Points of
/// two dimensional trees are written in the `z = 0` plane.
pub fn export_partition_to_vtk<P: AsRef<Path>>(
    tree: &Tree,
    ranges: &[BoxRange],
    path: P,
) -> Result<(), DfmmError> {
    let dim = tree.dim();
    if dim > 3 {
        return Err(DfmmError::Configuration(format!(
            "cannot export points in {} dimensions",
            dim
        )));
    }

    let npoints = tree.nsources();

    let points = tree
        .sources()
        .chunks_exact(dim)
        .flat_map(|point| (0..3).map(|axis| point.get(axis).copied().unwrap_or(0.0)))
        .collect_vec();

    let vertices = (0..npoints)
        .flat_map(|index| [1, index as u32])
        .collect_vec();

    let owners = source_owners(tree, ranges);

    let vtk = Vtk {
        version: Version { major: 4, minor: 1 },
        byte_order: ByteOrder::BigEndian,
        title: String::from("FMM work partition"),
        file_path: None,
        data: DataSet::inline(UnstructuredGridPiece {
            points: points.into(),
            cells: Cells {
                cell_verts: VertexNumbers::Legacy {
                    num_cells: npoints as u32,
                    vertices,
                },
                types: vec![CellType::Vertex; npoints],
            },
            data: Attributes {
                point: vec![Attribute::scalars("rank", 1).with_data(owners)],
                cell: vec![],
            },
        }),
    };

    vtk.export_ascii(path)?;

    Ok(())
}

#[cfg(test)]
mod test {
    use itertools::Itertools;

    use super::{
        export_partition_to_vtk, generate_normal_particles,
        generate_random_particles, grid_neighbour_traversal, grid_tree, seeded_rng,
        source_owners,
    };
    use crate::{partition::partition_work, types::IdWidth};

    #[test]
    fn test_grid_tree_spans() {
        let mut rng = seeded_rng(0);
        let sources = generate_random_particles(500, 3, &mut rng);
        let targets = generate_random_particles(100, 3, &mut rng);

        let tree = grid_tree(&sources, &targets, 3, 4, IdWidth::U32).unwrap();
        assert_eq!(tree.nboxes(), 64);
        assert_eq!(tree.box_source_counts_nonchild().iter().sum::<usize>(), 500);
        assert_eq!(tree.box_target_counts_nonchild().iter().sum::<usize>(), 100);

        // Every sorted source is the user source it claims to be.
        for (point, &user_index) in tree
            .sources()
            .chunks_exact(3)
            .zip(tree.user_source_ids().iter())
        {
            assert_eq!(point, &sources[3 * user_index..3 * user_index + 3]);
        }
    }

    #[test]
    fn test_grid_tree_rejects_bad_input() {
        let points = vec![0.5; 6];
        assert!(grid_tree(&points, &points, 3, 0, IdWidth::U32).is_err());
        assert!(grid_tree(&points, &points, 4, 2, IdWidth::U32).is_err());
        assert!(grid_tree(&points, &points, 0, 2, IdWidth::U32).is_err());
    }

    #[test]
    fn test_grid_neighbour_traversal() {
        let traversal = grid_neighbour_traversal(3, 2).unwrap();
        assert_eq!(traversal.nboxes(), 9);

        // Corner, edge and center boxes of a 3 x 3 grid.
        assert_eq!(traversal.dependencies(0), &[0, 1, 3, 4]);
        assert_eq!(traversal.dependencies(1), &[0, 1, 2, 3, 4, 5]);
        assert_eq!(traversal.dependencies(4), (0..9).collect_vec().as_slice());

        let traversal = grid_neighbour_traversal(4, 3).unwrap();
        assert_eq!(traversal.dependencies(0).len(), 8);
        assert_eq!(traversal.dependencies(21).len(), 27);

        assert!(grid_neighbour_traversal(0, 3).is_err());
    }

    #[test]
    fn test_normal_particles() {
        let mut rng = seeded_rng(3);
        let points = generate_normal_particles(1000, &[1.0, -1.0], 0.1, &mut rng).unwrap();
        assert_eq!(points.len(), 2000);

        let mean_x = points.iter().step_by(2).sum::<f64>() / 1000.0;
        assert!((mean_x - 1.0).abs() < 0.05);

        assert!(generate_normal_particles(10, &[0.0], -1.0, &mut rng).is_err());
    }

    #[test]
    fn test_export_partition() {
        let mut rng = seeded_rng(5);
        let points = generate_random_particles(200, 2, &mut rng);
        let tree = grid_tree(&points, &points, 2, 4, IdWidth::U16).unwrap();
        let ranges = partition_work(tree.nboxes(), 3).unwrap();

        let owners = source_owners(&tree, &ranges);
        assert!(owners.iter().all(|&rank| (0..3).contains(&rank)));
        assert!(owners.iter().tuple_windows().all(|(a, b)| a <= b));

        let path = std::env::temp_dir().join(format!("dfmm_partition_{}.vtk", std::process::id()));
        export_partition_to_vtk(&tree, &ranges, &path).unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.contains("rank"));
        std::fs::remove_file(&path).unwrap();
    }
}
