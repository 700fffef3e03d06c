//! Write the box partition of a clustered particle set to `partition.vtk`.
//!
//! Open the file in Paraview and color the points by `rank`.
use bempp_dfmm::{
    partition::partition_work,
    tools::{export_partition_to_vtk, generate_normal_particles, grid_tree, seeded_rng},
    types::IdWidth,
};

pub fn main() {
    let nranks = 8;
    let cells_per_dim = 10;

    let mut rng = seeded_rng(0);
    let points = generate_normal_particles(50000, &[0.0, 0.0, 0.0], 1.0, &mut rng).unwrap();

    let tree = grid_tree(&points, &points, 3, cells_per_dim, IdWidth::U32).unwrap();
    let ranges = partition_work(tree.nboxes(), nranks).unwrap();

    for range in ranges.iter() {
        let nsources = range
            .boxes()
            .map(|box_id| tree.box_source_counts_nonchild()[box_id])
            .sum::<usize>();
        println!("{} holds {} sources", range, nsources);
    }

    export_partition_to_vtk(&tree, &ranges, "partition.vtk").unwrap();
    println!("Wrote partition.vtk");
}
