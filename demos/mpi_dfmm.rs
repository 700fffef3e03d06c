//! Distributed direct sum over MPI.
//!
//! Run with `mpirun -n 4 cargo run --release --features mpi --example mpi_dfmm`.
use std::time::Instant;

use bempp_dfmm::{
    device::RayonDevice,
    tools::{generate_random_particles, grid_neighbour_traversal, grid_tree, seeded_rng},
    transport::MpiTransport,
    types::IdWidth,
    wrangler::{evaluate_near_field, DirectSumWrangler},
    DistributedConfig, DistributedFmm, FmmInput,
};
use itertools::izip;
use mpi::traits::Communicator;

pub fn main() {
    env_logger::init();

    let universe = mpi::initialize().unwrap();
    let world = universe.world();
    let rank = world.rank() as usize;

    let dim = 3;
    let cells_per_dim = 8;
    let npoints = 20000;

    let config = DistributedConfig::default().with_expected_ranks(world.size() as usize);
    let fmm = DistributedFmm::new(
        MpiTransport::new(&world),
        RayonDevice::new(),
        DirectSumWrangler,
        config,
    )
    .unwrap();

    if fmm.is_coordinator() {
        let mut rng = seeded_rng(0);
        let sources = generate_random_particles(npoints, dim, &mut rng);
        let targets = generate_random_particles(npoints, dim, &mut rng);
        let weights = vec![1.0; npoints];

        let tree = grid_tree(&sources, &targets, dim, cells_per_dim, IdWidth::U32).unwrap();
        let traversal = grid_neighbour_traversal(cells_per_dim, dim).unwrap();

        let input = FmmInput {
            tree: &tree,
            traversal: &traversal,
            weights: &weights,
        };

        let start = Instant::now();
        let potentials = fmm.run(Some(input)).unwrap().unwrap();
        println!(
            "Evaluated {} targets on {} ranks in {} ms",
            potentials.len(),
            world.size(),
            start.elapsed().as_millis()
        );

        // The same evaluation on the root alone.
        let single = evaluate_near_field(&tree, &traversal, &weights).unwrap();
        let max_error = izip!(&potentials, &single)
            .map(|(a, b)| (a - b).abs() / b.abs().max(1.0))
            .fold(0.0, f64::max);
        println!("Maximum relative difference to a single rank: {:e}", max_error);
    } else {
        fmm.run(None).unwrap();
        println!("Rank {} done.", rank);
    }
}
