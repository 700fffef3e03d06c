//! Distributed evaluation of a clustered particle set with one thread per rank.
//!
//! Run with `RUST_LOG=info cargo run --release --example threaded_dfmm`.
use std::{thread, time::Instant};

use bempp_dfmm::{
    device::RayonDevice,
    tools::{generate_normal_particles, grid_neighbour_traversal, grid_tree, seeded_rng},
    transport::{LocalTransport, Transport},
    types::IdWidth,
    wrangler::{evaluate_near_field, DirectSumWrangler},
    DistributedConfig, DistributedFmm, FmmInput,
};
use itertools::{izip, Itertools};

pub fn main() {
    env_logger::init();

    let nranks = 4;
    let dim = 3;
    let cells_per_dim = 6;
    let npoints = 10000;

    let mut rng = seeded_rng(0);
    let sources = generate_normal_particles(npoints, &[0.5, 0.5, 0.5], 0.2, &mut rng).unwrap();
    let targets = generate_normal_particles(npoints, &[0.3, 0.6, 0.5], 0.1, &mut rng).unwrap();
    let weights = (0..npoints).map(|i| 1.0 / (1 + i % 7) as f64).collect_vec();

    let tree = grid_tree(&sources, &targets, dim, cells_per_dim, IdWidth::U32).unwrap();
    let traversal = grid_neighbour_traversal(cells_per_dim, dim).unwrap();

    let input = FmmInput {
        tree: &tree,
        traversal: &traversal,
        weights: &weights,
    };

    let config = DistributedConfig::default().with_expected_ranks(nranks);
    let group = LocalTransport::group(nranks, config.timeout);

    let start = Instant::now();
    let potentials = thread::scope(|s| {
        let handles = group
            .into_iter()
            .map(|transport| {
                let config = config.clone();
                let input = (transport.rank() == config.root_rank).then_some(input);
                s.spawn(move || {
                    let fmm =
                        DistributedFmm::new(transport, RayonDevice::new(), DirectSumWrangler, config)
                            .unwrap();
                    fmm.run(input).unwrap()
                })
            })
            .collect_vec();

        handles
            .into_iter()
            .filter_map(|handle| handle.join().unwrap())
            .next()
            .unwrap()
    });
    println!(
        "Evaluated {} targets on {} ranks in {} ms",
        potentials.len(),
        nranks,
        start.elapsed().as_millis()
    );

    let start = Instant::now();
    let single = evaluate_near_field(&tree, &traversal, &weights).unwrap();
    println!("Serial evaluation in {} ms", start.elapsed().as_millis());

    let max_error = izip!(&potentials, &single)
        .map(|(a, b)| (a - b).abs() / b.abs().max(1.0))
        .fold(0.0, f64::max);
    println!("Maximum relative difference: {:e}", max_error);
}
