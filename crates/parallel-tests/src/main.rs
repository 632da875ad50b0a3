//! MPI-driven check that the distributed engine agrees with a sequential
//! run over the same particles, in the shape of an MPI smoke-test binary:
//! every rank builds the same particle set, runs both engines, and
//! compares the gathered potentials on rank 0.

use mpi::topology::Rank;
use mpi::traits::*;

use fmm_core::domain::Domain;
use fmm_core::engine::distributed::DistributedEngine;
use fmm_core::engine::sequential::SequentialEngine;
use fmm_core::octree::pointer::PointerOctree;
use fmm_core::partition::{build_local_grouped_octree, build_working_intervals};
use fmm_kernels_reference::{random_point_cloud, PointMassKernel};

const NPARTICLES: usize = 20_000;
const HEIGHT: u64 = 5;
const GROUP_SIZE: usize = 64;
const HYKSORT_K: Rank = fmm_core::constants::HYKSORT_K;
const CENTRE: [f64; 3] = [0.5, 0.5, 0.5];
const WIDTH: f64 = 1.0;

/// Every rank generates the same global point cloud so this test needs no
/// scatter step; each rank's *initial* shard is just every `size`-th
/// particle, an arbitrary starting distribution for `partition_particles`
/// to redistribute into contiguous Morton order.
fn initial_shard(rank: Rank, size: Rank) -> Vec<fmm_core::particle::Particle> {
    random_point_cloud(NPARTICLES, CENTRE, WIDTH, 7)
        .into_iter()
        .enumerate()
        .filter(|(i, _)| (*i as Rank) % size == rank)
        .map(|(_, p)| p)
        .collect()
}

fn run_distributed_vs_sequential() {
    let universe = mpi::initialize().expect("MPI initialize");
    let world = universe.world();
    let rank = world.rank();
    let size = world.size();

    let domain = Domain::from_centre_width(CENTRE, WIDTH);
    let local = initial_shard(rank, size);

    let (tree, span) = build_local_grouped_octree(&world, local, &domain, HEIGHT, GROUP_SIZE, HYKSORT_K)
        .expect("build local grouped octree");
    let intervals = build_working_intervals(&world, span, HEIGHT);

    let mut distributed = DistributedEngine::new(PointMassKernel::new());
    distributed.run(&world, &tree, &intervals).expect("distributed engine run");
    let result = distributed.result().expect("distributed engine populates a result");
    let leaf_level = HEIGHT - 1;

    // Every rank also runs the full particle set sequentially, so each can
    // check its own slab's potentials against a ground truth it didn't
    // have to receive over MPI.
    let all_particles = random_point_cloud(NPARTICLES, CENTRE, WIDTH, 7);
    let mut reference = PointerOctree::new(HEIGHT, domain).expect("valid reference tree height");
    for particle in &all_particles {
        reference.insert(*particle);
    }
    let mut sequential = SequentialEngine::new(PointMassKernel::new());
    sequential.run(&mut reference).expect("sequential engine run");

    // Containers on either side can hold the same particles in different
    // orders (hyksort vs insertion order), so match by position/value
    // rather than index before comparing potentials.
    let mut max_diff = 0.0f64;
    let mut compared = 0usize;
    tree.for_each_leaf(|key, initial_container| {
        if initial_container.is_empty() || key.level() != leaf_level {
            return;
        }
        let Some(local_container) = result.leaf_container(&key) else { return };
        let Some(reference_leaf) = reference.leaf(&key) else { return };
        for (i, position, value, _role) in local_container.iter() {
            for (j, ref_position, ref_value, _) in reference_leaf.container.iter() {
                if ref_position == position && ref_value == value {
                    max_diff = max_diff.max((local_container.potential(i) - reference_leaf.container.potential(j)).abs());
                    compared += 1;
                    break;
                }
            }
        }
    });

    log::info!("rank {rank}: compared {compared} particles, max potential difference {max_diff:.3e}");
    assert!(max_diff < 1e-6, "rank {rank}: distributed/sequential potential mismatch: {max_diff}");
}

fn main() {
    env_logger::init();
    run_distributed_vs_sequential();
}
