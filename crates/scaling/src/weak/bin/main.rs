//! Weak-scaling timing fixture: each rank owns a fixed-size local particle
//! set (`NPOINTS_PER_RANK`), so the global problem size grows with the
//! communicator. Times the partition/build step and the distributed
//! engine run separately and reduces both to the root rank.

use std::time::Instant;

use mpi::collective::SystemOperation;
use mpi::topology::SystemCommunicator;
use mpi::traits::*;

use fmm_core::domain::Domain;
use fmm_core::engine::distributed::DistributedEngine;
use fmm_core::partition::{build_local_grouped_octree, build_working_intervals};
use fmm_kernels_reference::{random_point_cloud, PointMassKernel};

const NPOINTS_PER_RANK: usize = 100_000;
const HEIGHT: u64 = 6;
const GROUP_SIZE: usize = 256;
const CENTRE: [f64; 3] = [0.5, 0.5, 0.5];
const WIDTH: f64 = 1.0;

struct RunTimes {
    build_ms: u128,
    run_ms: u128,
}

/// Build this rank's local slab and drive the distributed engine once,
/// timing the partition/build step and the engine run separately.
fn weak_scaling_fixture(world: &SystemCommunicator) -> (usize, RunTimes) {
    let domain = Domain::from_centre_width(CENTRE, WIDTH);
    let seed = world.rank() as u64;
    let local = random_point_cloud(NPOINTS_PER_RANK, CENTRE, WIDTH, seed);

    let start = Instant::now();
    let (tree, span) =
        build_local_grouped_octree(world, local, &domain, HEIGHT, GROUP_SIZE, fmm_core::constants::HYKSORT_K)
            .expect("build local grouped octree");
    let intervals = build_working_intervals(world, span, HEIGHT);
    let build_ms = start.elapsed().as_millis();

    let mut engine = DistributedEngine::new(PointMassKernel::new());
    let start = Instant::now();
    engine.run(world, &tree, &intervals).expect("distributed engine run");
    let run_ms = start.elapsed().as_millis();

    let particle_count = tree.num_particle_groups();
    (particle_count, RunTimes { build_ms, run_ms })
}

fn main() {
    let universe = mpi::initialize().expect("MPI initialize");
    let world = universe.world();
    let rank = world.rank();
    let size = world.size();
    let root_rank = 0;

    let (groups, times) = weak_scaling_fixture(&world);

    let mut total_groups = 0i64;
    let mut max_build_ms = 0i64;
    let mut max_run_ms = 0i64;
    let local_groups = groups as i64;
    let local_build_ms = times.build_ms as i64;
    let local_run_ms = times.run_ms as i64;

    if rank == root_rank {
        world.process_at_rank(root_rank).reduce_into_root(&local_groups, &mut total_groups, SystemOperation::sum());
        world.process_at_rank(root_rank).reduce_into_root(&local_build_ms, &mut max_build_ms, SystemOperation::max());
        world.process_at_rank(root_rank).reduce_into_root(&local_run_ms, &mut max_run_ms, SystemOperation::max());

        // ranks, particles per rank, total particle-group count, slowest build (ms), slowest run (ms)
        println!("{size}, {NPOINTS_PER_RANK}, {total_groups}, {max_build_ms}, {max_run_ms}");
    } else {
        world.process_at_rank(root_rank).reduce_into(&local_groups, SystemOperation::sum());
        world.process_at_rank(root_rank).reduce_into(&local_build_ms, SystemOperation::max());
        world.process_at_rank(root_rank).reduce_into(&local_run_ms, SystemOperation::max());
    }
}
