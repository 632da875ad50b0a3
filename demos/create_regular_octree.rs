//! Build a regular (uniform-depth) grouped octree from a random point cloud
//! and drive the task-parallel FMM engine over it end to end.

use fmm_core::engine::task::TaskParallelEngine;
use fmm_core::octree::grouped::GroupedOctree;
use fmm_core::particle_source::InMemoryParticleSource;
use fmm_kernels_reference::{random_point_cloud, PointMassKernel};

const NPARTICLES: usize = 100_000;
const HEIGHT: u64 = 5;
const GROUP_SIZE: usize = 64;

pub fn main() {
    env_logger::init();

    let centre = [0.0, 0.0, 0.0];
    let width = 2.2;
    let particles = random_point_cloud(NPARTICLES, centre, width, 0);
    let source = InMemoryParticleSource::new(centre, width, particles);

    let tree = GroupedOctree::from_particle_source(&source, HEIGHT, GROUP_SIZE).expect("regular octree build");

    let mut engine = TaskParallelEngine::new(PointMassKernel::new());
    let result = engine.run(&tree).expect("task-parallel engine run");

    println!(
        "regular octree: height={}, group_size={}, leaf groups={}",
        tree.height(),
        tree.group_size(),
        tree.num_particle_groups()
    );

    let mut reported = 0;
    tree.for_each_leaf(|key, container| {
        if reported >= 3 || container.is_empty() {
            return;
        }
        if let Some(phi) = result.first_particle_potential(&key) {
            println!("leaf {key:?}: {} particles, first potential = {phi:.6}", container.len());
            reported += 1;
        }
    });
}
