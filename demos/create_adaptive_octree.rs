//! Build an adaptive pointer-form octree from a random point cloud on the
//! unit sphere and drive the sequential FMM engine over it end to end.

use fmm_core::domain::Domain;
use fmm_core::engine::sequential::SequentialEngine;
use fmm_core::octree::pointer::PointerOctree;
use fmm_kernels_reference::{random_point_cloud, PointMassKernel};

const NPARTICLES: usize = 10_000;
const HEIGHT: u64 = 6;

pub fn main() {
    env_logger::init();

    let particles = random_point_cloud(NPARTICLES, [0.0, 0.0, 0.0], 2.2, 0);
    let domain = Domain::from_centre_width([0.0, 0.0, 0.0], 2.2);
    let mut tree = PointerOctree::new(HEIGHT, domain).expect("valid tree height");
    for particle in &particles {
        tree.insert(*particle);
    }

    let mut engine = SequentialEngine::new(PointMassKernel::new());
    engine.run(&mut tree).expect("sequential engine run");

    let leaf_level = tree.height() - 1;
    println!(
        "adaptive octree: height={}, leaves at level {}={}",
        tree.height(),
        leaf_level,
        tree.level_keys(leaf_level).len()
    );

    if let Some((key, leaf)) = tree.leaves().next() {
        println!(
            "sample leaf {:?}: {} particles, first potential = {:.6}",
            key,
            leaf.container.len(),
            if leaf.container.is_empty() { 0.0 } else { leaf.container.potential(0) }
        );
    }
}
