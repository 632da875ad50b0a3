//! A concrete `1/r` point-mass kernel and a direct-summation verifier.
//!
//! `fmm_core`'s `Kernel` trait is expansion-representation-agnostic per
//!.2 — this crate is the "external collaborator" concrete
//! kernel that exists only so tests, demos and benches have something to
//! drive the core with. It is not meant to be fast or compact: multipole
//! and local expansions here are literal flat lists of `(x, y, z, charge)`
//! source records rather than a truncated series, so the kernel reproduces
//! exact direct summation through the FMM pass structure — useful for
//! exercising the engines' plumbing and for the engine-equivalence and
//! conservation properties of, at the cost of the
//! `O(N)`-per-cell memory a real multipole representation would avoid.

use fmm_core::kernel::{CellExpansion, Kernel, RelativeCell};
use fmm_core::particle::ParticleContainer;

/// Softening added to squared distance before taking a reciprocal, so that
/// coincident points (including a particle against itself, if ever passed
/// in the same pair) never produce a division by zero.
const SOFTENING2: f64 = 1e-12;

/// A `1/r` point-mass kernel whose "expansions" are exact flat particle
/// lists rather than truncated series — see the module docs.
#[derive(Debug, Clone, Copy, Default)]
pub struct PointMassKernel;

impl PointMassKernel {
    pub fn new() -> Self {
        PointMassKernel
    }
}

/// `(potential, force)` contribution at `target` from a single point mass
/// `(source, charge)`, with softening to avoid a zero-distance blowup.
fn contribution(target: [f64; 3], source: [f64; 3], charge: f64) -> (f64, [f64; 3]) {
    let dx = target[0] - source[0];
    let dy = target[1] - source[1];
    let dz = target[2] - source[2];
    let r2 = dx * dx + dy * dy + dz * dz + SOFTENING2;
    let r = r2.sqrt();
    let phi = charge / r;
    let inv_r3 = 1.0 / (r2 * r);
    (phi, [-charge * dx * inv_r3, -charge * dy * inv_r3, -charge * dz * inv_r3])
}

/// Evaluate every `(x, y, z, charge)` quadruple in `sources` against one
/// target position, accumulating onto `(phi, force)`.
fn evaluate_flat_sources(target: [f64; 3], sources: &[f64], phi: &mut f64, force: &mut [f64; 3]) {
    for quad in sources.chunks_exact(4) {
        let (dphi, df) = contribution(target, [quad[0], quad[1], quad[2]], quad[3]);
        *phi += dphi;
        force[0] += df[0];
        force[1] += df[1];
        force[2] += df[2];
    }
}

impl Kernel for PointMassKernel {
    fn p2m(&self, leaf: &mut CellExpansion, sources: &ParticleContainer) {
        for (i, position, value, role) in sources.iter() {
            if role.is_source() {
                leaf.multipole.0.extend_from_slice(&[position[0], position[1], position[2], value]);
            }
            let _ = i;
        }
    }

    fn m2m(&self, parent: &mut CellExpansion, children: &[(&CellExpansion, usize)], _level: u64) {
        for (child, _slot) in children {
            parent.multipole.0.extend_from_slice(&child.multipole.0);
        }
    }

    fn m2l(&self, target: &mut CellExpansion, interaction_list: &[RelativeCell], _level: u64) {
        for rel in interaction_list {
            target.local.0.extend_from_slice(&rel.expansion.multipole.0);
        }
    }

    fn l2l(&self, parent: &CellExpansion, children: &mut [(&mut CellExpansion, usize)], _level: u64) {
        for (child, _slot) in children {
            child.local.0.extend_from_slice(&parent.local.0);
        }
    }

    fn l2p(&self, leaf: &CellExpansion, targets: &mut ParticleContainer) {
        for i in 0..targets.len() {
            if !targets.role(i).is_target() {
                continue;
            }
            let mut phi = 0.0;
            let mut force = [0.0; 3];
            evaluate_flat_sources(targets.position(i), &leaf.local.0, &mut phi, &mut force);
            targets.accumulate(i, force[0], force[1], force[2], phi);
        }
    }

    fn p2p(&self, targets: &mut ParticleContainer, sources: &mut ParticleContainer, mutual: bool) {
        for ti in 0..targets.len() {
            if !targets.role(ti).is_target() {
                continue;
            }
            let mut phi = 0.0;
            let mut force = [0.0; 3];
            let target_position = targets.position(ti);
            for si in 0..sources.len() {
                if !sources.role(si).is_source() {
                    continue;
                }
                let (dphi, df) = contribution(target_position, sources.position(si), sources.value(si));
                phi += dphi;
                force[0] += df[0];
                force[1] += df[1];
                force[2] += df[2];
            }
            targets.accumulate(ti, force[0], force[1], force[2], phi);
        }

        if mutual {
            for si in 0..sources.len() {
                if !sources.role(si).is_target() {
                    continue;
                }
                let mut phi = 0.0;
                let mut force = [0.0; 3];
                let source_position = sources.position(si);
                for ti in 0..targets.len() {
                    if !targets.role(ti).is_source() {
                        continue;
                    }
                    let (dphi, df) = contribution(source_position, targets.position(ti), targets.value(ti));
                    phi += dphi;
                    force[0] += df[0];
                    force[1] += df[1];
                    force[2] += df[2];
                }
                sources.accumulate(si, force[0], force[1], force[2], phi);
            }
        }
    }

    fn p2p_self(&self, container: &mut ParticleContainer) {
        for i in 0..container.len() {
            if !container.role(i).is_target() {
                continue;
            }
            let mut phi = 0.0;
            let mut force = [0.0; 3];
            let position = container.position(i);
            for j in 0..container.len() {
                if i == j || !container.role(j).is_source() {
                    continue;
                }
                let (dphi, df) = contribution(position, container.position(j), container.value(j));
                phi += dphi;
                force[0] += df[0];
                force[1] += df[1];
                force[2] += df[2];
            }
            container.accumulate(i, force[0], force[1], force[2], phi);
        }
    }

    fn supports_p2p_remote(&self) -> bool {
        true
    }

    fn p2p_remote(&self, targets: &mut ParticleContainer, sources: &ParticleContainer) {
        for ti in 0..targets.len() {
            if !targets.role(ti).is_target() {
                continue;
            }
            let mut phi = 0.0;
            let mut force = [0.0; 3];
            let target_position = targets.position(ti);
            for si in 0..sources.len() {
                if !sources.role(si).is_source() {
                    continue;
                }
                let (dphi, df) = contribution(target_position, sources.position(si), sources.value(si));
                phi += dphi;
                force[0] += df[0];
                force[1] += df[1];
                force[2] += df[2];
            }
            targets.accumulate(ti, force[0], force[1], force[2], phi);
        }
    }
}

/// Brute-force `O(n^2)` direct summation over every particle in
/// `container` against every other, used to verify an FMM run's
/// accumulated potentials/forces to within the tolerance
/// property 1/4 allows. Does not reset existing accumulators — callers
/// comparing against an FMM run should evaluate into a fresh container.
pub fn direct_summation(container: &mut ParticleContainer) {
    let positions: Vec<[f64; 3]> = (0..container.len()).map(|i| container.position(i)).collect();
    let values: Vec<f64> = (0..container.len()).map(|i| container.value(i)).collect();
    let roles: Vec<bool> = (0..container.len()).map(|i| container.role(i).is_source()).collect();

    for i in 0..container.len() {
        if !container.role(i).is_target() {
            continue;
        }
        let mut phi = 0.0;
        let mut force = [0.0; 3];
        for j in 0..container.len() {
            if i == j || !roles[j] {
                continue;
            }
            let (dphi, df) = contribution(positions[i], positions[j], values[j]);
            phi += dphi;
            force[0] += df[0];
            force[1] += df[1];
            force[2] += df[2];
        }
        container.accumulate(i, force[0], force[1], force[2], phi);
    }
}

/// Largest absolute potential difference between two containers holding
/// the same particles in the same order — the comparison
/// engine-equivalence tests  and FMM-vs-direct
/// accuracy tests both need.
pub fn max_potential_difference(a: &ParticleContainer, b: &ParticleContainer) -> f64 {
    (0..a.len().min(b.len()))
        .map(|i| (a.potential(i) - b.potential(i)).abs())
        .fold(0.0, f64::max)
}

/// A uniform-random point cloud in a cube, for demos and benches.
pub fn random_point_cloud(n: usize, centre: [f64; 3], width: f64, seed: u64) -> Vec<fmm_core::particle::Particle> {
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    let mut rng = StdRng::seed_from_u64(seed);
    let half = width / 2.0;
    (0..n)
        .map(|_| {
            let position = [
                centre[0] + rng.gen_range(-half..half),
                centre[1] + rng.gen_range(-half..half),
                centre[2] + rng.gen_range(-half..half),
            ];
            fmm_core::particle::Particle {
                position,
                value: rng.gen_range(0.1..1.0),
                role: fmm_core::particle::Role::Both,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use fmm_core::domain::Domain;
    use fmm_core::engine::sequential::SequentialEngine;
    use fmm_core::octree::pointer::PointerOctree;
    use fmm_core::particle::{Particle, Role};

    #[test]
    fn point_mass_m2m_concatenates_children() {
        let mut parent = CellExpansion::default();
        let mut child_a = CellExpansion::default();
        child_a.multipole.0 = vec![0.0, 0.0, 0.0, 1.0];
        let mut child_b = CellExpansion::default();
        child_b.multipole.0 = vec![1.0, 1.0, 1.0, 2.0];

        PointMassKernel::new().m2m(&mut parent, &[(&child_a, 0), (&child_b, 1)], 1);
        assert_eq!(parent.multipole.0, vec![0.0, 0.0, 0.0, 1.0, 1.0, 1.0, 1.0, 2.0]);
    }

    #[test]
    fn sequential_fmm_matches_direct_summation() {
        let domain = Domain::from_centre_width([0.0, 0.0, 0.0], 8.0);
        let mut tree = PointerOctree::new(4, domain).unwrap();

        let particles = random_point_cloud(40, [0.0, 0.0, 0.0], 7.5, 42);
        for particle in &particles {
            tree.insert(*particle);
        }

        let mut engine = SequentialEngine::new(PointMassKernel::new());
        engine.run(&mut tree).unwrap();

        // Independently compute each particle's direct-summation potential
        // and compare against what the engine accumulated on the same leaf.
        let mut max_diff = 0.0f64;
        for (_, leaf) in tree.leaves() {
            for (i, position, value, _role) in leaf.container.iter() {
                let mut phi = 0.0;
                for other in &particles {
                    if other.position == position && other.value == value {
                        continue;
                    }
                    let (dphi, _) = contribution(position, other.position, other.value);
                    phi += dphi;
                }
                max_diff = max_diff.max((leaf.container.potential(i) - phi).abs());
            }
        }
        assert!(max_diff < 1e-6, "fmm/direct potential mismatch: {max_diff}");
    }

    #[test]
    fn direct_summation_respects_source_target_roles() {
        let mut container = ParticleContainer::new();
        container.push(Particle { position: [0.0, 0.0, 0.0], value: 1.0, role: Role::Target }, None);
        container.push(Particle { position: [1.0, 0.0, 0.0], value: 3.0, role: Role::Source }, None);
        direct_summation(&mut container);
        assert!(container.potential(0) > 0.0);
        assert_eq!(container.potential(1), 0.0);
    }
}
