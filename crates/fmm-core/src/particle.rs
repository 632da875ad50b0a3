//! Particle storage.
//!
//! A structure-of-arrays container: three position arrays, one scalar
//! physical-value array, per-target force/potential accumulators, and an
//! optional parallel index array recording each particle's original
//! insertion rank. Flat `Vec` fields are used in place of an
//! array-of-structs `Vec<Particle>`, the way a columnar writer wants
//! separate coordinate slices rather than one struct per row.

use crate::types::PointType;

/// The role a particle plays in the Target-Source Model.
/// Plain (non-TSM) engines treat every particle as `Both`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Source,
    Target,
    Both,
}

impl Role {
    pub fn is_source(&self) -> bool {
        matches!(self, Role::Source | Role::Both)
    }

    pub fn is_target(&self) -> bool {
        matches!(self, Role::Target | Role::Both)
    }
}

/// A single particle: position, scalar physical value (e.g. charge or
/// mass), and role tag.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Particle {
    pub position: [PointType; 3],
    pub value: PointType,
    pub role: Role,
}

/// Structure-of-arrays storage for a leaf's particles.
///
/// Positions are stored as three parallel slices rather than a slice of
/// `[PointType; 3]` so that kernels can vectorise over one axis at a time;
/// `global_index` carries each particle's rank in the original
/// `ParticleSource` stream, preserved across any subsequent sort.
#[derive(Debug, Clone, Default)]
pub struct ParticleContainer {
    x: Vec<PointType>,
    y: Vec<PointType>,
    z: Vec<PointType>,
    value: Vec<PointType>,
    role: Vec<Role>,
    fx: Vec<PointType>,
    fy: Vec<PointType>,
    fz: Vec<PointType>,
    potential: Vec<PointType>,
    global_index: Option<Vec<usize>>,
}

impl ParticleContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// A container that additionally tracks each particle's original
    /// insertion rank.
    pub fn with_global_index() -> Self {
        ParticleContainer {
            global_index: Some(Vec::new()),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.x.len()
    }

    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Append one particle, allocating zeroed force/potential accumulators.
    /// If this container tracks global indices, `global_index` must be
    /// `Some`; if it doesn't, `global_index` is ignored.
    pub fn push(&mut self, particle: Particle, global_index: Option<usize>) {
        self.x.push(particle.position[0]);
        self.y.push(particle.position[1]);
        self.z.push(particle.position[2]);
        self.value.push(particle.value);
        self.role.push(particle.role);
        self.fx.push(0.0);
        self.fy.push(0.0);
        self.fz.push(0.0);
        self.potential.push(0.0);
        if let Some(indices) = self.global_index.as_mut() {
            indices.push(global_index.unwrap_or(self.x.len() - 1));
        }
    }

    pub fn position(&self, i: usize) -> [PointType; 3] {
        [self.x[i], self.y[i], self.z[i]]
    }

    pub fn value(&self, i: usize) -> PointType {
        self.value[i]
    }

    pub fn role(&self, i: usize) -> Role {
        self.role[i]
    }

    pub fn global_index(&self, i: usize) -> Option<usize> {
        self.global_index.as_ref().map(|indices| indices[i])
    }

    pub fn positions_x(&self) -> &[PointType] {
        &self.x
    }

    pub fn positions_y(&self) -> &[PointType] {
        &self.y
    }

    pub fn positions_z(&self) -> &[PointType] {
        &self.z
    }

    pub fn values(&self) -> &[PointType] {
        &self.value
    }

    /// Add `(dfx, dfy, dfz, dphi)` to particle `i`'s accumulators. Used by
    /// L2P and P2P, both of which only ever accumulate into targets.
    pub fn accumulate(&mut self, i: usize, dfx: PointType, dfy: PointType, dfz: PointType, dphi: PointType) {
        self.fx[i] += dfx;
        self.fy[i] += dfy;
        self.fz[i] += dfz;
        self.potential[i] += dphi;
    }

    pub fn force(&self, i: usize) -> [PointType; 3] {
        [self.fx[i], self.fy[i], self.fz[i]]
    }

    pub fn potential(&self, i: usize) -> PointType {
        self.potential[i]
    }

    /// Reset all force/potential accumulators to zero, leaving positions,
    /// values and roles untouched. Used between repeated FMM evaluations
    /// over the same point set (e.g. benchmarking, or a TSM engine that
    /// re-targets the same tree).
    pub fn reset_accumulators(&mut self) {
        self.fx.iter_mut().for_each(|v| *v = 0.0);
        self.fy.iter_mut().for_each(|v| *v = 0.0);
        self.fz.iter_mut().for_each(|v| *v = 0.0);
        self.potential.iter_mut().for_each(|v| *v = 0.0);
    }

    /// Iterate `(position, value, role)` for every particle.
    pub fn iter(&self) -> impl Iterator<Item = (usize, [PointType; 3], PointType, Role)> + '_ {
        (0..self.len()).map(move |i| (i, self.position(i), self.value[i], self.role[i]))
    }

    /// Count of particles whose role can act as a source.
    pub fn source_count(&self) -> usize {
        self.role.iter().filter(|r| r.is_source()).count()
    }

    /// Count of particles whose role can act as a target.
    pub fn target_count(&self) -> usize {
        self.role.iter().filter(|r| r.is_target()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_particle(x: PointType) -> Particle {
        Particle {
            position: [x, 0.0, 0.0],
            value: 1.0,
            role: Role::Both,
        }
    }

    #[test]
    fn push_then_read_round_trips() {
        let mut container = ParticleContainer::new();
        container.push(sample_particle(3.0), None);
        assert_eq!(container.len(), 1);
        assert_eq!(container.position(0), [3.0, 0.0, 0.0]);
        assert_eq!(container.force(0), [0.0, 0.0, 0.0]);
    }

    #[test]
    fn accumulate_adds_not_overwrites() {
        let mut container = ParticleContainer::new();
        container.push(sample_particle(0.0), None);
        container.accumulate(0, 1.0, 2.0, 3.0, 4.0);
        container.accumulate(0, 1.0, 2.0, 3.0, 4.0);
        assert_eq!(container.force(0), [2.0, 4.0, 6.0]);
        assert_eq!(container.potential(0), 8.0);
    }

    #[test]
    fn reset_accumulators_clears_forces_only() {
        let mut container = ParticleContainer::new();
        container.push(sample_particle(5.0), None);
        container.accumulate(0, 1.0, 1.0, 1.0, 1.0);
        container.reset_accumulators();
        assert_eq!(container.force(0), [0.0, 0.0, 0.0]);
        assert_eq!(container.position(0), [5.0, 0.0, 0.0]);
    }

    #[test]
    fn global_index_tracks_insertion_rank() {
        let mut container = ParticleContainer::with_global_index();
        container.push(sample_particle(1.0), Some(7));
        container.push(sample_particle(2.0), Some(3));
        assert_eq!(container.global_index(0), Some(7));
        assert_eq!(container.global_index(1), Some(3));
    }

    #[test]
    fn role_source_target_counts() {
        let mut container = ParticleContainer::new();
        container.push(
            Particle { position: [0.0; 3], value: 1.0, role: Role::Source },
            None,
        );
        container.push(
            Particle { position: [0.0; 3], value: 1.0, role: Role::Target },
            None,
        );
        container.push(
            Particle { position: [0.0; 3], value: 1.0, role: Role::Both },
            None,
        );
        assert_eq!(container.source_count(), 2);
        assert_eq!(container.target_count(), 2);
    }
}
