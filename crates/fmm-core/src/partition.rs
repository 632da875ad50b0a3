//! Distributed construction: hyksort-based particle redistribution and
//! working-interval resolution, the build path the distributed engine
//! runs over.
//!
//! `engine::distributed` assumes each peer already owns a contiguous
//! Morton-ordered slab and a full per-level `Vec<Vec<WorkingInterval>>`
//! table; this module is what gets a peer from "an arbitrary local
//! particle set" to that state: an all-gather of boundary keys followed
//! by completing the region between consecutive seeds, with particle
//! redistribution done via `hyksort(&mut points, k, comm)` over a flat,
//! `Equivalence`-keyed point record.

use memoffset::offset_of;
use mpi::datatype::{Equivalence, UncommittedUserDatatype, UserDatatype};
use mpi::topology::SystemCommunicator;
use mpi::traits::*;
use mpi::Address;

use crate::domain::Domain;
use crate::engine::distributed::{real_interval_at_level, resolve_working_intervals, WorkingInterval};
use crate::error::{FmmError, FmmResult};
use crate::morton::MortonKey;
use crate::octree::grouped::GroupedOctree;
use crate::particle::{Particle, Role};
use crate::particle_source::InMemoryParticleSource;
use crate::types::{KeyType, PointType};

/// The record `hyksort` actually redistributes: a particle plus the leaf
/// Morton key it sorts by. Flattened rather than nesting a `MortonKey`
/// field, so the `Equivalence` impl stays one level deep (no nested
/// `UncommittedUserDatatype::structured`, rather than a nested key field).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyedParticle {
    pub anchor: [KeyType; 3],
    pub morton: KeyType,
    pub x: PointType,
    pub y: PointType,
    pub z: PointType,
    pub value: PointType,
    pub role: u8,
}

impl KeyedParticle {
    fn new(particle: Particle, domain: &Domain, leaf_level: KeyType) -> Self {
        let key = leaf_key(&particle, domain, leaf_level);
        KeyedParticle {
            anchor: *key.anchor(),
            morton: key.morton(),
            x: particle.position[0],
            y: particle.position[1],
            z: particle.position[2],
            value: particle.value,
            role: role_to_tag(particle.role),
        }
    }

    fn key(&self) -> MortonKey {
        MortonKey::from_morton(self.morton)
    }

    fn into_particle(self) -> Particle {
        Particle {
            position: [self.x, self.y, self.z],
            value: self.value,
            role: role_from_tag(self.role),
        }
    }
}

impl PartialEq for KeyedParticle {
    fn eq(&self, other: &Self) -> bool {
        self.morton == other.morton
    }
}

impl Eq for KeyedParticle {}

impl PartialOrd for KeyedParticle {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyedParticle {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.morton.cmp(&other.morton)
    }
}

fn role_to_tag(role: Role) -> u8 {
    match role {
        Role::Source => 0,
        Role::Target => 1,
        Role::Both => 2,
    }
}

fn role_from_tag(tag: u8) -> Role {
    match tag {
        0 => Role::Source,
        1 => Role::Target,
        _ => Role::Both,
    }
}

fn leaf_key(particle: &Particle, domain: &Domain, leaf_level: KeyType) -> MortonKey {
    let mut key = MortonKey::from_point(&particle.position, domain);
    while key.level() < leaf_level {
        key = key.first_child();
    }
    while key.level() > leaf_level {
        key = key.parent();
    }
    key
}

unsafe impl Equivalence for KeyedParticle {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        UserDatatype::structured(
            &[1, 1, 1, 1, 1, 1, 1],
            &[
                offset_of!(KeyedParticle, anchor) as Address,
                offset_of!(KeyedParticle, morton) as Address,
                offset_of!(KeyedParticle, x) as Address,
                offset_of!(KeyedParticle, y) as Address,
                offset_of!(KeyedParticle, z) as Address,
                offset_of!(KeyedParticle, value) as Address,
                offset_of!(KeyedParticle, role) as Address,
            ],
            &[
                UncommittedUserDatatype::contiguous(3, &KeyType::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &KeyType::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &PointType::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &PointType::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &PointType::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &PointType::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(1, &u8::equivalent_datatype()).as_ref(),
            ],
        )
    }
}

/// Redistribute `local` particles across `world` in leaf-level Morton
/// order via `hyksort`, so each rank ends up holding a contiguous slab
/// instead of whatever arbitrary subset it started with. `k` is the
/// hyksort fanout (`constants::HYKSORT_K` for callers with no opinion of
/// their own).
pub fn partition_particles(
    world: &SystemCommunicator,
    local: Vec<Particle>,
    domain: &Domain,
    leaf_level: KeyType,
    k: i32,
) -> Vec<Particle> {
    let mut keyed: Vec<KeyedParticle> = local
        .into_iter()
        .map(|p| KeyedParticle::new(p, domain, leaf_level))
        .collect();

    log::debug!("rank {}: hyksort over {} particles (k={k})", world.rank(), keyed.len());
    let comm = world.duplicate();
    hyksort::hyksort(&mut keyed, k, comm);
    log::debug!("rank {}: post-partition share is {} particles", world.rank(), keyed.len());

    keyed.sort();
    keyed.into_iter().map(KeyedParticle::into_particle).collect()
}

/// The leaf-level `[min, max]` Morton span of an already-partitioned local
/// particle set. Empty inputs have no span; callers only reach this
/// after `partition_particles` on a non-empty global set, but a rank can
/// still end up with zero particles of its own.
pub fn local_leaf_span(
    particles: &[Particle],
    domain: &Domain,
    leaf_level: KeyType,
) -> FmmResult<(MortonKey, MortonKey)> {
    let mut keys = particles.iter().map(|p| leaf_key(p, domain, leaf_level));
    let first = keys.next().ok_or_else(|| FmmError::configuration("empty local particle set"))?;
    let (min, max) = keys.fold((first, first), |(min, max), key| (min.min(key), max.max(key)));
    Ok((min, max))
}

/// All-gather every peer's leaf-level span and resolve the full per-level
/// `Vec<Vec<WorkingInterval>>` table `DistributedEngine::run` expects —
/// one working-interval set per tree level, indexed `[level][rank]`.
pub fn build_working_intervals(
    world: &SystemCommunicator,
    local_span: (MortonKey, MortonKey),
    height: KeyType,
) -> Vec<Vec<WorkingInterval>> {
    let size = world.size() as usize;
    let leaf_level = height - 1;

    let mut mins = vec![0u64; size];
    let mut maxs = vec![0u64; size];
    world.all_gather_into(&local_span.0.morton(), &mut mins[..]);
    world.all_gather_into(&local_span.1.morton(), &mut maxs[..]);

    let real_leaf: Vec<(MortonKey, MortonKey)> = mins
        .iter()
        .zip(maxs.iter())
        .map(|(&min, &max)| (MortonKey::from_morton(min), MortonKey::from_morton(max)))
        .collect();

    (0..height)
        .map(|level| {
            let real_at_level: Vec<(MortonKey, MortonKey)> = real_leaf
                .iter()
                .map(|&(min, max)| real_interval_at_level(min, max, level, leaf_level))
                .collect();
            resolve_working_intervals(&real_at_level)
        })
        .collect()
}

/// Partition `local` particles across `world`, then bulk-build this rank's
/// slab of a [`GroupedOctree`] from its post-partition share. The caller is
/// responsible for running [`build_working_intervals`] separately once it
/// has a leaf span — the two are split so a caller can build the tree and
/// its interval table from the same `local_span` without redoing the
/// partition.
pub fn build_local_grouped_octree(
    world: &SystemCommunicator,
    local: Vec<Particle>,
    domain: &Domain,
    height: KeyType,
    group_size: usize,
    k: i32,
) -> FmmResult<(GroupedOctree, (MortonKey, MortonKey))> {
    let leaf_level = height - 1;
    let partitioned = partition_particles(world, local, domain, leaf_level, k);
    let span = local_leaf_span(&partitioned, domain, leaf_level)?;

    let source = InMemoryParticleSource::new(
        [
            domain.origin[0] + domain.diameter[0] / 2.0,
            domain.origin[1] + domain.diameter[1] / 2.0,
            domain.origin[2] + domain.diameter[2] / 2.0,
        ],
        domain.diameter[0],
        partitioned,
    );
    let tree = GroupedOctree::from_particle_source(&source, height, group_size)?;
    Ok((tree, span))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;

    fn domain() -> Domain {
        Domain::from_centre_width([0.0, 0.0, 0.0], 8.0)
    }

    fn particle(x: f64, y: f64, z: f64) -> Particle {
        Particle { position: [x, y, z], value: 1.0, role: Role::Both }
    }

    #[test]
    fn keyed_particle_round_trips_position_and_role() {
        let domain = domain();
        let p = Particle { position: [1.5, -2.0, 0.25], value: 7.0, role: Role::Source };
        let keyed = KeyedParticle::new(p, &domain, 3);
        let back = keyed.into_particle();
        assert_eq!(back.position, p.position);
        assert_eq!(back.value, p.value);
        assert_eq!(back.role, p.role);
    }

    #[test]
    fn keyed_particle_ordering_matches_leaf_key_ordering() {
        let domain = domain();
        let a = KeyedParticle::new(particle(-3.9, -3.9, -3.9), &domain, 3);
        let b = KeyedParticle::new(particle(3.9, 3.9, 3.9), &domain, 3);
        assert!(a < b || a == b);
        assert_eq!(a.key().level(), 3);
    }

    #[test]
    fn local_leaf_span_covers_all_local_particles() {
        let domain = domain();
        let particles = vec![particle(-3.9, -3.9, -3.9), particle(0.1, 0.1, 0.1), particle(3.9, 3.9, 3.9)];
        let keys: Vec<MortonKey> = particles.iter().map(|p| leaf_key(p, &domain, 3)).collect();
        let (min, max) = local_leaf_span(&particles, &domain, 3).unwrap();
        assert_eq!(min, *keys.iter().min().unwrap());
        assert_eq!(max, *keys.iter().max().unwrap());
    }

    #[test]
    fn local_leaf_span_rejects_empty_input() {
        let domain = domain();
        assert!(local_leaf_span(&[], &domain, 3).is_err());
    }
}
