//! Grouped (blocked) octree.
//!
//! Cells at a level are partitioned, in Morton order, into groups of at
//! most `G` cells; a group is one contiguous region: header (start index,
//! end index, count) followed by a dense array of cell records. This is
//! the Rust-native reading of the source's "single allocation, offset
//! table" grouped layout : here a `Vec<CellRecord>` plus a
//! `GroupHeader` stand in for the byte-arena-and-offsets scheme, since the
//! typed slice gives the same locality without unsafe code.

use std::collections::HashMap;

use crate::error::{FmmError, FmmResult};
use crate::kernel::CellExpansion;
use crate::morton::MortonKey;
use crate::octree::pointer::PointerOctree;
use crate::particle::ParticleContainer;
use crate::particle_source::ParticleSource;
use crate::types::KeyType;

/// Header of one group: the inclusive Morton-index span it covers and how
/// many cell records it actually holds (cells with no particles still get
/// a record slot).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupHeader {
    pub morton_min: MortonKey,
    pub morton_max: MortonKey,
    pub count: usize,
}

/// One group: header plus its dense run of cell records, in Morton order.
#[derive(Debug, Clone)]
pub struct CellGroup {
    pub header: GroupHeader,
    pub cells: Vec<MortonKey>,
    pub expansions: Vec<CellExpansion>,
}

impl CellGroup {
    pub fn local_index(&self, key: &MortonKey) -> Option<usize> {
        self.cells.binary_search(key).ok()
    }

    /// Whether `key` falls within this group's Morton interval, regardless
    /// of whether a cell actually exists at that index (used by the
    /// task engine's out-of-block precompute).
    pub fn covers(&self, key: &MortonKey) -> bool {
        *key >= self.header.morton_min && *key <= self.header.morton_max
    }
}

/// One particle group: the leaf-level analogue of a [`CellGroup`].
#[derive(Debug, Clone)]
pub struct ParticleGroup {
    pub header: GroupHeader,
    pub leaves: Vec<MortonKey>,
    pub containers: Vec<ParticleContainer>,
}

impl ParticleGroup {
    pub fn local_index(&self, key: &MortonKey) -> Option<usize> {
        self.leaves.binary_search(key).ok()
    }
}

/// Groups of cells per level plus groups of particle leaves.
pub struct GroupedOctree {
    group_size: usize,
    height: KeyType,
    cell_groups: HashMap<KeyType, Vec<CellGroup>>,
    particle_groups: Vec<ParticleGroup>,
}

impl GroupedOctree {
    pub fn height(&self) -> KeyType {
        self.height
    }

    pub fn group_size(&self) -> usize {
        self.group_size
    }

    pub fn num_groups(&self, level: KeyType) -> usize {
        self.cell_groups.get(&level).map(Vec::len).unwrap_or(0)
    }

    pub fn group(&self, level: KeyType, idx: usize) -> Option<&CellGroup> {
        self.cell_groups.get(&level).and_then(|groups| groups.get(idx))
    }

    pub fn groups_at_level(&self, level: KeyType) -> &[CellGroup] {
        self.cell_groups.get(&level).map(|v| v.as_slice()).unwrap_or(&[])
    }

    pub fn num_particle_groups(&self) -> usize {
        self.particle_groups.len()
    }

    pub fn particle_group(&self, idx: usize) -> Option<&ParticleGroup> {
        self.particle_groups.get(idx)
    }

    pub fn particle_groups(&self) -> &[ParticleGroup] {
        &self.particle_groups
    }

    /// Visit every leaf's particle container.
    pub fn for_each_leaf(&self, mut f: impl FnMut(MortonKey, &ParticleContainer)) {
        for group in &self.particle_groups {
            for (key, container) in group.leaves.iter().zip(group.containers.iter()) {
                f(*key, container);
            }
        }
    }

    /// Visit every cell at `level`.
    pub fn for_each_cell_with_level(&self, level: KeyType, mut f: impl FnMut(MortonKey, &CellExpansion)) {
        for group in self.groups_at_level(level) {
            for (key, expansion) in group.cells.iter().zip(group.expansions.iter()) {
                f(*key, expansion);
            }
        }
    }

    /// Build mode (a): copy the structure of an existing pointer octree
    /// into contiguous groups of at most `group_size` cells per level.
    pub fn from_pointer_octree(tree: &PointerOctree, group_size: usize) -> FmmResult<Self> {
        if group_size == 0 {
            return Err(FmmError::configuration("group size must be > 0"));
        }

        let mut cell_groups = HashMap::new();
        for level in 0..tree.height() {
            let keys = tree.level_keys(level);
            cell_groups.insert(level, chunk_into_groups(keys, group_size, |key| {
                tree.cell(key).map(|c| c.expansion.clone()).unwrap_or_default()
            }));
        }

        let leaf_level = tree.height() - 1;
        let mut leaf_keys: Vec<MortonKey> = tree.leaves().map(|(k, _)| *k).collect();
        leaf_keys.sort();
        let particle_groups = chunk_leaves_into_groups(&leaf_keys, group_size, |key| {
            tree.leaf(key).map(|l| l.container.clone()).unwrap_or_default()
        });
        let _ = leaf_level;

        Ok(GroupedOctree {
            group_size,
            height: tree.height(),
            cell_groups,
            particle_groups,
        })
    }

    /// Build mode (b): bulk-build directly from a particle source, sorting
    /// particles by leaf Morton index and emitting groups greedily up to
    /// capacity `group_size`.
    pub fn from_particle_source(
        source: &dyn ParticleSource,
        height: KeyType,
        group_size: usize,
    ) -> FmmResult<Self> {
        if group_size == 0 {
            return Err(FmmError::configuration("group size must be > 0"));
        }
        if height < 2 {
            return Err(FmmError::configuration("tree height must be >= 2"));
        }

        let domain = crate::domain::Domain::from_centre_width(source.box_centre(), source.box_width());
        let leaf_level = height - 1;

        let mut by_leaf: HashMap<MortonKey, ParticleContainer> = HashMap::new();
        for index in 0..source.num_particles() {
            let particle = source.fill(index);
            let mut key = MortonKey::from_point(&particle.position, &domain);
            while key.level() > leaf_level {
                key = key.parent();
            }
            while key.level() < leaf_level {
                key = key.first_child();
            }
            by_leaf
                .entry(key)
                .or_insert_with(ParticleContainer::new)
                .push(particle, Some(index));
        }

        let mut leaf_keys: Vec<MortonKey> = by_leaf.keys().copied().collect();
        leaf_keys.sort();
        let particle_groups = chunk_leaves_into_groups(&leaf_keys, group_size, |key| {
            by_leaf.get(key).cloned().unwrap_or_default()
        });

        // Derive the occupied cell set bottom-up: every leaf plus every
        // ancestor up to the root).
        let mut occupied: std::collections::BTreeMap<KeyType, std::collections::BTreeSet<MortonKey>> =
            std::collections::BTreeMap::new();
        for &leaf in &leaf_keys {
            let mut current = leaf;
            loop {
                occupied.entry(current.level()).or_default().insert(current);
                if current.level() == 0 {
                    break;
                }
                current = current.parent();
            }
        }

        let mut cell_groups = HashMap::new();
        for level in 0..height {
            let keys: Vec<MortonKey> = occupied.get(&level).map(|s| s.iter().copied().collect()).unwrap_or_default();
            cell_groups.insert(level, chunk_into_groups(&keys, group_size, |_| CellExpansion::default()));
        }

        Ok(GroupedOctree {
            group_size,
            height,
            cell_groups,
            particle_groups,
        })
    }
}

fn chunk_into_groups(
    keys: &[MortonKey],
    group_size: usize,
    mut expansion_for: impl FnMut(&MortonKey) -> CellExpansion,
) -> Vec<CellGroup> {
    keys.chunks(group_size)
        .map(|chunk| CellGroup {
            header: GroupHeader {
                morton_min: *chunk.first().unwrap(),
                morton_max: *chunk.last().unwrap(),
                count: chunk.len(),
            },
            cells: chunk.to_vec(),
            expansions: chunk.iter().map(&mut expansion_for).collect(),
        })
        .collect()
}

fn chunk_leaves_into_groups(
    keys: &[MortonKey],
    group_size: usize,
    mut container_for: impl FnMut(&MortonKey) -> ParticleContainer,
) -> Vec<ParticleGroup> {
    keys.chunks(group_size)
        .map(|chunk| ParticleGroup {
            header: GroupHeader {
                morton_min: *chunk.first().unwrap(),
                morton_max: *chunk.last().unwrap(),
                count: chunk.len(),
            },
            leaves: chunk.to_vec(),
            containers: chunk.iter().map(&mut container_for).collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::particle::{Particle, Role};

    struct FixedSource(Vec<Particle>);

    impl ParticleSource for FixedSource {
        fn box_centre(&self) -> [f64; 3] {
            [0.0, 0.0, 0.0]
        }
        fn box_width(&self) -> f64 {
            8.0
        }
        fn num_particles(&self) -> usize {
            self.0.len()
        }
        fn fill(&self, index: usize) -> Particle {
            self.0[index]
        }
    }

    fn sample_source() -> FixedSource {
        let mut particles = Vec::new();
        for i in 0..40 {
            let t = i as f64 / 40.0;
            particles.push(Particle {
                position: [-3.9 + 7.8 * t, -3.9 + 7.8 * (1.0 - t), 0.0],
                value: 1.0,
                role: Role::Both,
            });
        }
        FixedSource(particles)
    }

    #[test]
    fn groups_cover_disjoint_sorted_intervals() {
        let source = sample_source();
        let grouped = GroupedOctree::from_particle_source(&source, 4, 4).unwrap();
        for level in 0..grouped.height() {
            let groups = grouped.groups_at_level(level);
            for window in groups.windows(2) {
                assert!(window[0].header.morton_max < window[1].header.morton_min);
            }
        }
    }

    #[test]
    fn particle_groups_respect_capacity() {
        let source = sample_source();
        let grouped = GroupedOctree::from_particle_source(&source, 4, 4).unwrap();
        for group in grouped.particle_groups() {
            assert!(group.header.count <= 4);
        }
    }

    #[test]
    fn zero_group_size_is_a_configuration_error() {
        let source = sample_source();
        assert!(GroupedOctree::from_particle_source(&source, 4, 0).is_err());
    }

    #[test]
    fn from_pointer_octree_matches_leaf_count() {
        let domain = Domain::from_centre_width([0.0, 0.0, 0.0], 8.0);
        let mut tree = PointerOctree::new(4, domain).unwrap();
        for i in 0..10 {
            let t = i as f64 / 10.0;
            tree.insert(Particle {
                position: [-3.9 + 7.8 * t, 0.1, 0.1],
                value: 1.0,
                role: Role::Both,
            });
        }
        let grouped = GroupedOctree::from_pointer_octree(&tree, 4).unwrap();
        let total: usize = grouped.particle_groups().iter().map(|g| g.leaves.len()).sum();
        assert_eq!(total, tree.leaves().count());
    }
}
