//! Pointer-form octree.
//!
//! A flat `HashMap<MortonKey, _>` keyed on the packed Morton index, with
//! a level index (`BTreeMap<level, Vec<MortonKey>>`) built alongside it
//! for fast level-wise iteration, storing cells and leaves directly since
//! the core needs per-cell expansion storage rather than bare keys.

use std::collections::{BTreeMap, HashMap};

use crate::constants::DEEPEST_LEVEL;
use crate::domain::Domain;
use crate::error::{FmmError, FmmResult};
use crate::kernel::CellExpansion;
use crate::morton::{self, MortonKey};
use crate::particle::{Particle, ParticleContainer};
use crate::types::KeyType;

/// A single cell of the octree: address, expansion workspace, and whether
/// it is a leaf (owns a particle container) or an interior node.
#[derive(Debug, Clone)]
pub struct Cell {
    pub key: MortonKey,
    pub expansion: CellExpansion,
}

/// A leaf cell's particle container.
#[derive(Debug, Clone, Default)]
pub struct Leaf {
    pub container: ParticleContainer,
}

/// Hierarchical cell storage with a level-by-level cursor.
///
/// Cells are keyed by their Morton index in a `HashMap` for O(1) lookup
/// during M2M/M2L/L2L; a parallel `BTreeMap<level, Vec<MortonKey>>` gives
/// the sorted per-level Morton order the cursor walks.
pub struct PointerOctree {
    height: KeyType,
    domain: Domain,
    cells: HashMap<MortonKey, Cell>,
    leaves: HashMap<MortonKey, Leaf>,
    levels: BTreeMap<KeyType, Vec<MortonKey>>,
}

impl PointerOctree {
    /// An empty octree of the given `height` (number of levels, root at 0,
    /// leaves at `height - 1`) over `domain`.
    pub fn new(height: KeyType, domain: Domain) -> FmmResult<Self> {
        if height < 2 || height > DEEPEST_LEVEL + 1 {
            return Err(FmmError::configuration(format!(
                "tree height {height} out of range [2, {}]",
                DEEPEST_LEVEL + 1
            )));
        }
        Ok(PointerOctree {
            height,
            domain,
            cells: HashMap::new(),
            leaves: HashMap::new(),
            levels: BTreeMap::new(),
        })
    }

    pub fn height(&self) -> KeyType {
        self.height
    }

    pub fn domain(&self) -> &Domain {
        &self.domain
    }

    /// Insert a particle, creating its leaf cell and every ancestor cell
    /// up to the root if they do not already exist.
    pub fn insert(&mut self, particle: Particle) {
        let leaf_key = morton::MortonKey::from_point(&particle.position, &self.domain);
        let leaf_key = descend_to_level(leaf_key, self.height - 1);

        self.leaves
            .entry(leaf_key)
            .or_insert_with(Leaf::default)
            .container
            .push(particle, None);

        let mut current = leaf_key;
        loop {
            if let std::collections::hash_map::Entry::Vacant(entry) = self.cells.entry(current) {
                entry.insert(Cell {
                    key: current,
                    expansion: CellExpansion::default(),
                });
                let level_keys = self.levels.entry(current.level()).or_default();
                let pos = level_keys.partition_point(|&k| k < current);
                if level_keys.get(pos) != Some(&current) {
                    level_keys.insert(pos, current);
                }
            }

            if current.level() == 0 {
                break;
            }
            current = current.parent();
        }
    }

    pub fn cell(&self, key: &MortonKey) -> Option<&Cell> {
        self.cells.get(key)
    }

    pub fn cell_mut(&mut self, key: &MortonKey) -> Option<&mut Cell> {
        self.cells.get_mut(key)
    }

    pub fn leaf(&self, key: &MortonKey) -> Option<&Leaf> {
        self.leaves.get(key)
    }

    pub fn leaf_mut(&mut self, key: &MortonKey) -> Option<&mut Leaf> {
        self.leaves.get_mut(key)
    }

    pub fn leaves(&self) -> impl Iterator<Item = (&MortonKey, &Leaf)> {
        self.leaves.iter()
    }

    /// The paired mutable-expansion/immutable-container handles P2M writes
    /// through: the cell and its leaf live in separate maps, so this method
    /// splits the borrow internally rather than forcing callers to hold
    /// two independent borrows of `self`.
    pub fn p2m_inputs(&mut self, key: &MortonKey) -> Option<(&mut CellExpansion, &ParticleContainer)> {
        let cell = self.cells.get_mut(key)?;
        let leaf = self.leaves.get(key)?;
        Some((&mut cell.expansion, &leaf.container))
    }

    /// The paired immutable-expansion/mutable-container handles L2P writes
    /// through.
    pub fn l2p_inputs(&mut self, key: &MortonKey) -> Option<(&CellExpansion, &mut ParticleContainer)> {
        let cell = self.cells.get(key)?;
        let leaf = self.leaves.get_mut(key)?;
        Some((&cell.expansion, &mut leaf.container))
    }

    /// Remove a leaf's container from the tree, taking ownership. Paired
    /// with [`PointerOctree::put_leaf`] so the P2P pass can hold two
    /// distinct leaves' containers mutably at once without violating the
    /// borrow checker's single-mutable-reference-per-key rule.
    pub fn take_leaf(&mut self, key: &MortonKey) -> Option<Leaf> {
        self.leaves.remove(key)
    }

    pub fn put_leaf(&mut self, key: MortonKey, leaf: Leaf) {
        self.leaves.insert(key, leaf);
    }

    /// Remove a set of cells, taking ownership, for the same reason as
    /// [`PointerOctree::take_leaf`] — used by M2M/L2L when the kernel's
    /// batched signature needs several children mutable at once.
    pub fn take_cells(&mut self, keys: &[MortonKey]) -> Vec<(MortonKey, Cell)> {
        keys.iter()
            .filter_map(|key| self.cells.remove(key).map(|cell| (*key, cell)))
            .collect()
    }

    pub fn put_cells(&mut self, cells: Vec<(MortonKey, Cell)>) {
        for (key, cell) in cells {
            self.cells.insert(key, cell);
        }
    }

    /// Keys present at `level`, in Morton order.
    pub fn level_keys(&self, level: KeyType) -> &[MortonKey] {
        self.levels.get(&level).map(|v| v.as_slice()).unwrap_or(&[])
    }

    /// A restartable cursor over one level.
    pub fn iterator(&self, level: KeyType) -> Cursor<'_> {
        Cursor {
            tree: self,
            level,
            index: 0,
        }
    }

    /// Up to 189 interaction-list cells for the cell addressed by `coord`
    /// at `level`, present in this tree (absent cousins are skipped —
    /// the adaptive tree need not contain every combinatorial slot).
    pub fn get_distant_neighbors(&self, coord: &MortonKey, level: KeyType) -> Vec<Cell> {
        let key = descend_to_level(*coord, level);
        key.interaction_list()
            .into_iter()
            .filter_map(|(other, _)| self.cells.get(&other).cloned())
            .collect()
    }

    /// Up to 26 neighbouring leaves of the leaf addressed by `morton` at
    /// the deepest level `height - 1`.
    pub fn get_leafs_neighbors(&self, morton: &MortonKey) -> Vec<(MortonKey, &Leaf)> {
        morton
            .neighbors()
            .into_iter()
            .filter_map(|key| self.leaves.get(&key).map(|leaf| (key, leaf)))
            .collect()
    }
}

fn descend_to_level(key: MortonKey, level: KeyType) -> MortonKey {
    let mut current = key;
    while current.level() < level {
        current = current.first_child();
    }
    while current.level() > level {
        current = current.parent();
    }
    current
}

/// Cursor over one level of the tree. The protocol is
/// explicit rather than a standard `Iterator`: `move_up`/`move_down` cross
/// levels and do not preserve horizontal (left-to-right) alignment, so the
/// caller must call `goto_left` to re-anchor after crossing levels.
pub struct Cursor<'a> {
    tree: &'a PointerOctree,
    level: KeyType,
    index: usize,
}

impl<'a> Cursor<'a> {
    /// Position at the first (lowest Morton index) cell of the current level.
    pub fn goto_bottom_left(&mut self) {
        self.index = 0;
    }

    /// Re-anchor to the first cell of the current level, after a level
    /// change that does not itself preserve horizontal position.
    pub fn goto_left(&mut self) {
        self.index = 0;
    }

    /// Advance to the next cell at this level in Morton order. Returns
    /// `false` once the cursor has passed the last cell.
    pub fn move_right(&mut self) -> bool {
        let len = self.tree.level_keys(self.level).len();
        if self.index + 1 >= len {
            self.index = len;
            false
        } else {
            self.index += 1;
            true
        }
    }

    /// Move to the parent level. Horizontal position is not preserved;
    /// call `goto_left` (or otherwise re-derive an index) before iterating.
    pub fn move_up(&mut self) {
        if self.level > 0 {
            self.level -= 1;
            self.index = 0;
        }
    }

    /// Move to the child level. Horizontal position is not preserved.
    pub fn move_down(&mut self) {
        if self.level + 1 < self.tree.height {
            self.level += 1;
            self.index = 0;
        }
    }

    /// The cell currently under the cursor, if any.
    pub fn current(&self) -> Option<&'a Cell> {
        self.tree
            .level_keys(self.level)
            .get(self.index)
            .and_then(|key| self.tree.cell(key))
    }

    pub fn level(&self) -> KeyType {
        self.level
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::Role;

    fn domain() -> Domain {
        Domain::from_centre_width([0.0, 0.0, 0.0], 8.0)
    }

    fn particle(x: f64, y: f64, z: f64) -> Particle {
        Particle {
            position: [x, y, z],
            value: 1.0,
            role: Role::Both,
        }
    }

    #[test]
    fn insert_creates_ancestor_chain() {
        let mut tree = PointerOctree::new(4, domain()).unwrap();
        tree.insert(particle(-3.75, 0.25, 0.25));
        assert!(!tree.level_keys(0).is_empty());
        assert!(!tree.level_keys(3).is_empty());
    }

    #[test]
    fn cursor_walks_level_in_morton_order() {
        let mut tree = PointerOctree::new(3, domain()).unwrap();
        tree.insert(particle(-3.75, 0.25, 0.25));
        tree.insert(particle(3.75, 0.25, 0.25));

        let mut cursor = tree.iterator(2);
        cursor.goto_bottom_left();
        let mut keys = Vec::new();
        loop {
            if let Some(cell) = cursor.current() {
                keys.push(cell.key);
            }
            if !cursor.move_right() {
                break;
            }
        }
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }

    #[test]
    fn distant_neighbors_excludes_self_and_direct_neighbors() {
        let mut tree = PointerOctree::new(5, domain()).unwrap();
        for i in 0..20 {
            let t = i as f64 / 20.0;
            tree.insert(particle(-3.9 + 7.8 * t, -3.9 + 7.8 * t, -3.9 + 7.8 * t));
        }
        let target = *tree.level_keys(4).first().unwrap();
        let neighbors: std::collections::HashSet<_> =
            target.neighbors().into_iter().collect();
        for cell in tree.get_distant_neighbors(&target, 4) {
            assert_ne!(cell.key, target);
            assert!(!neighbors.contains(&cell.key));
        }
    }
}
