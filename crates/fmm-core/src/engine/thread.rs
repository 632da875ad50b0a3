//! Thread-parallel (inspector-executor) engine.
//!
//! For each pass and level: a single thread (the "inspector") walks the
//! cursor to gather a contiguous array of cell references, then a
//! work-sharing `rayon` parallel loop (the "executor") processes them.
//! Each worker clones the kernel once via `for_each_init`, matching the
//! `ParallelCompute` idiom other n-body crates in this corpus use for
//! per-worker state (`other_examples/…particular-src-parallel.rs.rs`).
//!
//! Cell mutation during the parallel phase is expressed as "gather inputs,
//! compute outputs in parallel, apply outputs on the inspector thread" —
//! the executor never holds two live mutable borrows into the same
//! `HashMap`-backed tree at once, sidestepping unsafe code while keeping
//! the gather/parallel-compute/apply shape the spec calls for.

use rayon::prelude::*;

use crate::engine::state::{EngineState, Lifecycle};
use crate::error::FmmResult;
use crate::kernel::{CellExpansion, Kernel, RelativeCell};
use crate::morton::MortonKey;
use crate::octree::pointer::PointerOctree;

/// Colour assignment for the 26-colour P2P scheme: leaves sharing a
/// colour have pairwise disjoint neighbour sets, so each colour batch is
/// safe to run with the mutual form concurrently.
fn colour_of(key: &MortonKey) -> u8 {
    let [cx, cy, cz] = key.level_coordinate();
    (((cx.rem_euclid(3)) * 9) + ((cy.rem_euclid(3)) * 3) + cz.rem_euclid(3)) as u8
}

pub struct ThreadParallelEngine<K: Kernel> {
    kernel: K,
    lifecycle: Lifecycle,
}

impl<K: Kernel> ThreadParallelEngine<K> {
    pub fn new(mut kernel: K) -> Self {
        kernel.init();
        ThreadParallelEngine {
            kernel,
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.lifecycle.state()
    }

    pub fn run(&mut self, tree: &mut PointerOctree) -> FmmResult<()> {
        self.lifecycle.advance(EngineState::Prepared)?;
        self.lifecycle.advance(EngineState::Running)?;

        let height = tree.height();
        self.bottom_pass(tree);
        self.upward_pass(tree, height);
        self.downward_transfer(tree, height);
        self.downward_propagation(tree, height);
        self.direct_pass(tree);

        self.lifecycle.advance(EngineState::Completed)?;
        Ok(())
    }

    fn bottom_pass(&self, tree: &mut PointerOctree) {
        let leaf_level = tree.height() - 1;
        let leaf_keys = tree.level_keys(leaf_level).to_vec();

        let outputs: Vec<_> = leaf_keys
            .par_iter()
            .map_init(
                || self.kernel.clone(),
                |kernel, key| {
                    let mut expansion = CellExpansion::default();
                    if let Some(leaf) = tree.leaf(key) {
                        kernel.p2m(&mut expansion, &leaf.container);
                    }
                    (*key, expansion)
                },
            )
            .collect();

        for (key, expansion) in outputs {
            if let Some(cell) = tree.cell_mut(&key) {
                cell.expansion = expansion;
            }
        }
    }

    fn upward_pass(&self, tree: &mut PointerOctree, height: u64) {
        if height < 3 {
            return;
        }
        for level in (2..=height - 2).rev() {
            let parents = tree.level_keys(level).to_vec();

            let gathered: Vec<_> = parents
                .iter()
                .map(|parent| {
                    let children: Vec<(CellExpansion, usize)> = parent
                        .children()
                        .iter()
                        .enumerate()
                        .filter_map(|(slot, key)| tree.cell(key).map(|c| (c.expansion.clone(), slot)))
                        .collect();
                    (*parent, children)
                })
                .collect();

            let outputs: Vec<_> = gathered
                .into_par_iter()
                .map_init(
                    || self.kernel.clone(),
                    |kernel, (parent, children)| {
                        let mut expansion = CellExpansion::default();
                        if !children.is_empty() {
                            let refs: Vec<_> = children.iter().map(|(e, s)| (e, *s)).collect();
                            kernel.m2m(&mut expansion, &refs, level);
                        }
                        (parent, expansion, children.is_empty())
                    },
                )
                .collect();

            for (key, expansion, empty) in outputs {
                if empty {
                    continue;
                }
                if let Some(cell) = tree.cell_mut(&key) {
                    cell.expansion = expansion;
                }
            }
        }
    }

    fn downward_transfer(&self, tree: &mut PointerOctree, height: u64) {
        for level in 2..height {
            let targets = tree.level_keys(level).to_vec();

            let gathered: Vec<_> = targets
                .iter()
                .map(|target| {
                    let owned: Vec<(MortonKey, u16, CellExpansion)> = target
                        .interaction_list()
                        .into_iter()
                        .filter_map(|(key, slot)| tree.cell(&key).map(|c| (key, slot, c.expansion.clone())))
                        .collect();
                    (*target, owned)
                })
                .collect();

            let outputs: Vec<_> = gathered
                .into_par_iter()
                .map_init(
                    || self.kernel.clone(),
                    |kernel, (target, owned)| {
                        let mut expansion = match tree.cell(&target) {
                            Some(c) => c.expansion.clone(),
                            None => CellExpansion::default(),
                        };
                        if !owned.is_empty() {
                            let relative: Vec<RelativeCell> = owned
                                .iter()
                                .map(|(key, slot, e)| RelativeCell { key: *key, slot: *slot, expansion: e })
                                .collect();
                            kernel.m2l(&mut expansion, &relative, level);
                        }
                        (target, expansion)
                    },
                )
                .collect();

            for (key, expansion) in outputs {
                if let Some(cell) = tree.cell_mut(&key) {
                    cell.expansion = expansion;
                }
            }
        }
    }

    fn downward_propagation(&self, tree: &mut PointerOctree, height: u64) {
        if height < 3 {
            return;
        }
        for level in 2..=height - 2 {
            let parents = tree.level_keys(level).to_vec();

            let gathered: Vec<_> = parents
                .iter()
                .filter_map(|parent| tree.cell(parent).map(|c| (*parent, c.expansion.clone(), parent.children())))
                .collect();

            let outputs: Vec<_> = gathered
                .into_par_iter()
                .map_init(
                    || self.kernel.clone(),
                    |kernel, (_parent, parent_expansion, child_keys)| {
                        let mut child_expansions: Vec<CellExpansion> =
                            child_keys.iter().map(|_| CellExpansion::default()).collect();
                        {
                            let mut refs: Vec<_> = child_expansions
                                .iter_mut()
                                .enumerate()
                                .map(|(slot, e)| (e, slot))
                                .collect();
                            kernel.l2l(&parent_expansion, &mut refs, level);
                        }
                        (child_keys, child_expansions)
                    },
                )
                .collect();

            for (child_keys, child_expansions) in outputs {
                for (key, expansion) in child_keys.into_iter().zip(child_expansions) {
                    if let Some(cell) = tree.cell_mut(&key) {
                        cell.expansion = expansion;
                    }
                }
            }
        }
    }

    fn direct_pass(&self, tree: &mut PointerOctree) {
        let leaf_level = tree.height() - 1;
        let leaf_keys = tree.level_keys(leaf_level).to_vec();

        // L2P: embarrassingly parallel, one leaf's targets at a time.
        let l2p_outputs: Vec<_> = leaf_keys
            .par_iter()
            .map_init(
                || self.kernel.clone(),
                |kernel, key| {
                    let mut targets = tree.leaf(key).map(|l| l.container.clone()).unwrap_or_default();
                    if let Some(cell) = tree.cell(key) {
                        kernel.l2p(&cell.expansion, &mut targets);
                    }
                    (*key, targets)
                },
            )
            .collect();
        for (key, targets) in l2p_outputs {
            if let Some(leaf) = tree.leaf_mut(&key) {
                leaf.container = targets;
            }
        }

        // P2P self-interaction, also embarrassingly parallel.
        let self_outputs: Vec<_> = leaf_keys
            .par_iter()
            .map_init(
                || self.kernel.clone(),
                |kernel, key| {
                    let mut container = tree.leaf(key).map(|l| l.container.clone()).unwrap_or_default();
                    kernel.p2p_self(&mut container);
                    (*key, container)
                },
            )
            .collect();
        for (key, container) in self_outputs {
            if let Some(leaf) = tree.leaf_mut(&key) {
                leaf.container = container;
            }
        }

        // Mutual P2P, 26-colour scheme: colours run sequentially, pairs
        // within a colour run in parallel since they never share a leaf.
        let mut by_colour: [Vec<(MortonKey, MortonKey)>; 27] = Default::default();
        for &key in &leaf_keys {
            for neighbor in key.neighbors() {
                if neighbor >= key {
                    continue;
                }
                by_colour[colour_of(&key) as usize].push((key, neighbor));
            }
        }

        for pairs in by_colour.iter() {
            if pairs.is_empty() {
                continue;
            }
            let outputs: Vec<_> = pairs
                .par_iter()
                .map_init(
                    || self.kernel.clone(),
                    |kernel, (a, b)| {
                        let mut a_container = tree.leaf(a).map(|l| l.container.clone()).unwrap_or_default();
                        let mut b_container = tree.leaf(b).map(|l| l.container.clone()).unwrap_or_default();
                        kernel.p2p(&mut a_container, &mut b_container, true);
                        (*a, a_container, *b, b_container)
                    },
                )
                .collect();
            for (a, a_container, b, b_container) in outputs {
                if let Some(leaf) = tree.leaf_mut(&a) {
                    leaf.container = a_container;
                }
                if let Some(leaf) = tree.leaf_mut(&b) {
                    leaf.container = b_container;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::colour_of;
    use crate::domain::Domain;
    use crate::morton::MortonKey;

    #[test]
    fn same_colour_neighbors_are_never_direct_neighbors() {
        let domain = Domain::from_centre_width([0.0, 0.0, 0.0], 8.0);
        let mut key = MortonKey::from_point(&[0.1, 0.1, 0.1], &domain);
        while key.level() > 4 {
            key = key.parent();
        }
        let my_colour = colour_of(&key);
        for neighbor in key.neighbors() {
            // Adjacent cells along an axis differ by 1 mod 3 on that axis,
            // so same-colour collisions cannot happen among direct
            // neighbours within one colouring period (3 boxes).
            if colour_of(&neighbor) == my_colour {
                assert_ne!(neighbor, key);
            }
        }
    }

    #[test]
    fn colour_range_is_bounded() {
        assert!((0..27).contains(&(colour_of(&MortonKey::from_anchor(&[5, 9, 13])) as i32)));
    }
}
