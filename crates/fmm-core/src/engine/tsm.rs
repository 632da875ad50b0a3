//! Target-Source Model engine: wraps the sequential schedule and prunes
//! M2L/L2L/L2P/P2P work against a [`RoleTable`] built bottom-up from the
//! tree's own leaf contents. On a dataset where every particle is both
//! source and target the table prunes nothing, so this engine's output
//! matches [`SequentialEngine`](crate::engine::sequential::SequentialEngine)
//! exactly in that case.

use crate::engine::state::{EngineState, Lifecycle};
use crate::error::FmmResult;
use crate::kernel::{Kernel, RelativeCell};
use crate::octree::pointer::PointerOctree;
use crate::tsm::{build_role_table, RoleTable};

/// Single-thread driver over a [`PointerOctree`] that consults a
/// [`RoleTable`] to skip M2L/L2L/L2P/P2P work on subtrees that hold no
/// source or no target particles.
pub struct TsmEngine<K: Kernel> {
    kernel: K,
    lifecycle: Lifecycle,
    roles: RoleTable,
}

impl<K: Kernel> TsmEngine<K> {
    pub fn new(mut kernel: K) -> Self {
        kernel.init();
        TsmEngine {
            kernel,
            lifecycle: Lifecycle::default(),
            roles: RoleTable::new(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.lifecycle.state()
    }

    pub fn roles(&self) -> &RoleTable {
        &self.roles
    }

    /// Run the same five-phase schedule as the sequential engine, with
    /// M2L, L2L, L2P and P2P pruned against the role table.
    pub fn run(&mut self, tree: &mut PointerOctree) -> FmmResult<()> {
        self.lifecycle.advance(EngineState::Prepared)?;
        self.lifecycle.advance(EngineState::Running)?;

        self.roles = build_role_table(tree.leaves().map(|(key, leaf)| (*key, &leaf.container)));

        let height = tree.height();

        self.bottom_pass(tree);
        self.upward_pass(tree, height);
        self.downward_transfer(tree, height);
        self.downward_propagation(tree, height);
        self.direct_pass(tree);

        self.lifecycle.advance(EngineState::Completed)?;
        Ok(())
    }

    /// Phase 1: P2M at every leaf. Unconditional — the role bits a leaf
    /// carries are themselves derived from this pass's inputs, and an
    /// empty-source leaf produces an inert (all-zero) multipole anyway.
    fn bottom_pass(&self, tree: &mut PointerOctree) {
        let leaf_level = tree.height() - 1;
        let leaf_keys = tree.level_keys(leaf_level).to_vec();
        for key in leaf_keys {
            if let Some((expansion, sources)) = tree.p2m_inputs(&key) {
                self.kernel.p2m(expansion, sources);
            }
        }
    }

    /// Phase 2: M2M, levels `H-2` down to 2. Unconditional, same reasoning
    /// as `bottom_pass`: a cell with no source descendants simply carries
    /// an inert multipole up the tree.
    fn upward_pass(&self, tree: &mut PointerOctree, height: u64) {
        if height < 3 {
            return;
        }
        for level in (2..=height - 2).rev() {
            let parents = tree.level_keys(level).to_vec();
            for parent in parents {
                let child_keys: Vec<_> = parent.children();
                let children: Vec<_> = child_keys
                    .iter()
                    .enumerate()
                    .filter_map(|(slot, key)| tree.cell(key).map(|c| (c.expansion.clone(), slot)))
                    .collect();
                if children.is_empty() {
                    continue;
                }
                if let Some(cell) = tree.cell_mut(&parent) {
                    let refs: Vec<_> = children.iter().map(|(e, slot)| (e, *slot)).collect();
                    self.kernel.m2m(&mut cell.expansion, &refs, level);
                }
            }
        }
    }

    /// Phase 3: M2L, levels 2 up to `H-1`. Skipped entirely at a target
    /// with no target descendants; within the interaction list, a source
    /// with no source descendants is dropped rather than contributing an
    /// inert zero multipole.
    fn downward_transfer(&self, tree: &mut PointerOctree, height: u64) {
        for level in 2..height {
            let targets = tree.level_keys(level).to_vec();
            for target in targets {
                if !self.roles.should_run_m2l(&target) {
                    continue;
                }
                let owned: Vec<(crate::morton::MortonKey, u16, crate::kernel::CellExpansion)> = target
                    .interaction_list()
                    .into_iter()
                    .filter(|(key, _)| self.roles.contributes_as_source(key))
                    .filter_map(|(key, slot)| tree.cell(&key).map(|c| (key, slot, c.expansion.clone())))
                    .collect();
                if owned.is_empty() {
                    continue;
                }
                let relative: Vec<RelativeCell> = owned
                    .iter()
                    .map(|(key, slot, expansion)| RelativeCell {
                        key: *key,
                        slot: *slot,
                        expansion,
                    })
                    .collect();
                if let Some(cell) = tree.cell_mut(&target) {
                    self.kernel.m2l(&mut cell.expansion, &relative, level);
                }
            }
        }
    }

    /// Phase 4: L2L, levels 2 up to `H-2`. Every child still moves through
    /// `take_cells`/`put_cells` so state is never lost; only children with
    /// target descendants actually receive the parent's local expansion.
    fn downward_propagation(&self, tree: &mut PointerOctree, height: u64) {
        if height < 3 {
            return;
        }
        for level in 2..=height - 2 {
            let parents = tree.level_keys(level).to_vec();
            for parent in parents {
                let parent_expansion = match tree.cell(&parent) {
                    Some(cell) => cell.expansion.clone(),
                    None => continue,
                };
                let child_keys = parent.children();
                let mut owned = tree.take_cells(&child_keys);
                if owned.is_empty() {
                    continue;
                }
                let propagate: Vec<MortonKeyAndSlot> = owned
                    .iter()
                    .filter(|(key, _)| self.roles.should_propagate_l2l(key))
                    .map(|(key, _)| {
                        let slot = child_keys.iter().position(|k| k == key).unwrap();
                        (*key, slot)
                    })
                    .collect();
                if !propagate.is_empty() {
                    let mut refs: Vec<_> = owned
                        .iter_mut()
                        .filter(|(key, _)| propagate.iter().any(|(pkey, _)| pkey == key))
                        .map(|(key, cell)| {
                            let slot = child_keys.iter().position(|k| k == key).unwrap();
                            (&mut cell.expansion, slot)
                        })
                        .collect();
                    self.kernel.l2l(&parent_expansion, &mut refs, level);
                }
                tree.put_cells(owned);
            }
        }
    }

    /// Phase 5: L2P then P2P, each pruned against the role table. A pair
    /// where neither side needs a target contributes nothing and is
    /// skipped outright; a pair where only one side does runs the
    /// one-directional (non-mutual) form in the direction that matters.
    fn direct_pass(&self, tree: &mut PointerOctree) {
        let leaf_level = tree.height() - 1;
        let leaf_keys = tree.level_keys(leaf_level).to_vec();

        for key in &leaf_keys {
            if !self.roles.should_run_direct(key) {
                continue;
            }
            if let Some((expansion, targets)) = tree.l2p_inputs(key) {
                self.kernel.l2p(expansion, targets);
            }
        }

        for key in &leaf_keys {
            if !self.roles.should_run_direct(key) || !self.roles.readable_as_source(key) {
                continue;
            }
            if let Some(mut leaf) = tree.take_leaf(key) {
                self.kernel.p2p_self(&mut leaf.container);
                tree.put_leaf(*key, leaf);
            }
        }

        for &key in &leaf_keys {
            for neighbor in key.neighbors() {
                if neighbor >= key {
                    continue; // canonical order: only the lower index computes the pair
                }
                let key_wants = self.roles.should_run_direct(&key);
                let neighbor_wants = self.roles.should_run_direct(&neighbor);
                let key_gives = self.roles.readable_as_source(&key);
                let neighbor_gives = self.roles.readable_as_source(&neighbor);

                let forward = key_wants && neighbor_gives;
                let backward = neighbor_wants && key_gives;
                if !forward && !backward {
                    continue;
                }

                let (Some(mut a), Some(mut b)) = (tree.take_leaf(&key), tree.take_leaf(&neighbor)) else {
                    continue;
                };
                if forward && backward {
                    self.kernel.p2p(&mut a.container, &mut b.container, true);
                } else if forward {
                    self.kernel.p2p(&mut a.container, &mut b.container, false);
                } else {
                    self.kernel.p2p(&mut b.container, &mut a.container, false);
                }
                tree.put_leaf(key, a);
                tree.put_leaf(neighbor, b);
            }
        }
    }
}

type MortonKeyAndSlot = (crate::morton::MortonKey, usize);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::engine::sequential::SequentialEngine;
    use crate::kernel::{CellExpansion, LocalExpansion, MultipoleExpansion};
    use crate::particle::{Particle, ParticleContainer, Role};

    /// Running total kernel: multipole/local expansions are particle
    /// counts, P2P/L2P add the counterpart count to potential. Not
    /// physically meaningful, just deterministic and order-insensitive
    /// enough to compare schedules.
    #[derive(Clone)]
    struct CountingKernel;

    impl Kernel for CountingKernel {
        fn p2m(&self, leaf: &mut CellExpansion, sources: &ParticleContainer) {
            leaf.multipole_len_placeholder(sources.source_count());
        }
        fn m2m(&self, parent: &mut CellExpansion, children: &[(&CellExpansion, usize)], _level: u64) {
            let total: f64 = children.iter().map(|(c, _)| c.multipole.0.first().copied().unwrap_or(0.0)).sum();
            parent.multipole_len_placeholder(total as usize);
        }
        fn m2l(&self, target: &mut CellExpansion, interaction_list: &[RelativeCell], _level: u64) {
            let total: f64 = interaction_list
                .iter()
                .map(|rc| rc.expansion.multipole.0.first().copied().unwrap_or(0.0))
                .sum();
            target.local.0 = vec![total];
        }
        fn l2l(&self, parent: &CellExpansion, children: &mut [(&mut CellExpansion, usize)], _level: u64) {
            let value = parent.local.0.first().copied().unwrap_or(0.0);
            for (child, _) in children.iter_mut() {
                child.local.0 = vec![value];
            }
        }
        fn l2p(&self, leaf: &CellExpansion, targets: &mut ParticleContainer) {
            let value = leaf.local.0.first().copied().unwrap_or(0.0);
            for i in 0..targets.len() {
                targets.accumulate(i, 0.0, 0.0, 0.0, value);
            }
        }
        fn p2p(&self, targets: &mut ParticleContainer, sources: &mut ParticleContainer, mutual: bool) {
            for i in 0..targets.len() {
                targets.accumulate(i, 0.0, 0.0, 0.0, sources.len() as f64);
            }
            if mutual {
                for i in 0..sources.len() {
                    sources.accumulate(i, 0.0, 0.0, 0.0, targets.len() as f64);
                }
            }
        }
        fn p2p_self(&self, _container: &mut ParticleContainer) {}
    }

    impl CellExpansion {
        fn multipole_len_placeholder(&mut self, value: usize) {
            self.multipole = MultipoleExpansion(vec![value as f64]);
            if self.local.0.is_empty() {
                self.local = LocalExpansion(vec![0.0]);
            }
        }
    }

    fn domain() -> Domain {
        Domain::from_centre_width([0.0, 0.0, 0.0], 8.0)
    }

    #[test]
    fn tsm_engine_reaches_completed() {
        let mut tree = PointerOctree::new(3, domain()).unwrap();
        tree.insert(Particle { position: [-3.75, 0.25, 0.25], value: 100.0, role: Role::Both });
        tree.insert(Particle { position: [3.75, 0.25, 0.25], value: 1.0, role: Role::Both });

        let mut engine = TsmEngine::new(CountingKernel);
        engine.run(&mut tree).unwrap();
        assert_eq!(engine.state(), EngineState::Completed);
    }

    /// S5: on an all-`Role::Both` dataset the role table prunes nothing,
    /// so a TSM run must match the plain sequential schedule exactly.
    #[test]
    fn tsm_matches_sequential_when_every_particle_is_both() {
        let particles = [
            Particle { position: [-3.75, 0.25, 0.25], value: 100.0, role: Role::Both },
            Particle { position: [3.75, 0.25, 0.25], value: 1.0, role: Role::Both },
            Particle { position: [0.25, -3.75, 1.5], value: 7.0, role: Role::Both },
            Particle { position: [1.75, 1.75, -3.1], value: 3.0, role: Role::Both },
        ];

        let mut tsm_tree = PointerOctree::new(3, domain()).unwrap();
        let mut seq_tree = PointerOctree::new(3, domain()).unwrap();
        for p in particles {
            tsm_tree.insert(p);
            seq_tree.insert(p);
        }

        TsmEngine::new(CountingKernel).run(&mut tsm_tree).unwrap();
        SequentialEngine::new(CountingKernel).run(&mut seq_tree).unwrap();

        for (key, leaf) in tsm_tree.leaves() {
            let reference = seq_tree.leaf(key).unwrap();
            for i in 0..leaf.container.len() {
                assert_eq!(leaf.container.potential(i), reference.container.potential(i));
            }
        }
    }

    /// S5, mixed roles: pruning must never change a real target's result.
    /// With some particles pure sources and others pure targets, the
    /// pruned schedule still has to land every target at the same
    /// potential an unpruned (sequential) run over the identical particle
    /// set would produce — TSM only skips work that contributes to
    /// nothing, never work a target actually depends on.
    #[test]
    fn tsm_matches_sequential_for_targets_with_mixed_roles() {
        let particles = [
            Particle { position: [-3.75, 0.25, 0.25], value: 5.0, role: Role::Source },
            Particle { position: [3.75, 0.25, 0.25], value: 2.0, role: Role::Target },
            Particle { position: [0.25, -3.75, 1.5], value: 9.0, role: Role::Source },
            Particle { position: [1.75, 1.75, -3.1], value: 4.0, role: Role::Target },
        ];

        let mut tsm_tree = PointerOctree::new(3, domain()).unwrap();
        let mut seq_tree = PointerOctree::new(3, domain()).unwrap();
        for p in particles {
            tsm_tree.insert(p);
            seq_tree.insert(p);
        }

        TsmEngine::new(CountingKernel).run(&mut tsm_tree).unwrap();
        SequentialEngine::new(CountingKernel).run(&mut seq_tree).unwrap();

        for (key, leaf) in tsm_tree.leaves() {
            let reference = seq_tree.leaf(key).unwrap();
            for i in 0..leaf.container.len() {
                if leaf.container.role(i).is_target() {
                    assert_eq!(leaf.container.potential(i), reference.container.potential(i));
                }
            }
        }
    }
}
