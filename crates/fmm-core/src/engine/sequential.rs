//! Sequential engine — the canonical five-phase FMM schedule every other
//! engine must preserve logically.

use crate::engine::state::{EngineState, Lifecycle};
use crate::error::FmmResult;
use crate::kernel::{Kernel, RelativeCell};
use crate::octree::pointer::PointerOctree;

/// Single-thread reference driver over a [`PointerOctree`].
pub struct SequentialEngine<K: Kernel> {
    kernel: K,
    lifecycle: Lifecycle,
}

impl<K: Kernel> SequentialEngine<K> {
    pub fn new(mut kernel: K) -> Self {
        kernel.init();
        SequentialEngine {
            kernel,
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.lifecycle.state()
    }

    /// Run the full P2M / M2M / M2L / L2L / (L2P + P2P) schedule over
    /// `tree`.
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

    /// Phase 1: P2M at every leaf, from its own source particles.
    fn bottom_pass(&self, tree: &mut PointerOctree) {
        let leaf_level = tree.height() - 1;
        let leaf_keys = tree.level_keys(leaf_level).to_vec();
        for key in leaf_keys {
            if let Some((expansion, sources)) = tree.p2m_inputs(&key) {
                self.kernel.p2m(expansion, sources);
            }
        }
    }

    /// Phase 2: M2M, levels `H-2` down to 2.
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

    /// Phase 3: M2L, levels 2 up to `H-1`.
    fn downward_transfer(&self, tree: &mut PointerOctree, height: u64) {
        for level in 2..height {
            let targets = tree.level_keys(level).to_vec();
            for target in targets {
                let owned: Vec<(crate::morton::MortonKey, u16, crate::kernel::CellExpansion)> = target
                    .interaction_list()
                    .into_iter()
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

    /// Phase 4: L2L, levels 2 up to `H-2`.
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
                {
                    let mut refs: Vec<_> = owned
                        .iter_mut()
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

    /// Phase 5: L2P then P2P. The mutual-form P2P
    /// visits each unordered pair once, keyed by `outside < inside`
    /// Morton order (the canonical order required for reproducibility).
    fn direct_pass(&self, tree: &mut PointerOctree) {
        let leaf_level = tree.height() - 1;
        let leaf_keys = tree.level_keys(leaf_level).to_vec();

        for key in &leaf_keys {
            if let Some((expansion, targets)) = tree.l2p_inputs(key) {
                self.kernel.l2p(expansion, targets);
            }
        }

        for key in &leaf_keys {
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
                let (Some(mut a), Some(mut b)) = (tree.take_leaf(&key), tree.take_leaf(&neighbor)) else {
                    continue;
                };
                self.kernel.p2p(&mut a.container, &mut b.container, true);
                tree.put_leaf(key, a);
                tree.put_leaf(neighbor, b);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;
    use crate::kernel::{CellExpansion, LocalExpansion, MultipoleExpansion};
    use crate::particle::{Particle, ParticleContainer, Role};

    /// A trivial accumulating kernel used only to exercise the schedule:
    /// multipole/local are running particle counts, and P2P/L2P simply
    /// add 1.0 to potential per contributing particle. Not physically
    /// meaningful, just deterministic.
    #[derive(Clone)]
    struct CountingKernel;

    impl Kernel for CountingKernel {
        fn p2m(&self, leaf: &mut CellExpansion, sources: &ParticleContainer) {
            leaf.multipole_len_placeholder(sources.len());
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
        fn p2p(&self, targets: &mut ParticleContainer, sources: &mut ParticleContainer, _mutual: bool) {
            for i in 0..targets.len() {
                targets.accumulate(i, 0.0, 0.0, 0.0, sources.len() as f64);
            }
            for i in 0..sources.len() {
                sources.accumulate(i, 0.0, 0.0, 0.0, targets.len() as f64);
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

    #[test]
    fn sequential_engine_reaches_completed() {
        let domain = Domain::from_centre_width([0.0, 0.0, 0.0], 8.0);
        let mut tree = PointerOctree::new(3, domain).unwrap();
        tree.insert(Particle { position: [-3.75, 0.25, 0.25], value: 100.0, role: Role::Both });
        tree.insert(Particle { position: [3.75, 0.25, 0.25], value: 1.0, role: Role::Both });

        let mut engine = SequentialEngine::new(CountingKernel);
        engine.run(&mut tree).unwrap();
        assert_eq!(engine.state(), EngineState::Completed);
    }
}
