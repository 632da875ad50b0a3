//! Task-parallel engine.
//!
//! Each group becomes a data-flow handle. Rather than hand-rolling a
//! topological sort over an explicit task graph, each group's cell/particle
//! storage is wrapped in an `RwLock`: a task acquires a write lock on the
//! group(s) it mutates and read locks on the group(s) it only consults,
//! and `rayon`'s work-stealing pool is left to discover the available
//! parallelism implicitly — a task blocks only if another task genuinely
//! holds a conflicting lock. This favours a pattern the wider corpus
//! already reaches for over hand-rolled schedulers; see `DESIGN.md`.

use std::sync::RwLock;

use rayon::prelude::*;

use crate::engine::state::{EngineState, Lifecycle};
use crate::error::FmmResult;
use crate::interaction::OutOfBlockInteraction;
use crate::kernel::{CellExpansion, Kernel, RelativeCell};
use crate::morton::{self, MortonKey};
use crate::octree::grouped::GroupedOctree;
use crate::particle::ParticleContainer;
use crate::types::KeyType;

/// Precomputed cross-group dependency lists for one level: M2L pairs and
/// P2P pairs that cross a group boundary.
#[derive(Default)]
struct LevelPrecompute {
    m2l_out_of_block: Vec<OutOfBlockInteraction>,
    p2p_out_of_block: Vec<OutOfBlockInteraction>,
}

/// A group's cell records guarded for concurrent task access.
struct GroupCells {
    keys: Vec<MortonKey>,
    expansions: Vec<RwLock<CellExpansion>>,
}

/// A group's particle containers guarded for concurrent task access.
struct GroupParticles {
    keys: Vec<MortonKey>,
    containers: Vec<RwLock<ParticleContainer>>,
}

/// The mutable state one run works over: locked cell/particle groups plus
/// the per-level cross-group precompute. Split out from
/// [`TaskParallelEngine::run`] so the distributed engine can drive the
/// same phases level-by-level, interleaving ghost exchange between them.
pub(crate) struct TaskRunState {
    cells_by_level: Vec<Vec<GroupCells>>,
    particle_groups: Vec<GroupParticles>,
    precompute: Vec<LevelPrecompute>,
}

impl TaskRunState {
    pub(crate) fn height(&self) -> KeyType {
        self.cells_by_level.len() as KeyType
    }

    /// A read-locked snapshot of every cell at `level`, for shipping over
    /// the wire or comparing against another rank's view.
    pub(crate) fn snapshot_level(&self, level: KeyType) -> Vec<(MortonKey, CellExpansion)> {
        self.cells_by_level
            .get(level as usize)
            .into_iter()
            .flatten()
            .flat_map(|group| group.keys.iter().zip(group.expansions.iter()).map(|(k, e)| (*k, e.read().unwrap().clone())))
            .collect()
    }

    /// A read-locked snapshot of every leaf's particle container.
    pub(crate) fn snapshot_particles(&self) -> Vec<(MortonKey, ParticleContainer)> {
        self.particle_groups
            .iter()
            .flat_map(|group| group.keys.iter().zip(group.containers.iter()).map(|(k, c)| (*k, c.read().unwrap().clone())))
            .collect()
    }
}

pub struct TaskParallelEngine<K: Kernel> {
    kernel: K,
    lifecycle: Lifecycle,
}

impl<K: Kernel> TaskParallelEngine<K> {
    pub fn new(mut kernel: K) -> Self {
        kernel.init();
        TaskParallelEngine {
            kernel,
            lifecycle: Lifecycle::default(),
        }
    }

    pub fn state(&self) -> EngineState {
        self.lifecycle.state()
    }

    /// Run the schedule over an already-built [`GroupedOctree`], mutating
    /// it in place and returning the locked cell/particle state applied
    /// back onto it.
    pub fn run(&mut self, tree: &GroupedOctree) -> FmmResult<GroupedOctreeResult> {
        self.lifecycle.advance(EngineState::Prepared)?;
        let state = self.prepare(tree);
        self.lifecycle.advance(EngineState::Running)?;

        self.run_bottom_pass(&state);
        self.run_upward_pass(&state);
        self.run_downward_transfer(&state);
        self.run_downward_propagation(&state);
        self.run_direct_pass(&state);

        self.lifecycle.advance(EngineState::Completed)?;

        Ok(self.finish(state))
    }

    /// Build the locked run state from a [`GroupedOctree`] snapshot,
    /// without running any phase.
    pub(crate) fn prepare(&self, tree: &GroupedOctree) -> TaskRunState {
        let height = tree.height();
        let cells_by_level: Vec<Vec<GroupCells>> = (0..height)
            .map(|level| {
                tree.groups_at_level(level)
                    .iter()
                    .map(|group| GroupCells {
                        keys: group.cells.clone(),
                        expansions: group.expansions.iter().cloned().map(RwLock::new).collect(),
                    })
                    .collect()
            })
            .collect();

        let particle_groups: Vec<GroupParticles> = tree
            .particle_groups()
            .iter()
            .map(|group| GroupParticles {
                keys: group.leaves.clone(),
                containers: group.containers.iter().cloned().map(RwLock::new).collect(),
            })
            .collect();

        let precompute: Vec<LevelPrecompute> = (0..height)
            .map(|level| precompute_level(tree, level))
            .collect();

        TaskRunState {
            cells_by_level,
            particle_groups,
            precompute,
        }
    }

    /// Drain the locked run state back into a plain [`GroupedOctreeResult`].
    pub(crate) fn finish(&self, state: TaskRunState) -> GroupedOctreeResult {
        GroupedOctreeResult {
            cells_by_level: state.cells_by_level,
            particle_groups: state.particle_groups,
        }
    }

    pub(crate) fn run_bottom_pass(&self, state: &TaskRunState) {
        self.bottom_pass(&state.cells_by_level, &state.particle_groups)
    }

    pub(crate) fn run_upward_pass(&self, state: &TaskRunState) {
        self.upward_pass(&state.cells_by_level, state.height())
    }

    /// M2M at `level`, extending each parent's child set with remote
    /// children received as ghosts (keyed by the child's own `MortonKey`).
    /// A kernel aggregates "up to 8 existing children" in one call, so a
    /// ghost child is merged into the same children list rather than
    /// applied as a second, separate M2M invocation.
    pub(crate) fn run_upward_level_with_ghosts(&self, state: &TaskRunState, level: KeyType, ghost_children: &[(MortonKey, CellExpansion)]) {
        self.upward_pass_level_with_ghosts(&state.cells_by_level, level, ghost_children)
    }

    pub(crate) fn run_downward_transfer(&self, state: &TaskRunState) {
        self.downward_transfer(&state.cells_by_level, &state.precompute, state.height())
    }

    pub(crate) fn run_downward_transfer_level(&self, state: &TaskRunState, level: KeyType) {
        self.downward_transfer_level(&state.cells_by_level, &state.precompute, level)
    }

    pub(crate) fn run_downward_propagation(&self, state: &TaskRunState) {
        self.downward_propagation(&state.cells_by_level, state.height())
    }

    pub(crate) fn run_direct_pass(&self, state: &TaskRunState) {
        self.direct_pass(&state.cells_by_level, &state.particle_groups, &state.precompute)
    }

    /// Fold one remote interaction-list member's multipole into a local
    /// target's M2L. Returns `false` if the target isn't present locally.
    pub(crate) fn fold_m2l_ghost(
        &self,
        state: &TaskRunState,
        level: KeyType,
        target_key: &MortonKey,
        source_key: MortonKey,
        slot: u16,
        ghost_source: &CellExpansion,
    ) -> bool {
        let Some(groups) = state.cells_by_level.get(level as usize) else {
            return false;
        };
        let Some((group, idx)) = locate(groups, target_key) else {
            return false;
        };
        let relative = [RelativeCell { key: source_key, slot, expansion: ghost_source }];
        let mut expansion = group.expansions[idx].write().unwrap();
        self.kernel.m2l(&mut expansion, &relative, level);
        true
    }

    pub(crate) fn run_downward_propagation_level_with_ghosts(
        &self,
        state: &TaskRunState,
        level: KeyType,
        ghost_parents: &[(MortonKey, CellExpansion)],
    ) {
        self.downward_propagation_level_with_ghosts(&state.cells_by_level, level, ghost_parents)
    }

    /// Fold a remote leaf's particles into a local target leaf's near
    /// field. Falls back to a non-mutual [`Kernel::p2p`] over a throwaway
    /// clone of the ghost when the kernel has no dedicated remote path.
    /// Returns `false` if the target isn't present locally.
    pub(crate) fn fold_p2p_ghost(&self, state: &TaskRunState, target_key: &MortonKey, ghost_source: &ParticleContainer) -> bool {
        let Some((group, idx)) = locate_particles(&state.particle_groups, target_key) else {
            return false;
        };
        let mut targets = group.containers[idx].write().unwrap();
        if self.kernel.supports_p2p_remote() {
            self.kernel.p2p_remote(&mut targets, ghost_source);
        } else {
            let mut source_copy = ghost_source.clone();
            self.kernel.p2p(&mut targets, &mut source_copy, false);
        }
        true
    }

    fn bottom_pass(&self, cells_by_level: &[Vec<GroupCells>], particle_groups: &[GroupParticles]) {
        let leaf_level = cells_by_level.len() as KeyType - 1;
        let leaf_groups = &cells_by_level[leaf_level as usize];

        leaf_groups.par_iter().for_each_init(
            || self.kernel.clone(),
            |kernel, group| {
                for (idx, key) in group.keys.iter().enumerate() {
                    let Some(pgroup) = particle_groups.iter().find(|g| g.keys.contains(key)) else {
                        continue;
                    };
                    let local = pgroup.keys.iter().position(|k| k == key).unwrap();
                    let sources = pgroup.containers[local].read().unwrap();
                    let mut expansion = group.expansions[idx].write().unwrap();
                    kernel.p2m(&mut expansion, &sources);
                }
            },
        );
    }

    fn upward_pass(&self, cells_by_level: &[Vec<GroupCells>], height: KeyType) {
        if height < 3 {
            return;
        }
        for level in (2..=height - 2).rev() {
            self.upward_pass_level_with_ghosts(cells_by_level, level, &[]);
        }
    }

    fn upward_pass_level_with_ghosts(
        &self,
        cells_by_level: &[Vec<GroupCells>],
        level: KeyType,
        ghost_children: &[(MortonKey, CellExpansion)],
    ) {
        let (parent_levels, child_levels) = cells_by_level.split_at(level as usize + 1);
        let parent_groups = &parent_levels[level as usize];
        let child_groups = &child_levels[0];

        parent_groups.par_iter().for_each_init(
            || self.kernel.clone(),
            |kernel, group| {
                for (idx, parent_key) in group.keys.iter().enumerate() {
                    let child_keys = parent_key.children();
                    let mut owned = Vec::new();
                    for (slot, child_key) in child_keys.iter().enumerate() {
                        if let Some(value) = lookup_expansion(child_groups, child_key) {
                            owned.push((value, slot));
                        } else if let Some((_, ghost)) = ghost_children.iter().find(|(k, _)| k == child_key) {
                            owned.push((ghost.clone(), slot));
                        }
                    }
                    if owned.is_empty() {
                        continue;
                    }
                    let refs: Vec<_> = owned.iter().map(|(e, s)| (e, *s)).collect();
                    let mut expansion = group.expansions[idx].write().unwrap();
                    kernel.m2m(&mut expansion, &refs, level);
                }
            },
        );
    }

    fn downward_transfer(&self, cells_by_level: &[Vec<GroupCells>], precompute: &[LevelPrecompute], height: KeyType) {
        for level in 2..height {
            self.downward_transfer_level(cells_by_level, precompute, level);
        }
    }

    fn downward_transfer_level(&self, cells_by_level: &[Vec<GroupCells>], precompute: &[LevelPrecompute], level: KeyType) {
        let groups = &cells_by_level[level as usize];

        // In-block (self) M2L: both cells live in the same group.
        groups.par_iter().for_each_init(
            || self.kernel.clone(),
            |kernel, group| {
                for (idx, target_key) in group.keys.iter().enumerate() {
                    let mut owned = Vec::new();
                    for (other, slot) in target_key.interaction_list() {
                        if let Some(local) = group.keys.iter().position(|k| *k == other) {
                            owned.push((other, slot, group.expansions[local].read().unwrap().clone()));
                        }
                    }
                    if owned.is_empty() {
                        continue;
                    }
                    let relative: Vec<RelativeCell> = owned
                        .iter()
                        .map(|(key, slot, e)| RelativeCell { key: *key, slot: *slot, expansion: e })
                        .collect();
                    let mut expansion = group.expansions[idx].write().unwrap();
                    kernel.m2l(&mut expansion, &relative, level);
                }
            },
        );

        // Out-of-block M2L: precomputed pairs, `inside` computes both
        // sides using the opposite-slot map.
        precompute[level as usize].m2l_out_of_block.par_iter().for_each_init(
            || self.kernel.clone(),
            |kernel, pair| {
                if let Some(source) = lookup_expansion(groups, &pair.outside) {
                    if let Some((group, idx)) = locate(groups, &pair.inside) {
                        let relative = [RelativeCell { key: pair.outside, slot: pair.slot, expansion: &source }];
                        let mut expansion = group.expansions[idx].write().unwrap();
                        kernel.m2l(&mut expansion, &relative, level);
                    }
                }
                if let Some(source) = lookup_expansion(groups, &pair.inside) {
                    if let Some((group, idx)) = locate(groups, &pair.outside) {
                        let opposite_slot = morton::opposite_m2l_slot(pair.slot);
                        let relative = [RelativeCell { key: pair.inside, slot: opposite_slot, expansion: &source }];
                        let mut expansion = group.expansions[idx].write().unwrap();
                        kernel.m2l(&mut expansion, &relative, level);
                    }
                }
            },
        );
    }

    fn downward_propagation(&self, cells_by_level: &[Vec<GroupCells>], height: KeyType) {
        if height < 3 {
            return;
        }
        for level in 2..=height - 2 {
            self.downward_propagation_level_with_ghosts(cells_by_level, level, &[]);
        }
    }

    /// L2L at `level`. A parent this rank only partially assembled (some
    /// children live on another rank) is not a reliable source for its
    /// local expansion; when `ghost_parents` carries that parent's
    /// authoritative copy from the owning rank, it is used in place of
    /// the local (possibly incomplete) one.
    fn downward_propagation_level_with_ghosts(
        &self,
        cells_by_level: &[Vec<GroupCells>],
        level: KeyType,
        ghost_parents: &[(MortonKey, CellExpansion)],
    ) {
        let (parent_levels, child_levels) = cells_by_level.split_at(level as usize + 1);
        let parent_groups = &parent_levels[level as usize];
        let child_groups = &child_levels[0];

        parent_groups.par_iter().for_each_init(
            || self.kernel.clone(),
            |kernel, group| {
                for (idx, parent_key) in group.keys.iter().enumerate() {
                    let parent_expansion = match ghost_parents.iter().find(|(k, _)| k == parent_key) {
                        Some((_, ghost)) => ghost.clone(),
                        None => group.expansions[idx].read().unwrap().clone(),
                    };
                    let child_keys = parent_key.children();
                    let mut owned = Vec::new();
                    for (slot, child_key) in child_keys.iter().enumerate() {
                        if let Some((cgroup, cidx)) = locate(child_groups, child_key) {
                            owned.push((cgroup, cidx, slot));
                        }
                    }
                    for (cgroup, cidx, slot) in owned {
                        let mut child_expansion = cgroup.expansions[cidx].write().unwrap();
                        let mut refs = [(&mut *child_expansion, slot)];
                        kernel.l2l(&parent_expansion, &mut refs, level);
                    }
                }
            },
        );
    }

    fn direct_pass(
        &self,
        cells_by_level: &[Vec<GroupCells>],
        particle_groups: &[GroupParticles],
        precompute: &[LevelPrecompute],
    ) {
        let leaf_level = cells_by_level.len() as KeyType - 1;
        let leaf_groups = &cells_by_level[leaf_level as usize];

        leaf_groups.par_iter().for_each_init(
            || self.kernel.clone(),
            |kernel, group| {
                for (idx, key) in group.keys.iter().enumerate() {
                    let Some((pgroup, pidx)) = locate_particles(particle_groups, key) else {
                        continue;
                    };
                    let expansion = group.expansions[idx].read().unwrap();
                    let mut targets = pgroup.containers[pidx].write().unwrap();
                    kernel.l2p(&expansion, &mut targets);
                    kernel.p2p_self(&mut targets);
                }
            },
        );

        precompute[leaf_level as usize].p2p_out_of_block.par_iter().for_each_init(
            || self.kernel.clone(),
            |kernel, pair| {
                let (Some((inside_group, inside_idx)), Some((outside_group, outside_idx))) = (
                    locate_particles(particle_groups, &pair.inside),
                    locate_particles(particle_groups, &pair.outside),
                ) else {
                    return;
                };
                let mut inside = inside_group.containers[inside_idx].write().unwrap();
                let mut outside = outside_group.containers[outside_idx].write().unwrap();
                kernel.p2p(&mut inside, &mut outside, true);
            },
        );
    }
}

/// A group's cell/particle state after a run, handed back so call sites
/// can compare against another engine's output for equivalence testing.
pub struct GroupedOctreeResult {
    cells_by_level: Vec<Vec<GroupCells>>,
    particle_groups: Vec<GroupParticles>,
}

impl GroupedOctreeResult {
    /// Potential on the first particle of the leaf addressed by `key`, for
    /// engine-equivalence comparisons in tests.
    pub fn first_particle_potential(&self, key: &MortonKey) -> Option<f64> {
        let (group, idx) = locate_particles(&self.particle_groups, key)?;
        let container = group.containers[idx].read().unwrap();
        if container.is_empty() {
            None
        } else {
            Some(container.potential(0))
        }
    }

    pub fn expansion_at(&self, level: KeyType, key: &MortonKey) -> Option<CellExpansion> {
        let group = self.cells_by_level.get(level as usize)?;
        lookup_expansion(group, key)
    }

    /// The full particle container of the leaf addressed by `key`, for
    /// equivalence comparisons that need every particle's accumulated
    /// potential/force, not just the first.
    pub fn leaf_container(&self, key: &MortonKey) -> Option<ParticleContainer> {
        let (group, idx) = locate_particles(&self.particle_groups, key)?;
        Some(group.containers[idx].read().unwrap().clone())
    }
}

fn lookup_expansion(groups: &[GroupCells], key: &MortonKey) -> Option<CellExpansion> {
    locate(groups, key).map(|(group, idx)| group.expansions[idx].read().unwrap().clone())
}

fn locate<'a>(groups: &'a [GroupCells], key: &MortonKey) -> Option<(&'a GroupCells, usize)> {
    groups.iter().find_map(|group| group.keys.iter().position(|k| k == key).map(|idx| (group, idx)))
}

fn locate_particles<'a>(groups: &'a [GroupParticles], key: &MortonKey) -> Option<(&'a GroupParticles, usize)> {
    groups.iter().find_map(|group| group.keys.iter().position(|k| k == key).map(|idx| (group, idx)))
}

/// Enumerate cross-group M2L/P2P pairs for one level, sorted by outside
/// index and deduplicated, keeping only `outside < inside`.
fn precompute_level(tree: &GroupedOctree, level: KeyType) -> LevelPrecompute {
    let mut m2l = Vec::new();
    for group in tree.groups_at_level(level) {
        for &inside in &group.cells {
            for (outside, slot) in inside.interaction_list() {
                if outside < inside && !group.covers(&outside) {
                    m2l.push(OutOfBlockInteraction::new(inside, outside, slot));
                }
            }
        }
    }
    crate::interaction::sort_by_outside_index(&mut m2l);
    m2l.dedup();

    let mut p2p = Vec::new();
    if level as usize == tree.height() as usize - 1 {
        for group in tree.particle_groups() {
            for &inside in &group.leaves {
                for neighbor in inside.neighbors() {
                    if neighbor < inside && !(group.header.morton_min..=group.header.morton_max).contains(&neighbor) {
                        let slot = morton::near_field_slot(relative_offset(&inside, &neighbor));
                        p2p.push(OutOfBlockInteraction::new(inside, neighbor, slot));
                    }
                }
            }
        }
        crate::interaction::sort_by_outside_index(&mut p2p);
        p2p.dedup();
    }

    LevelPrecompute {
        m2l_out_of_block: m2l,
        p2p_out_of_block: p2p,
    }
}

fn relative_offset(a: &MortonKey, b: &MortonKey) -> [i64; 3] {
    let ac = a.level_coordinate();
    let bc = b.level_coordinate();
    [bc[0] - ac[0], bc[1] - ac[1], bc[2] - ac[2]]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::{Particle, Role};
    use crate::particle_source::{InMemoryParticleSource, ParticleSource};

    fn sample_source() -> InMemoryParticleSource {
        let mut particles = Vec::new();
        for i in 0..60 {
            let t = i as f64 / 60.0;
            particles.push(Particle {
                position: [-3.9 + 7.8 * t, -3.9 + 7.8 * (1.0 - t), 0.0],
                value: 1.0,
                role: Role::Both,
            });
        }
        InMemoryParticleSource::new([0.0; 3], 8.0, particles)
    }

    #[test]
    fn precompute_only_keeps_outside_less_than_inside() {
        let source = sample_source();
        let tree = GroupedOctree::from_particle_source(&source, 4, 8).unwrap();
        let precompute = precompute_level(&tree, 3);
        for pair in &precompute.m2l_out_of_block {
            assert!(pair.outside < pair.inside);
        }
    }
}
