//! Distributed (MPI) engine.
//!
//! Each peer owns a contiguous Morton slab; partition boundaries are
//! resolved by all-gathering `[morton_min, morton_max]` and completing the
//! region between consecutive seeds. Peer boundaries are resolved with the
//! working-interval rule —
//! `working[p].min = max(real[p].min, working[p-1].max + 1)` — and layers
//! the per-level M2M/M2L/L2L/P2P ghost exchange on top of it using the
//! same non-blocking send/recv idiom.

use std::collections::{HashMap, HashSet};

use mpi::topology::SystemCommunicator;
use mpi::traits::*;

use crate::constants::{TAG_DOWNWARD_BASE, TAG_M2L_BASE, TAG_P2P, TAG_UPWARD_BASE};
use crate::engine::state::{EngineState, Lifecycle};
use crate::engine::task::{GroupedOctreeResult, TaskParallelEngine, TaskRunState};
use crate::error::{FmmError, FmmResult};
use crate::kernel::{CellExpansion, Kernel, LocalExpansion, MultipoleExpansion};
use crate::morton::{self, MortonKey};
use crate::octree::grouped::GroupedOctree;
use crate::particle::{Particle, ParticleContainer, Role};
use crate::types::KeyType;

/// The Morton interval each peer is responsible for at one level, after
/// resolving parents whose children straddle a peer boundary
/// (the "working interval").
#[derive(Debug, Clone, Copy)]
pub struct WorkingInterval {
    pub min: MortonKey,
    pub max: MortonKey,
}

/// A payload exchanged between two peers for one pass at one level:
/// a cell (M2M/M2L/L2L) or a particle-container slice (P2P). Both are
/// sent as a tagged, length-prefixed run.
#[derive(Debug, Clone)]
pub struct GhostCell {
    pub key: MortonKey,
    pub expansion: CellExpansion,
}

/// Ghost cells/leaves received from other ranks during the most recent
/// `run`, kept for introspection after the run completes. Every ghost
/// recorded here was also folded into the local computation at the point
/// it was received — this store is a record of what crossed the wire, not
/// the only place that data is used.
#[derive(Debug, Clone, Default)]
pub struct GhostStore {
    cells: HashMap<MortonKey, GhostCell>,
    leaves: HashMap<MortonKey, ParticleContainer>,
}

impl GhostStore {
    pub fn cell(&self, key: &MortonKey) -> Option<&GhostCell> {
        self.cells.get(key)
    }

    pub fn leaf(&self, key: &MortonKey) -> Option<&ParticleContainer> {
        self.leaves.get(key)
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn num_leaves(&self) -> usize {
        self.leaves.len()
    }

    fn absorb_cells(&mut self, ghosts: &[GhostCell]) {
        for ghost in ghosts {
            self.cells.insert(ghost.key, ghost.clone());
        }
    }

    fn absorb_leaves(&mut self, leaves: &[(MortonKey, ParticleContainer)]) {
        for (key, container) in leaves {
            self.leaves.insert(*key, container.clone());
        }
    }
}

/// Peer-parallel FMM: the per-peer slab is driven by a nested
/// [`TaskParallelEngine`], with ghost exchange bridging level boundaries.
pub struct DistributedEngine<K: Kernel> {
    local: TaskParallelEngine<K>,
    lifecycle: Lifecycle,
    ghosts: GhostStore,
    result: Option<GroupedOctreeResult>,
}

impl<K: Kernel> DistributedEngine<K> {
    pub fn new(kernel: K) -> Self {
        DistributedEngine {
            local: TaskParallelEngine::new(kernel),
            lifecycle: Lifecycle::default(),
            ghosts: GhostStore::default(),
            result: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.lifecycle.state()
    }

    /// Ghost cells and leaves gathered during the last `run`.
    pub fn ghosts(&self) -> &GhostStore {
        &self.ghosts
    }

    /// This peer's local slab result from the last `run`, for comparison
    /// against a sequential or task-parallel run over the same particles.
    pub fn result(&self) -> Option<&GroupedOctreeResult> {
        self.result.as_ref()
    }

    /// Run the five-phase schedule over this peer's local slab, exchanging
    /// ghost cells at each level's M2M/M2L/L2L boundary and ghost leaves at
    /// the P2P boundary, folding every one into the matching kernel call as
    /// it arrives. `world` is the communicator; `intervals[level]` is every
    /// peer's working interval at that level (from an all-gather the caller
    /// performs once at construction).
    pub fn run(&mut self, world: &SystemCommunicator, tree: &GroupedOctree, intervals: &[Vec<WorkingInterval>]) -> FmmResult<()> {
        self.lifecycle.advance(EngineState::Prepared)?;
        let state = self.local.prepare(tree);
        self.lifecycle.advance(EngineState::Running)?;

        let rank = world.rank();
        let height = tree.height();
        self.ghosts = GhostStore::default();

        self.local.run_bottom_pass(&state);

        // Upward (M2M): ascend from the deepest parent level to the root.
        // Before computing a parent level's M2M, exchange the child
        // level's boundary cells so a parent straddling two peers' slabs
        // sees every child contribution, not just the ones physically
        // local to this rank.
        if height >= 3 {
            for level in (2..=height - 2).rev() {
                let child_level = level + 1;
                let ghosts = self.exchange_boundary_cells(world, &state, intervals, child_level, TAG_UPWARD_BASE + child_level as i32)?;
                log::trace!("rank {rank}: M2M ghost exchange at level {child_level} received {} cells", ghosts.len());
                let ghost_children: Vec<(MortonKey, CellExpansion)> = ghosts.iter().map(|g| (g.key, g.expansion.clone())).collect();
                self.local.run_upward_level_with_ghosts(&state, level, &ghost_children);
                self.ghosts.absorb_cells(&ghosts);
            }
        }

        // M2L: per level, exchange this level's boundary cells, run the
        // rank-local (in-block and out-of-block) M2L pass, then fold in
        // any interaction-list partner that arrived as a ghost instead of
        // being physically present in this rank's own slab.
        for level in 2..height {
            let ghosts = self.exchange_boundary_cells(world, &state, intervals, level, TAG_M2L_BASE + level as i32)?;
            log::trace!("rank {rank}: M2L ghost exchange at level {level} received {} cells", ghosts.len());
            self.local.run_downward_transfer_level(&state, level);

            let ghost_by_key: HashMap<MortonKey, &CellExpansion> = ghosts.iter().map(|g| (g.key, &g.expansion)).collect();
            let local_targets: Vec<MortonKey> = state.snapshot_level(level).into_iter().map(|(key, _)| key).collect();
            for target in &local_targets {
                for (source, slot) in target.interaction_list() {
                    if let Some(&expansion) = ghost_by_key.get(&source) {
                        self.local.fold_m2l_ghost(&state, level, target, source, slot, expansion);
                    }
                }
            }
            self.ghosts.absorb_cells(&ghosts);
        }

        // L2L: mirror of the M2M ascent. A rank holding only a partial
        // copy of a straddling parent (some children live on another
        // rank) defers to the owning rank's complete copy, received here,
        // instead of propagating its own incomplete local expansion.
        if height >= 3 {
            for level in 2..=height - 2 {
                let ghosts = self.exchange_boundary_cells(world, &state, intervals, level, TAG_DOWNWARD_BASE + level as i32)?;
                log::trace!("rank {rank}: L2L ghost exchange at level {level} received {} cells", ghosts.len());
                let ghost_parents: Vec<(MortonKey, CellExpansion)> = ghosts.iter().map(|g| (g.key, g.expansion.clone())).collect();
                self.local.run_downward_propagation_level_with_ghosts(&state, level, &ghost_parents);
                self.ghosts.absorb_cells(&ghosts);
            }
        }

        // P2P: exchange boundary leaves with the ring neighbours, run the
        // rank-local direct pass, then fold every ghost leaf into the
        // local leaves it neighbours.
        let ghost_leaves = self.exchange_boundary_leaves(world, &state, TAG_P2P)?;
        log::debug!("rank {rank}: P2P ghost exchange received {} leaves", ghost_leaves.len());
        self.local.run_direct_pass(&state);

        let ghost_leaf_by_key: HashMap<MortonKey, &ParticleContainer> = ghost_leaves.iter().map(|(key, c)| (*key, c)).collect();
        let local_leaves: Vec<MortonKey> = state.snapshot_particles().into_iter().map(|(key, _)| key).collect();
        for leaf in &local_leaves {
            for neighbor in leaf.neighbors() {
                if let Some(&source) = ghost_leaf_by_key.get(&neighbor) {
                    self.local.fold_p2p_ghost(&state, leaf, source);
                }
            }
        }
        self.ghosts.absorb_leaves(&ghost_leaves);

        self.result = Some(self.local.finish(state));

        self.lifecycle.advance(EngineState::Completed)?;
        Ok(())
    }

    /// Ship every cell at `level` this rank holds but does not own (per
    /// `intervals`) to its ring neighbours, and receive theirs in turn.
    /// A plain ring — rather than routing each cell to its exact owner —
    /// is enough here because a contiguous Morton-slab partition only ever
    /// needs cells from an immediately adjacent peer to complete an M2M,
    /// M2L or L2L at a boundary; the same assumption the existing P2P
    /// exchange already makes. Every pair of ranks exchanges a count
    /// first, then the payload.
    fn exchange_boundary_cells(
        &self,
        world: &SystemCommunicator,
        state: &TaskRunState,
        intervals: &[Vec<WorkingInterval>],
        level: KeyType,
        _tag: i32,
    ) -> FmmResult<Vec<GhostCell>> {
        let rank = world.rank();
        let size = world.size();
        if size <= 1 {
            return Ok(Vec::new());
        }
        let my_interval = intervals
            .get(level as usize)
            .and_then(|v| v.get(rank as usize))
            .ok_or_else(|| FmmError::configuration("missing working interval for level"))?;

        let boundary: Vec<GhostCell> = state
            .snapshot_level(level)
            .into_iter()
            .filter(|(key, _)| !owns(my_interval, key))
            .map(|(key, expansion)| GhostCell { key, expansion })
            .collect();

        let prev = if rank > 0 { rank - 1 } else { size - 1 };
        let next = if rank + 1 < size { rank + 1 } else { 0 };

        let mut incoming = Vec::new();
        mpi::request::scope(|scope| {
            let mut headers: Vec<u64> = Vec::with_capacity(boundary.len() * 3);
            let mut data: Vec<f64> = Vec::new();
            for ghost in &boundary {
                headers.push(ghost.key.morton());
                headers.push(ghost.expansion.multipole.0.len() as u64);
                headers.push(ghost.expansion.local.0.len() as u64);
                data.extend_from_slice(&ghost.expansion.multipole.0);
                data.extend_from_slice(&ghost.expansion.local.0);
            }
            let my_count = [boundary.len() as u64, data.len() as u64];

            let mut requests = Vec::new();
            for peer in [prev, next] {
                requests.push(world.process_at_rank(peer).immediate_send(scope, &my_count));
            }
            let mut peer_counts = [[0u64; 2]; 2];
            for (slot, peer) in [prev, next].iter().enumerate() {
                world.process_at_rank(*peer).receive_into(&mut peer_counts[slot]);
            }
            for request in requests {
                request.wait();
            }

            let mut requests = Vec::new();
            requests.push(world.process_at_rank(prev).immediate_send(scope, headers.as_slice()));
            requests.push(world.process_at_rank(prev).immediate_send(scope, data.as_slice()));
            requests.push(world.process_at_rank(next).immediate_send(scope, headers.as_slice()));
            requests.push(world.process_at_rank(next).immediate_send(scope, data.as_slice()));

            for (slot, peer) in [prev, next].iter().enumerate() {
                let (count, words) = (peer_counts[slot][0] as usize, peer_counts[slot][1] as usize);
                if count == 0 {
                    continue;
                }
                let mut peer_headers = vec![0u64; count * 3];
                let mut peer_data = vec![0f64; words];
                world.process_at_rank(*peer).receive_into(&mut peer_headers[..]);
                world.process_at_rank(*peer).receive_into(&mut peer_data[..]);

                let mut cursor = 0usize;
                for chunk in peer_headers.chunks(3) {
                    let (morton, multipole_len, local_len) = (chunk[0], chunk[1] as usize, chunk[2] as usize);
                    let multipole = peer_data[cursor..cursor + multipole_len].to_vec();
                    cursor += multipole_len;
                    let local = peer_data[cursor..cursor + local_len].to_vec();
                    cursor += local_len;
                    incoming.push(GhostCell {
                        key: MortonKey::from_morton(morton),
                        expansion: CellExpansion {
                            multipole: MultipoleExpansion(multipole),
                            local: LocalExpansion(local),
                        },
                    });
                }
            }
            for request in requests {
                request.wait();
            }
        });

        Ok(incoming)
    }

    /// Leaf-level analogue of [`DistributedEngine::exchange_boundary_cells`]:
    /// ships particle containers instead of cell expansions. A container is
    /// flattened to `(x, y, z, value)` words; force/potential accumulators
    /// are not shipped, since a ghost leaf is read-only on the receiving
    /// side (P2P against a ghost never writes the ghost back).
    fn exchange_boundary_leaves(&self, world: &SystemCommunicator, state: &TaskRunState, _tag: i32) -> FmmResult<Vec<(MortonKey, ParticleContainer)>> {
        let rank = world.rank();
        let size = world.size();
        if size <= 1 {
            return Ok(Vec::new());
        }

        let particles = state.snapshot_particles();
        let local_keys: HashSet<MortonKey> = particles.iter().map(|(key, _)| *key).collect();

        // Every leaf this rank owns that is a near-field neighbour of a
        // leaf owned by a different rank is a boundary leaf that other
        // rank needs; we don't know remote ownership directly, so every
        // rank exchanges its entire boundary ring with its two Morton-order
        // neighbours in the communicator.
        let prev = if rank > 0 { rank - 1 } else { size - 1 };
        let next = if rank + 1 < size { rank + 1 } else { 0 };

        let boundary: Vec<&(MortonKey, ParticleContainer)> = particles
            .iter()
            .filter(|(key, _)| key.neighbors().iter().any(|n| !local_keys.contains(n)))
            .collect();

        let mut incoming = Vec::new();
        mpi::request::scope(|scope| {
            let mut headers: Vec<u64> = Vec::with_capacity(boundary.len() * 2);
            let mut data: Vec<f64> = Vec::new();
            for (key, container) in &boundary {
                headers.push(key.morton());
                headers.push(container.len() as u64);
                for i in 0..container.len() {
                    let p = container.position(i);
                    data.push(p[0]);
                    data.push(p[1]);
                    data.push(p[2]);
                    data.push(container.value(i));
                }
            }
            let my_count = [headers.len() as u64 / 2, data.len() as u64];

            let mut requests = Vec::new();
            for peer in [prev, next] {
                requests.push(world.process_at_rank(peer).immediate_send(scope, &my_count));
            }
            let mut peer_counts = [[0u64; 2]; 2];
            for (slot, peer) in [prev, next].iter().enumerate() {
                world.process_at_rank(*peer).receive_into(&mut peer_counts[slot]);
            }
            for request in requests {
                request.wait();
            }

            let mut requests = Vec::new();
            requests.push(world.process_at_rank(prev).immediate_send(scope, headers.as_slice()));
            requests.push(world.process_at_rank(prev).immediate_send(scope, data.as_slice()));
            requests.push(world.process_at_rank(next).immediate_send(scope, headers.as_slice()));
            requests.push(world.process_at_rank(next).immediate_send(scope, data.as_slice()));

            for (slot, peer) in [prev, next].iter().enumerate() {
                let (count, words) = (peer_counts[slot][0] as usize, peer_counts[slot][1] as usize);
                if count == 0 {
                    continue;
                }
                let mut peer_headers = vec![0u64; count * 2];
                let mut peer_data = vec![0f64; words];
                world.process_at_rank(*peer).receive_into(&mut peer_headers[..]);
                world.process_at_rank(*peer).receive_into(&mut peer_data[..]);

                let mut cursor = 0usize;
                for chunk in peer_headers.chunks(2) {
                    let (morton, particle_count) = (chunk[0], chunk[1] as usize);
                    let mut container = ParticleContainer::new();
                    for _ in 0..particle_count {
                        let word = &peer_data[cursor..cursor + 4];
                        container.push(
                            Particle {
                                position: [word[0], word[1], word[2]],
                                value: word[3],
                                role: Role::Source,
                            },
                            None,
                        );
                        cursor += 4;
                    }
                    incoming.push((MortonKey::from_morton(morton), container));
                }
            }
            for request in requests {
                request.wait();
            }
        });

        Ok(incoming)
    }
}

/// Whether `key` lies within `interval` — cells outside it are boundary
/// cells whose owner is a different peer.
pub fn owns(interval: &WorkingInterval, key: &MortonKey) -> bool {
    *key >= interval.min && *key <= interval.max
}

/// Compute the real (unresolved) per-level interval from a peer's own
/// `[morton_min, morton_max]` leaf-level span, by climbing both ends from
/// `leaf_level` up to `level`.
pub fn real_interval_at_level(leaf_min: MortonKey, leaf_max: MortonKey, level: KeyType, leaf_level: KeyType) -> (MortonKey, MortonKey) {
    let shift = leaf_level - level;
    let mut min = leaf_min;
    let mut max = leaf_max;
    for _ in 0..shift {
        min = min.parent();
        max = max.parent();
    }
    (min, max)
}

/// The disjoint-prefix working-interval cleanup:
/// `working[p].min = max(real[p].min, working[p-1].max + 1)`. The packed
/// Morton index carries the level in its low 15 bits, so "+1" here means
/// the next index at the same level ([`morton::next_morton_index`]), not
/// a raw integer increment of the packed value.
pub fn resolve_working_intervals(real: &[(MortonKey, MortonKey)]) -> Vec<WorkingInterval> {
    let mut working = Vec::with_capacity(real.len());
    let mut previous_max_morton: Option<KeyType> = None;

    for &(min, max) in real {
        let candidate_min = min.morton();
        let resolved_min = match previous_max_morton {
            Some(prev_max) if morton::next_morton_index(prev_max) > candidate_min => morton::next_morton_index(prev_max),
            _ => candidate_min,
        };
        let resolved_min_key = if resolved_min <= max.morton() {
            MortonKey::from_morton(resolved_min)
        } else {
            max
        };
        working.push(WorkingInterval {
            min: resolved_min_key,
            max,
        });
        previous_max_morton = Some(max.morton());
    }

    working
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_working_intervals_is_disjoint_and_contiguous() {
        let real = vec![
            (MortonKey::from_morton(0), MortonKey::from_morton(10)),
            (MortonKey::from_morton(8), MortonKey::from_morton(20)),
            (MortonKey::from_morton(18), MortonKey::from_morton(30)),
        ];
        let working = resolve_working_intervals(&real);
        for window in working.windows(2) {
            assert!(window[0].max.morton() < window[1].min.morton());
        }
    }

    #[test]
    fn real_interval_climbs_to_requested_level() {
        let leaf_min = MortonKey::from_anchor(&[0, 0, 0]);
        let leaf_max = MortonKey::from_anchor(&[4, 4, 4]);
        let (min, max) = real_interval_at_level(leaf_min, leaf_max, 2, 4);
        assert_eq!(min.level(), 2);
        assert_eq!(max.level(), 2);
    }
}
