//! Target-Source Model (TSM) wrapper.
//!
//! Each cell carries two role bits propagated bottom-up during P2M/M2M;
//! the wrapper prunes M2L/L2L/L2P/P2P invocations on subtrees that cannot
//! contribute (no source descendants) or cannot receive (no target
//! descendants). This is the sole reason TSM exists — the schedule itself
//! is otherwise identical to the non-TSM engines.

use std::collections::HashMap;

use crate::morton::MortonKey;
use crate::particle::{ParticleContainer, Role};

/// The two role bits a TSM cell carries.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RoleBits {
    pub has_source_descendants: bool,
    pub has_target_descendants: bool,
}

impl RoleBits {
    pub fn from_container(container: &ParticleContainer) -> Self {
        RoleBits {
            has_source_descendants: container.source_count() > 0,
            has_target_descendants: container.target_count() > 0,
        }
    }

    /// M2M propagation: OR over existing children's bits.
    pub fn aggregate(children: impl IntoIterator<Item = RoleBits>) -> Self {
        let mut bits = RoleBits::default();
        for child in children {
            bits.has_source_descendants |= child.has_source_descendants;
            bits.has_target_descendants |= child.has_target_descendants;
        }
        bits
    }
}

/// Per-cell role-bit table, built bottom-up over a tree during P2M/M2M.
#[derive(Debug, Clone, Default)]
pub struct RoleTable {
    bits: HashMap<MortonKey, RoleBits>,
}

impl RoleTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: MortonKey, bits: RoleBits) {
        self.bits.insert(key, bits);
    }

    pub fn get(&self, key: &MortonKey) -> RoleBits {
        self.bits.get(key).copied().unwrap_or_default()
    }

    /// M2L at `target` should run only if `target` has target descendants;
    /// further, within the interaction list, only neighbours with source
    /// descendants actually contribute — callers filter the list with
    /// [`RoleTable::contributes_as_source`].
    pub fn should_run_m2l(&self, target: &MortonKey) -> bool {
        self.get(target).has_target_descendants
    }

    pub fn contributes_as_source(&self, source: &MortonKey) -> bool {
        self.get(source).has_source_descendants
    }

    /// L2L propagates only to children with target descendants.
    pub fn should_propagate_l2l(&self, child: &MortonKey) -> bool {
        self.get(child).has_target_descendants
    }

    /// P2P/L2P run only at leaves with target descendants.
    pub fn should_run_direct(&self, leaf: &MortonKey) -> bool {
        self.get(leaf).has_target_descendants
    }

    /// P2P/L2P read only from leaves with source descendants.
    pub fn readable_as_source(&self, leaf: &MortonKey) -> bool {
        self.get(leaf).has_source_descendants
    }
}

/// Builds a [`RoleTable`] bottom-up from leaf role bits. A dataset where
/// every particle is `Role::Both` yields a table that is `true, true`
/// everywhere non-empty — the pruning is then a no-op, matching the
/// equivalence property.
pub fn build_role_table<'a>(
    leaf_containers: impl IntoIterator<Item = (MortonKey, &'a ParticleContainer)>,
) -> RoleTable {
    let mut table = RoleTable::new();
    let mut frontier = Vec::new();

    for (key, container) in leaf_containers {
        let bits = RoleBits::from_container(container);
        table.set(key, bits);
        frontier.push(key);
    }

    // Propagate upward, level by level, until the root.
    while let Some(&deepest) = frontier.iter().max_by_key(|k| k.level()) {
        if deepest.level() == 0 {
            break;
        }
        let level = deepest.level();
        let this_level: Vec<MortonKey> = frontier.iter().copied().filter(|k| k.level() == level).collect();
        frontier.retain(|k| k.level() != level);

        let mut parents: HashMap<MortonKey, Vec<RoleBits>> = HashMap::new();
        for key in this_level {
            let parent = key.parent();
            parents.entry(parent).or_default().push(table.get(&key));
        }
        for (parent, children_bits) in parents {
            let existing = table.get(&parent);
            let aggregated = RoleBits::aggregate(children_bits.into_iter().chain(std::iter::once(existing)));
            table.set(parent, aggregated);
            frontier.push(parent);
        }
    }

    table
}

/// Whether `role` is consistent with a dataset where every particle is
/// both source and target — the case where TSM pruning must be a no-op.
pub fn is_source_and_target(role: Role) -> bool {
    matches!(role, Role::Both)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::particle::Particle;

    fn container_with(role: Role) -> ParticleContainer {
        let mut container = ParticleContainer::new();
        container.push(Particle { position: [0.0; 3], value: 1.0, role }, None);
        container
    }

    #[test]
    fn role_bits_reflect_container_contents() {
        let bits = RoleBits::from_container(&container_with(Role::Source));
        assert!(bits.has_source_descendants);
        assert!(!bits.has_target_descendants);
    }

    #[test]
    fn both_role_table_prunes_nothing() {
        let leaf = MortonKey::from_anchor(&[0, 0, 0]);
        let container = container_with(Role::Both);
        let table = build_role_table([(leaf, &container)]);
        assert!(table.should_run_m2l(&leaf));
        assert!(table.contributes_as_source(&leaf));
        assert!(table.should_run_direct(&leaf));
        assert!(table.readable_as_source(&leaf));
    }

    #[test]
    fn source_only_leaf_is_not_a_direct_target() {
        let leaf = MortonKey::from_anchor(&[0, 0, 0]);
        let container = container_with(Role::Source);
        let table = build_role_table([(leaf, &container)]);
        assert!(!table.should_run_direct(&leaf));
        assert!(table.readable_as_source(&leaf));
    }

    #[test]
    fn aggregate_propagates_upward_via_or() {
        let source_bits = RoleBits { has_source_descendants: true, has_target_descendants: false };
        let target_bits = RoleBits { has_source_descendants: false, has_target_descendants: true };
        let parent = RoleBits::aggregate([source_bits, target_bits]);
        assert!(parent.has_source_descendants);
        assert!(parent.has_target_descendants);
    }
}
