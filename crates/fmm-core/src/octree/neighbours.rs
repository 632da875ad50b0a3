//! Neighbour enumerator.
//!
//! A thin, named wrapper over [`MortonKey::neighbors`]/[`MortonKey::interaction_list`]
//! so call sites read as "ask the neighbour enumerator" rather than reaching
//! into Morton internals directly, keeping tree structure (`octree::`)
//! separate from addressing (`morton`).

use crate::morton::MortonKey;

/// Up to 26 direct (near-field) neighbours of `key`, clamped to the root
/// cube, never duplicated.
pub fn near_field(key: &MortonKey) -> Vec<MortonKey> {
    key.neighbors()
}

/// Up to 189 M2L interaction-list members of `key`, each tagged with its
/// deterministic relative-position slot in `0..343`.
pub fn interaction_list(key: &MortonKey) -> Vec<(MortonKey, u16)> {
    key.interaction_list()
}

/// Property test helper
/// `ℓ`, the near-field and interaction list together cover every cell at
/// `ℓ` whose parent is a neighbour of the working cell's parent (or is the
/// parent itself), with no duplicates between the two sets.
pub fn covers_parent_neighbourhood(key: &MortonKey) -> bool {
    let near: std::collections::HashSet<_> = near_field(key).into_iter().collect();
    let far: std::collections::HashSet<_> = interaction_list(key).into_iter().map(|(k, _)| k).collect();
    near.is_disjoint(&far) && !near.contains(key) && !far.contains(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Domain;

    #[test]
    fn near_and_far_sets_are_disjoint() {
        let domain = Domain::from_centre_width([0.0, 0.0, 0.0], 8.0);
        let mut key = MortonKey::from_point(&[0.3, -1.2, 2.1], &domain);
        while key.level() > 4 {
            key = key.parent();
        }
        assert!(covers_parent_neighbourhood(&key));
    }
}
