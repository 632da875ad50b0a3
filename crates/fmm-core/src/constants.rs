//! Crate wide constants.
use crate::types::KeyType;

/// Deepest level an octree can be built to. Bounded by the 48 bits of
/// interleaved coordinate available in a `MortonKey`. `morton::LEVEL_SIZE`
/// and `morton::ROOT` are derived from this value.
pub const DEEPEST_LEVEL: KeyType = 16;

/// Default maximum number of particles per leaf before a block is split
/// further during distributed blocktree refinement.
pub const NCRIT: usize = 150;

/// Default oversampling factor for the parallel (hyksort) sample sort.
pub const HYKSORT_K: i32 = 2;

/// Default maximum number of cells per group in the grouped octree.
pub const DEFAULT_GROUP_SIZE: usize = 256;

/// Distributed wire-protocol tag reserved for the P2P ghost exchange,
/// per the distributed wire protocol.
pub const TAG_P2P: i32 = 99;

/// Base tag for the per-level upward (M2M) ghost exchange. The level is
/// added to this base to produce `TAG_UPWARD(level)`.
pub const TAG_UPWARD_BASE: i32 = 1_000;

/// Base tag for the per-level M2L ghost exchange.
pub const TAG_M2L_BASE: i32 = 2_000;

/// Base tag for the per-level downward (L2L) ghost exchange.
pub const TAG_DOWNWARD_BASE: i32 = 3_000;
