//! Octree storage: pointer form, grouped form, and the neighbour
//! enumerator.

pub mod grouped;
pub mod neighbours;
pub mod pointer;

pub use grouped::{CellGroup, GroupHeader, GroupedOctree, ParticleGroup};
pub use pointer::{Cell, Cursor, Leaf, PointerOctree};
