//! Scalar type aliases shared across the crate.

/// Coordinate / physical-value scalar type.
pub type PointType = f64;

/// Morton index / integer-coordinate scalar type.
pub type KeyType = u64;
