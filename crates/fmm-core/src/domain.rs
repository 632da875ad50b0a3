//! The bounding cube of the simulation domain.

use memoffset::offset_of;
use mpi::{
    datatype::{Equivalence, UncommittedUserDatatype, UserDatatype},
    Address,
};

use crate::types::PointType;

/// An axis-aligned bounding cube, described by its origin (lower corner)
/// and diameter along each axis. A centre + width cube and an origin +
/// diameter pair are equivalent; the latter avoids recomputing the lower
/// corner from the centre on every Morton encode.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Domain {
    pub origin: [PointType; 3],
    pub diameter: [PointType; 3],
}

impl Domain {
    /// Build a domain from a centre point and a uniform width, matching
    /// the centre/width framing.
    pub fn from_centre_width(centre: [PointType; 3], width: PointType) -> Self {
        let half = width / 2.0;
        Domain {
            origin: [centre[0] - half, centre[1] - half, centre[2] - half],
            diameter: [width, width, width],
        }
    }

    /// Smallest cube enclosing all of `points`, padded by a small relative
    /// margin so that points exactly on the upper boundary still map to a
    /// valid anchor.
    pub fn from_points(points: &[[PointType; 3]]) -> Self {
        let mut min = [f64::INFINITY; 3];
        let mut max = [f64::NEG_INFINITY; 3];

        for p in points {
            for dim in 0..3 {
                min[dim] = min[dim].min(p[dim]);
                max[dim] = max[dim].max(p[dim]);
            }
        }

        let mut diameter = 0.0f64;
        for dim in 0..3 {
            diameter = diameter.max(max[dim] - min[dim]);
        }
        // Guard against a degenerate (single point, or co-planar) point set.
        let diameter = if diameter <= 0.0 { 1.0 } else { diameter * 1.00001 };

        Domain {
            origin: min,
            diameter: [diameter, diameter, diameter],
        }
    }
}

unsafe impl Equivalence for Domain {
    type Out = UserDatatype;
    fn equivalent_datatype() -> Self::Out {
        UserDatatype::structured(
            &[1, 1],
            &[
                offset_of!(Domain, origin) as Address,
                offset_of!(Domain, diameter) as Address,
            ],
            &[
                UncommittedUserDatatype::contiguous(3, &PointType::equivalent_datatype()).as_ref(),
                UncommittedUserDatatype::contiguous(3, &PointType::equivalent_datatype()).as_ref(),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_centre_width_round_trips() {
        let domain = Domain::from_centre_width([0.0, 0.0, 0.0], 8.0);
        assert_eq!(domain.origin, [-4.0, -4.0, -4.0]);
        assert_eq!(domain.diameter, [8.0, 8.0, 8.0]);
    }

    #[test]
    fn from_points_covers_all_points() {
        let points = vec![[-3.75, 0.25, 0.25], [3.75, 0.25, 0.25]];
        let domain = Domain::from_points(&points);
        for p in &points {
            for dim in 0..3 {
                assert!(p[dim] >= domain.origin[dim]);
                assert!(p[dim] <= domain.origin[dim] + domain.diameter[dim]);
            }
        }
    }
}
