//! `fmm-core`: an adaptive-octree Fast Multipole Method engine, kernel-agnostic
//! and backend-agnostic by construction.
//!
//! The crate is organized by component: Morton addressing, particle
//! storage, the two octree representations and their shared neighbour
//! enumerator, the `Kernel` capability, the four execution engines, and
//! the Target-Source Model role wrapper. `partition` and `io` sit outside
//! that grouping: they are the ambient glue (distributed construction,
//! timing-record I/O) every engine needs but no single component owns.
//!
//! Concrete kernels, particle sources and file formats are deliberately
//! out of scope here — see `fmm-kernels-reference` for a minimal `1/r`
//! point-mass kernel used in tests, demos and benches.

pub mod constants;
pub mod domain;
pub mod engine;
pub mod error;
pub mod interaction;
pub mod io;
pub mod kernel;
pub mod morton;
pub mod octree;
pub mod particle;
pub mod particle_source;
pub mod partition;
pub mod tsm;
pub mod types;

pub use domain::Domain;
pub use error::{FmmError, FmmResult};
pub use kernel::{CellExpansion, Kernel, LocalExpansion, MultipoleExpansion, RelativeCell};
pub use morton::MortonKey;
pub use particle::{Particle, ParticleContainer, Role};
pub use particle_source::{InMemoryParticleSource, ParticleSource};
