//! The `Kernel` capability.
//!
//! The core never inspects expansion internals — `MultipoleExpansion` and
//! `LocalExpansion` are opaque, kernel-owned blobs threaded through by
//! value. Concrete kernels (Chebyshev, spherical harmonics, uniform grid)
//! live outside this crate; `fmm-kernels-reference` supplies a `1/r`
//! point-mass kernel for tests, demos and benches only.

use crate::morton::MortonKey;
use crate::particle::ParticleContainer;

/// Opaque per-cell far-field representation. Kernels are free to give this
/// any internal shape; the engine only ever moves it by value or takes a
/// `&mut` reference while invoking an operator.
#[derive(Debug, Clone, Default)]
pub struct MultipoleExpansion(pub Vec<f64>);

/// Opaque per-cell local (near-source) representation.
#[derive(Debug, Clone, Default)]
pub struct LocalExpansion(pub Vec<f64>);

/// The multipole/local pair plus addressing carried by every cell,
/// Kept separate from the tree's own `Cell` so that a
/// kernel workspace can be swapped without touching tree topology.
#[derive(Debug, Clone, Default)]
pub struct CellExpansion {
    pub multipole: MultipoleExpansion,
    pub local: LocalExpansion,
}

/// One interaction-list or near-field neighbour as seen by a kernel
/// operator: the neighbour's own expansion/container plus its
/// relative-position slot.
pub struct RelativeCell<'a> {
    pub key: MortonKey,
    pub slot: u16,
    pub expansion: &'a CellExpansion,
}

/// The six FMM operators plus near-field direct interaction
/// Operators are reentrant and never allocate the buffers they
/// write to — `CellExpansion`/`ParticleContainer` accumulators are
/// preallocated by the caller. The engine clones one kernel instance per
/// worker via [`Clone`].
pub trait Kernel: Clone + Send + Sync {
    /// One-time per-worker setup (e.g. precomputed translation operators).
    /// Called once per cloned instance before any pass.
    fn init(&mut self) {}

    /// Compute a leaf's initial multipole from its source particles.
    fn p2m(&self, leaf: &mut CellExpansion, sources: &ParticleContainer);

    /// Aggregate the multipoles of up to 8 existing children into the
    /// parent's multipole. Absent children are simply missing from `children`.
    fn m2m(&self, parent: &mut CellExpansion, children: &[(&CellExpansion, usize)], level: u64);

    /// Translate every interaction-list source multipole into contributions
    /// accumulated onto `target`'s local expansion.
    fn m2l(&self, target: &mut CellExpansion, interaction_list: &[RelativeCell], level: u64);

    /// Propagate a parent's local expansion down onto up to 8 children.
    fn l2l(&self, parent: &CellExpansion, children: &mut [(&mut CellExpansion, usize)], level: u64);

    /// Evaluate a leaf's local expansion at each of its target particle
    /// positions, accumulating force/potential.
    fn l2p(&self, leaf: &CellExpansion, targets: &mut ParticleContainer);

    /// Direct near-field interaction between a target container and one
    /// neighbour's source container. `mutual` requests the Newton's-third-law
    /// form: both `targets` and `sources` receive contributions from a
    /// single pass over the pair (valid only when the caller guarantees the
    /// pair is visited exactly once).
    fn p2p(&self, targets: &mut ParticleContainer, sources: &mut ParticleContainer, mutual: bool);

    /// Self-interaction form of P2P within a single leaf's particle set.
    fn p2p_self(&self, container: &mut ParticleContainer);

    /// Whether this kernel supports a non-mutating remote P2P variant,
    /// required by the distributed engine's ghost exchange (it may not
    /// write back into a neighbour's remote container).
    fn supports_p2p_remote(&self) -> bool {
        false
    }

    /// Non-mutating P2P: accumulate `sources`' contribution onto `targets`
    /// only. Must be implemented when [`Kernel::supports_p2p_remote`]
    /// returns `true`.
    fn p2p_remote(&self, targets: &mut ParticleContainer, sources: &ParticleContainer) {
        let _ = (targets, sources);
        unimplemented!("p2p_remote called on a kernel that does not support it");
    }
}
