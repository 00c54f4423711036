//! Incremental-state plumbing shared by layers that decode one frame at a time.

use burn::tensor::backend::Backend;

/// A layer that can run frame by frame while carrying its own history.
pub trait StreamingModule<B: Backend> {
    /// Per-utterance state (history buffers, attention focus, ...).
    type State;

    /// Fresh state for a new utterance.
    fn init_state(&self, device: &B::Device) -> Self::State;
}
