//! Typed failure categories carried inside `anyhow::Error`.
//!
//! Public functions return `anyhow::Result`; callers that need to react to a
//! specific category (the per-line loop in the runtime, the CLI exit path)
//! downcast to [`Dv3Error`].

/// Error categories surfaced by synthesis.
#[derive(Debug, thiserror::Error)]
pub enum Dv3Error {
    /// Missing or malformed configuration. Fatal, reported before model work.
    #[error("config: {0}")]
    Config(String),

    /// Checkpoint not found, unreadable, or incompatible with the model.
    #[error("checkpoint: {0}")]
    Checkpoint(String),

    /// Requested compute device is unavailable.
    #[error("device: {0}")]
    Device(String),

    /// The vocoder produced NaN or infinite samples.
    #[error("reconstruction failed: {non_finite} of {total} samples are not finite")]
    Reconstruction { non_finite: usize, total: usize },

    /// Text could not be mapped to tokens.
    #[error("frontend: {0}")]
    Frontend(String),
}

impl Dv3Error {
    /// Shorthand for a config error wrapped in `anyhow`.
    pub fn config(message: impl Into<String>) -> anyhow::Error {
        Self::Config(message.into()).into()
    }

    /// Shorthand for a checkpoint error wrapped in `anyhow`.
    pub fn checkpoint(message: impl Into<String>) -> anyhow::Error {
        Self::Checkpoint(message.into()).into()
    }
}

/// Return the typed category of an `anyhow` error, if it has one.
pub fn category(err: &anyhow::Error) -> Option<&Dv3Error> {
    err.chain().find_map(|cause| cause.downcast_ref::<Dv3Error>())
}
