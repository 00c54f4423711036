//! Text front-end: raw text to symbol ids.
//!
//! The model only sees [`TokenSequence`]s; how text becomes symbols is behind
//! the [`TextFrontend`] trait.

pub mod english;
pub mod symbols;

use anyhow::Result;
use rand_chacha::ChaCha8Rng;

/// Immutable, non-empty sequence of symbol ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenSequence {
    ids: Vec<i64>,
}

impl TokenSequence {
    /// Wrap ids; `None` when empty.
    pub fn new(ids: Vec<i64>) -> Option<Self> {
        if ids.is_empty() {
            None
        } else {
            Some(Self { ids })
        }
    }

    pub fn ids(&self) -> &[i64] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

/// Maps raw text to tokens.
pub trait TextFrontend {
    /// Encode one utterance. `rng` drives any stochastic substitution.
    fn encode(&self, text: &str, rng: &mut ChaCha8Rng) -> Result<TokenSequence>;
}

pub use english::{CmuDict, EnglishFrontend};
