//! English grapheme front-end with probabilistic dictionary pronunciations.

use super::symbols::{char_id, eos_id, phoneme_id};
use super::{TextFrontend, TokenSequence};
use crate::error::Dv3Error;
use anyhow::{Context, Result};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Word → phonemes map parsed from a CMUdict-format file.
#[derive(Debug, Default, Clone)]
pub struct CmuDict {
    entries: HashMap<String, Vec<String>>,
}

impl CmuDict {
    /// Load a dictionary from disk.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("read pronunciation dictionary {}", path.display()))?;
        Ok(Self::parse(&text))
    }

    /// Parse dictionary text. Alternate pronunciations (`WORD(1)`) and entries
    /// with unknown phonemes are skipped; the first pronunciation wins.
    pub fn parse(text: &str) -> Self {
        let mut entries = HashMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with(";;;") {
                continue;
            }
            let mut parts = line.split_whitespace();
            let Some(word) = parts.next() else {
                continue;
            };
            if word.ends_with(')') {
                continue;
            }
            let phonemes: Vec<String> = parts.map(str::to_string).collect();
            if phonemes.is_empty() || phonemes.iter().any(|p| phoneme_id(p).is_none()) {
                continue;
            }
            entries
                .entry(word.to_lowercase())
                .or_insert(phonemes);
        }
        Self { entries }
    }

    /// Pronunciation of a lowercase word.
    pub fn lookup(&self, word: &str) -> Option<&[String]> {
        self.entries.get(word).map(Vec::as_slice)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Character-level English front-end.
///
/// Each dictionary word is replaced by its phonemes with probability
/// `replace_prob`; everything else is spelled out character by character.
#[derive(Debug, Clone)]
pub struct EnglishFrontend {
    dict: Option<CmuDict>,
    replace_prob: f32,
}

impl EnglishFrontend {
    pub fn new(dict: Option<CmuDict>, replace_prob: f32) -> Self {
        Self {
            dict,
            replace_prob: replace_prob.clamp(0.0, 1.0),
        }
    }

    /// Normalize raw text: drop non-ASCII, lowercase, collapse whitespace.
    pub fn clean(text: &str) -> String {
        let ascii: String = text
            .chars()
            .filter(char::is_ascii)
            .map(|c| c.to_ascii_lowercase())
            .collect();
        ascii.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn push_word(&self, word: &str, ids: &mut Vec<i64>, rng: &mut ChaCha8Rng) {
        if let Some(phonemes) = self.dict.as_ref().and_then(|d| d.lookup(word)) {
            // Draw only for dictionary words so the stream of draws depends on the text alone.
            if self.replace_prob > 0.0 && rng.random::<f32>() < self.replace_prob {
                ids.extend(phonemes.iter().filter_map(|p| phoneme_id(p)).map(|id| id as i64));
                return;
            }
        }
        ids.extend(word.chars().filter_map(char_id).map(|id| id as i64));
    }
}

impl TextFrontend for EnglishFrontend {
    fn encode(&self, text: &str, rng: &mut ChaCha8Rng) -> Result<TokenSequence> {
        let cleaned = Self::clean(text);
        let mut ids = Vec::with_capacity(cleaned.len() + 1);
        let mut word = String::new();
        for c in cleaned.chars() {
            if c.is_ascii_alphabetic() || (c == '\'' && !word.is_empty()) {
                word.push(c);
                continue;
            }
            if !word.is_empty() {
                self.push_word(&word, &mut ids, rng);
                word.clear();
            }
            if let Some(id) = char_id(c) {
                ids.push(id as i64);
            }
        }
        if !word.is_empty() {
            self.push_word(&word, &mut ids, rng);
        }
        ids.push(eos_id() as i64);
        TokenSequence::new(ids).ok_or_else(|| Dv3Error::Frontend("empty token sequence".into()).into())
    }
}
