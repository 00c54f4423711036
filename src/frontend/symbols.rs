//! Symbol inventory shared by the text front-end and the embedding table.
//!
//! The order is part of the checkpoint contract: id `i` selects row `i` of the
//! text embedding.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Padding symbol (id 0).
pub const PAD: &str = "_";
/// End-of-sequence symbol (id 1), appended to every utterance.
pub const EOS: &str = "~";

const CHARACTERS: &str = "ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz!'(),-.:;? ";

/// CMUdict phoneme set (with stress markers).
pub const ARPABET: &[&str] = &[
    "AA", "AA0", "AA1", "AA2", "AE", "AE0", "AE1", "AE2", "AH", "AH0", "AH1", "AH2", "AO",
    "AO0", "AO1", "AO2", "AW", "AW0", "AW1", "AW2", "AY", "AY0", "AY1", "AY2", "B", "CH", "D",
    "DH", "EH", "EH0", "EH1", "EH2", "ER", "ER0", "ER1", "ER2", "EY", "EY0", "EY1", "EY2", "F",
    "G", "HH", "IH", "IH0", "IH1", "IH2", "IY", "IY0", "IY1", "IY2", "JH", "K", "L", "M", "N",
    "NG", "OW", "OW0", "OW1", "OW2", "OY", "OY0", "OY1", "OY2", "P", "R", "S", "SH", "T", "TH",
    "UH", "UH0", "UH1", "UH2", "UW", "UW0", "UW1", "UW2", "V", "W", "Y", "Z", "ZH",
];

/// Phoneme symbols are prefixed so they never collide with characters.
const PHONEME_PREFIX: char = '@';

struct SymbolTable {
    symbols: Vec<String>,
    ids: HashMap<String, usize>,
}

fn table() -> &'static SymbolTable {
    static TABLE: OnceLock<SymbolTable> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut symbols = vec![PAD.to_string(), EOS.to_string()];
        symbols.extend(CHARACTERS.chars().map(String::from));
        symbols.extend(ARPABET.iter().map(|p| format!("{PHONEME_PREFIX}{p}")));
        let ids = symbols
            .iter()
            .enumerate()
            .map(|(id, s)| (s.clone(), id))
            .collect();
        SymbolTable { symbols, ids }
    })
}

/// Total number of symbols (rows of the text embedding).
pub fn vocab_size() -> usize {
    table().symbols.len()
}

/// Id of the end-of-sequence symbol.
pub fn eos_id() -> usize {
    table().ids[EOS]
}

/// Id of a character symbol. Padding and EOS are never produced from text.
pub fn char_id(c: char) -> Option<usize> {
    if c == '_' || c == '~' {
        return None;
    }
    let mut buf = [0u8; 4];
    table().ids.get(c.encode_utf8(&mut buf) as &str).copied()
}

/// Id of an ARPAbet phoneme such as `AH0`.
pub fn phoneme_id(phoneme: &str) -> Option<usize> {
    table()
        .ids
        .get(&format!("{PHONEME_PREFIX}{phoneme}"))
        .copied()
}

/// Printable symbol for an id.
pub fn symbol(id: usize) -> Option<&'static str> {
    table().symbols.get(id).map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_pad_eos_chars_phonemes() {
        assert_eq!(symbol(0), Some(PAD));
        assert_eq!(eos_id(), 1);
        assert_eq!(char_id('A'), Some(2));
        assert_eq!(
            vocab_size(),
            2 + CHARACTERS.chars().count() + ARPABET.len()
        );
        assert_eq!(phoneme_id("AA"), Some(2 + CHARACTERS.chars().count()));
    }

    #[test]
    fn reserved_and_unknown_chars_have_no_id() {
        assert_eq!(char_id('_'), None);
        assert_eq!(char_id('~'), None);
        assert_eq!(char_id('#'), None);
        assert_eq!(phoneme_id("XX1"), None);
        assert_eq!(symbol(phoneme_id("ZH").unwrap()), Some("@ZH"));
    }
}
