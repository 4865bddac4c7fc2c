//! Vocabulary-list tokenizer for SentencePiece-style vocabularies.
//!
//! Tokens are plain strings indexed by id. Word boundaries are marked with
//! `\u{2581}` (LOWER ONE EIGHTH BLOCK) and raw bytes are carried by `<0xNN>`
//! tokens. Encoding is greedy longest-match with byte fallback. Decoding
//! assembles bytes first and converts to UTF-8 lossily, so a multi-byte
//! character split across tokens decodes to U+FFFD until all of its bytes
//! are present.

use std::collections::HashMap;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use super::Tokenizer;
use crate::error::ServeError;

/// The SentencePiece word-boundary marker character.
const SPIECE_UNDERLINE: char = '\u{2581}';

/// On-disk vocabulary format.
///
/// ```json
/// { "tokens": ["<pad>", "<bos>", "<eos>", "▁hello"], "bos_token_id": 1, "eos_token_id": 2 }
/// ```
#[derive(Debug, Deserialize)]
struct VocabFile {
    tokens: Vec<String>,
    #[serde(default)]
    bos_token_id: Option<u32>,
    #[serde(default)]
    eos_token_id: Option<u32>,
    #[serde(default)]
    pad_token_id: Option<u32>,
    #[serde(default)]
    add_bos: bool,
}

pub struct VocabTokenizer {
    /// Token string -> token ID (byte tokens excluded).
    token_to_id: HashMap<String, u32>,
    /// Token ID -> token string.
    id_to_token: Vec<String>,
    /// Byte value -> `<0xNN>` token ID.
    byte_tokens: [Option<u32>; 256],
    /// Longest token, in chars. Bounds the greedy match window.
    max_token_chars: usize,
    bos_id: Option<u32>,
    eos_id: Option<u32>,
    pad_id: Option<u32>,
    /// Whether to prepend BOS when encoding with special tokens.
    add_bos: bool,
}

impl VocabTokenizer {
    pub fn new(
        tokens: Vec<String>,
        bos_id: Option<u32>,
        eos_id: Option<u32>,
        pad_id: Option<u32>,
        add_bos: bool,
    ) -> Self {
        let mut token_to_id = HashMap::with_capacity(tokens.len());
        let mut byte_tokens = [None; 256];
        let mut max_token_chars = 1;

        for (i, tok) in tokens.iter().enumerate() {
            let id = i as u32;
            if let Some(byte) = parse_byte_token(tok) {
                byte_tokens[byte as usize] = Some(id);
                continue;
            }
            if Some(id) == bos_id || Some(id) == eos_id || Some(id) == pad_id {
                continue;
            }
            max_token_chars = max_token_chars.max(tok.chars().count());
            token_to_id.entry(tok.clone()).or_insert(id);
        }

        debug!(
            vocab_size = tokens.len(),
            byte_tokens = byte_tokens.iter().filter(|b| b.is_some()).count(),
            max_token_chars,
            "Vocab tokenizer initialized"
        );

        Self {
            token_to_id,
            id_to_token: tokens,
            byte_tokens,
            max_token_chars,
            bos_id,
            eos_id,
            pad_id,
            add_bos,
        }
    }

    /// Load a tokenizer from a JSON vocabulary file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServeError> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading vocabulary");
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(json: &str) -> Result<Self, ServeError> {
        let file: VocabFile = serde_json::from_str(json)?;
        let vocab_size = file.tokens.len();
        for (name, id) in [
            ("bos_token_id", file.bos_token_id),
            ("eos_token_id", file.eos_token_id),
            ("pad_token_id", file.pad_token_id),
        ] {
            if let Some(id) = id {
                if id as usize >= vocab_size {
                    return Err(ServeError::Tokenizer(format!(
                        "{} {} is outside the vocabulary (size {})",
                        name, id, vocab_size
                    )));
                }
            }
        }
        Ok(Self::new(
            file.tokens,
            file.bos_token_id,
            file.eos_token_id,
            file.pad_token_id,
            file.add_bos,
        ))
    }

    fn is_special(&self, id: u32) -> bool {
        Some(id) == self.bos_id || Some(id) == self.eos_id || Some(id) == self.pad_id
    }

    fn byte_fallback(&self, ch: char, output: &mut Vec<u32>) {
        let mut buf = [0u8; 4];
        for &byte in ch.encode_utf8(&mut buf).as_bytes() {
            match self.byte_tokens[byte as usize] {
                Some(id) => output.push(id),
                None => debug!(byte, "No byte token, dropping"),
            }
        }
    }

    /// Small vocabulary shared by unit tests across the crate.
    ///
    /// Ids: 0 `<pad>`, 1 `<bos>`, 2 `<eos>`, 3 `▁`, 4..=10 single letters
    /// `h e l o w r d`, 11 `▁hello`, 12 `▁world`, 13 `!`, 14 `.`,
    /// 15 `▁Hello`, 16 `▁World`, 17 `He`, 18 `llo`, then `<0x00>`..`<0xFF>`
    /// at `19 + byte`.
    #[cfg(test)]
    pub(crate) fn for_testing() -> Self {
        let mut tokens: Vec<String> = [
            "<pad>", "<bos>", "<eos>", "\u{2581}", "h", "e", "l", "o", "w", "r", "d",
            "\u{2581}hello", "\u{2581}world", "!", ".", "\u{2581}Hello", "\u{2581}World",
            "He", "llo",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        tokens.extend((0..=255u8).map(|b| format!("<0x{:02X}>", b)));
        Self::new(tokens, Some(1), Some(2), Some(0), false)
    }
}

impl Tokenizer for VocabTokenizer {
    fn encode(&self, text: &str, add_special_tokens: bool) -> Vec<u32> {
        let mut output = Vec::new();

        if add_special_tokens && self.add_bos {
            if let Some(bos) = self.bos_id {
                output.push(bos);
            }
        }
        if text.is_empty() {
            return output;
        }

        let normalized: String = std::iter::once(SPIECE_UNDERLINE)
            .chain(text.chars().map(|c| if c == ' ' { SPIECE_UNDERLINE } else { c }))
            .collect();

        // Byte offset of every char boundary, including the end.
        let mut bounds: Vec<usize> = normalized.char_indices().map(|(i, _)| i).collect();
        bounds.push(normalized.len());
        let num_chars = bounds.len() - 1;

        let mut i = 0;
        while i < num_chars {
            let longest = (i + self.max_token_chars).min(num_chars);
            let matched = (i + 1..=longest).rev().find_map(|j| {
                self.token_to_id
                    .get(&normalized[bounds[i]..bounds[j]])
                    .map(|&id| (id, j))
            });
            match matched {
                Some((id, j)) => {
                    output.push(id);
                    i = j;
                }
                None => {
                    if let Some(ch) = normalized[bounds[i]..].chars().next() {
                        self.byte_fallback(ch, &mut output);
                    }
                    i += 1;
                }
            }
        }

        output
    }

    fn decode(&self, ids: &[u32]) -> String {
        let mut bytes = Vec::new();
        for &id in ids {
            if self.is_special(id) {
                continue;
            }
            let Some(token) = self.id_to_token.get(id as usize) else {
                continue;
            };
            match parse_byte_token(token) {
                Some(byte) => bytes.push(byte),
                None => bytes.extend_from_slice(token.as_bytes()),
            }
        }
        let text = String::from_utf8_lossy(&bytes).replace(SPIECE_UNDERLINE, " ");
        // Strip leading space that comes from the initial underline.
        match text.strip_prefix(' ') {
            Some(rest) => rest.to_string(),
            None => text,
        }
    }

    fn vocab_size(&self) -> usize {
        self.id_to_token.len()
    }

    fn bos_token_id(&self) -> Option<u32> {
        self.bos_id
    }

    fn eos_token_id(&self) -> Option<u32> {
        self.eos_id
    }

    fn pad_token_id(&self) -> Option<u32> {
        self.pad_id
    }
}

/// Parse a `<0xNN>` byte token.
fn parse_byte_token(token: &str) -> Option<u8> {
    let hex = token.strip_prefix("<0x")?.strip_suffix('>')?;
    if hex.len() != 2 {
        return None;
    }
    u8::from_str_radix(hex, 16).ok()
}
