//! Incremental detokenization of a growing token sequence.
//!
//! A tokenizer's decode is not concatenative: a trailing byte token may be
//! half of a UTF-8 character, and word markers or merges can change how the
//! tail of the text renders once the next token arrives. The detokenizer
//! therefore decodes a sliding window of the history and only emits text
//! that is settled, holding back the unsettled tail until more tokens (or
//! [`IncrementalDetokenizer::finish`]) resolve it.
//!
//! Offsets into the token history:
//!
//! ```text
//!   tokens: [ ... emitted ... | prefix window | unflushed tail ]
//!                             ^prefix_offset  ^read_offset
//! ```
//!
//! The prefix window is decoded again together with the tail so that the
//! tail renders with the same left context it will have in the full decode.

use std::sync::Arc;

use crate::error::ServeError;
use crate::tokenizer::Tokenizer;

const REPLACEMENT_CHAR: char = '\u{FFFD}';

/// Per-request incremental detokenizer.
///
/// Every `put` returns only text that future tokens cannot revise. The
/// concatenation of all `put` results followed by the `finish` result equals
/// `tokenizer.decode(all_tokens)`.
pub struct IncrementalDetokenizer {
    tokenizer: Arc<dyn Tokenizer>,
    /// Full token history.
    tokens: Vec<u32>,
    /// Start of the context window re-decoded on every `put`.
    prefix_offset: usize,
    /// Tokens before this offset have had their text emitted.
    read_offset: usize,
    finished: bool,
}

impl IncrementalDetokenizer {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self {
            tokenizer,
            tokens: Vec::new(),
            prefix_offset: 0,
            read_offset: 0,
            finished: false,
        }
    }

    /// Append `token_ids` and return the newly settled text.
    ///
    /// Returns an empty string while the tail is still unsettled (for example
    /// a partial UTF-8 sequence). Fails with [`ServeError::StreamClosed`]
    /// after [`finish`](Self::finish).
    pub fn put(&mut self, token_ids: &[u32]) -> Result<String, ServeError> {
        if self.finished {
            return Err(ServeError::StreamClosed("detokenizer"));
        }
        if token_ids.is_empty() {
            return Ok(String::new());
        }
        self.tokens.extend_from_slice(token_ids);

        let prefix_text = self
            .tokenizer
            .decode(&self.tokens[self.prefix_offset..self.read_offset]);
        let full_text = self.tokenizer.decode(&self.tokens[self.prefix_offset..]);

        if full_text.len() <= prefix_text.len() || full_text.ends_with(REPLACEMENT_CHAR) {
            return Ok(String::new());
        }
        // The window rendered the already-emitted prefix differently; wait
        // for more context rather than emit text that contradicts it.
        let Some(delta) = full_text
            .strip_prefix(prefix_text.as_str())
            .map(str::to_string)
        else {
            return Ok(String::new());
        };

        self.prefix_offset = self.read_offset;
        self.read_offset = self.tokens.len();
        Ok(delta)
    }

    /// Flush all withheld text and close the stream.
    ///
    /// Fails with [`ServeError::StreamClosed`] when called a second time.
    pub fn finish(&mut self) -> Result<String, ServeError> {
        if self.finished {
            return Err(ServeError::StreamClosed("detokenizer"));
        }
        self.finished = true;

        if self.read_offset == self.tokens.len() {
            return Ok(String::new());
        }
        let prefix_text = self
            .tokenizer
            .decode(&self.tokens[self.prefix_offset..self.read_offset]);
        let full_text = self.tokenizer.decode(&self.tokens[self.prefix_offset..]);
        self.prefix_offset = self.read_offset;
        self.read_offset = self.tokens.len();

        Ok(match full_text.strip_prefix(prefix_text.as_str()) {
            Some(rest) => rest.to_string(),
            // Keep whatever lies past the common prefix.
            None => {
                let common = common_prefix_len(&prefix_text, &full_text);
                full_text[common..].to_string()
            }
        })
    }

    /// Full token history seen so far.
    pub fn tokens(&self) -> &[u32] {
        &self.tokens
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }
}

/// Byte length of the longest common prefix of `a` and `b`, on a char boundary.
fn common_prefix_len(a: &str, b: &str) -> usize {
    a.char_indices()
        .zip(b.chars())
        .find(|((_, ca), cb)| ca != cb)
        .map(|((i, _), _)| i)
        .unwrap_or_else(|| a.len().min(b.len()))
}
