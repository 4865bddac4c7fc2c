//! Tokenizer trait and the vocabulary-list tokenizer used by the serving layer.
//!
//! The serving core only ever decodes: prompts go to the engine as text or
//! token ids, and generated token ids come back to be turned into text by the
//! [`IncrementalDetokenizer`](crate::streamer::IncrementalDetokenizer).

pub mod vocab;

pub use vocab::VocabTokenizer;

/// A tokenizer that converts text to token IDs and back.
///
/// All implementations must be thread-safe (`Send + Sync`) so one instance
/// can be shared by every request of a batch.
pub trait Tokenizer: Send + Sync {
    /// Encode text into a sequence of token IDs.
    ///
    /// When `add_special_tokens` is true, implementation-specific special tokens
    /// are added (e.g. BOS).
    fn encode(&self, text: &str, add_special_tokens: bool) -> Vec<u32>;

    /// Decode a sequence of token IDs back into text.
    ///
    /// Decoding is not required to be concatenative: the text for
    /// `a ++ b` may differ from `decode(a) ++ decode(b)` near the seam.
    fn decode(&self, ids: &[u32]) -> String;

    /// Return the total vocabulary size.
    fn vocab_size(&self) -> usize;

    /// Beginning-of-sequence token ID, if applicable.
    fn bos_token_id(&self) -> Option<u32>;

    /// End-of-sequence token ID, if applicable.
    fn eos_token_id(&self) -> Option<u32>;

    /// Padding token ID, if applicable.
    fn pad_token_id(&self) -> Option<u32>;
}
