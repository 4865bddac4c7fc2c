//! Batch text generation on top of a step-driven token generation engine.
//!
//! The engine reports progress only as stream events of new token ids per
//! request. [`ServeEngine`] turns that stream into final per-prompt text:
//! incremental detokenization, stop-string truncation, and scoped use of the
//! engine's single stream callback slot.

pub mod cli;
pub mod engine;
pub mod error;
pub mod streamer;
pub mod tokenizer;

pub use engine::{GenerationConfig, GenerationEngine, ReplayEngine, ServeEngine};
pub use error::ServeError;
pub use tokenizer::{Tokenizer, VocabTokenizer};
