//! Per-request text streaming: token ids in, settled and stop-truncated text out.
//!
//! - [`IncrementalDetokenizer`]: token deltas → text deltas that later tokens
//!   cannot revise.
//! - [`StopStringMatcher`]: text deltas → text truncated at the first stop
//!   string occurrence.

pub mod detokenizer;
pub mod stop;

pub use detokenizer::IncrementalDetokenizer;
pub use stop::StopStringMatcher;
