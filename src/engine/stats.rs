//! Engine runtime statistics.

use serde::{Deserialize, Serialize};

use crate::error::ServeError;

/// Fixed-schema statistics report of a generation engine.
///
/// Latencies are seconds per token, times are seconds.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EngineStats {
    /// Average latency of processing one token in prefill.
    pub single_token_prefill_latency: f64,
    /// Average latency of processing one token in decode.
    pub single_token_decode_latency: f64,
    pub engine_total_prefill_time: f64,
    pub engine_total_decode_time: f64,
    pub total_prefill_tokens: u64,
    pub total_decode_tokens: u64,
}

impl EngineStats {
    pub fn from_json(json: &str) -> Result<Self, ServeError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_json(&self) -> Result<String, ServeError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode throughput in tokens per second, 0 when nothing was decoded.
    pub fn decode_tokens_per_sec(&self) -> f64 {
        if self.engine_total_decode_time > 0.0 {
            self.total_decode_tokens as f64 / self.engine_total_decode_time
        } else {
            0.0
        }
    }
}
