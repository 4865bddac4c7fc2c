//! A deterministic, script-driven [`GenerationEngine`].
//!
//! Each call to [`step`](GenerationEngine::step) consumes one scripted step
//! and hands its deliveries to the installed callback, after applying the
//! bookkeeping a real engine does: stop tokens, stop strings, length
//! limits, aborts, and dropping output for requests it has already finished.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ServeError;
use crate::streamer::{IncrementalDetokenizer, StopStringMatcher};
use crate::tokenizer::Tokenizer;

use super::callback::{GenerationEngine, RequestStreamCallback};
use super::config::EngineConfig;
use super::request::{FinishReason, Prompt, Request, RequestStreamOutput};
use super::stats::EngineStats;

/// One engine step: zero or more callback deliveries, in order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayStep {
    #[serde(default)]
    pub deliveries: Vec<Vec<RequestStreamOutput>>,
}

impl ReplayStep {
    pub fn new(deliveries: Vec<Vec<RequestStreamOutput>>) -> Self {
        Self { deliveries }
    }

    /// A step with a single delivery.
    pub fn single(outputs: Vec<RequestStreamOutput>) -> Self {
        Self {
            deliveries: vec![outputs],
        }
    }
}

/// The full event schedule of a replay run.
///
/// ```json
/// {"steps": [{"deliveries": [[{"request_id": "0", "delta": [15]}]]}]}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReplayScript {
    #[serde(default)]
    pub steps: Vec<ReplayStep>,
}

impl ReplayScript {
    pub fn new(steps: Vec<ReplayStep>) -> Self {
        Self { steps }
    }

    pub fn from_json(json: &str) -> Result<Self, ServeError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServeError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

/// Engine-side view of one live request.
struct ActiveRequest {
    prompt_tokens: usize,
    max_tokens: usize,
    generated: usize,
    prefilled: bool,
    /// Configured stop token ids, plus EOS unless `ignore_eos` is set.
    stop_token_ids: Vec<u32>,
    /// Decoded-text stop string check. Needs a tokenizer.
    stop_strs: Option<(IncrementalDetokenizer, StopStringMatcher)>,
}

impl ActiveRequest {
    /// Whether `token_ids` completes one of the request's stop strings.
    fn completes_stop_str(&mut self, token_ids: &[u32]) -> bool {
        let Some((detokenizer, matcher)) = &mut self.stop_strs else {
            return false;
        };
        if let Ok(text) = detokenizer.put(token_ids) {
            matcher.put(&text);
        }
        matcher.triggered()
    }
}

pub struct ReplayEngine {
    config: EngineConfig,
    tokenizer: Option<Arc<dyn Tokenizer>>,
    script: VecDeque<ReplayStep>,
    callback: Option<RequestStreamCallback>,
    active: HashMap<String, ActiveRequest>,
    closed: HashSet<String>,
    pending_aborts: Vec<String>,
    submitted: Vec<Request>,
    num_steps: usize,
    total_prefill_tokens: u64,
    total_decode_tokens: u64,
    prefill_time: Duration,
    decode_time: Duration,
}

impl ReplayEngine {
    pub fn new(config: EngineConfig, script: ReplayScript) -> Self {
        Self {
            config,
            tokenizer: None,
            script: script.steps.into(),
            callback: None,
            active: HashMap::new(),
            closed: HashSet::new(),
            pending_aborts: Vec::new(),
            submitted: Vec::new(),
            num_steps: 0,
            total_prefill_tokens: 0,
            total_decode_tokens: 0,
            prefill_time: Duration::ZERO,
            decode_time: Duration::ZERO,
        }
    }

    /// Tokenizer used to size text prompts against the sequence length limit,
    /// to find EOS, and to match stop strings in generated text.
    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = Some(tokenizer);
        self
    }

    /// Every request accepted by `add_request`, in submission order.
    pub fn submitted(&self) -> &[Request] {
        &self.submitted
    }

    pub fn num_steps(&self) -> usize {
        self.num_steps
    }

    pub fn num_active(&self) -> usize {
        self.active.len()
    }

    fn prompt_len(&self, prompt: &Prompt) -> usize {
        match (prompt, &self.tokenizer) {
            (Prompt::Tokens(ids), _) => ids.len(),
            (Prompt::Text(text), Some(tokenizer)) => tokenizer.encode(text, true).len(),
            (Prompt::Text(_), None) => 0,
        }
    }

    fn close(&mut self, request_id: &str) {
        self.active.remove(request_id);
        self.closed.insert(request_id.to_string());
    }

    /// Apply engine bookkeeping to one scripted event.
    ///
    /// Returns `None` when the event must not reach the callback. Events for
    /// ids the engine never saw pass through untouched.
    fn admit(
        &mut self,
        mut output: RequestStreamOutput,
        prefill: &mut bool,
    ) -> Option<RequestStreamOutput> {
        if self.closed.contains(&output.request_id) {
            debug!(request_id = %output.request_id, "Dropping event for closed request");
            return None;
        }
        let Some(request) = self.active.get_mut(&output.request_id) else {
            return Some(output);
        };

        if !request.prefilled {
            request.prefilled = true;
            self.total_prefill_tokens += request.prompt_tokens as u64;
            *prefill = true;
        }

        // A stop token ends the request and is kept in the output.
        let token_ids = &mut output.delta.token_ids;
        if let Some(pos) = token_ids
            .iter()
            .position(|id| request.stop_token_ids.contains(id))
        {
            token_ids.truncate(pos + 1);
            output.finish_reason = Some(FinishReason::Stop);
        }

        let remaining = request.max_tokens.saturating_sub(request.generated);
        if token_ids.len() >= remaining {
            let truncated = token_ids.len() > remaining;
            token_ids.truncate(remaining);
            if truncated || output.finish_reason.is_none() {
                output.finish_reason = Some(FinishReason::Length);
            }
        }

        if request.completes_stop_str(token_ids) {
            output.finish_reason = Some(FinishReason::Stop);
        }
        request.generated += output.delta.token_ids.len();
        self.total_decode_tokens += output.delta.token_ids.len() as u64;

        if output.finish_reason.is_some() {
            let request_id = output.request_id.clone();
            self.close(&request_id);
        }
        Some(output)
    }
}

impl GenerationEngine for ReplayEngine {
    fn add_request(&mut self, request: Request) -> Result<(), ServeError> {
        if self.active.contains_key(&request.request_id) {
            return Err(ServeError::Engine(format!(
                "request '{}' is already active",
                request.request_id
            )));
        }
        let prompt_tokens = self.prompt_len(&request.inputs);
        if prompt_tokens > self.config.max_single_sequence_length {
            return Err(ServeError::Engine(format!(
                "prompt of request '{}' has {} tokens, exceeds max_single_sequence_length {}",
                request.request_id, prompt_tokens, self.config.max_single_sequence_length
            )));
        }

        let config = &request.generation_config;
        let mut stop_token_ids = config.stop_token_ids.clone();
        let eos = self.tokenizer.as_ref().and_then(|t| t.eos_token_id());
        if let (Some(eos), false) = (eos, config.ignore_eos) {
            stop_token_ids.push(eos);
        }
        let stop_strs = match &self.tokenizer {
            Some(tokenizer) if !config.stop_strs.is_empty() => Some((
                IncrementalDetokenizer::new(Arc::clone(tokenizer)),
                StopStringMatcher::new(config.stop_strs.iter().cloned()),
            )),
            _ => None,
        };

        debug!(request_id = %request.request_id, prompt_tokens, "Replay engine accepted request");
        self.closed.remove(&request.request_id);
        self.active.insert(
            request.request_id.clone(),
            ActiveRequest {
                prompt_tokens,
                max_tokens: config.max_tokens,
                generated: 0,
                prefilled: false,
                stop_token_ids,
                stop_strs,
            },
        );
        self.submitted.push(request);
        Ok(())
    }

    fn abort_request(&mut self, request_id: &str) -> Result<(), ServeError> {
        if self.active.contains_key(request_id) {
            debug!(request_id, "Aborting request");
            self.close(request_id);
            self.pending_aborts.push(request_id.to_string());
        }
        Ok(())
    }

    fn step(&mut self) -> Result<(), ServeError> {
        let callback = self.callback.clone().ok_or_else(|| {
            ServeError::Engine("step called without a request stream callback".to_string())
        })?;
        let start = Instant::now();
        self.num_steps += 1;

        if !self.pending_aborts.is_empty() {
            let aborts: Vec<RequestStreamOutput> = self
                .pending_aborts
                .drain(..)
                .map(|id| RequestStreamOutput::new(id, Vec::new(), Some(FinishReason::Abort)))
                .collect();
            callback(&aborts);
        }

        let Some(step) = self.script.pop_front() else {
            if self.active.is_empty() {
                return Ok(());
            }
            return Err(ServeError::Engine(format!(
                "replay script exhausted with {} active requests",
                self.active.len()
            )));
        };

        let mut prefill = false;
        for delivery in step.deliveries {
            let outputs: Vec<RequestStreamOutput> = delivery
                .into_iter()
                .filter_map(|output| self.admit(output, &mut prefill))
                .collect();
            if !outputs.is_empty() {
                callback(&outputs);
            }
        }

        let elapsed = start.elapsed();
        if prefill {
            self.prefill_time += elapsed;
        } else {
            self.decode_time += elapsed;
        }
        debug!(step = self.num_steps, remaining = self.script.len(), "Replay step done");
        Ok(())
    }

    fn request_stream_callback(&self) -> Option<RequestStreamCallback> {
        self.callback.clone()
    }

    fn set_request_stream_callback(&mut self, callback: Option<RequestStreamCallback>) {
        self.callback = callback;
    }

    fn stats(&self) -> Result<String, ServeError> {
        let per_token = |time: Duration, tokens: u64| {
            if tokens > 0 {
                time.as_secs_f64() / tokens as f64
            } else {
                0.0
            }
        };
        EngineStats {
            single_token_prefill_latency: per_token(self.prefill_time, self.total_prefill_tokens),
            single_token_decode_latency: per_token(self.decode_time, self.total_decode_tokens),
            engine_total_prefill_time: self.prefill_time.as_secs_f64(),
            engine_total_decode_time: self.decode_time.as_secs_f64(),
            total_prefill_tokens: self.total_prefill_tokens,
            total_decode_tokens: self.total_decode_tokens,
        }
        .to_json()
    }

    fn reset(&mut self) -> Result<(), ServeError> {
        debug!(active = self.active.len(), "Resetting replay engine");
        self.active.clear();
        self.closed.clear();
        self.pending_aborts.clear();
        Ok(())
    }
}
