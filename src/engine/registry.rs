//! Per-request state for one batch call, indexed by dense request id.
//!
//! Ids are `0..N-1` for a batch of `N`, so state lives in a `Vec` and every
//! event is dispatched by index.

use std::sync::Arc;

use tracing::debug;

use crate::error::ServeError;
use crate::streamer::{IncrementalDetokenizer, StopStringMatcher};
use crate::tokenizer::Tokenizer;

use super::request::{FinishReason, GenerationOutput, RequestStreamOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Registered but not yet handed to the engine.
    Pending,
    Streaming,
    Finished,
}

impl RequestStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Finished)
    }
}

pub struct RequestState {
    detokenizer: IncrementalDetokenizer,
    matcher: StopStringMatcher,
    output: String,
    status: RequestStatus,
    finish_reason: Option<FinishReason>,
}

impl RequestState {
    fn new(tokenizer: Arc<dyn Tokenizer>, stop_strs: &[String]) -> Self {
        Self {
            detokenizer: IncrementalDetokenizer::new(tokenizer),
            matcher: StopStringMatcher::new(stop_strs.iter().cloned()),
            output: String::new(),
            status: RequestStatus::Pending,
            finish_reason: None,
        }
    }

    pub fn status(&self) -> RequestStatus {
        self.status
    }

    /// Text emitted so far.
    pub fn output(&self) -> &str {
        &self.output
    }

    pub fn finish_reason(&self) -> Option<&FinishReason> {
        self.finish_reason.as_ref()
    }

    /// Run one event through detokenizer and matcher.
    ///
    /// Returns the final finish reason when this event completes the request.
    fn apply(
        &mut self,
        token_ids: &[u32],
        engine_reason: Option<&FinishReason>,
    ) -> Result<Option<FinishReason>, ServeError> {
        let text = self.detokenizer.put(token_ids)?;
        let mut delta = self.matcher.put(&text);

        let finish_reason = if self.matcher.triggered() {
            Some(FinishReason::Stop)
        } else if let Some(reason) = engine_reason {
            let tail = self.detokenizer.finish()?;
            delta.push_str(&self.matcher.put(&tail));
            if !self.matcher.triggered() {
                delta.push_str(&self.matcher.finish()?);
            }
            if self.matcher.triggered() {
                Some(FinishReason::Stop)
            } else {
                Some(reason.clone())
            }
        } else {
            None
        };

        self.output.push_str(&delta);
        if let Some(reason) = &finish_reason {
            self.status = RequestStatus::Finished;
            self.finish_reason = Some(reason.clone());
        }
        Ok(finish_reason)
    }
}

/// Dense, id-indexed state for every request of one batch.
#[derive(Default)]
pub struct RequestRegistry {
    requests: Vec<RequestState>,
    num_finished: usize,
}

impl RequestRegistry {
    /// One `Pending` entry per stop-string set, ids assigned in order.
    pub fn new(tokenizer: &Arc<dyn Tokenizer>, stop_strs: &[&[String]]) -> Self {
        Self {
            requests: stop_strs
                .iter()
                .map(|stops| RequestState::new(Arc::clone(tokenizer), stops))
                .collect(),
            num_finished: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn num_finished(&self) -> usize {
        self.num_finished
    }

    pub fn all_finished(&self) -> bool {
        self.num_finished == self.requests.len()
    }

    pub fn get(&self, index: usize) -> Option<&RequestState> {
        self.requests.get(index)
    }

    /// Record that request `index` was handed to the engine.
    pub fn mark_submitted(&mut self, index: usize) -> Result<(), ServeError> {
        let num_requests = self.requests.len();
        let state = self
            .requests
            .get_mut(index)
            .ok_or_else(|| ServeError::UnknownRequest {
                request_id: index.to_string(),
                num_requests,
            })?;
        state.status = RequestStatus::Streaming;
        Ok(())
    }

    /// Resolve a string-encoded request id to its index in this batch.
    pub fn resolve(&self, request_id: &str) -> Result<usize, ServeError> {
        request_id
            .parse::<usize>()
            .ok()
            .filter(|&index| index < self.requests.len())
            .ok_or_else(|| ServeError::UnknownRequest {
                request_id: request_id.to_string(),
                num_requests: self.requests.len(),
            })
    }

    /// Route one stream event to its request.
    ///
    /// Returns the request index and, when the event completed it, the final
    /// finish reason. Events for unknown, unsubmitted or finished requests
    /// are protocol faults.
    pub fn deliver(
        &mut self,
        output: &RequestStreamOutput,
    ) -> Result<(usize, Option<FinishReason>), ServeError> {
        let (request_id, token_ids, engine_reason) = output.unpack();
        let index = self.resolve(request_id)?;
        let state = &mut self.requests[index];
        match state.status {
            RequestStatus::Pending => return Err(ServeError::RequestNotSubmitted(index)),
            RequestStatus::Finished => return Err(ServeError::RequestFinished(index)),
            RequestStatus::Streaming => {}
        }

        let finish_reason = state.apply(token_ids, engine_reason)?;
        if let Some(reason) = &finish_reason {
            self.num_finished += 1;
            debug!(
                request_id = index,
                finish_reason = %reason,
                num_finished = self.num_finished,
                "Request finished"
            );
        }
        Ok((index, finish_reason))
    }

    /// Final outputs in id order. `None` unless every request finished.
    pub fn into_outputs(self) -> Option<Vec<GenerationOutput>> {
        self.requests
            .into_iter()
            .map(|state| {
                state.finish_reason.map(|finish_reason| GenerationOutput {
                    text: state.output,
                    finish_reason,
                })
            })
            .collect()
    }
}
