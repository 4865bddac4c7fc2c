//! Requests submitted to the engine and the stream events it sends back.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use super::config::GenerationConfig;

/// Prompt input: raw text, or token ids that bypass the tokenizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Prompt {
    Text(String),
    Tokens(Vec<u32>),
}

impl From<&str> for Prompt {
    fn from(text: &str) -> Self {
        Prompt::Text(text.to_string())
    }
}

impl From<String> for Prompt {
    fn from(text: String) -> Self {
        Prompt::Text(text)
    }
}

impl From<Vec<u32>> for Prompt {
    fn from(ids: Vec<u32>) -> Self {
        Prompt::Tokens(ids)
    }
}

impl From<&[u32]> for Prompt {
    fn from(ids: &[u32]) -> Self {
        Prompt::Tokens(ids.to_vec())
    }
}

/// A generation request as handed to the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    /// String-encoded id. Within one batch call, ids are `"0"..="N-1"`.
    pub request_id: String,
    pub inputs: Prompt,
    pub generation_config: GenerationConfig,
}

impl Request {
    pub fn new(
        request_id: impl Into<String>,
        inputs: impl Into<Prompt>,
        generation_config: GenerationConfig,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            inputs: inputs.into(),
            generation_config,
        }
    }
}

/// Token ids produced for a request since its previous event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenData {
    pub token_ids: Vec<u32>,
}

impl From<Vec<u32>> for TokenData {
    fn from(token_ids: Vec<u32>) -> Self {
        Self { token_ids }
    }
}

/// Why the engine stopped generating for a request.
///
/// The serving core treats any present reason as "finished"; it only ever
/// produces [`FinishReason::Stop`] itself, when a stop string matches.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FinishReason {
    /// A stop string or stop token ended generation.
    Stop,
    /// Reached `max_tokens` or the sequence length limit.
    Length,
    /// Aborted through `abort_request`.
    Abort,
    Other(String),
}

impl FinishReason {
    pub fn as_str(&self) -> &str {
        match self {
            FinishReason::Stop => "stop",
            FinishReason::Length => "length",
            FinishReason::Abort => "abort",
            FinishReason::Other(tag) => tag,
        }
    }
}

impl From<&str> for FinishReason {
    fn from(tag: &str) -> Self {
        match tag {
            "stop" => FinishReason::Stop,
            "length" => FinishReason::Length,
            "abort" => FinishReason::Abort,
            other => FinishReason::Other(other.to_string()),
        }
    }
}

impl fmt::Display for FinishReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for FinishReason {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FinishReason {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let tag = String::deserialize(deserializer)?;
        Ok(FinishReason::from(tag.as_str()))
    }
}

/// One stream event: new tokens for a request, and whether it finished.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestStreamOutput {
    pub request_id: String,
    #[serde(default)]
    pub delta: TokenData,
    #[serde(default)]
    pub finish_reason: Option<FinishReason>,
}

impl RequestStreamOutput {
    pub fn new(
        request_id: impl Into<String>,
        token_ids: Vec<u32>,
        finish_reason: Option<FinishReason>,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            delta: TokenData::from(token_ids),
            finish_reason,
        }
    }

    pub fn unpack(&self) -> (&str, &[u32], Option<&FinishReason>) {
        (
            &self.request_id,
            &self.delta.token_ids,
            self.finish_reason.as_ref(),
        )
    }
}

/// Final result for one prompt of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationOutput {
    pub text: String,
    pub finish_reason: FinishReason,
}
