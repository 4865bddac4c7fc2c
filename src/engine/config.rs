//! Configuration types handed to the generation engine.
//!
//! Everything here is (de)serializable with serde so engines can take their
//! configuration as JSON, and every field has a default so partial documents
//! are accepted.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ServeError;

/// Sampling parameters. Interpreted by the engine only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingConfig {
    /// Temperature for logit scaling. 0.0 = greedy (argmax).
    pub temperature: f32,
    /// Top-P (nucleus): cumulative probability cutoff. 1.0 = disabled.
    pub top_p: f32,
    /// Top-K: keep only the top-k highest probability tokens. 0 = disabled.
    pub top_k: usize,
    pub repetition_penalty: f32,
    pub frequency_penalty: f32,
    pub presence_penalty: f32,
    /// Random seed for reproducibility.
    pub seed: Option<u64>,
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.8,
            top_p: 0.95,
            top_k: 0,
            repetition_penalty: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            seed: None,
        }
    }
}

/// Per-request generation configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationConfig {
    #[serde(flatten)]
    pub sampling: SamplingConfig,
    /// Maximum number of tokens to generate.
    pub max_tokens: usize,
    /// Output is truncated before the first occurrence of any of these.
    pub stop_strs: Vec<String>,
    /// Engine stops when any of these token ids is produced.
    pub stop_token_ids: Vec<u32>,
    pub ignore_eos: bool,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            sampling: SamplingConfig::default(),
            max_tokens: 128,
            stop_strs: Vec::new(),
            stop_token_ids: Vec::new(),
            ignore_eos: false,
        }
    }
}

impl GenerationConfig {
    pub fn with_stop_strs<I, S>(mut self, stop_strs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.stop_strs = stop_strs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: usize) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn to_json(&self) -> Result<String, ServeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ServeError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServeError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

/// Generation configs for one batch: shared by every prompt, or one per prompt.
#[derive(Debug, Clone)]
pub enum GenerationConfigs {
    Shared(GenerationConfig),
    PerPrompt(Vec<GenerationConfig>),
}

impl GenerationConfigs {
    /// One config per prompt, broadcasting a shared config.
    ///
    /// Fails with [`ServeError::ConfigCountMismatch`] when a per-prompt list
    /// has the wrong length.
    pub fn resolve(self, num_prompts: usize) -> Result<Vec<GenerationConfig>, ServeError> {
        match self {
            GenerationConfigs::Shared(config) => Ok(vec![config; num_prompts]),
            GenerationConfigs::PerPrompt(configs) if configs.len() == num_prompts => Ok(configs),
            GenerationConfigs::PerPrompt(configs) => Err(ServeError::ConfigCountMismatch {
                configs: configs.len(),
                prompts: num_prompts,
            }),
        }
    }
}

impl From<GenerationConfig> for GenerationConfigs {
    fn from(config: GenerationConfig) -> Self {
        GenerationConfigs::Shared(config)
    }
}

impl From<&GenerationConfig> for GenerationConfigs {
    fn from(config: &GenerationConfig) -> Self {
        GenerationConfigs::Shared(config.clone())
    }
}

impl From<Vec<GenerationConfig>> for GenerationConfigs {
    fn from(configs: Vec<GenerationConfig>) -> Self {
        GenerationConfigs::PerPrompt(configs)
    }
}

/// Paged KV cache configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KvCacheConfig {
    pub page_size: usize,
    pub max_num_sequence: usize,
    pub max_total_sequence_length: Option<usize>,
}

impl Default for KvCacheConfig {
    fn default() -> Self {
        Self {
            page_size: 16,
            max_num_sequence: 32,
            max_total_sequence_length: None,
        }
    }
}

/// Engine execution mode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineMode {
    pub enable_speculative: bool,
    /// Draft tokens proposed per speculative step.
    pub spec_draft_length: usize,
}

impl Default for EngineMode {
    fn default() -> Self {
        Self {
            enable_speculative: false,
            spec_draft_length: 4,
        }
    }
}

/// One-time engine initialization arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Longest prompt plus generation a single request may reach.
    pub max_single_sequence_length: usize,
    pub tokenizer_path: Option<PathBuf>,
    pub kv_cache_config: KvCacheConfig,
    pub engine_mode: EngineMode,
    pub enable_tracing: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_single_sequence_length: 4096,
            tokenizer_path: None,
            kv_cache_config: KvCacheConfig::default(),
            engine_mode: EngineMode::default(),
            enable_tracing: false,
        }
    }
}

impl EngineConfig {
    pub fn to_json(&self) -> Result<String, ServeError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self, ServeError> {
        let config: Self = serde_json::from_str(json)?;
        if config.max_single_sequence_length == 0 {
            return Err(ServeError::Config(
                "max_single_sequence_length must be positive".to_string(),
            ));
        }
        if config.kv_cache_config.page_size == 0 {
            return Err(ServeError::Config("page_size must be positive".to_string()));
        }
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ServeError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}
