//! Engine-facing APIs.
//!
//! - [`GenerationEngine`]: the step-driven engine contract
//! - [`ServeEngine`]: batch generation over any engine
//! - [`ReplayEngine`]: scripted engine for tests and offline replays

pub mod callback;
pub mod config;
pub mod generate;
pub mod registry;
pub mod replay;
pub mod request;
pub mod stats;
pub mod trace;

pub use callback::{CallbackGuard, GenerationEngine, RequestStreamCallback};
pub use config::{
    EngineConfig, EngineMode, GenerationConfig, GenerationConfigs, KvCacheConfig, SamplingConfig,
};
pub use generate::ServeEngine;
pub use replay::{ReplayEngine, ReplayScript, ReplayStep};
pub use request::{FinishReason, GenerationOutput, Prompt, Request, RequestStreamOutput, TokenData};
pub use stats::EngineStats;
pub use trace::EventTraceRecorder;
