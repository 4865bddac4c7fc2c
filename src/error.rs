use thiserror::Error;

#[derive(Error, Debug)]
pub enum ServeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Number of generation configs ({configs}) does not match number of prompts ({prompts})")]
    ConfigCountMismatch { configs: usize, prompts: usize },

    #[error("Unknown request id '{request_id}' (batch has {num_requests} requests)")]
    UnknownRequest {
        request_id: String,
        num_requests: usize,
    },

    #[error("Request {0} received an event before it was submitted")]
    RequestNotSubmitted(usize),

    #[error("Request {0} received an event after it finished")]
    RequestFinished(usize),

    #[error("{0} is already closed")]
    StreamClosed(&'static str),

    #[error("Tokenizer error: {0}")]
    Tokenizer(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Engine error: {0}")]
    Engine(String),
}

impl ServeError {
    /// True for faults that mean the orchestrator and the engine disagree
    /// about request state.
    pub fn is_protocol_fault(&self) -> bool {
        matches!(
            self,
            ServeError::UnknownRequest { .. }
                | ServeError::RequestNotSubmitted(_)
                | ServeError::RequestFinished(_)
                | ServeError::StreamClosed(_)
        )
    }
}
