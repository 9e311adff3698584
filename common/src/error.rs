use async_openai::error::OpenAIError;
use thiserror::Error;
use tokio::task::JoinError;

// Core internal errors
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] surrealdb::Error),
    #[error("OpenAI error: {0}")]
    OpenAI(#[from] OpenAIError),
    #[error("Scope error: {0}")]
    Scope(String),
    #[error("Upstream unavailable: {0}")]
    Upstream(String),
    #[error("Tool execution error: {0}")]
    ToolExecution(String),
    #[error("A turn is already in flight for this session")]
    TurnInFlight,
    #[error("Send buffer saturated, consumer too slow")]
    SlowConsumer,
    #[error("Turn deadline exceeded")]
    Deadline,
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Embedding error: {0}")]
    Embedding(String),
    #[error("LLM parsing error: {0}")]
    LLMParsing(String),
    #[error("Task join error: {0}")]
    Join(#[from] JoinError),
    #[error("IoError: {0}")]
    Io(#[from] std::io::Error),
    #[error("Config error: {0}")]
    Config(#[from] config::ConfigError),
    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
    #[error("Internal service error: {0}")]
    Internal(String),
}

impl AppError {
    /// Stable error code used on the wire (`error` frames).
    pub fn wire_code(&self) -> &'static str {
        match self {
            AppError::Scope(_) => "unauthorized",
            AppError::Upstream(_) | AppError::OpenAI(_) => "upstream_partial",
            AppError::TurnInFlight => "turn_in_flight",
            AppError::SlowConsumer => "slow_consumer",
            AppError::Deadline => "deadline",
            AppError::Validation(_) | AppError::LLMParsing(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            _ => "internal",
        }
    }

    /// Transient failures are recovered locally where possible; the rest are
    /// surfaced to the client immediately.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::Database(_)
                | AppError::Upstream(_)
                | AppError::OpenAI(_)
                | AppError::Embedding(_)
        )
    }
}
