mod core;
mod variants;

pub use self::core::{EngineDeps, EngineTimeouts, ThinkEngine};
pub use self::variants::{EnterpriseTwin, PersonalTwin};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use common::{error::AppError, scope::MemoryScope};

/// Phase and tool usage surfaced to the client alongside the stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CognitiveState {
    pub phase: String,
    pub tools_used: Vec<String>,
}

/// One element of a think stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ThinkChunk {
    /// Displayable response text, markers already stripped.
    Content(String),
    /// Out-of-band state; the transport renders it as `cognitive_state`.
    Meta(CognitiveState),
    /// Terminal or recoverable error surfaced to the client.
    Error {
        code: &'static str,
        message: String,
    },
}

/// One user turn handed to a twin.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    pub session_id: String,
    pub input: String,
    pub scope: MemoryScope,
    pub cancel: CancellationToken,
}

/// A cognitive engine bound to one tenant configuration.
///
/// `think` returns a channel of chunks; the channel closing is the
/// end-of-stream signal. Implementations must ingest the produced exchange
/// before closing, including partial ones.
#[async_trait]
pub trait Twin: Send + Sync {
    async fn think(&self, request: TurnRequest) -> Result<mpsc::Receiver<ThinkChunk>, AppError>;

    /// Variant name, for logs and registry bookkeeping.
    fn variant(&self) -> &'static str;
}
