use std::sync::Arc;
use std::time::Duration;

use common::{storage::db::SurrealDbClient, utils::config::AppConfig};
use engine::TwinRegistry;
use memory_pipeline::MemoryPipeline;

use crate::auth::CredentialResolver;

/// Transport-level knobs, lifted out of the app config at startup.
#[derive(Debug, Clone, Copy)]
pub struct TransportConfig {
    pub send_buffer: usize,
    pub send_timeout: Duration,
    pub turn_deadline: Duration,
    /// Queue a mid-turn `message` instead of rejecting it.
    pub queue_turns: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            send_buffer: 64,
            send_timeout: Duration::from_secs(10),
            turn_deadline: Duration::from_secs(120),
            queue_turns: false,
        }
    }
}

impl From<&AppConfig> for TransportConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            send_buffer: config.send_buffer_size,
            send_timeout: Duration::from_secs(config.send_timeout_secs),
            turn_deadline: Duration::from_secs(config.turn_deadline_secs),
            queue_turns: config.queue_turns,
        }
    }
}

/// Shared state behind every WebSocket connection.
#[derive(Clone)]
pub struct WsState {
    pub db: Arc<SurrealDbClient>,
    pub registry: Arc<TwinRegistry>,
    pub pipeline: Arc<MemoryPipeline>,
    pub resolver: Arc<dyn CredentialResolver>,
    pub transport: TransportConfig,
}
