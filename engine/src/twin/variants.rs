use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use common::{error::AppError, storage::types::tenant_config::TenantConfig};

use super::{
    core::{EngineDeps, EngineTimeouts, ThinkEngine},
    ThinkChunk, Twin, TurnRequest,
};

/// The personal twin: conversation-first retrieval, hot context on per the
/// tenant's policy.
pub struct PersonalTwin {
    engine: Arc<ThinkEngine>,
}

impl PersonalTwin {
    pub fn new(deps: EngineDeps, tenant: TenantConfig, timeouts: EngineTimeouts) -> Self {
        Self {
            engine: ThinkEngine::new(deps, tenant, timeouts, false),
        }
    }
}

#[async_trait]
impl Twin for PersonalTwin {
    async fn think(&self, request: TurnRequest) -> Result<mpsc::Receiver<ThinkChunk>, AppError> {
        Arc::clone(&self.engine).spawn_turn(request)
    }

    fn variant(&self) -> &'static str {
        "personal"
    }
}

/// The enterprise twin: document-first. The smart-RAG store joins every
/// retrieval pass and documents outrank conversational memory in the prompt.
pub struct EnterpriseTwin {
    engine: Arc<ThinkEngine>,
}

impl EnterpriseTwin {
    pub fn new(deps: EngineDeps, tenant: TenantConfig, timeouts: EngineTimeouts) -> Self {
        Self {
            engine: ThinkEngine::new(deps, tenant, timeouts, true),
        }
    }
}

#[async_trait]
impl Twin for EnterpriseTwin {
    async fn think(&self, request: TurnRequest) -> Result<mpsc::Receiver<ThinkChunk>, AppError> {
        Arc::clone(&self.engine).spawn_turn(request)
    }

    fn variant(&self) -> &'static str {
        "enterprise"
    }
}
