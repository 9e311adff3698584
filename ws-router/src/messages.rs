use serde::{Deserialize, Serialize};

use common::scope::MemoryScope;

/// Frames the client sends over `/ws/{session_id}`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Verify {
        credential: String,
    },
    Message {
        content: String,
        #[serde(default)]
        division: Option<String>,
    },
    SetDivision {
        division: String,
    },
    Ping,
}

/// Scope as presented back to the client on `verified`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ScopePayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    pub departments: Vec<String>,
}

impl From<&MemoryScope> for ScopePayload {
    fn from(scope: &MemoryScope) -> Self {
        Self {
            tenant_id: scope.tenant_id.clone(),
            user_id: scope.user_id.clone(),
            departments: scope.departments.clone(),
        }
    }
}

/// Frames the server sends.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Connected,
    Verified {
        scope: ScopePayload,
    },
    StreamChunk {
        content: String,
        done: bool,
    },
    CognitiveState {
        phase: String,
        tools_used: Vec<String>,
    },
    SessionAnalytics {
        session_duration_ms: u64,
        turn_count: u64,
    },
    Error {
        code: String,
        message: String,
    },
    Pong,
}
