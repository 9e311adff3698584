use std::pin::Pin;

use async_openai::types::{
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs,
};
use async_trait::async_trait;
use futures::{Stream, StreamExt};

use crate::error::AppError;

/// One request against the chat backend: a system prompt plus the user turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LmRequest {
    pub model: String,
    pub system: String,
    pub user: String,
}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<String, AppError>> + Send>>;

/// Seam between the engine and the LLM HTTP API. Production wraps
/// async-openai; tests script the replies.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Streaming completion; yields content deltas in emit order.
    async fn stream_chat(&self, request: LmRequest) -> Result<ChunkStream, AppError>;

    /// One-shot completion, used for the tool synthesis call.
    async fn complete(&self, request: LmRequest) -> Result<String, AppError>;
}

pub struct OpenAiModel {
    client: async_openai::Client<async_openai::config::OpenAIConfig>,
}

impl OpenAiModel {
    pub fn new(client: async_openai::Client<async_openai::config::OpenAIConfig>) -> Self {
        Self { client }
    }

    fn build_request(
        request: &LmRequest,
        stream: bool,
    ) -> Result<async_openai::types::CreateChatCompletionRequest, AppError> {
        CreateChatCompletionRequestArgs::default()
            .model(&request.model)
            .stream(stream)
            .messages([
                ChatCompletionRequestSystemMessage::from(request.system.clone()).into(),
                ChatCompletionRequestUserMessage::from(request.user.clone()).into(),
            ])
            .build()
            .map_err(AppError::OpenAI)
    }
}

#[async_trait]
impl LanguageModel for OpenAiModel {
    async fn stream_chat(&self, request: LmRequest) -> Result<ChunkStream, AppError> {
        let request = Self::build_request(&request, true)?;
        let stream = self
            .client
            .chat()
            .create_stream(request)
            .await
            .map_err(|e| AppError::Upstream(format!("LLM stream failed to open: {e}")))?;

        let mapped = stream.filter_map(|item| async move {
            match item {
                Ok(response) => response
                    .choices
                    .first()
                    .and_then(|choice| choice.delta.content.clone())
                    .filter(|content| !content.is_empty())
                    .map(Ok),
                Err(e) => Some(Err(AppError::Upstream(format!("LLM stream error: {e}")))),
            }
        });

        Ok(Box::pin(mapped))
    }

    async fn complete(&self, request: LmRequest) -> Result<String, AppError> {
        let request = Self::build_request(&request, false)?;
        let response = self
            .client
            .chat()
            .create(request)
            .await
            .map_err(|e| AppError::Upstream(format!("LLM completion failed: {e}")))?;

        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or(AppError::LLMParsing("No content found in LLM response".into()))
    }
}

#[cfg(any(test, feature = "test-utils"))]
pub use scripted::{ScriptedModel, ScriptedReply};

#[cfg(any(test, feature = "test-utils"))]
mod scripted {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::{AppError, ChunkStream, LanguageModel, LmRequest};
    use async_trait::async_trait;
    use futures::stream;
    use futures::StreamExt;

    /// One canned model reply, consumed in order.
    #[derive(Debug, Clone)]
    pub struct ScriptedReply {
        pub chunks: Vec<String>,
        /// When set, the stream never terminates after its chunks; used to
        /// exercise cancellation paths.
        pub hang_after: bool,
    }

    impl ScriptedReply {
        pub fn text(content: &str) -> Self {
            Self {
                chunks: vec![content.to_string()],
                hang_after: false,
            }
        }

        pub fn chunks(chunks: &[&str]) -> Self {
            Self {
                chunks: chunks.iter().map(|c| (*c).to_string()).collect(),
                hang_after: false,
            }
        }

        pub fn hanging(chunks: &[&str]) -> Self {
            Self {
                chunks: chunks.iter().map(|c| (*c).to_string()).collect(),
                hang_after: true,
            }
        }
    }

    /// Scripted `LanguageModel` for tests: replies come from a queue, every
    /// request is logged for assertions.
    #[derive(Default)]
    pub struct ScriptedModel {
        replies: Mutex<VecDeque<ScriptedReply>>,
        stream_requests: Mutex<Vec<LmRequest>>,
        completion_requests: Mutex<Vec<LmRequest>>,
    }

    impl ScriptedModel {
        pub fn new(replies: Vec<ScriptedReply>) -> Self {
            Self {
                replies: Mutex::new(replies.into()),
                stream_requests: Mutex::new(Vec::new()),
                completion_requests: Mutex::new(Vec::new()),
            }
        }

        pub fn push(&self, reply: ScriptedReply) {
            if let Ok(mut replies) = self.replies.lock() {
                replies.push_back(reply);
            }
        }

        pub fn stream_requests(&self) -> Vec<LmRequest> {
            self.stream_requests
                .lock()
                .map(|log| log.clone())
                .unwrap_or_default()
        }

        pub fn completion_requests(&self) -> Vec<LmRequest> {
            self.completion_requests
                .lock()
                .map(|log| log.clone())
                .unwrap_or_default()
        }

        fn next_reply(&self) -> Result<ScriptedReply, AppError> {
            self.replies
                .lock()
                .map_err(|_| AppError::Internal("scripted model poisoned".into()))?
                .pop_front()
                .ok_or_else(|| AppError::Upstream("scripted model ran out of replies".into()))
        }
    }

    #[async_trait]
    impl LanguageModel for ScriptedModel {
        async fn stream_chat(&self, request: LmRequest) -> Result<ChunkStream, AppError> {
            if let Ok(mut log) = self.stream_requests.lock() {
                log.push(request);
            }
            let reply = self.next_reply()?;
            let chunks = stream::iter(reply.chunks.into_iter().map(Ok));
            if reply.hang_after {
                Ok(Box::pin(chunks.chain(stream::pending())))
            } else {
                Ok(Box::pin(chunks))
            }
        }

        async fn complete(&self, request: LmRequest) -> Result<String, AppError> {
            if let Ok(mut log) = self.completion_requests.lock() {
                log.push(request);
            }
            let reply = self.next_reply()?;
            Ok(reply.chunks.concat())
        }
    }
}
