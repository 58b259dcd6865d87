use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::errors::TransportError;
use crate::event::StreamEvent;
use crate::ids::SessionId;
use crate::model::{Citation, Opinion};

/// Boxed event stream returned by [`AnswerService::stream`].
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// Parameters for a streaming answer request.
#[derive(Clone, Debug, Default)]
pub struct StreamRequest {
    pub query: String,
    pub conversation_id: Option<SessionId>,
    pub context_window_size: Option<u32>,
    pub web_search_enabled: Option<bool>,
    pub mode: Option<String>,
}

impl StreamRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }
}

/// Parameters for a one-shot (non-streaming) answer request.
#[derive(Clone, Debug, Serialize)]
pub struct AskRequest {
    pub query: String,
    pub top_k: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<SessionId>,
}

/// Complete answer payload from the one-shot endpoint.
#[derive(Clone, Debug, Deserialize)]
pub struct AskResponse {
    pub answer: String,
    #[serde(default)]
    pub chunks: Vec<Citation>,
    #[serde(default)]
    pub llm_model: Option<String>,
    #[serde(default)]
    pub council_opinions: Vec<Opinion>,
}

/// Partial update applied to a remote conversation record.
#[derive(Clone, Debug, Default, Serialize)]
pub struct ConversationPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_pinned: Option<bool>,
}

/// Trait implemented by the remote answer backend.
#[async_trait]
pub trait AnswerService: Send + Sync {
    /// Open a streaming answer for the given query. The returned stream
    /// yields decoded events and ends after a terminal event.
    async fn stream(&self, request: &StreamRequest) -> Result<EventStream, TransportError>;

    /// Request one complete answer without streaming.
    async fn ask(&self, request: &AskRequest) -> Result<AskResponse, TransportError>;

    /// Delete a remote conversation.
    async fn delete_conversation(&self, id: &SessionId) -> Result<(), TransportError>;

    /// Patch a remote conversation's title or pin state.
    async fn update_conversation(
        &self,
        id: &SessionId,
        patch: &ConversationPatch,
    ) -> Result<(), TransportError>;
}
