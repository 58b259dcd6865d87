use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use counsel_core::ids::SessionId;
use counsel_core::model::Message;

use crate::error::StoreError;

/// What the remote knows about one conversation, without its messages.
#[derive(Clone, Debug)]
pub struct SessionSummary {
    pub id: SessionId,
    pub title: String,
    pub is_pinned: bool,
    pub updated_at: DateTime<Utc>,
}

/// Source of truth for the remote session list. Message history is
/// fetched lazily, per session.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    async fn list_summaries(&self) -> Result<Vec<SessionSummary>, StoreError>;
    async fn fetch_messages(&self, id: &SessionId) -> Result<Vec<Message>, StoreError>;
}

/// In-memory backend for tests.
#[derive(Default)]
pub struct MemorySyncBackend {
    summaries: Mutex<Vec<SessionSummary>>,
    histories: Mutex<HashMap<SessionId, Vec<Message>>>,
}

impl MemorySyncBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, summary: SessionSummary, messages: Vec<Message>) {
        self.histories.lock().insert(summary.id.clone(), messages);
        self.summaries.lock().push(summary);
    }
}

#[async_trait]
impl SyncBackend for MemorySyncBackend {
    async fn list_summaries(&self) -> Result<Vec<SessionSummary>, StoreError> {
        Ok(self.summaries.lock().clone())
    }

    async fn fetch_messages(&self, id: &SessionId) -> Result<Vec<Message>, StoreError> {
        self.histories
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("session {id}")))
    }
}
