use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::broadcast;

use counsel_core::ids::{MessageId, SessionId};
use counsel_core::model::{Citation, Message, Opinion, Session};

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// How a patch touches the message body.
#[derive(Clone, Debug)]
pub enum ContentPatch {
    Append(String),
    Replace(String),
}

/// Partial update merged into one message. Unset fields leave the message
/// untouched.
#[derive(Clone, Debug, Default)]
pub struct MessagePatch {
    content: Option<ContentPatch>,
    logs: Vec<String>,
    opinion: Option<Opinion>,
    citations: Option<Vec<Citation>>,
    follow_ups: Option<Vec<String>>,
    streaming: Option<bool>,
}

impl MessagePatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_content(mut self, delta: impl Into<String>) -> Self {
        self.content = Some(ContentPatch::Append(delta.into()));
        self
    }

    pub fn replace_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(ContentPatch::Replace(content.into()));
        self
    }

    pub fn push_log(mut self, line: impl Into<String>) -> Self {
        self.logs.push(line.into());
        self
    }

    pub fn opinion(mut self, opinion: Opinion) -> Self {
        self.opinion = Some(opinion);
        self
    }

    pub fn citations(mut self, citations: Vec<Citation>) -> Self {
        self.citations = Some(citations);
        self
    }

    pub fn follow_ups(mut self, follow_ups: Vec<String>) -> Self {
        self.follow_ups = Some(follow_ups);
        self
    }

    pub fn streaming(mut self, streaming: bool) -> Self {
        self.streaming = Some(streaming);
        self
    }
}

#[derive(Default)]
struct StoreState {
    sessions: Vec<Session>,
    current: Option<SessionId>,
}

/// In-memory session and message store. All mutations go through this
/// type; readers get cloned snapshots. Every change to a session is
/// announced on the broadcast feed with that session's id.
pub struct SessionStore {
    inner: RwLock<StoreState>,
    changes: broadcast::Sender<SessionId>,
}

impl SessionStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: RwLock::new(StoreState::default()),
            changes,
        }
    }

    /// Subscribe to change notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionId> {
        self.changes.subscribe()
    }

    fn notify(&self, id: &SessionId) {
        let _ = self.changes.send(id.clone());
    }

    /// Create a fresh session, make it current, and return its id. If an
    /// empty session already exists it is reused instead, so repeated
    /// "new chat" requests never pile up blank sessions.
    pub fn create_session(&self) -> SessionId {
        let mut state = self.inner.write();

        let reusable = state
            .sessions
            .iter()
            .find(|s| s.messages.is_empty())
            .map(|s| s.id.clone());
        let id = match reusable {
            Some(id) => id,
            None => {
                let session = Session::new();
                let id = session.id.clone();
                state.sessions.insert(0, session);
                id
            }
        };
        state.current = Some(id.clone());
        drop(state);
        self.notify(&id);
        id
    }

    /// Make the given session current. Returns false if it does not exist.
    pub fn select_session(&self, id: &SessionId) -> bool {
        let mut state = self.inner.write();
        if !state.sessions.iter().any(|s| &s.id == id) {
            return false;
        }
        state.current = Some(id.clone());
        drop(state);
        self.notify(id);
        true
    }

    pub fn current_session(&self) -> Option<Session> {
        let state = self.inner.read();
        let current = state.current.as_ref()?;
        state.sessions.iter().find(|s| &s.id == current).cloned()
    }

    pub fn sessions(&self) -> Vec<Session> {
        self.inner.read().sessions.clone()
    }

    pub fn session(&self, id: &SessionId) -> Option<Session> {
        self.inner.read().sessions.iter().find(|s| &s.id == id).cloned()
    }

    pub fn message(&self, session_id: &SessionId, message_id: &MessageId) -> Option<Message> {
        self.session(session_id)?.message(message_id).cloned()
    }

    pub fn has_streaming_message(&self, id: &SessionId) -> bool {
        self.session(id)
            .map(|s| s.streaming_message().is_some())
            .unwrap_or(false)
    }

    /// Append messages to a session. Returns false if the session is gone.
    pub fn append_messages(&self, id: &SessionId, messages: Vec<Message>) -> bool {
        let mut state = self.inner.write();
        let Some(session) = state.sessions.iter_mut().find(|s| &s.id == id) else {
            return false;
        };
        session.messages.extend(messages);
        session.updated_at = Utc::now();
        drop(state);
        self.notify(id);
        true
    }

    /// Replace a session's entire message list (truncation for edit and
    /// regenerate). Returns false if the session is gone.
    pub fn replace_messages(&self, id: &SessionId, messages: Vec<Message>) -> bool {
        let mut state = self.inner.write();
        let Some(session) = state.sessions.iter_mut().find(|s| &s.id == id) else {
            return false;
        };
        session.messages = messages;
        session.updated_at = Utc::now();
        drop(state);
        self.notify(id);
        true
    }

    /// Merge a patch into one message. A patch aimed at a message that no
    /// longer exists (session deleted, history truncated) is silently
    /// dropped and returns false. Opinions deduplicate by council role,
    /// first writer wins.
    pub fn patch_message(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        patch: MessagePatch,
    ) -> bool {
        let mut state = self.inner.write();
        let Some(session) = state.sessions.iter_mut().find(|s| &s.id == session_id) else {
            return false;
        };
        let Some(message) = session.messages.iter_mut().find(|m| &m.id == message_id) else {
            return false;
        };

        match patch.content {
            Some(ContentPatch::Append(delta)) => message.content.push_str(&delta),
            Some(ContentPatch::Replace(content)) => message.content = content,
            None => {}
        }
        message.logs.extend(patch.logs);
        if let Some(opinion) = patch.opinion {
            if !message.opinions.iter().any(|o| o.role == opinion.role) {
                message.opinions.push(opinion);
            }
        }
        if let Some(citations) = patch.citations {
            message.citations = citations;
        }
        if let Some(follow_ups) = patch.follow_ups {
            message.follow_ups = follow_ups;
        }
        if let Some(streaming) = patch.streaming {
            message.is_streaming = streaming;
        }

        session.updated_at = Utc::now();
        drop(state);
        self.notify(session_id);
        true
    }

    /// Remove a session. Clears the current selection if it pointed at it.
    pub fn delete_session(&self, id: &SessionId) -> bool {
        let mut state = self.inner.write();
        let before = state.sessions.len();
        state.sessions.retain(|s| &s.id != id);
        if state.sessions.len() == before {
            return false;
        }
        if state.current.as_ref() == Some(id) {
            state.current = None;
        }
        drop(state);
        self.notify(id);
        true
    }

    /// Rename a session. Does not bump `updated_at`, so renaming never
    /// reorders the session list.
    pub fn rename_session(&self, id: &SessionId, title: impl Into<String>) -> bool {
        let mut state = self.inner.write();
        let Some(session) = state.sessions.iter_mut().find(|s| &s.id == id) else {
            return false;
        };
        session.title = title.into();
        drop(state);
        self.notify(id);
        true
    }

    /// Pin or unpin a session. Does not bump `updated_at`.
    pub fn set_pinned(&self, id: &SessionId, pinned: bool) -> bool {
        let mut state = self.inner.write();
        let Some(session) = state.sessions.iter_mut().find(|s| &s.id == id) else {
            return false;
        };
        session.is_pinned = pinned;
        drop(state);
        self.notify(id);
        true
    }

    /// Merge a remote-ordered session list into the store
    /// (reconciliation). Remote metadata wins, but a session's local
    /// message history wins whenever it is non-empty at merge time, so a
    /// patch that landed while the caller was fetching is never reverted.
    /// Sessions the remote does not know about are kept at the end of the
    /// list, which also keeps the current selection alive.
    pub fn merge_sessions(&self, remote: Vec<Session>) {
        let mut state = self.inner.write();

        let mut merged = Vec::with_capacity(remote.len());
        for mut session in remote {
            if let Some(local) = state.sessions.iter().find(|s| s.id == session.id) {
                if !local.messages.is_empty() {
                    session.messages = local.messages.clone();
                }
            }
            merged.push(session);
        }
        for session in std::mem::take(&mut state.sessions) {
            if !merged.iter().any(|m| m.id == session.id) {
                merged.push(session);
            }
        }
        state.sessions = merged;

        let current = state.current.clone();
        drop(state);
        if let Some(id) = current {
            self.notify(&id);
        }
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}
