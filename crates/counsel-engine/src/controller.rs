//! Generation lifecycle controller.
//!
//! `ChatEngine` sits between the session store and the answer service: it
//! starts generations, folds stream events into the store, and handles
//! stop, regenerate, and edit. One generation may be in flight per
//! session; a `CancellationToken` per run makes stop immediate.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use counsel_core::event::StreamEvent;
use counsel_core::ids::{MessageId, SessionId};
use counsel_core::model::{Message, Role};
use counsel_core::service::{AnswerService, AskRequest, ConversationPatch, StreamRequest};
use counsel_store::{MessagePatch, SessionStore};

use crate::error::EngineError;

/// Shown in place of an answer when the transport fails mid-generation.
pub const GENERATION_FAILED_MESSAGE: &str =
    "Sorry, I encountered an error while processing your request.";

const TITLE_MAX_CHARS: usize = 30;

/// Knobs forwarded to the answer service on every request.
#[derive(Clone, Debug)]
pub struct GenerationOptions {
    pub top_k: u32,
    pub context_window_size: Option<u32>,
    pub web_search_enabled: Option<bool>,
    pub mode: Option<String>,
}

impl Default for GenerationOptions {
    fn default() -> Self {
        Self {
            top_k: 5,
            context_window_size: None,
            web_search_enabled: None,
            mode: None,
        }
    }
}

/// Tracks one in-flight generation.
struct ActiveGeneration {
    cancel: CancellationToken,
    message_id: MessageId,
}

/// Handle to a spawned generation. Dropping it does not cancel the run.
pub struct GenerationHandle {
    handle: JoinHandle<()>,
}

impl GenerationHandle {
    /// Wait until the generation has fully settled in the store.
    pub async fn settled(self) {
        let _ = self.handle.await;
    }
}

pub struct ChatEngine {
    store: Arc<SessionStore>,
    service: Arc<dyn AnswerService>,
    options: GenerationOptions,
    active: Arc<DashMap<SessionId, ActiveGeneration>>,
}

impl ChatEngine {
    pub fn new(
        store: Arc<SessionStore>,
        service: Arc<dyn AnswerService>,
        options: GenerationOptions,
    ) -> Self {
        Self {
            store,
            service,
            options,
            active: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Start a new chat (or reuse an existing empty one) and select it.
    pub fn new_chat(&self) -> SessionId {
        self.store.create_session()
    }

    pub fn select_session(&self, id: &SessionId) -> bool {
        self.store.select_session(id)
    }

    pub fn is_generating(&self, id: &SessionId) -> bool {
        self.active.contains_key(id)
    }

    fn guard_idle(&self, id: &SessionId) -> Result<(), EngineError> {
        if self.active.contains_key(id) || self.store.has_streaming_message(id) {
            return Err(EngineError::GenerationInFlight(id.to_string()));
        }
        Ok(())
    }

    /// Claim the session's generation slot. The entry API makes the claim
    /// atomic, so two racing callers can never both start a run.
    fn reserve_generation(
        &self,
        id: &SessionId,
        message_id: MessageId,
    ) -> Result<CancellationToken, EngineError> {
        match self.active.entry(id.clone()) {
            Entry::Occupied(_) => Err(EngineError::GenerationInFlight(id.to_string())),
            Entry::Vacant(slot) => {
                let cancel = CancellationToken::new();
                slot.insert(ActiveGeneration {
                    cancel: cancel.clone(),
                    message_id,
                });
                Ok(cancel)
            }
        }
    }

    /// Send a user message and stream the answer into a fresh AI message.
    #[instrument(skip(self, query), fields(session = %session_id))]
    pub fn send(
        &self,
        session_id: &SessionId,
        query: &str,
    ) -> Result<GenerationHandle, EngineError> {
        let session = self
            .store
            .session(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        self.guard_idle(session_id)?;

        let placeholder = Message::streaming_ai();
        let placeholder_id = placeholder.id.clone();
        let cancel = self.reserve_generation(session_id, placeholder_id.clone())?;

        if session.has_default_title() {
            self.store.rename_session(session_id, derive_title(query));
        }

        self.store
            .append_messages(session_id, vec![Message::user(query), placeholder]);

        Ok(self.spawn_generation(session_id, query, placeholder_id, cancel))
    }

    /// Discard an AI message and answer its preceding user message again.
    /// With no target, the session's last message is regenerated. Returns
    /// `Ok(None)` when the target is not an AI message directly after a
    /// user message.
    #[instrument(skip(self), fields(session = %session_id))]
    pub fn regenerate(
        &self,
        session_id: &SessionId,
        target: Option<&MessageId>,
    ) -> Result<Option<GenerationHandle>, EngineError> {
        let session = self
            .store
            .session(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        self.guard_idle(session_id)?;

        let idx = match target {
            Some(id) => match session.messages.iter().position(|m| &m.id == id) {
                Some(idx) => idx,
                None => return Ok(None),
            },
            None => match session.messages.len().checked_sub(1) {
                Some(idx) => idx,
                None => return Ok(None),
            },
        };

        if session.messages[idx].role != Role::Ai
            || idx == 0
            || session.messages[idx - 1].role != Role::User
        {
            return Ok(None);
        }

        let query = session.messages[idx - 1].content.clone();
        let mut kept: Vec<Message> = session.messages[..idx].to_vec();
        let placeholder = Message::streaming_ai();
        let placeholder_id = placeholder.id.clone();
        kept.push(placeholder);
        let cancel = self.reserve_generation(session_id, placeholder_id.clone())?;
        self.store.replace_messages(session_id, kept);

        Ok(Some(self.spawn_generation(session_id, &query, placeholder_id, cancel)))
    }

    fn spawn_generation(
        &self,
        session_id: &SessionId,
        query: &str,
        placeholder_id: MessageId,
        cancel: CancellationToken,
    ) -> GenerationHandle {
        let request = StreamRequest {
            query: query.to_string(),
            conversation_id: Some(session_id.clone()),
            context_window_size: self.options.context_window_size,
            web_search_enabled: self.options.web_search_enabled,
            mode: self.options.mode.clone(),
        };

        let store = Arc::clone(&self.store);
        let service = Arc::clone(&self.service);
        let active = Arc::clone(&self.active);
        let session_id = session_id.clone();

        let handle = tokio::spawn(async move {
            run_generation(&store, &*service, &session_id, &placeholder_id, request, &cancel).await;

            // Finalization is a no-op when stop already flipped the flag
            // or the message was truncated away.
            store.patch_message(
                &session_id,
                &placeholder_id,
                MessagePatch::new().streaming(false),
            );
            active.remove_if(&session_id, |_, generation| {
                generation.message_id == placeholder_id
            });
        });

        GenerationHandle { handle }
    }

    /// Cancel the in-flight generation, keeping whatever content already
    /// arrived. Safe to call repeatedly and when nothing is running.
    #[instrument(skip(self), fields(session = %session_id))]
    pub fn stop(&self, session_id: &SessionId) {
        if let Some((_, generation)) = self.active.remove(session_id) {
            generation.cancel.cancel();
        }

        if let Some(session) = self.store.session(session_id) {
            if let Some(message) = session.streaming_message() {
                self.store.patch_message(
                    session_id,
                    &message.id,
                    MessagePatch::new().streaming(false),
                );
            }
        }
    }

    /// Rewrite a user message and replace everything after it with one
    /// complete (non-streamed) answer.
    #[instrument(skip(self, new_content), fields(session = %session_id))]
    pub async fn edit(
        &self,
        session_id: &SessionId,
        message_id: &MessageId,
        new_content: &str,
    ) -> Result<(), EngineError> {
        let session = self
            .store
            .session(session_id)
            .ok_or_else(|| EngineError::SessionNotFound(session_id.to_string()))?;
        self.guard_idle(session_id)?;

        let idx = session
            .messages
            .iter()
            .position(|m| &m.id == message_id)
            .ok_or_else(|| EngineError::MessageNotFound(message_id.to_string()))?;
        if session.messages[idx].role != Role::User {
            return Err(EngineError::MessageNotFound(format!(
                "{message_id} is not a user message"
            )));
        }

        let cancel = self.reserve_generation(session_id, message_id.clone())?;

        let mut kept: Vec<Message> = session.messages[..idx].to_vec();
        kept.push(session.messages[idx].rewritten(new_content));
        self.store.replace_messages(session_id, kept);

        let request = AskRequest {
            query: new_content.to_string(),
            top_k: self.options.top_k,
            conversation_id: Some(session_id.clone()),
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = self.service.ask(&request) => Some(result),
        };

        match outcome {
            // Cancelled: the rewritten question stands alone, no answer.
            None => {}
            Some(Ok(response)) => {
                let mut answer = Message::ai(response.answer);
                answer.citations = response.chunks;
                answer.opinions = response.council_opinions;
                self.store.append_messages(session_id, vec![answer]);
            }
            Some(Err(e)) if e.is_cancelled() => {}
            Some(Err(e)) => {
                tracing::warn!(session = %session_id, error = %e, "edit request failed");
                self.store
                    .append_messages(session_id, vec![Message::ai(GENERATION_FAILED_MESSAGE)]);
            }
        }

        self.active
            .remove_if(session_id, |_, generation| generation.message_id == *message_id);
        Ok(())
    }

    /// Delete locally, then tell the remote in the background. A remote
    /// miss is fine; the conversation is gone either way.
    #[instrument(skip(self), fields(session = %session_id))]
    pub fn delete_session(&self, session_id: &SessionId) -> bool {
        self.stop(session_id);
        if !self.store.delete_session(session_id) {
            return false;
        }

        let service = Arc::clone(&self.service);
        let id = session_id.clone();
        tokio::spawn(async move {
            if let Err(e) = service.delete_conversation(&id).await {
                tracing::warn!(session = %id, error = %e, "remote delete failed");
            }
        });
        true
    }

    /// Rename locally and push the new title to the remote in the
    /// background.
    pub fn rename_session(&self, session_id: &SessionId, title: &str) -> bool {
        if !self.store.rename_session(session_id, title) {
            return false;
        }
        self.push_remote_patch(
            session_id,
            ConversationPatch {
                title: Some(title.to_string()),
                is_pinned: None,
            },
        );
        true
    }

    /// Flip the pin state locally and push it to the remote in the
    /// background. Returns the new state, or None if the session is gone.
    pub fn toggle_pin(&self, session_id: &SessionId) -> Option<bool> {
        let session = self.store.session(session_id)?;
        let pinned = !session.is_pinned;
        self.store.set_pinned(session_id, pinned);
        self.push_remote_patch(
            session_id,
            ConversationPatch {
                title: None,
                is_pinned: Some(pinned),
            },
        );
        Some(pinned)
    }

    fn push_remote_patch(&self, session_id: &SessionId, patch: ConversationPatch) {
        let service = Arc::clone(&self.service);
        let id = session_id.clone();
        tokio::spawn(async move {
            if let Err(e) = service.update_conversation(&id, &patch).await {
                tracing::warn!(session = %id, error = %e, "remote update failed");
            }
        });
    }
}

/// Drive one stream to its terminal event, folding everything into the
/// placeholder message.
async fn run_generation(
    store: &SessionStore,
    service: &dyn AnswerService,
    session_id: &SessionId,
    message_id: &MessageId,
    request: StreamRequest,
    cancel: &CancellationToken,
) {
    let opened = tokio::select! {
        _ = cancel.cancelled() => return,
        result = service.stream(&request) => result,
    };

    let mut stream = match opened {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(session = %session_id, error = %e, "failed to open answer stream");
            store.patch_message(
                session_id,
                message_id,
                MessagePatch::new().replace_content(GENERATION_FAILED_MESSAGE),
            );
            return;
        }
    };

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = stream.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let terminal = event.is_terminal();
        apply_event(store, session_id, message_id, event);
        if terminal {
            break;
        }
    }
}

fn apply_event(
    store: &SessionStore,
    session_id: &SessionId,
    message_id: &MessageId,
    event: StreamEvent,
) {
    let patch = match event {
        StreamEvent::Log(line) => MessagePatch::new().push_log(line),
        StreamEvent::Citations(citations) => MessagePatch::new().citations(citations),
        StreamEvent::Opinion(opinion) => MessagePatch::new().opinion(opinion),
        StreamEvent::Token(token) => MessagePatch::new().append_content(token),
        StreamEvent::FollowUps(follow_ups) => MessagePatch::new().follow_ups(follow_ups),
        StreamEvent::Completion { answer, error } => {
            let patch = MessagePatch::new().streaming(false);
            if let Some(error) = error {
                patch.replace_content(format!("Error: {error}"))
            } else {
                match answer {
                    // The final answer wins only when it carries more than
                    // the tokens already accumulated.
                    Some(answer) => {
                        let accumulated = store
                            .message(session_id, message_id)
                            .map(|m| m.content.chars().count())
                            .unwrap_or(0);
                        if answer.chars().count() > accumulated {
                            patch.replace_content(answer)
                        } else {
                            patch
                        }
                    }
                    None => patch,
                }
            }
        }
        StreamEvent::Failed(e) => {
            if e.is_cancelled() {
                MessagePatch::new().streaming(false)
            } else {
                tracing::warn!(session = %session_id, error = %e, "answer stream failed");
                MessagePatch::new()
                    .replace_content(GENERATION_FAILED_MESSAGE)
                    .streaming(false)
            }
        }
    };

    store.patch_message(session_id, message_id, patch);
}

/// First line of the question, clipped for the session list.
fn derive_title(query: &str) -> String {
    let trimmed = query.trim();
    if trimmed.chars().count() <= TITLE_MAX_CHARS {
        trimmed.to_string()
    } else {
        let clipped: String = trimmed.chars().take(TITLE_MAX_CHARS).collect();
        format!("{clipped}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use counsel_client::mock::{MockService, ScriptedStream};
    use counsel_core::errors::TransportError;
    use counsel_core::model::{Citation, Opinion};
    use counsel_core::service::AskResponse;

    fn setup(scripts: Vec<ScriptedStream>) -> (ChatEngine, Arc<MockService>, SessionId) {
        let mock = Arc::new(MockService::new());
        for script in scripts {
            mock.push_stream(script);
        }
        let engine = ChatEngine::new(
            Arc::new(SessionStore::new()),
            mock.clone(),
            GenerationOptions::default(),
        );
        let session_id = engine.new_chat();
        (engine, mock, session_id)
    }

    async fn settle_spawned() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    fn opinion(role: &str, text: &str) -> Opinion {
        Opinion {
            role: role.into(),
            model: "mock-model".into(),
            text: text.into(),
            web_search_used: false,
        }
    }

    #[tokio::test]
    async fn send_streams_answer_into_new_message() {
        let (engine, _, sid) = setup(vec![ScriptedStream::answer("Article 21 applies.")]);

        let handle = engine.send(&sid, "Does Article 21 apply?").unwrap();
        handle.settled().await;

        let session = engine.store().session(&sid).unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[1].role, Role::Ai);
        assert_eq!(session.messages[1].content, "Article 21 applies.");
        assert!(!session.messages[1].is_streaming);
        assert!(!engine.is_generating(&sid));
    }

    #[tokio::test]
    async fn send_derives_title_from_first_question() {
        let (engine, _, sid) = setup(vec![ScriptedStream::answer("yes")]);
        engine.send(&sid, "hi").unwrap().settled().await;
        assert_eq!(engine.store().session(&sid).unwrap().title, "hi");
    }

    #[tokio::test]
    async fn long_titles_are_clipped_with_ellipsis() {
        let (engine, _, sid) = setup(vec![ScriptedStream::answer("yes")]);
        let query = "What is the constitutional basis for judicial review in India?";
        engine.send(&sid, query).unwrap().settled().await;

        let title = engine.store().session(&sid).unwrap().title;
        assert_eq!(title, "What is the constitutional bas...");
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
    }

    #[tokio::test]
    async fn title_not_overwritten_on_later_sends() {
        let (engine, _, sid) = setup(vec![
            ScriptedStream::answer("one"),
            ScriptedStream::answer("two"),
        ]);
        engine.send(&sid, "first question").unwrap().settled().await;
        engine.send(&sid, "second question").unwrap().settled().await;
        assert_eq!(engine.store().session(&sid).unwrap().title, "first question");
    }

    #[tokio::test]
    async fn stream_metadata_lands_on_the_answer() {
        let (engine, _, sid) = setup(vec![ScriptedStream::Events(vec![
            StreamEvent::Log("searching judgments".into()),
            StreamEvent::Citations(vec![Citation {
                rank: 1,
                score: 0.9,
                text: "Maneka Gandhi v. Union of India".into(),
                metadata: Default::default(),
            }]),
            StreamEvent::Opinion(opinion("judge", "allowed")),
            StreamEvent::Token("Allowed.".into()),
            StreamEvent::FollowUps(vec!["On what grounds?".into()]),
            StreamEvent::Completion { answer: None, error: None },
        ])]);

        engine.send(&sid, "q").unwrap().settled().await;

        let message = engine.store().session(&sid).unwrap().messages[1].clone();
        assert_eq!(message.content, "Allowed.");
        assert_eq!(message.logs, vec!["searching judgments"]);
        assert_eq!(message.citations.len(), 1);
        assert_eq!(message.opinions.len(), 1);
        assert_eq!(message.follow_ups, vec!["On what grounds?"]);
    }

    #[tokio::test]
    async fn completion_answer_replaces_shorter_accumulation() {
        let (engine, _, sid) = setup(vec![ScriptedStream::Events(vec![
            StreamEvent::Token("Part".into()),
            StreamEvent::Completion {
                answer: Some("Partial answers get replaced".into()),
                error: None,
            },
        ])]);

        engine.send(&sid, "q").unwrap().settled().await;
        assert_eq!(
            engine.store().session(&sid).unwrap().messages[1].content,
            "Partial answers get replaced"
        );
    }

    #[tokio::test]
    async fn completion_answer_never_shrinks_accumulation() {
        let (engine, _, sid) = setup(vec![ScriptedStream::Events(vec![
            StreamEvent::Token("The full streamed answer text".into()),
            StreamEvent::Completion { answer: Some("short".into()), error: None },
        ])]);

        engine.send(&sid, "q").unwrap().settled().await;
        assert_eq!(
            engine.store().session(&sid).unwrap().messages[1].content,
            "The full streamed answer text"
        );
    }

    #[tokio::test]
    async fn backend_error_is_formatted() {
        let (engine, _, sid) = setup(vec![ScriptedStream::backend_error("index offline")]);

        engine.send(&sid, "q").unwrap().settled().await;

        let message = engine.store().session(&sid).unwrap().messages[1].clone();
        assert_eq!(message.content, "Error: index offline");
        assert!(!message.is_streaming);
    }

    #[tokio::test]
    async fn transport_failure_uses_fallback_text() {
        let (engine, _, sid) = setup(vec![ScriptedStream::Events(vec![StreamEvent::Failed(
            TransportError::NetworkError("connection reset".into()),
        )])]);

        engine.send(&sid, "q").unwrap().settled().await;
        assert_eq!(
            engine.store().session(&sid).unwrap().messages[1].content,
            GENERATION_FAILED_MESSAGE
        );
    }

    #[tokio::test]
    async fn failed_stream_open_uses_fallback_text() {
        let (engine, _, sid) = setup(vec![ScriptedStream::Error(
            TransportError::ServerError { status: 500, body: "boom".into() },
        )]);

        engine.send(&sid, "q").unwrap().settled().await;

        let message = engine.store().session(&sid).unwrap().messages[1].clone();
        assert_eq!(message.content, GENERATION_FAILED_MESSAGE);
        assert!(!message.is_streaming);
        assert!(!engine.is_generating(&sid));
    }

    #[tokio::test]
    async fn send_rejects_missing_session() {
        let (engine, _, _) = setup(vec![]);
        let result = engine.send(&SessionId::new(), "q");
        assert!(matches!(result, Err(EngineError::SessionNotFound(_))));
    }

    #[tokio::test]
    async fn send_rejects_while_generation_in_flight() {
        let (engine, _, sid) = setup(vec![ScriptedStream::EventsThenPending(vec![
            StreamEvent::Token("partial".into()),
        ])]);

        let _handle = engine.send(&sid, "first").unwrap();
        settle_spawned().await;

        let second = engine.send(&sid, "second");
        assert!(matches!(second, Err(EngineError::GenerationInFlight(_))));

        engine.stop(&sid);
    }

    #[tokio::test]
    async fn back_to_back_sends_claim_only_one_slot() {
        let (engine, mock, sid) = setup(vec![ScriptedStream::EventsThenPending(vec![])]);

        let _first = engine.send(&sid, "first").unwrap();
        // Rejected synchronously, before the first run has even been polled.
        let second = engine.send(&sid, "second");
        assert!(matches!(second, Err(EngineError::GenerationInFlight(_))));
        assert_eq!(mock.stream_count(), 0);

        engine.stop(&sid);
    }

    #[tokio::test]
    async fn stop_keeps_partial_content_and_is_idempotent() {
        let (engine, _, sid) = setup(vec![ScriptedStream::EventsThenPending(vec![
            StreamEvent::Token("partial ".into()),
            StreamEvent::Token("answer".into()),
        ])]);

        let handle = engine.send(&sid, "q").unwrap();
        settle_spawned().await;

        engine.stop(&sid);
        engine.stop(&sid);
        handle.settled().await;

        let session = engine.store().session(&sid).unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].content, "partial answer");
        assert!(!session.messages[1].is_streaming);
        assert!(!engine.is_generating(&sid));
    }

    #[tokio::test]
    async fn stop_when_idle_is_a_noop() {
        let (engine, _, sid) = setup(vec![]);
        engine.stop(&sid);
        assert!(engine.store().session(&sid).is_some());
    }

    #[tokio::test]
    async fn send_works_again_after_stop() {
        let (engine, _, sid) = setup(vec![
            ScriptedStream::EventsThenPending(vec![StreamEvent::Token("partial".into())]),
            ScriptedStream::answer("second answer"),
        ]);

        let _first = engine.send(&sid, "first").unwrap();
        settle_spawned().await;
        engine.stop(&sid);

        let handle = engine.send(&sid, "again").unwrap();
        handle.settled().await;

        let session = engine.store().session(&sid).unwrap();
        assert_eq!(session.messages.len(), 4);
        assert_eq!(session.messages[3].content, "second answer");
    }

    #[tokio::test]
    async fn regenerate_replays_last_user_question() {
        let (engine, mock, sid) = setup(vec![
            ScriptedStream::answer("first answer"),
            ScriptedStream::answer("second answer"),
        ]);

        engine.send(&sid, "the question").unwrap().settled().await;
        let handle = engine.regenerate(&sid, None).unwrap().unwrap();
        handle.settled().await;

        let session = engine.store().session(&sid).unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].content, "second answer");
        assert_eq!(mock.stream_count(), 2);
    }

    #[tokio::test]
    async fn regenerate_specific_message_truncates_after_it() {
        let (engine, _, sid) = setup(vec![
            ScriptedStream::answer("a1"),
            ScriptedStream::answer("a2"),
            ScriptedStream::answer("a1 again"),
        ]);

        engine.send(&sid, "q1").unwrap().settled().await;
        engine.send(&sid, "q2").unwrap().settled().await;

        let first_answer_id = engine.store().session(&sid).unwrap().messages[1].id.clone();
        let handle = engine.regenerate(&sid, Some(&first_answer_id)).unwrap().unwrap();
        handle.settled().await;

        let session = engine.store().session(&sid).unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].content, "q1");
        assert_eq!(session.messages[1].content, "a1 again");
    }

    #[tokio::test]
    async fn regenerate_refuses_user_messages() {
        let (engine, _, sid) = setup(vec![ScriptedStream::answer("a")]);
        engine.send(&sid, "q").unwrap().settled().await;

        let user_id = engine.store().session(&sid).unwrap().messages[0].id.clone();
        let result = engine.regenerate(&sid, Some(&user_id)).unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn regenerate_on_empty_session_is_none() {
        let (engine, _, sid) = setup(vec![]);
        assert!(engine.regenerate(&sid, None).unwrap().is_none());
    }

    #[tokio::test]
    async fn edit_truncates_and_appends_complete_answer() {
        let (engine, mock, sid) = setup(vec![
            ScriptedStream::answer("a1"),
            ScriptedStream::answer("a2"),
        ]);
        engine.send(&sid, "q1").unwrap().settled().await;
        engine.send(&sid, "q2").unwrap().settled().await;

        mock.push_ask(Ok(AskResponse {
            answer: "revised answer".into(),
            chunks: vec![Citation {
                rank: 1,
                score: 0.8,
                text: "source".into(),
                metadata: Default::default(),
            }],
            llm_model: Some("mock-model".into()),
            council_opinions: vec![opinion("devil's advocate", "dissent")],
        }));

        let first_user_id = engine.store().session(&sid).unwrap().messages[0].id.clone();
        engine.edit(&sid, &first_user_id, "q1 revised").await.unwrap();

        let session = engine.store().session(&sid).unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[0].content, "q1 revised");
        assert_eq!(session.messages[0].role, Role::User);
        assert_eq!(session.messages[1].content, "revised answer");
        assert_eq!(session.messages[1].citations.len(), 1);
        assert_eq!(session.messages[1].opinions.len(), 1);
        assert!(!session.messages[1].is_streaming);
        assert_eq!(mock.ask_count(), 1);
    }

    #[tokio::test]
    async fn edit_keeps_the_message_id() {
        let (engine, mock, sid) = setup(vec![ScriptedStream::answer("a1")]);
        engine.send(&sid, "q1").unwrap().settled().await;
        mock.push_ask(Ok(AskResponse {
            answer: "revised".into(),
            chunks: vec![],
            llm_model: None,
            council_opinions: vec![],
        }));

        let user_id = engine.store().session(&sid).unwrap().messages[0].id.clone();
        engine.edit(&sid, &user_id, "q1 revised").await.unwrap();

        let session = engine.store().session(&sid).unwrap();
        assert_eq!(session.messages[0].id, user_id);
        assert_eq!(session.messages[0].content, "q1 revised");
    }

    #[tokio::test]
    async fn edit_failure_appends_fallback_answer() {
        let (engine, mock, sid) = setup(vec![ScriptedStream::answer("a1")]);
        engine.send(&sid, "q1").unwrap().settled().await;

        mock.push_ask(Err(TransportError::NetworkError("down".into())));

        let user_id = engine.store().session(&sid).unwrap().messages[0].id.clone();
        engine.edit(&sid, &user_id, "q1 revised").await.unwrap();

        let session = engine.store().session(&sid).unwrap();
        assert_eq!(session.messages.len(), 2);
        assert_eq!(session.messages[1].content, GENERATION_FAILED_MESSAGE);
        assert!(!engine.is_generating(&sid));
    }

    #[tokio::test]
    async fn edit_rejects_ai_messages() {
        let (engine, _, sid) = setup(vec![ScriptedStream::answer("a1")]);
        engine.send(&sid, "q1").unwrap().settled().await;

        let ai_id = engine.store().session(&sid).unwrap().messages[1].id.clone();
        let result = engine.edit(&sid, &ai_id, "rewrite").await;
        assert!(matches!(result, Err(EngineError::MessageNotFound(_))));
    }

    #[tokio::test]
    async fn delete_session_removes_locally_and_remotely() {
        let (engine, mock, sid) = setup(vec![]);
        assert!(engine.delete_session(&sid));
        settle_spawned().await;

        assert!(engine.store().session(&sid).is_none());
        assert_eq!(mock.deleted(), vec![sid.clone()]);
        assert!(!engine.delete_session(&sid));
    }

    #[tokio::test]
    async fn rename_and_pin_push_remote_patches() {
        let (engine, mock, sid) = setup(vec![]);

        assert!(engine.rename_session(&sid, "Land acquisition"));
        assert_eq!(engine.toggle_pin(&sid), Some(true));
        settle_spawned().await;

        let session = engine.store().session(&sid).unwrap();
        assert_eq!(session.title, "Land acquisition");
        assert!(session.is_pinned);

        let updates = mock.updated();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].1.title.as_deref(), Some("Land acquisition"));
        assert_eq!(updates[1].1.is_pinned, Some(true));
    }

    #[test]
    fn derive_title_short_query_unchanged() {
        assert_eq!(derive_title("  short question  "), "short question");
    }

    #[test]
    fn derive_title_counts_chars_not_bytes() {
        let query = "अनुच्छेद २१ का दायरा क्या है और यह कहाँ लागू होता है";
        let title = derive_title(query);
        assert!(title.ends_with("..."));
        assert_eq!(title.chars().count(), TITLE_MAX_CHARS + 3);
    }
}
