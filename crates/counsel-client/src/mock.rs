use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use futures::{Stream, StreamExt};
use parking_lot::Mutex;

use counsel_core::errors::TransportError;
use counsel_core::event::StreamEvent;
use counsel_core::ids::SessionId;
use counsel_core::service::{
    AnswerService, AskRequest, AskResponse, ConversationPatch, StreamRequest,
};

/// Pre-programmed stream outcomes for deterministic testing without a
/// backend.
pub enum ScriptedStream {
    /// Yield a sequence of events, then end.
    Events(Vec<StreamEvent>),
    /// Yield a sequence of events, then hang until cancelled.
    EventsThenPending(Vec<StreamEvent>),
    /// Return an error from the stream() call itself.
    Error(TransportError),
    /// Wait a duration, then yield the inner script.
    Delay(Duration, Box<ScriptedStream>),
}

impl ScriptedStream {
    /// Convenience: token-by-token stream ending with a matching
    /// completion frame.
    pub fn answer(text: &str) -> Self {
        let mut events: Vec<StreamEvent> = text
            .split_inclusive(' ')
            .map(|piece| StreamEvent::Token(piece.to_string()))
            .collect();
        events.push(StreamEvent::Completion {
            answer: Some(text.to_string()),
            error: None,
        });
        Self::Events(events)
    }

    /// Convenience: stream that ends with a backend-reported error.
    pub fn backend_error(message: &str) -> Self {
        Self::Events(vec![StreamEvent::Completion {
            answer: None,
            error: Some(message.to_string()),
        }])
    }

    /// Convenience: wrap any script with a delay.
    pub fn delayed(delay: Duration, inner: ScriptedStream) -> Self {
        Self::Delay(delay, Box::new(inner))
    }
}

/// Mock answer service that plays back scripted outcomes in sequence.
#[derive(Default)]
pub struct MockService {
    streams: Mutex<VecDeque<ScriptedStream>>,
    asks: Mutex<VecDeque<Result<AskResponse, TransportError>>>,
    stream_count: AtomicUsize,
    ask_count: AtomicUsize,
    deletes: Mutex<Vec<SessionId>>,
    updates: Mutex<Vec<(SessionId, ConversationPatch)>>,
}

impl MockService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_stream(&self, script: ScriptedStream) {
        self.streams.lock().push_back(script);
    }

    pub fn push_ask(&self, outcome: Result<AskResponse, TransportError>) {
        self.asks.lock().push_back(outcome);
    }

    pub fn stream_count(&self) -> usize {
        self.stream_count.load(Ordering::Relaxed)
    }

    pub fn ask_count(&self) -> usize {
        self.ask_count.load(Ordering::Relaxed)
    }

    /// Sessions passed to `delete_conversation` so far.
    pub fn deleted(&self) -> Vec<SessionId> {
        self.deletes.lock().clone()
    }

    /// Patches passed to `update_conversation` so far.
    pub fn updated(&self) -> Vec<(SessionId, ConversationPatch)> {
        self.updates.lock().clone()
    }
}

#[async_trait]
impl AnswerService for MockService {
    async fn stream(
        &self,
        _request: &StreamRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = StreamEvent> + Send>>, TransportError> {
        self.stream_count.fetch_add(1, Ordering::Relaxed);

        let Some(script) = self.streams.lock().pop_front() else {
            return Err(TransportError::InvalidRequest(
                "MockService: no stream scripted for this call".into(),
            ));
        };

        resolve_script(script).await
    }

    async fn ask(&self, _request: &AskRequest) -> Result<AskResponse, TransportError> {
        self.ask_count.fetch_add(1, Ordering::Relaxed);

        self.asks.lock().pop_front().unwrap_or_else(|| {
            Err(TransportError::InvalidRequest(
                "MockService: no ask outcome scripted for this call".into(),
            ))
        })
    }

    async fn delete_conversation(&self, id: &SessionId) -> Result<(), TransportError> {
        self.deletes.lock().push(id.clone());
        Ok(())
    }

    async fn update_conversation(
        &self,
        id: &SessionId,
        patch: &ConversationPatch,
    ) -> Result<(), TransportError> {
        self.updates.lock().push((id.clone(), patch.clone()));
        Ok(())
    }
}

/// Resolve a script, handling Delay by sleeping first.
/// Unrolls nested delays iteratively to avoid recursive async.
async fn resolve_script(
    script: ScriptedStream,
) -> Result<Pin<Box<dyn Stream<Item = StreamEvent> + Send>>, TransportError> {
    let mut current = script;
    loop {
        match current {
            ScriptedStream::Events(events) => {
                return Ok(Box::pin(stream::iter(events)));
            }
            ScriptedStream::EventsThenPending(events) => {
                return Ok(Box::pin(stream::iter(events).chain(stream::pending())));
            }
            ScriptedStream::Error(e) => return Err(e),
            ScriptedStream::Delay(duration, inner) => {
                tokio::time::sleep(duration).await;
                current = *inner;
            }
        }
    }
}
