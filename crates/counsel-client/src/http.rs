use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use futures::{Future, Stream};
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};
use tracing::instrument;

use counsel_core::errors::TransportError;
use counsel_core::event::StreamEvent;
use counsel_core::ids::SessionId;
use counsel_core::service::{
    AnswerService, AskRequest, AskResponse, ConversationPatch, StreamRequest,
};

use crate::decoder::LineDecoder;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const STREAM_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Connection settings for the remote answer backend.
#[derive(Clone, Debug)]
pub struct ServiceConfig {
    pub base_url: String,
    pub auth_token: Option<SecretString>,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            auth_token: None,
            connect_timeout: CONNECT_TIMEOUT,
            idle_timeout: STREAM_IDLE_TIMEOUT,
        }
    }
}

/// HTTP client for the answer backend.
pub struct HttpAnswerService {
    client: Client,
    config: ServiceConfig,
}

impl HttpAnswerService {
    pub fn new(config: ServiceConfig) -> Result<Self, TransportError> {
        let client = Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()
            .map_err(|e| TransportError::NetworkError(e.to_string()))?;
        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth_token {
            Some(token) => req.header(
                "Authorization",
                format!("Bearer {}", token.expose_secret()),
            ),
            None => req,
        }
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, TransportError> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(TransportError::from_status(status, body))
    }
}

#[async_trait]
impl AnswerService for HttpAnswerService {
    #[instrument(skip(self, request), fields(query_len = request.query.len()))]
    async fn stream(
        &self,
        request: &StreamRequest,
    ) -> Result<Pin<Box<dyn Stream<Item = StreamEvent> + Send>>, TransportError> {
        let mut params: Vec<(&str, String)> = vec![("query", request.query.clone())];
        if let Some(id) = &request.conversation_id {
            params.push(("conversation_id", id.to_string()));
        }
        if let Some(size) = request.context_window_size {
            params.push(("context_window_size", size.to_string()));
        }
        if let Some(enabled) = request.web_search_enabled {
            params.push(("web_search_enabled", enabled.to_string()));
        }
        if let Some(mode) = &request.mode {
            params.push(("mode", mode.clone()));
        }

        let req = self.authorize(self.client.get(self.url("/api/stream")).query(&params));

        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::NetworkError(e.to_string()))?;
        let resp = Self::check_status(resp).await?;

        let stream = EventStream::new(resp.bytes_stream(), self.config.idle_timeout);
        Ok(Box::pin(stream))
    }

    #[instrument(skip(self, request), fields(query_len = request.query.len()))]
    async fn ask(&self, request: &AskRequest) -> Result<AskResponse, TransportError> {
        let req = self.authorize(self.client.post(self.url("/api/chat")).json(request));

        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::NetworkError(e.to_string()))?;
        let resp = Self::check_status(resp).await?;

        resp.json::<AskResponse>()
            .await
            .map_err(|e| TransportError::InvalidRequest(format!("malformed response: {e}")))
    }

    #[instrument(skip(self), fields(session = %id))]
    async fn delete_conversation(&self, id: &SessionId) -> Result<(), TransportError> {
        let req = self.authorize(self.client.delete(self.url(&format!("/api/chat/{id}"))));

        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::NetworkError(e.to_string()))?;

        // Already gone counts as deleted.
        if resp.status().as_u16() == 404 {
            return Ok(());
        }
        Self::check_status(resp).await.map(|_| ())
    }

    #[instrument(skip(self, patch), fields(session = %id))]
    async fn update_conversation(
        &self,
        id: &SessionId,
        patch: &ConversationPatch,
    ) -> Result<(), TransportError> {
        let req = self.authorize(
            self.client
                .patch(self.url(&format!("/api/chat/{id}")))
                .json(patch),
        );

        let resp = req
            .send()
            .await
            .map_err(|e| TransportError::NetworkError(e.to_string()))?;
        Self::check_status(resp).await.map(|_| ())
    }
}

/// Wraps the response byte stream and yields decoded events.
/// Includes an idle timeout — if no data arrives within `idle_duration`,
/// emits a failure event and ends.
struct EventStream {
    inner: Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>,
    decoder: LineDecoder,
    pending: Vec<StreamEvent>,
    done: bool,
    idle_deadline: Pin<Box<tokio::time::Sleep>>,
    idle_duration: Duration,
}

impl EventStream {
    fn new(
        byte_stream: impl Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send + 'static,
        idle_timeout: Duration,
    ) -> Self {
        Self {
            inner: Box::pin(byte_stream),
            decoder: LineDecoder::new(),
            pending: Vec::new(),
            done: false,
            idle_deadline: Box::pin(tokio::time::sleep(idle_timeout)),
            idle_duration: idle_timeout,
        }
    }
}

impl Stream for EventStream {
    type Item = StreamEvent;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        // Return pending events first
        if !self.pending.is_empty() {
            return std::task::Poll::Ready(Some(self.pending.remove(0)));
        }
        if self.done {
            return std::task::Poll::Ready(None);
        }

        loop {
            match self.inner.as_mut().poll_next(cx) {
                std::task::Poll::Ready(Some(Ok(bytes))) => {
                    // Data received — reset idle timer
                    let new_deadline = tokio::time::Instant::now() + self.idle_duration;
                    self.idle_deadline.as_mut().reset(new_deadline);

                    let events = self.decoder.feed(&bytes);
                    self.pending.extend(events);

                    if !self.pending.is_empty() {
                        return std::task::Poll::Ready(Some(self.pending.remove(0)));
                    }
                }
                std::task::Poll::Ready(Some(Err(e))) => {
                    self.done = true;
                    return std::task::Poll::Ready(Some(StreamEvent::Failed(
                        TransportError::StreamInterrupted(e.to_string()),
                    )));
                }
                std::task::Poll::Ready(None) => {
                    // Stream ended — flush any trailing line
                    self.done = true;
                    let flushed = self.decoder.finish();
                    return std::task::Poll::Ready(flushed);
                }
                std::task::Poll::Pending => {
                    // No data available — check idle timeout
                    if self.idle_deadline.as_mut().poll(cx).is_ready() {
                        self.done = true;
                        return std::task::Poll::Ready(Some(StreamEvent::Failed(
                            TransportError::StreamInterrupted(format!(
                                "idle timeout after {}s",
                                self.idle_duration.as_secs()
                            )),
                        )));
                    }
                    return std::task::Poll::Pending;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[test]
    fn default_config() {
        let config = ServiceConfig::default();
        assert_eq!(config.base_url, "http://localhost:8000");
        assert!(config.auth_token.is_none());
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn url_joins_without_double_slash() {
        let service = HttpAnswerService::new(ServiceConfig {
            base_url: "http://localhost:8000/".into(),
            ..ServiceConfig::default()
        })
        .unwrap();
        assert_eq!(service.url("/api/stream"), "http://localhost:8000/api/stream");
    }

    #[tokio::test]
    async fn event_stream_decodes_frames_across_chunks() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, reqwest::Error>>(16);
        let rx_stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        let stream = Box::pin(EventStream::new(rx_stream, Duration::from_secs(90)));

        tx.send(Ok(bytes::Bytes::from("token:\"Art"))).await.unwrap();
        tx.send(Ok(bytes::Bytes::from("icle\"\ndata:{\"answer\":\"Article\"}\n")))
            .await
            .unwrap();
        drop(tx);

        let events: Vec<StreamEvent> = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], StreamEvent::Token(t) if t == "Article"));
        assert!(matches!(&events[1], StreamEvent::Completion { .. }));
    }

    #[tokio::test]
    async fn event_stream_flushes_unterminated_tail() {
        let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, reqwest::Error>>(16);
        let rx_stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        let mut stream = Box::pin(EventStream::new(rx_stream, Duration::from_secs(90)));

        tx.send(Ok(bytes::Bytes::from(r#"data:{"answer":"done"}"#)))
            .await
            .unwrap();
        drop(tx);

        let event = stream.next().await;
        assert!(matches!(
            event,
            Some(StreamEvent::Completion { answer: Some(a), .. }) if a == "done"
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn idle_timeout_fires_when_no_data() {
        tokio::time::pause();

        let byte_stream = futures::stream::pending::<Result<bytes::Bytes, reqwest::Error>>();
        let mut stream = Box::pin(EventStream::new(byte_stream, Duration::from_secs(5)));

        tokio::time::advance(Duration::from_secs(6)).await;

        let event = stream.next().await;
        assert!(
            matches!(
                &event,
                Some(StreamEvent::Failed(TransportError::StreamInterrupted(msg))) if msg.contains("idle timeout")
            ),
            "expected idle timeout failure, got: {event:?}"
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn idle_timeout_resets_on_data() {
        tokio::time::pause();

        let (tx, rx) = tokio::sync::mpsc::channel::<Result<bytes::Bytes, reqwest::Error>>(16);
        let rx_stream = tokio_stream::wrappers::ReceiverStream::new(rx);
        let mut stream = Box::pin(EventStream::new(rx_stream, Duration::from_secs(5)));

        tx.send(Ok(bytes::Bytes::from("token:\"a\"\n"))).await.unwrap();
        assert!(matches!(stream.next().await, Some(StreamEvent::Token(_))));

        // Advance less than the timeout from the reset point, then feed again
        tokio::time::advance(Duration::from_secs(4)).await;
        tx.send(Ok(bytes::Bytes::from("token:\"b\"\n"))).await.unwrap();
        assert!(matches!(stream.next().await, Some(StreamEvent::Token(_))));

        drop(tx);
        let event = stream.next().await;
        assert!(event.is_none(), "expected stream end, got: {event:?}");
    }
}
