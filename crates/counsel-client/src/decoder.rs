use serde::Deserialize;

use counsel_core::event::StreamEvent;
use counsel_core::model::{Citation, Opinion};

/// Incremental decoder for the line-oriented answer protocol.
///
/// Each frame is one newline-terminated line of the form `tag:payload`.
/// The decoder carries raw bytes across `feed` calls, so chunk boundaries
/// (including splits inside a multi-byte UTF-8 sequence) never change what
/// is decoded.
#[derive(Default)]
pub struct LineDecoder {
    carry: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk of bytes and return every event completed by it.
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        self.carry.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(pos) = self.carry.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.carry.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..pos]);
            if let Some(event) = parse_line(line.trim_end_matches('\r')) {
                events.push(event);
            }
        }
        events
    }

    /// Flush the trailing unterminated line, if any. Call once at end of
    /// stream.
    pub fn finish(&mut self) -> Option<StreamEvent> {
        if self.carry.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.carry);
        let line = String::from_utf8_lossy(&rest);
        parse_line(line.trim_end_matches('\r'))
    }
}

fn parse_line(line: &str) -> Option<StreamEvent> {
    if line.is_empty() {
        return None;
    }

    if let Some(payload) = line.strip_prefix("log:") {
        return Some(StreamEvent::Log(payload.trim().to_string()));
    }
    if let Some(payload) = line.strip_prefix("chunks:") {
        return match serde_json::from_str::<Vec<Citation>>(payload.trim()) {
            Ok(citations) => Some(StreamEvent::Citations(citations)),
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed chunks frame");
                None
            }
        };
    }
    if let Some(payload) = line.strip_prefix("opinion:") {
        return match serde_json::from_str::<WireOpinion>(payload.trim()) {
            Ok(wire) => Some(StreamEvent::Opinion(wire.into())),
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed opinion frame");
                None
            }
        };
    }
    if let Some(payload) = line.strip_prefix("token:") {
        return match serde_json::from_str::<String>(payload.trim()) {
            Ok(token) => Some(StreamEvent::Token(token)),
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed token frame");
                None
            }
        };
    }
    if let Some(payload) = line.strip_prefix("followup:") {
        return match serde_json::from_str::<Vec<String>>(payload.trim()) {
            Ok(follow_ups) => Some(StreamEvent::FollowUps(follow_ups)),
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed followup frame");
                None
            }
        };
    }
    if let Some(payload) = line.strip_prefix("data:") {
        return match serde_json::from_str::<WireCompletion>(payload.trim()) {
            Ok(wire) => Some(StreamEvent::Completion { answer: wire.answer, error: wire.error }),
            Err(e) => {
                tracing::warn!(error = %e, "dropping malformed data frame");
                None
            }
        };
    }

    tracing::debug!(line, "ignoring unrecognized frame");
    None
}

// --- Deserialization types for wire frames ---

#[derive(Deserialize)]
struct WireOpinion {
    role: String,
    model: String,
    opinion: String,
    web_search_enabled: Option<bool>,
}

impl From<WireOpinion> for Opinion {
    fn from(wire: WireOpinion) -> Self {
        Opinion {
            role: wire.role,
            model: wire.model,
            text: wire.opinion,
            web_search_used: wire.web_search_enabled.unwrap_or(false),
        }
    }
}

#[derive(Deserialize)]
struct WireCompletion {
    answer: Option<String>,
    error: Option<String>,
}
