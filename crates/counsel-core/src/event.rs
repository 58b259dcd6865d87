use crate::errors::TransportError;
use crate::model::{Citation, Opinion};

/// Events decoded from the answer stream. Loose ordering contract:
///
/// (Log | Citations | Opinion | Token | FollowUps)* → Completion
///
/// Failed can appear at any point and ends the stream.
#[derive(Clone, Debug)]
pub enum StreamEvent {
    Log(String),
    Citations(Vec<Citation>),
    Opinion(Opinion),
    Token(String),
    FollowUps(Vec<String>),
    Completion {
        answer: Option<String>,
        error: Option<String>,
    },
    Failed(TransportError),
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completion { .. } | Self::Failed(_))
    }
}
