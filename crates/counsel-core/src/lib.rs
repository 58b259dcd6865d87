pub mod errors;
pub mod event;
pub mod ids;
pub mod model;
pub mod service;

pub use errors::TransportError;
pub use event::StreamEvent;
pub use ids::{MessageId, SessionId};
pub use model::{Citation, Message, Opinion, Role, Session, DEFAULT_SESSION_TITLE};
pub use service::{AnswerService, AskRequest, AskResponse, ConversationPatch, EventStream, StreamRequest};
