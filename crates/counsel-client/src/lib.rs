pub mod decoder;
pub mod http;
pub mod mock;

pub use decoder::LineDecoder;
pub use http::{HttpAnswerService, ServiceConfig};
pub use mock::{MockService, ScriptedStream};
