pub mod controller;
pub mod error;
pub mod sync;

pub use controller::{ChatEngine, GenerationHandle, GenerationOptions, GENERATION_FAILED_MESSAGE};
pub use error::EngineError;
pub use sync::Reconciler;
