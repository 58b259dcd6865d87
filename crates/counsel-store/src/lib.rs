pub mod error;
pub mod schema;
pub mod sqlite;
pub mod store;
pub mod sync;

pub use error::StoreError;
pub use sqlite::{Database, SqliteSyncBackend};
pub use store::{ContentPatch, MessagePatch, SessionStore};
pub use sync::{MemorySyncBackend, SessionSummary, SyncBackend};
