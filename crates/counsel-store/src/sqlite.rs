use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::info;

use counsel_core::ids::{MessageId, SessionId};
use counsel_core::model::{Citation, Message, Opinion, Role, Session};

use crate::error::StoreError;
use crate::schema;
use crate::sync::{SessionSummary, SyncBackend};

/// Thread-safe SQLite connection wrapper.
/// Uses parking_lot::Mutex for synchronous access (rusqlite is not Send).
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl Database {
    /// Open or create a database at the given path.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Io(format!("create dir: {e}")))?;
        }

        let conn = Connection::open(path).map_err(|e| StoreError::Database(e.to_string()))?;
        Self::initialize(&conn)?;

        info!(path = %path.display(), "database opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: path.to_owned(),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn =
            Connection::open_in_memory().map_err(|e| StoreError::Database(e.to_string()))?;
        Self::initialize(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: PathBuf::from(":memory:"),
        })
    }

    fn initialize(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(schema::PRAGMAS)
            .map_err(|e| StoreError::Database(format!("pragmas: {e}")))?;
        conn.execute_batch(schema::CREATE_TABLES)
            .map_err(|e| StoreError::Database(format!("schema: {e}")))?;

        let version: Option<u32> = conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
                row.get(0)
            })
            .ok();
        if version.is_none() {
            conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                [schema::SCHEMA_VERSION],
            )
            .map_err(|e| StoreError::Database(format!("schema version: {e}")))?;
        }
        Ok(())
    }

    /// Execute a closure with the database connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Connection) -> Result<T, StoreError>,
    {
        let conn = self.conn.lock();
        f(&conn)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Clone for Database {
    fn clone(&self) -> Self {
        Self {
            conn: self.conn.clone(),
            path: self.path.clone(),
        }
    }
}

/// Everything on a message that is not a scalar column, stored as one
/// JSON payload.
#[derive(Default, Serialize, Deserialize)]
struct MessagePayload {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    opinions: Vec<Opinion>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    citations: Vec<Citation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    follow_ups: Vec<String>,
}

impl MessagePayload {
    fn is_empty(&self) -> bool {
        self.logs.is_empty()
            && self.opinions.is_empty()
            && self.citations.is_empty()
            && self.follow_ups.is_empty()
    }
}

/// Sync backend over the local SQLite conversation cache.
pub struct SqliteSyncBackend {
    db: Database,
}

impl SqliteSyncBackend {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Write a session and its full message history.
    pub fn save_session(&self, session: &Session) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO conversations (id, title, is_pinned, updated_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                     title = excluded.title,
                     is_pinned = excluded.is_pinned,
                     updated_at = excluded.updated_at",
                rusqlite::params![
                    session.id.as_str(),
                    session.title,
                    session.is_pinned as i64,
                    session.updated_at.to_rfc3339(),
                ],
            )?;

            conn.execute(
                "DELETE FROM messages WHERE conversation_id = ?1",
                [session.id.as_str()],
            )?;

            for (sequence, message) in session.messages.iter().enumerate() {
                let payload = MessagePayload {
                    logs: message.logs.clone(),
                    opinions: message.opinions.clone(),
                    citations: message.citations.clone(),
                    follow_ups: message.follow_ups.clone(),
                };
                let payload_json = if payload.is_empty() {
                    None
                } else {
                    Some(serde_json::to_string(&payload)?)
                };

                conn.execute(
                    "INSERT INTO messages
                         (id, conversation_id, sequence, role, content, created_at, payload)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    rusqlite::params![
                        message.id.as_str(),
                        session.id.as_str(),
                        sequence as i64,
                        message.role.to_string(),
                        message.content,
                        message.timestamp.to_rfc3339(),
                        payload_json,
                    ],
                )?;
            }
            Ok(())
        })
    }

    /// Remove a conversation and its messages.
    pub fn delete_session(&self, id: &SessionId) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute("DELETE FROM conversations WHERE id = ?1", [id.as_str()])?;
            Ok(())
        })
    }
}

fn parse_timestamp(raw: &str, what: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("{what} timestamp: {e}")))
}

#[async_trait]
impl SyncBackend for SqliteSyncBackend {
    async fn list_summaries(&self) -> Result<Vec<SessionSummary>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, title, is_pinned, updated_at
                 FROM conversations
                 ORDER BY is_pinned DESC, updated_at DESC",
            )?;
            let rows = stmt.query_map([], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            let mut summaries = Vec::new();
            for row in rows {
                let (id, title, is_pinned, updated_at) = row?;
                summaries.push(SessionSummary {
                    id: SessionId::from_raw(id),
                    title,
                    is_pinned: is_pinned != 0,
                    updated_at: parse_timestamp(&updated_at, "conversation")?,
                });
            }
            Ok(summaries)
        })
    }

    async fn fetch_messages(&self, id: &SessionId) -> Result<Vec<Message>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, role, content, created_at, payload
                 FROM messages
                 WHERE conversation_id = ?1
                 ORDER BY sequence ASC",
            )?;
            let rows = stmt.query_map([id.as_str()], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                ))
            })?;

            let mut messages = Vec::new();
            for row in rows {
                let (mid, role, content, created_at, payload) = row?;
                let role = Role::from_str(&role)
                    .map_err(|e| StoreError::Serialization(format!("message role: {e}")))?;
                let payload: MessagePayload = match payload {
                    Some(json) => serde_json::from_str(&json)?,
                    None => MessagePayload::default(),
                };
                messages.push(Message {
                    id: MessageId::from_raw(mid),
                    role,
                    content,
                    timestamp: parse_timestamp(&created_at, "message")?,
                    is_streaming: false,
                    logs: payload.logs,
                    opinions: payload.opinions,
                    citations: payload.citations,
                    follow_ups: payload.follow_ups,
                });
            }
            Ok(messages)
        })
    }
}
