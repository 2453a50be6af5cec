use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::StoreError;

pub type Result<T> = std::result::Result<T, StoreError>;

pub const DEFAULT_TITLE: &str = "New Chat";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    fn parse(raw: &str) -> Role {
        match raw {
            "system" => Role::System,
            "user" => Role::User,
            _ => Role::Assistant,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    pub title: String,
    /// Empty when no downloaded model is selected.
    pub model_id: String,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub seq: i64,
    pub role: Role,
    pub text: String,
    pub is_error: bool,
    pub created_at: String,
}

pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS conversations (
                id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                model_id TEXT NOT NULL DEFAULT '',
                created_at TEXT NOT NULL
            )",
            [],
        )?;

        conn.execute(
            "CREATE TABLE IF NOT EXISTS messages (
                id TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
                seq INTEGER NOT NULL,
                role TEXT NOT NULL,
                text TEXT NOT NULL,
                is_error INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL
            )",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_messages_conversation
             ON messages(conversation_id, seq)",
            [],
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ── conversations ──

    pub fn create_conversation(&self, title: Option<&str>, model_id: &str) -> Result<Conversation> {
        let conversation = Conversation {
            id: uuid::Uuid::new_v4().to_string(),
            title: title
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or(DEFAULT_TITLE)
                .to_string(),
            model_id: model_id.to_string(),
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conversations (id, title, model_id, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![
                conversation.id,
                conversation.title,
                conversation.model_id,
                conversation.created_at
            ],
        )?;
        Ok(conversation)
    }

    /// Newest first.
    pub fn list_conversations(&self) -> Result<Vec<Conversation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, title, model_id, created_at FROM conversations
             ORDER BY rowid DESC",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(Conversation {
                id: row.get(0)?,
                title: row.get(1)?,
                model_id: row.get(2)?,
                created_at: row.get(3)?,
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    pub fn conversation(&self, id: &str) -> Result<Option<Conversation>> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT id, title, model_id, created_at FROM conversations WHERE id = ?1",
                [id],
                |row| {
                    Ok(Conversation {
                        id: row.get(0)?,
                        title: row.get(1)?,
                        model_id: row.get(2)?,
                        created_at: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(found)
    }

    /// Deletes the conversation and, by cascade, its messages.
    pub fn delete_conversation(&self, id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute("DELETE FROM conversations WHERE id = ?1", [id])?;
        Ok(n > 0)
    }

    pub fn rename(&self, id: &str, title: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE conversations SET title = ?1 WHERE id = ?2",
            params![title, id],
        )?;
        Ok(n > 0)
    }

    pub fn set_model(&self, id: &str, model_id: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE conversations SET model_id = ?1 WHERE id = ?2",
            params![model_id, id],
        )?;
        Ok(n > 0)
    }

    /// Blank out model ids that are not in `valid_ids`. Returns how many
    /// conversations changed.
    pub fn clear_model_references(&self, valid_ids: &[String]) -> Result<usize> {
        let conn = self.conn.lock();
        let tx = conn.unchecked_transaction()?;
        let stale: Vec<String> = {
            let mut stmt =
                tx.prepare("SELECT id, model_id FROM conversations WHERE model_id != ''")?;
            let rows = stmt.query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            let stale: Vec<String> = rows
                .filter_map(|r| r.ok())
                .filter(|(_, model)| !valid_ids.contains(model))
                .map(|(id, _)| id)
                .collect();
            stale
        };
        for id in &stale {
            tx.execute("UPDATE conversations SET model_id = '' WHERE id = ?1", [id])?;
        }
        tx.commit()?;
        Ok(stale.len())
    }

    // ── messages ──

    /// `None` when the conversation no longer exists.
    pub fn append_message(
        &self,
        conversation_id: &str,
        role: Role,
        text: &str,
        is_error: bool,
    ) -> Result<Option<Message>> {
        let conn = self.conn.lock();
        let exists = conn
            .query_row(
                "SELECT 1 FROM conversations WHERE id = ?1",
                [conversation_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if !exists {
            return Ok(None);
        }
        let seq: i64 = conn.query_row(
            "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE conversation_id = ?1",
            [conversation_id],
            |row| row.get(0),
        )?;
        let message = Message {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.to_string(),
            seq,
            role,
            text: text.to_string(),
            is_error,
            created_at: chrono::Utc::now().to_rfc3339(),
        };
        conn.execute(
            "INSERT INTO messages (id, conversation_id, seq, role, text, is_error, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                message.id,
                message.conversation_id,
                message.seq,
                message.role.as_str(),
                message.text,
                message.is_error as i32,
                message.created_at,
            ],
        )?;
        Ok(Some(message))
    }

    /// `false` when the message (or its conversation) is gone.
    pub fn append_to_message(&self, message_id: &str, text: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE messages SET text = text || ?1 WHERE id = ?2",
            params![text, message_id],
        )?;
        Ok(n > 0)
    }

    pub fn replace_message_text(
        &self,
        message_id: &str,
        text: &str,
        is_error: bool,
    ) -> Result<bool> {
        let conn = self.conn.lock();
        let n = conn.execute(
            "UPDATE messages SET text = ?1, is_error = ?2 WHERE id = ?3",
            params![text, is_error as i32, message_id],
        )?;
        Ok(n > 0)
    }

    pub fn message(&self, message_id: &str) -> Result<Option<Message>> {
        let conn = self.conn.lock();
        let found = conn
            .query_row(
                "SELECT id, conversation_id, seq, role, text, is_error, created_at
                 FROM messages WHERE id = ?1",
                [message_id],
                message_from_row,
            )
            .optional()?;
        Ok(found)
    }

    /// Whole transcript in order.
    pub fn messages(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, seq, role, text, is_error, created_at
             FROM messages WHERE conversation_id = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map([conversation_id], message_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }

    /// The last `limit` messages, oldest first.
    pub fn recent_messages(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, seq, role, text, is_error, created_at FROM (
                SELECT * FROM messages WHERE conversation_id = ?1 ORDER BY seq DESC LIMIT ?2
             ) ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![conversation_id, limit as i64], message_from_row)?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Message> {
    Ok(Message {
        id: row.get(0)?,
        conversation_id: row.get(1)?,
        seq: row.get(2)?,
        role: Role::parse(&row.get::<_, String>(3)?),
        text: row.get(4)?,
        is_error: row.get::<_, i32>(5)? != 0,
        created_at: row.get(6)?,
    })
}
