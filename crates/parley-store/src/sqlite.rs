use crate::document::DocumentStore;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use parley_core::{ChatMessage, ConnectionRecord, Conversation, ParleyError, ParleyResult};
use parley_training::TrainingRule;
use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use std::path::Path;
use uuid::Uuid;

/// SQLite-backed document store.
///
/// Every collection is a table of JSON documents plus the columns it is
/// queried by. Uses a `Mutex<Connection>`; the database is created and
/// migrated on open.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

fn db_err(e: rusqlite::Error) -> ParleyError {
    ParleyError::Store(e.to_string())
}

/// Fixed-width RFC 3339 so that text ordering matches time ordering.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_all<T: DeserializeOwned>(rows: Vec<String>) -> ParleyResult<Vec<T>> {
    rows.iter()
        .map(|data| serde_json::from_str(data).map_err(ParleyError::from))
        .collect()
}

impl SqliteStore {
    /// Open (or create) a database at `path`.
    pub fn open(path: &Path) -> ParleyResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database.
    pub fn open_memory() -> ParleyResult<Self> {
        let conn = Connection::open_in_memory().map_err(db_err)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> ParleyResult<()> {
        let conn = self.conn.lock();
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS connections (
                id          TEXT PRIMARY KEY,
                data        TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS conversations (
                id              TEXT PRIMARY KEY,
                connection_id   TEXT NOT NULL,
                contact         TEXT NOT NULL,
                last_message_at TEXT,
                data            TEXT NOT NULL,
                UNIQUE (connection_id, contact)
            );

            CREATE TABLE IF NOT EXISTS messages (
                id              TEXT PRIMARY KEY,
                conversation_id TEXT NOT NULL,
                timestamp       TEXT NOT NULL,
                deleted         INTEGER NOT NULL DEFAULT 0,
                data            TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_messages_conversation
                ON messages (conversation_id, timestamp);

            CREATE TABLE IF NOT EXISTS training_rules (
                id              TEXT PRIMARY KEY,
                connection_id   TEXT NOT NULL,
                data            TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_training_rules_connection
                ON training_rules (connection_id);
            ",
        )
        .map_err(db_err)
    }

    fn conversation_by_pair(
        conn: &Connection,
        connection_id: &str,
        contact: &str,
    ) -> ParleyResult<Option<Conversation>> {
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM conversations WHERE connection_id = ?1 AND contact = ?2",
                params![connection_id, contact],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        data.map(|d| serde_json::from_str(&d).map_err(ParleyError::from))
            .transpose()
    }

    fn write_conversation(conn: &Connection, conversation: &Conversation) -> ParleyResult<usize> {
        let data = serde_json::to_string(conversation)?;
        conn.execute(
            "UPDATE conversations SET data = ?2, last_message_at = ?3 WHERE id = ?1",
            params![
                conversation.id.to_string(),
                data,
                conversation.last_message_at.map(ts)
            ],
        )
        .map_err(db_err)
    }
}

#[async_trait]
impl DocumentStore for SqliteStore {
    async fn upsert_connection(&self, record: &ConnectionRecord) -> ParleyResult<()> {
        let data = serde_json::to_string(record)?;
        self.conn
            .lock()
            .execute(
                "INSERT INTO connections (id, data) VALUES (?1, ?2)
                 ON CONFLICT(id) DO UPDATE SET data = excluded.data",
                params![record.id, data],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_connection(&self, id: &str) -> ParleyResult<Option<ConnectionRecord>> {
        let data: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT data FROM connections WHERE id = ?1",
                params![id],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        data.map(|d| serde_json::from_str(&d).map_err(ParleyError::from))
            .transpose()
    }

    async fn list_connections(&self) -> ParleyResult<Vec<ConnectionRecord>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare("SELECT data FROM connections ORDER BY id")
                .map_err(db_err)?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows
        };
        parse_all(rows)
    }

    async fn get_or_create_conversation(
        &self,
        connection_id: &str,
        contact: &str,
        display_name: Option<&str>,
    ) -> ParleyResult<Conversation> {
        let mut fresh = Conversation::new(connection_id, contact);
        fresh.display_name = display_name.map(str::to_string);
        let data = serde_json::to_string(&fresh)?;

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conversations (id, connection_id, contact, last_message_at, data)
             VALUES (?1, ?2, ?3, NULL, ?4)
             ON CONFLICT DO NOTHING",
            params![fresh.id.to_string(), connection_id, contact, data],
        )
        .map_err(db_err)?;

        let mut conversation = Self::conversation_by_pair(&conn, connection_id, contact)?
            .ok_or_else(|| {
                ParleyError::Store(format!(
                    "conversation for {connection_id}/{contact} vanished after insert"
                ))
            })?;

        // Keep the contact's push name current.
        if let Some(name) = display_name {
            if conversation.display_name.as_deref() != Some(name) {
                conversation.display_name = Some(name.to_string());
                conversation.updated_at = Utc::now();
                Self::write_conversation(&conn, &conversation)?;
            }
        }
        Ok(conversation)
    }

    async fn get_conversation(&self, id: Uuid) -> ParleyResult<Option<Conversation>> {
        let data: Option<String> = self
            .conn
            .lock()
            .query_row(
                "SELECT data FROM conversations WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        data.map(|d| serde_json::from_str(&d).map_err(ParleyError::from))
            .transpose()
    }

    async fn modify_conversation(
        &self,
        id: Uuid,
        change: &mut (dyn for<'c> FnMut(&'c mut Conversation) -> bool + Send),
    ) -> ParleyResult<Option<Conversation>> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM conversations WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(data) = data else {
            return Ok(None);
        };
        let mut conversation: Conversation = serde_json::from_str(&data)?;
        if change(&mut conversation) {
            Self::write_conversation(&conn, &conversation)?;
        }
        Ok(Some(conversation))
    }

    async fn list_conversations(&self, connection_id: &str) -> ParleyResult<Vec<Conversation>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT data FROM conversations WHERE connection_id = ?1
                     ORDER BY last_message_at IS NULL, last_message_at DESC",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![connection_id], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows
        };
        parse_all(rows)
    }

    async fn append_message(&self, message: &ChatMessage) -> ParleyResult<()> {
        let data = serde_json::to_string(message)?;
        self.conn
            .lock()
            .execute(
                "INSERT INTO messages (id, conversation_id, timestamp, deleted, data)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    message.id.to_string(),
                    message.conversation_id.to_string(),
                    ts(message.timestamp),
                    message.deleted_at.is_some(),
                    data
                ],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn recent_messages(
        &self,
        conversation_id: Uuid,
        limit: usize,
    ) -> ParleyResult<Vec<ChatMessage>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare(
                    "SELECT data FROM messages
                     WHERE conversation_id = ?1 AND deleted = 0
                     ORDER BY timestamp DESC, rowid DESC
                     LIMIT ?2",
                )
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![conversation_id.to_string(), limit], |row| {
                    row.get::<_, String>(0)
                })
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows
        };
        let mut messages: Vec<ChatMessage> = parse_all(rows)?;
        messages.reverse();
        Ok(messages)
    }

    async fn soft_delete_message(&self, id: Uuid) -> ParleyResult<bool> {
        let conn = self.conn.lock();
        let data: Option<String> = conn
            .query_row(
                "SELECT data FROM messages WHERE id = ?1 AND deleted = 0",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(db_err)?;
        let Some(data) = data else {
            return Ok(false);
        };
        let mut message: ChatMessage = serde_json::from_str(&data)?;
        message.deleted_at = Some(Utc::now());
        let data = serde_json::to_string(&message)?;
        conn.execute(
            "UPDATE messages SET deleted = 1, data = ?2 WHERE id = ?1",
            params![id.to_string(), data],
        )
        .map_err(db_err)?;
        Ok(true)
    }

    async fn upsert_training_rule(&self, rule: &TrainingRule) -> ParleyResult<()> {
        rule.validate()?;
        let data = serde_json::to_string(rule)?;
        self.conn
            .lock()
            .execute(
                "INSERT INTO training_rules (id, connection_id, data) VALUES (?1, ?2, ?3)
                 ON CONFLICT(id) DO UPDATE SET
                    connection_id = excluded.connection_id,
                    data = excluded.data",
                params![rule.id, rule.connection_id, data],
            )
            .map_err(db_err)?;
        Ok(())
    }

    async fn list_training_rules(&self, connection_id: &str) -> ParleyResult<Vec<TrainingRule>> {
        let rows = {
            let conn = self.conn.lock();
            let mut stmt = conn
                .prepare("SELECT data FROM training_rules WHERE connection_id = ?1 ORDER BY id")
                .map_err(db_err)?;
            let rows = stmt
                .query_map(params![connection_id], |row| row.get::<_, String>(0))
                .map_err(db_err)?
                .collect::<Result<Vec<_>, _>>()
                .map_err(db_err)?;
            rows
        };
        parse_all(rows)
    }

    async fn delete_training_rule(&self, id: &str) -> ParleyResult<bool> {
        let deleted = self
            .conn
            .lock()
            .execute("DELETE FROM training_rules WHERE id = ?1", params![id])
            .map_err(db_err)?;
        Ok(deleted > 0)
    }
}
