//! SQLite-backed store for assistants, memories, conversations, tasks and feedback.
//!
//! Each submodule adds an `impl AssistantDatabase` block for one table family.
//! Statements that take part in turn persistence are also exposed as free
//! functions over `&Connection` so they can run inside one transaction.

pub mod assistants;
pub mod conversations;
pub mod memories;
pub mod tasks;

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

pub use assistants::{Assistant, AssistantType, MemoryFocusRule, NewAssistant};
pub use conversations::{Chat, ConversationEntry, MessageRole, Session};
pub use memories::{Memory, MemoryType, Relationship, Tag};
pub use tasks::{Feedback, FeedbackStats, Task, TaskCounts, TaskStatus};

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

pub struct AssistantDatabase {
    conn: Mutex<Connection>,
}

impl AssistantDatabase {
    /// Helper to lock the connection
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| anyhow::anyhow!("Database lock poisoned: {}", e))
    }

    /// Create or open the database
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {:?}", path))?;
        Self::from_connection(conn)
    }

    /// Open a private in-memory database (for tests and dry runs).
    pub fn in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.ensure_schema()?;
        Ok(db)
    }

    /// Run `f` inside a single transaction, committing only if it succeeds.
    pub fn with_transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.lock_conn()?;
        let tx = conn.transaction()?;
        let value = f(&tx)?;
        tx.commit().context("Failed to commit transaction")?;
        Ok(value)
    }

    /// Create the database schema
    fn ensure_schema(&self) -> Result<()> {
        let conn = self.lock_conn()?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS assistants (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                assistant_type TEXT NOT NULL,
                model TEXT,
                instructions TEXT,
                external_assistant_id TEXT,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        // At most one focus rule per assistant.
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS memory_focus_rules (
                id TEXT PRIMARY KEY,
                assistant_id TEXT NOT NULL UNIQUE REFERENCES assistants(id),
                max_results INTEGER NOT NULL DEFAULT 5,
                relationship_types_json TEXT NOT NULL DEFAULT '[]',
                priority_tags_json TEXT NOT NULL DEFAULT '[]',
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS memories (
                id TEXT PRIMARY KEY,
                content TEXT NOT NULL,
                memory_type TEXT NOT NULL,
                task_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            [],
        )?;

        // Tag identity is the name.
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS tags (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        // Link tables carry no cascades: deleting a memory leaves its links.
        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS memory_tags (
                memory_id TEXT NOT NULL,
                tag_id TEXT NOT NULL,
                PRIMARY KEY (memory_id, tag_id)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS assistant_tags (
                assistant_id TEXT NOT NULL,
                tag_id TEXT NOT NULL,
                PRIMARY KEY (assistant_id, tag_id)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS owned_memories (
                assistant_id TEXT NOT NULL,
                memory_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (assistant_id, memory_id)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS focused_memories (
                rule_id TEXT NOT NULL,
                memory_id TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (rule_id, memory_id)
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                assistant_id TEXT NOT NULL,
                user_id TEXT,
                created_at TEXT NOT NULL,
                ended_at TEXT
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS chats (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id),
                thread_id TEXT,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS chat_messages (
                id TEXT PRIMARY KEY,
                chat_id TEXT NOT NULL REFERENCES chats(id),
                memory_id TEXT NOT NULL,
                role TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                assistant_id TEXT NOT NULL,
                description TEXT NOT NULL,
                status TEXT NOT NULL,
                output TEXT,
                error TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS relationships (
                id TEXT PRIMARY KEY,
                source_type TEXT NOT NULL,
                source_id TEXT NOT NULL,
                target_type TEXT NOT NULL,
                target_id TEXT NOT NULL,
                relationship TEXT NOT NULL,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            r#"CREATE TABLE IF NOT EXISTS feedback (
                id TEXT PRIMARY KEY,
                task_id TEXT,
                assistant_id TEXT,
                rating INTEGER NOT NULL CHECK (rating BETWEEN 1 AND 5),
                comment TEXT,
                created_at TEXT NOT NULL
            )"#,
            [],
        )?;

        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chats_session_created ON chats(session_id, created_at DESC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chats_thread ON chats(thread_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_chat_messages_chat_created ON chat_messages(chat_id, created_at ASC)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_tasks_assistant_status ON tasks(assistant_id, status)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_feedback_assistant ON feedback(assistant_id)",
            [],
        )?;
        conn.execute(
            "CREATE INDEX IF NOT EXISTS idx_relationships_source ON relationships(source_type, source_id)",
            [],
        )?;

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn execute_batch_for_test(&self, sql: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute_batch(sql)?;
        Ok(())
    }
}

/// Fixed-width UTC timestamp so lexical order matches chronological order.
pub(crate) fn db_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

pub(crate) fn parse_ts(
    value: String,
    column: usize,
) -> std::result::Result<DateTime<Utc>, rusqlite::Error> {
    DateTime::parse_from_rfc3339(&value)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                column,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })
}

pub(crate) fn parse_opt_ts(
    value: Option<String>,
    column: usize,
) -> std::result::Result<Option<DateTime<Utc>>, rusqlite::Error> {
    value.map(|v| parse_ts(v, column)).transpose()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_is_idempotent_across_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("mindkeep.db");

        let db = AssistantDatabase::new(&path).expect("db init");
        let assistant = db
            .create_assistant(&NewAssistant::completion("Archivist", "gpt-4o-mini"))
            .expect("create assistant");
        drop(db);

        let reopened = AssistantDatabase::new(&path).expect("db reopen");
        let loaded = reopened
            .get_assistant(&assistant.id)
            .expect("get assistant")
            .expect("assistant survives reopen");
        assert_eq!(loaded.name, "Archivist");
    }

    #[test]
    fn timestamps_sort_lexically_in_time_order() {
        let early = DateTime::parse_from_rfc3339("2024-01-01T10:00:00Z")
            .expect("parse")
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2024-01-01T10:00:00.5Z")
            .expect("parse")
            .with_timezone(&Utc);
        assert!(db_timestamp(early) < db_timestamp(late));
        assert_eq!(db_timestamp(early).len(), db_timestamp(late).len());
        assert_eq!(
            parse_ts(db_timestamp(early), 0).expect("roundtrip"),
            early
        );
    }

    #[test]
    fn failed_transaction_rolls_back() {
        let db = AssistantDatabase::in_memory().expect("db init");
        let result: Result<()> = db.with_transaction(|tx| {
            memories::insert_memory(tx, "draft", MemoryType::Knowledge, None)?;
            anyhow::bail!("abort");
        });
        assert!(result.is_err());

        let found = db.search_memories("draft", &[]).expect("search");
        assert!(found.is_empty());
    }
}
