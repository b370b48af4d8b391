use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::{db_timestamp, new_id, parse_opt_ts, parse_ts, AssistantDatabase};

/// (assistant, user) pairing that groups chats.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub assistant_id: String,
    pub user_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: String,
    pub session_id: String,
    /// External thread this chat is bound to, for thread-backed assistants.
    pub thread_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_db_str(self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw {
            "assistant" => MessageRole::Assistant,
            _ => MessageRole::User,
        }
    }
}

/// One message of a chat joined with the memory that holds its content.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationEntry {
    pub message_id: String,
    pub chat_id: String,
    pub memory_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

fn session_from_row(row: &Row<'_>) -> rusqlite::Result<Session> {
    Ok(Session {
        id: row.get(0)?,
        assistant_id: row.get(1)?,
        user_id: row.get(2)?,
        created_at: parse_ts(row.get(3)?, 3)?,
        ended_at: parse_opt_ts(row.get(4)?, 4)?,
    })
}

fn chat_from_row(row: &Row<'_>) -> rusqlite::Result<Chat> {
    Ok(Chat {
        id: row.get(0)?,
        session_id: row.get(1)?,
        thread_id: row.get(2)?,
        created_at: parse_ts(row.get(3)?, 3)?,
    })
}

pub(crate) fn insert_session(
    conn: &Connection,
    assistant_id: &str,
    user_id: Option<&str>,
) -> Result<Session> {
    let session = Session {
        id: new_id(),
        assistant_id: assistant_id.to_string(),
        user_id: user_id.map(str::to_string),
        created_at: Utc::now(),
        ended_at: None,
    };
    conn.execute(
        "INSERT INTO sessions (id, assistant_id, user_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            session.id,
            session.assistant_id,
            session.user_id,
            db_timestamp(session.created_at),
        ],
    )
    .context("Failed to insert session")?;
    Ok(session)
}

pub(crate) fn insert_chat(
    conn: &Connection,
    session_id: &str,
    thread_id: Option<&str>,
) -> Result<Chat> {
    let chat = Chat {
        id: new_id(),
        session_id: session_id.to_string(),
        thread_id: thread_id.map(str::to_string),
        created_at: Utc::now(),
    };
    conn.execute(
        "INSERT INTO chats (id, session_id, thread_id, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            chat.id,
            chat.session_id,
            chat.thread_id,
            db_timestamp(chat.created_at),
        ],
    )
    .context("Failed to insert chat")?;
    Ok(chat)
}

pub(crate) fn insert_chat_message(
    conn: &Connection,
    chat_id: &str,
    memory_id: &str,
    role: MessageRole,
) -> Result<String> {
    let id = new_id();
    conn.execute(
        "INSERT INTO chat_messages (id, chat_id, memory_id, role, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            id,
            chat_id,
            memory_id,
            role.as_db_str(),
            db_timestamp(Utc::now()),
        ],
    )
    .with_context(|| format!("Failed to insert {} message", role.as_db_str()))?;
    Ok(id)
}

pub(crate) fn bind_chat_thread(conn: &Connection, chat_id: &str, thread_id: &str) -> Result<()> {
    conn.execute(
        "UPDATE chats SET thread_id = ?1 WHERE id = ?2",
        params![thread_id, chat_id],
    )
    .context("Failed to bind chat to thread")?;
    Ok(())
}

impl AssistantDatabase {
    pub fn create_session(&self, assistant_id: &str, user_id: Option<&str>) -> Result<Session> {
        let conn = self.lock_conn()?;
        insert_session(&conn, assistant_id, user_id)
    }

    pub fn create_chat(&self, session_id: &str, thread_id: Option<&str>) -> Result<Chat> {
        let conn = self.lock_conn()?;
        insert_chat(&conn, session_id, thread_id)
    }

    pub fn get_session(&self, id: &str) -> Result<Option<Session>> {
        let conn = self.lock_conn()?;
        let session = conn
            .query_row(
                "SELECT id, assistant_id, user_id, created_at, ended_at FROM sessions WHERE id = ?1",
                [id],
                session_from_row,
            )
            .optional()?;
        Ok(session)
    }

    /// Stamp a session as ended. Ended sessions count as expired.
    pub fn end_session(&self, id: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE sessions SET ended_at = ?1 WHERE id = ?2 AND ended_at IS NULL",
            params![db_timestamp(Utc::now()), id],
        )?;
        Ok(changed > 0)
    }

    pub fn get_chat(&self, id: &str) -> Result<Option<Chat>> {
        let conn = self.lock_conn()?;
        let chat = conn
            .query_row(
                "SELECT id, session_id, thread_id, created_at FROM chats WHERE id = ?1",
                [id],
                chat_from_row,
            )
            .optional()?;
        Ok(chat)
    }

    pub fn latest_chat_for_session(&self, session_id: &str) -> Result<Option<Chat>> {
        let conn = self.lock_conn()?;
        let chat = conn
            .query_row(
                "SELECT id, session_id, thread_id, created_at FROM chats
                 WHERE session_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT 1",
                [session_id],
                chat_from_row,
            )
            .optional()?;
        Ok(chat)
    }

    /// Most recent chat bound to an external thread.
    pub fn find_chat_by_thread(&self, thread_id: &str) -> Result<Option<Chat>> {
        let conn = self.lock_conn()?;
        let chat = conn
            .query_row(
                "SELECT id, session_id, thread_id, created_at FROM chats
                 WHERE thread_id = ?1
                 ORDER BY created_at DESC, rowid DESC
                 LIMIT 1",
                [thread_id],
                chat_from_row,
            )
            .optional()?;
        Ok(chat)
    }

    pub fn bind_chat_thread(&self, chat_id: &str, thread_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        bind_chat_thread(&conn, chat_id, thread_id)
    }

    pub fn add_chat_message(
        &self,
        chat_id: &str,
        memory_id: &str,
        role: MessageRole,
    ) -> Result<String> {
        let conn = self.lock_conn()?;
        insert_chat_message(&conn, chat_id, memory_id, role)
    }

    /// Messages of a chat in chronological order.
    pub fn chat_history(&self, chat_id: &str) -> Result<Vec<ConversationEntry>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT cm.id, cm.chat_id, cm.memory_id, cm.role, m.content, cm.created_at
             FROM chat_messages cm
             JOIN memories m ON m.id = cm.memory_id
             WHERE cm.chat_id = ?1
             ORDER BY cm.created_at ASC, cm.rowid ASC",
        )?;
        let entries = stmt
            .query_map([chat_id], |row| {
                let role: String = row.get(3)?;
                Ok(ConversationEntry {
                    message_id: row.get(0)?,
                    chat_id: row.get(1)?,
                    memory_id: row.get(2)?,
                    role: MessageRole::from_db(&role),
                    content: row.get(4)?,
                    created_at: parse_ts(row.get(5)?, 5)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    #[cfg(test)]
    pub(crate) fn count_rows(&self, table: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| row.get(0))?;
        Ok(count as usize)
    }

    #[cfg(test)]
    pub(crate) fn backdate_chat(&self, chat_id: &str, created_at: DateTime<Utc>) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE chats SET created_at = ?1 WHERE id = ?2",
            params![db_timestamp(created_at), chat_id],
        )?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn backdate_session(
        &self,
        session_id: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "UPDATE sessions SET created_at = ?1 WHERE id = ?2",
            params![db_timestamp(created_at), session_id],
        )?;
        Ok(())
    }
}
