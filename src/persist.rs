//! Records one conversation turn across sessions, chats, memories, messages and tags.

use anyhow::Result;
use rusqlite::Connection;
use serde::Serialize;

use crate::database::conversations::{bind_chat_thread, insert_chat, insert_chat_message, insert_session};
use crate::database::memories::{insert_memory, own_memory_in, tag_memory_in};
use crate::database::{AssistantDatabase, Chat, Memory, MemoryType, MessageRole, Session, Tag};
use crate::error::PersistenceWarning;
use crate::lifecycle::ResolvedConversation;

/// Write primitives a turn needs, over either the shared handle or one transaction.
trait TurnStore {
    fn insert_session(&self, assistant_id: &str, user_id: Option<&str>) -> Result<Session>;
    fn insert_chat(&self, session_id: &str, thread_id: Option<&str>) -> Result<Chat>;
    fn bind_chat_thread(&self, chat_id: &str, thread_id: &str) -> Result<()>;
    fn insert_memory(&self, content: &str, kind: MemoryType, task_id: Option<&str>) -> Result<Memory>;
    fn insert_message(&self, chat_id: &str, memory_id: &str, role: MessageRole) -> Result<String>;
    fn tag_memory(&self, memory_id: &str, tag: &str) -> Result<Tag>;
    fn own_memory(&self, assistant_id: &str, memory_id: &str) -> Result<()>;
}

impl TurnStore for AssistantDatabase {
    fn insert_session(&self, assistant_id: &str, user_id: Option<&str>) -> Result<Session> {
        self.create_session(assistant_id, user_id)
    }

    fn insert_chat(&self, session_id: &str, thread_id: Option<&str>) -> Result<Chat> {
        self.create_chat(session_id, thread_id)
    }

    fn bind_chat_thread(&self, chat_id: &str, thread_id: &str) -> Result<()> {
        AssistantDatabase::bind_chat_thread(self, chat_id, thread_id)
    }

    fn insert_memory(&self, content: &str, kind: MemoryType, task_id: Option<&str>) -> Result<Memory> {
        self.create_memory(content, kind, task_id)
    }

    fn insert_message(&self, chat_id: &str, memory_id: &str, role: MessageRole) -> Result<String> {
        self.add_chat_message(chat_id, memory_id, role)
    }

    fn tag_memory(&self, memory_id: &str, tag: &str) -> Result<Tag> {
        AssistantDatabase::tag_memory(self, memory_id, tag)
    }

    fn own_memory(&self, assistant_id: &str, memory_id: &str) -> Result<()> {
        AssistantDatabase::own_memory(self, assistant_id, memory_id)
    }
}

impl TurnStore for Connection {
    fn insert_session(&self, assistant_id: &str, user_id: Option<&str>) -> Result<Session> {
        insert_session(self, assistant_id, user_id)
    }

    fn insert_chat(&self, session_id: &str, thread_id: Option<&str>) -> Result<Chat> {
        insert_chat(self, session_id, thread_id)
    }

    fn bind_chat_thread(&self, chat_id: &str, thread_id: &str) -> Result<()> {
        bind_chat_thread(self, chat_id, thread_id)
    }

    fn insert_memory(&self, content: &str, kind: MemoryType, task_id: Option<&str>) -> Result<Memory> {
        insert_memory(self, content, kind, task_id)
    }

    fn insert_message(&self, chat_id: &str, memory_id: &str, role: MessageRole) -> Result<String> {
        insert_chat_message(self, chat_id, memory_id, role)
    }

    fn tag_memory(&self, memory_id: &str, tag: &str) -> Result<Tag> {
        tag_memory_in(self, memory_id, tag)
    }

    fn own_memory(&self, assistant_id: &str, memory_id: &str) -> Result<()> {
        own_memory_in(self, assistant_id, memory_id)
    }
}

#[derive(Debug, Clone)]
pub struct TurnRecord<'a> {
    pub assistant_id: &'a str,
    pub user_id: Option<&'a str>,
    pub prompt: &'a str,
    pub reply: &'a str,
    pub task_id: &'a str,
}

#[derive(Debug, Clone, Serialize)]
pub struct PersistedTurn {
    pub session_id: String,
    pub chat_id: String,
    pub user_memory_id: String,
    pub assistant_memory_id: String,
    pub warnings: Vec<PersistenceWarning>,
}

/// Provenance tags attached to each turn memory.
pub fn provenance_tags(chat_id: &str, assistant_id: &str, role: MessageRole) -> [String; 3] {
    [
        format!("chat:{}", chat_id),
        format!("assistant:{}", assistant_id),
        format!("role:{}", role.as_db_str()),
    ]
}

pub struct TurnPersister<'a> {
    db: &'a AssistantDatabase,
    atomic: bool,
}

impl<'a> TurnPersister<'a> {
    pub fn new(db: &'a AssistantDatabase, atomic: bool) -> Self {
        Self { db, atomic }
    }

    /// Write the turn in the order session, chat, user memory, user message,
    /// assistant memory, assistant message, then tags and owned links.
    ///
    /// Best-effort mode applies each write on its own; tag, owned-link and
    /// thread-binding failures become warnings and earlier writes stay. Atomic
    /// mode runs everything in one transaction and fails on any error.
    pub fn persist(&self, conversation: &ResolvedConversation, turn: &TurnRecord<'_>) -> Result<PersistedTurn> {
        if self.atomic {
            self.db
                .with_transaction(|tx| write_turn(&**tx, conversation, turn, true))
        } else {
            write_turn(self.db, conversation, turn, false)
        }
    }
}

fn write_turn<S: TurnStore + ?Sized>(
    store: &S,
    conversation: &ResolvedConversation,
    turn: &TurnRecord<'_>,
    strict: bool,
) -> Result<PersistedTurn> {
    let mut warnings = Vec::new();
    let mut secondary = |step: String, result: Result<()>| -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if strict => Err(e.context(step)),
            Err(e) => {
                tracing::warn!("Turn write '{}' failed: {:#}", step, e);
                warnings.push(PersistenceWarning::new(step, format!("{:#}", e)));
                Ok(())
            }
        }
    };

    let session_id = match &conversation.session_id {
        Some(id) => id.clone(),
        None => store.insert_session(turn.assistant_id, turn.user_id)?.id,
    };

    let chat_id = match &conversation.chat_id {
        Some(id) => {
            if let (true, Some(thread_id)) = (conversation.bind_thread, conversation.thread_id.as_deref()) {
                secondary(
                    format!("bind chat {} to thread", id),
                    store.bind_chat_thread(id, thread_id),
                )?;
            }
            id.clone()
        }
        None => {
            store
                .insert_chat(&session_id, conversation.thread_id.as_deref())?
                .id
        }
    };

    let user_memory = store.insert_memory(turn.prompt, MemoryType::Prompt, None)?;
    store.insert_message(&chat_id, &user_memory.id, MessageRole::User)?;
    let assistant_memory = store.insert_memory(turn.reply, MemoryType::Session, Some(turn.task_id))?;
    store.insert_message(&chat_id, &assistant_memory.id, MessageRole::Assistant)?;

    for (memory, role) in [
        (&user_memory, MessageRole::User),
        (&assistant_memory, MessageRole::Assistant),
    ] {
        for tag in provenance_tags(&chat_id, turn.assistant_id, role) {
            secondary(
                format!("tag {} memory with {}", role.as_db_str(), tag),
                store.tag_memory(&memory.id, &tag).map(|_| ()),
            )?;
        }
    }

    for memory in [&user_memory, &assistant_memory] {
        secondary(
            format!("own memory {}", memory.id),
            store.own_memory(turn.assistant_id, &memory.id),
        )?;
    }

    Ok(PersistedTurn {
        session_id,
        chat_id,
        user_memory_id: user_memory.id,
        assistant_memory_id: assistant_memory.id,
        warnings,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::NewAssistant;

    fn seeded() -> (AssistantDatabase, String) {
        let db = AssistantDatabase::in_memory().expect("db init");
        let assistant = db
            .create_assistant(&NewAssistant::completion("Keeper", "gpt-4o-mini"))
            .expect("assistant");
        (db, assistant.id)
    }

    fn record<'a>(assistant_id: &'a str, task_id: &'a str) -> TurnRecord<'a> {
        TurnRecord {
            assistant_id,
            user_id: Some("user-7"),
            prompt: "what is wal mode?",
            reply: "write-ahead logging",
            task_id,
        }
    }

    #[test]
    fn fresh_turn_creates_all_records_in_order() {
        let (db, assistant_id) = seeded();
        let task = db.open_task(&assistant_id, "p").expect("task");
        let persisted = TurnPersister::new(&db, false)
            .persist(&ResolvedConversation::default(), &record(&assistant_id, &task.id))
            .expect("persist");

        assert!(persisted.warnings.is_empty());
        assert_eq!(db.count_rows("sessions").expect("count"), 1);
        assert_eq!(db.count_rows("chats").expect("count"), 1);
        assert_eq!(db.count_rows("memories").expect("count"), 2);
        assert_eq!(db.count_rows("chat_messages").expect("count"), 2);

        let session = db
            .get_session(&persisted.session_id)
            .expect("query")
            .expect("session");
        assert_eq!(session.user_id.as_deref(), Some("user-7"));

        let history = db.chat_history(&persisted.chat_id).expect("history");
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[1].content, "write-ahead logging");

        let reply = db
            .get_memory(&persisted.assistant_memory_id)
            .expect("query")
            .expect("memory");
        assert_eq!(reply.task_id.as_deref(), Some(task.id.as_str()));

        let tags = db
            .memory_tag_names(&persisted.assistant_memory_id)
            .expect("tags");
        assert_eq!(
            tags,
            vec![
                format!("assistant:{}", assistant_id),
                format!("chat:{}", persisted.chat_id),
                "role:assistant".to_string(),
            ]
        );
        let owned = db.owned_memory_ids(&assistant_id).expect("owned");
        assert!(owned.contains(&persisted.user_memory_id));
        assert!(owned.contains(&persisted.assistant_memory_id));
    }

    #[test]
    fn existing_chat_is_reused_and_new_chat_gets_thread() {
        let (db, assistant_id) = seeded();
        let session = db.create_session(&assistant_id, None).expect("session");
        let chat = db.create_chat(&session.id, None).expect("chat");

        let persisted = TurnPersister::new(&db, false)
            .persist(
                &ResolvedConversation {
                    session_id: Some(session.id.clone()),
                    chat_id: Some(chat.id.clone()),
                    ..Default::default()
                },
                &record(&assistant_id, "t1"),
            )
            .expect("persist");
        assert_eq!(persisted.chat_id, chat.id);
        assert_eq!(db.count_rows("sessions").expect("count"), 1);

        let persisted = TurnPersister::new(&db, false)
            .persist(
                &ResolvedConversation {
                    session_id: Some(session.id.clone()),
                    thread_id: Some("thread_9".to_string()),
                    ..Default::default()
                },
                &record(&assistant_id, "t2"),
            )
            .expect("persist");
        let created = db
            .get_chat(&persisted.chat_id)
            .expect("query")
            .expect("chat");
        assert_eq!(created.session_id, session.id);
        assert_eq!(created.thread_id.as_deref(), Some("thread_9"));
    }

    #[test]
    fn tag_failures_are_warnings_in_best_effort_mode() {
        let (db, assistant_id) = seeded();
        db.execute_batch_for_test(
            "CREATE TRIGGER no_tags BEFORE INSERT ON memory_tags
             BEGIN SELECT RAISE(ABORT, 'tag writes disabled'); END;",
        )
        .expect("trigger");

        let persisted = TurnPersister::new(&db, false)
            .persist(&ResolvedConversation::default(), &record(&assistant_id, "t"))
            .expect("turn still persisted");
        assert_eq!(persisted.warnings.len(), 6);
        assert!(persisted.warnings[0].detail.contains("tag writes disabled"));
        assert_eq!(db.count_rows("chat_messages").expect("count"), 2);
    }

    #[test]
    fn atomic_mode_rolls_back_everything_on_failure() {
        let (db, assistant_id) = seeded();
        db.execute_batch_for_test(
            "CREATE TRIGGER no_owned BEFORE INSERT ON owned_memories
             BEGIN SELECT RAISE(ABORT, 'owned writes disabled'); END;",
        )
        .expect("trigger");

        let err = TurnPersister::new(&db, true)
            .persist(&ResolvedConversation::default(), &record(&assistant_id, "t"))
            .unwrap_err();
        assert!(format!("{:#}", err).contains("owned writes disabled"));
        for table in ["sessions", "chats", "memories", "chat_messages", "memory_tags", "tags"] {
            assert_eq!(db.count_rows(table).expect("count"), 0, "{} not rolled back", table);
        }
    }

    #[test]
    fn unbound_chat_is_bound_to_reported_thread() {
        let (db, assistant_id) = seeded();
        let session = db.create_session(&assistant_id, None).expect("session");
        let chat = db.create_chat(&session.id, None).expect("chat");

        TurnPersister::new(&db, true)
            .persist(
                &ResolvedConversation {
                    session_id: Some(session.id.clone()),
                    chat_id: Some(chat.id.clone()),
                    thread_id: Some("thread_1".to_string()),
                    bind_thread: true,
                    history: Vec::new(),
                },
                &record(&assistant_id, "t"),
            )
            .expect("persist");
        let bound = db.find_chat_by_thread("thread_1").expect("query").expect("chat");
        assert_eq!(bound.id, chat.id);
    }
}
