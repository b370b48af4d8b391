//! Session and chat continuity for incoming prompts.

use chrono::{DateTime, Duration, Utc};

use crate::database::{AssistantDatabase, Chat, ConversationEntry, Session};
use crate::error::EngineError;

/// Fixed TTL measured from creation, not from last activity.
#[derive(Debug, Clone, Copy)]
pub struct ExpiryPolicy {
    ttl: Duration,
}

impl Default for ExpiryPolicy {
    fn default() -> Self {
        Self::from_hours(24)
    }
}

impl ExpiryPolicy {
    pub fn from_hours(hours: i64) -> Self {
        Self {
            ttl: Duration::hours(hours.max(0)),
        }
    }

    pub fn is_expired(&self, created_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        now - created_at > self.ttl
    }

    pub fn chat_expired(&self, chat: &Chat, now: DateTime<Utc>) -> bool {
        self.is_expired(chat.created_at, now)
    }

    pub fn session_expired(&self, session: &Session, now: DateTime<Utc>) -> bool {
        session.ended_at.is_some() || self.is_expired(session.created_at, now)
    }
}

/// Ids as supplied by the caller.
#[derive(Debug, Clone, Copy)]
pub struct ConversationRef<'a> {
    pub assistant_id: &'a str,
    pub chat_id: Option<&'a str>,
    pub session_id: Option<&'a str>,
}

/// Where a turn will be recorded, plus the history to feed the backend.
#[derive(Debug, Clone, Default)]
pub struct ResolvedConversation {
    /// `None` means a new session is created at persistence time.
    pub session_id: Option<String>,
    /// `None` means a new chat is created at persistence time.
    pub chat_id: Option<String>,
    /// External thread the turn belongs to.
    pub thread_id: Option<String>,
    /// Set when an existing chat must be bound to `thread_id`.
    pub bind_thread: bool,
    pub history: Vec<ConversationEntry>,
}

/// Validate the supplied ids and pick the session and chat this turn continues.
///
/// Fails with `Validation` on a dangling or mismatched reference.
pub fn resolve_conversation(
    db: &AssistantDatabase,
    policy: &ExpiryPolicy,
    target: ConversationRef<'_>,
    now: DateTime<Utc>,
) -> Result<ResolvedConversation, EngineError> {
    let supplied_chat = match target.chat_id {
        Some(chat_id) => {
            let chat = db
                .get_chat(chat_id)?
                .ok_or_else(|| EngineError::validation(format!("chat {} does not exist", chat_id)))?;
            if let Some(session_id) = target.session_id {
                if chat.session_id != session_id {
                    return Err(EngineError::validation(format!(
                        "chat {} does not belong to session {}",
                        chat_id, session_id
                    )));
                }
            }
            Some(chat)
        }
        None => None,
    };

    let session_id = target
        .session_id
        .or_else(|| supplied_chat.as_ref().map(|c| c.session_id.as_str()));
    let session = match session_id {
        Some(session_id) => {
            let session = db.get_session(session_id)?.ok_or_else(|| {
                EngineError::validation(format!("session {} does not exist", session_id))
            })?;
            if session.assistant_id != target.assistant_id {
                return Err(EngineError::validation(format!(
                    "session {} belongs to a different assistant",
                    session_id
                )));
            }
            Some(session)
        }
        None => None,
    };

    let history_chat = match (&supplied_chat, &session) {
        (Some(chat), _) => Some(chat.clone()),
        (None, Some(session)) => db.latest_chat_for_session(&session.id)?,
        (None, None) => None,
    };
    let history = match &history_chat {
        Some(chat) => db.chat_history(&chat.id)?,
        None => Vec::new(),
    };

    let live_session = session.filter(|s| !policy.session_expired(s, now));
    let active_chat = if live_session.is_some() {
        history_chat.filter(|c| !policy.chat_expired(c, now))
    } else {
        None
    };

    tracing::debug!(
        "Resolved conversation for {}: session={:?} chat={:?} history={}",
        target.assistant_id,
        live_session.as_ref().map(|s| s.id.as_str()),
        active_chat.as_ref().map(|c| c.id.as_str()),
        history.len()
    );

    Ok(ResolvedConversation {
        session_id: live_session.map(|s| s.id),
        thread_id: active_chat.as_ref().and_then(|c| c.thread_id.clone()),
        chat_id: active_chat.map(|c| c.id),
        bind_thread: false,
        history,
    })
}

/// Retarget persistence when the thread backend reports a thread other than
/// the one bound to the active chat.
///
/// An active chat with no thread yet is bound to the reported one. Otherwise
/// the chat already bound to that thread is used, or a new chat is created for
/// it under the resolved session.
pub fn apply_thread_override(
    db: &AssistantDatabase,
    assistant_id: &str,
    resolved: &mut ResolvedConversation,
    reported_thread: Option<&str>,
) -> Result<(), EngineError> {
    let Some(thread_id) = reported_thread else {
        return Ok(());
    };
    if resolved.thread_id.as_deref() == Some(thread_id) {
        return Ok(());
    }

    if resolved.chat_id.is_some() && resolved.thread_id.is_none() {
        tracing::debug!("Binding chat {:?} to thread {}", resolved.chat_id, thread_id);
        resolved.thread_id = Some(thread_id.to_string());
        resolved.bind_thread = true;
        return Ok(());
    }

    if let Some(chat) = db.find_chat_by_thread(thread_id)? {
        let owner = db.get_session(&chat.session_id)?;
        if owner.is_some_and(|s| s.assistant_id == assistant_id) {
            tracing::debug!("Thread {} maps to existing chat {}", thread_id, chat.id);
            resolved.session_id = Some(chat.session_id);
            resolved.chat_id = Some(chat.id);
            resolved.thread_id = Some(thread_id.to_string());
            resolved.bind_thread = false;
            return Ok(());
        }
    }

    tracing::debug!(
        "Thread rotated from {:?} to {}; turn goes to a new chat",
        resolved.thread_id,
        thread_id
    );
    resolved.chat_id = None;
    resolved.thread_id = Some(thread_id.to_string());
    resolved.bind_thread = false;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{MemoryType, MessageRole, NewAssistant};

    fn seeded() -> (AssistantDatabase, String) {
        let db = AssistantDatabase::in_memory().expect("db init");
        let assistant = db
            .create_assistant(&NewAssistant::completion("Guide", "gpt-4o-mini"))
            .expect("assistant");
        (db, assistant.id)
    }

    fn target<'a>(
        assistant_id: &'a str,
        chat_id: Option<&'a str>,
        session_id: Option<&'a str>,
    ) -> ConversationRef<'a> {
        ConversationRef {
            assistant_id,
            chat_id,
            session_id,
        }
    }

    #[test]
    fn ttl_boundary_is_exclusive() {
        let policy = ExpiryPolicy::default();
        let created = Utc::now();
        assert!(!policy.is_expired(created, created + Duration::hours(23) + Duration::minutes(59)));
        assert!(!policy.is_expired(created, created + Duration::hours(24)));
        assert!(policy.is_expired(created, created + Duration::hours(24) + Duration::milliseconds(1)));
    }

    #[test]
    fn nothing_supplied_means_everything_new() {
        let (db, assistant_id) = seeded();
        let resolved = resolve_conversation(
            &db,
            &ExpiryPolicy::default(),
            target(&assistant_id, None, None),
            Utc::now(),
        )
        .expect("resolve");
        assert!(resolved.session_id.is_none());
        assert!(resolved.chat_id.is_none());
        assert!(resolved.history.is_empty());
    }

    #[test]
    fn chat_must_exist_and_match_session() {
        let (db, assistant_id) = seeded();
        let session = db.create_session(&assistant_id, None).expect("session");
        let other = db.create_session(&assistant_id, None).expect("session");
        let chat = db.create_chat(&session.id, None).expect("chat");
        let policy = ExpiryPolicy::default();

        let err = resolve_conversation(&db, &policy, target(&assistant_id, Some("missing"), None), Utc::now())
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let err = resolve_conversation(
            &db,
            &policy,
            target(&assistant_id, Some(&chat.id), Some(&other.id)),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));

        let ok = resolve_conversation(
            &db,
            &policy,
            target(&assistant_id, Some(&chat.id), Some(&session.id)),
            Utc::now(),
        )
        .expect("matching ids");
        assert_eq!(ok.chat_id.as_deref(), Some(chat.id.as_str()));
        assert_eq!(ok.session_id.as_deref(), Some(session.id.as_str()));
    }

    #[test]
    fn session_of_other_assistant_is_rejected() {
        let (db, assistant_id) = seeded();
        let stranger = db
            .create_assistant(&NewAssistant::completion("Other", "m"))
            .expect("assistant");
        let session = db.create_session(&stranger.id, None).expect("session");

        let err = resolve_conversation(
            &db,
            &ExpiryPolicy::default(),
            target(&assistant_id, None, Some(&session.id)),
            Utc::now(),
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[test]
    fn expired_chat_keeps_session_and_history() {
        let (db, assistant_id) = seeded();
        let session = db.create_session(&assistant_id, None).expect("session");
        let chat = db.create_chat(&session.id, None).expect("chat");
        let memory = db
            .create_memory("old turn", MemoryType::Prompt, None)
            .expect("memory");
        db.add_chat_message(&chat.id, &memory.id, MessageRole::User)
            .expect("message");
        let now = Utc::now();
        db.backdate_chat(&chat.id, now - Duration::hours(25))
            .expect("backdate");

        let resolved = resolve_conversation(
            &db,
            &ExpiryPolicy::default(),
            target(&assistant_id, Some(&chat.id), None),
            now,
        )
        .expect("resolve");
        assert_eq!(resolved.session_id.as_deref(), Some(session.id.as_str()));
        assert!(resolved.chat_id.is_none());
        assert_eq!(resolved.history.len(), 1);
    }

    #[test]
    fn aged_session_ends_continuation_of_fresh_chat() {
        let (db, assistant_id) = seeded();
        let session = db.create_session(&assistant_id, None).expect("session");
        let chat = db.create_chat(&session.id, Some("thread_fresh")).expect("chat");
        let memory = db
            .create_memory("still relevant", MemoryType::Prompt, None)
            .expect("memory");
        db.add_chat_message(&chat.id, &memory.id, MessageRole::User)
            .expect("message");
        let now = Utc::now();
        db.backdate_session(&session.id, now - Duration::hours(25))
            .expect("backdate");

        let resolved = resolve_conversation(
            &db,
            &ExpiryPolicy::default(),
            target(&assistant_id, Some(&chat.id), Some(&session.id)),
            now,
        )
        .expect("resolve");
        assert!(resolved.session_id.is_none());
        assert!(resolved.chat_id.is_none());
        assert!(resolved.thread_id.is_none());
        assert_eq!(resolved.history.len(), 1);
        assert_eq!(resolved.history[0].content, "still relevant");
    }

    #[test]
    fn session_only_continues_latest_chat_unless_session_ended() {
        let (db, assistant_id) = seeded();
        let session = db.create_session(&assistant_id, None).expect("session");
        let chat = db.create_chat(&session.id, Some("thread_x")).expect("chat");
        let policy = ExpiryPolicy::default();

        let resolved = resolve_conversation(&db, &policy, target(&assistant_id, None, Some(&session.id)), Utc::now())
            .expect("resolve");
        assert_eq!(resolved.chat_id.as_deref(), Some(chat.id.as_str()));
        assert_eq!(resolved.thread_id.as_deref(), Some("thread_x"));

        db.end_session(&session.id).expect("end");
        let resolved = resolve_conversation(&db, &policy, target(&assistant_id, None, Some(&session.id)), Utc::now())
            .expect("resolve");
        assert!(resolved.session_id.is_none());
        assert!(resolved.chat_id.is_none());
    }

    #[test]
    fn reported_thread_retargets_persistence() {
        let (db, assistant_id) = seeded();
        let session = db.create_session(&assistant_id, None).expect("session");
        let bound = db.create_chat(&session.id, Some("thread_old")).expect("chat");
        let elsewhere = db.create_chat(&session.id, Some("thread_known")).expect("chat");

        let base = ResolvedConversation {
            session_id: Some(session.id.clone()),
            chat_id: Some(bound.id.clone()),
            thread_id: Some("thread_old".to_string()),
            ..Default::default()
        };

        let mut same = base.clone();
        apply_thread_override(&db, &assistant_id, &mut same, Some("thread_old")).expect("override");
        assert_eq!(same.chat_id.as_deref(), Some(bound.id.as_str()));

        let mut known = base.clone();
        apply_thread_override(&db, &assistant_id, &mut known, Some("thread_known")).expect("override");
        assert_eq!(known.chat_id.as_deref(), Some(elsewhere.id.as_str()));

        let mut fresh = base.clone();
        apply_thread_override(&db, &assistant_id, &mut fresh, Some("thread_new")).expect("override");
        assert!(fresh.chat_id.is_none());
        assert_eq!(fresh.session_id.as_deref(), Some(session.id.as_str()));
        assert_eq!(fresh.thread_id.as_deref(), Some("thread_new"));

        let mut unbound = ResolvedConversation {
            thread_id: None,
            ..base
        };
        apply_thread_override(&db, &assistant_id, &mut unbound, Some("thread_new")).expect("override");
        assert_eq!(unbound.chat_id.as_deref(), Some(bound.id.as_str()));
        assert!(unbound.bind_thread);
    }
}
