use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use super::memories::upsert_tag;
use super::{db_timestamp, new_id, parse_ts, AssistantDatabase};

/// Behavioral type of an assistant; selects the backend strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", from = "String")]
pub enum AssistantType {
    /// Stateless request/response completion.
    Completion,
    /// Conversation state lives in an externally hosted thread.
    Thread,
    /// Unrecognized type; no backend serves it.
    Other(String),
}

impl AssistantType {
    pub fn as_db_str(&self) -> &str {
        match self {
            AssistantType::Completion => "completion",
            AssistantType::Thread => "thread",
            AssistantType::Other(raw) => raw.as_str(),
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "completion" | "chat" | "stateless" => AssistantType::Completion,
            "thread" | "assistant" | "persistent" => AssistantType::Thread,
            _ => AssistantType::Other(raw.trim().to_string()),
        }
    }
}

impl From<String> for AssistantType {
    fn from(raw: String) -> Self {
        AssistantType::from_db(&raw)
    }
}

impl From<AssistantType> for String {
    fn from(kind: AssistantType) -> Self {
        kind.as_db_str().to_string()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Assistant {
    pub id: String,
    pub name: String,
    pub assistant_type: AssistantType,
    pub model: Option<String>,
    /// System instructions prepended to every prompt.
    pub instructions: Option<String>,
    /// Remote assistant configuration used by the thread provider.
    pub external_assistant_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAssistant {
    pub name: String,
    pub assistant_type: AssistantType,
    pub model: Option<String>,
    pub instructions: Option<String>,
    pub external_assistant_id: Option<String>,
}

impl NewAssistant {
    pub fn completion(name: &str, model: &str) -> Self {
        Self {
            name: name.to_string(),
            assistant_type: AssistantType::Completion,
            model: Some(model.to_string()),
            instructions: None,
            external_assistant_id: None,
        }
    }

    pub fn thread(name: &str, external_assistant_id: &str) -> Self {
        Self {
            name: name.to_string(),
            assistant_type: AssistantType::Thread,
            model: None,
            instructions: None,
            external_assistant_id: Some(external_assistant_id.to_string()),
        }
    }

    pub fn with_instructions(mut self, instructions: &str) -> Self {
        self.instructions = Some(instructions.to_string());
        self
    }
}

/// Per-assistant cap on how many memories are in focus for a prompt.
///
/// `relationship_types` and `priority_tags` are soft hints only; they are
/// stored and surfaced but never used as hard filters.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryFocusRule {
    pub id: String,
    pub assistant_id: String,
    pub max_results: i64,
    pub relationship_types: Vec<String>,
    pub priority_tags: Vec<String>,
    pub created_at: DateTime<Utc>,
}

fn assistant_from_row(row: &Row<'_>) -> rusqlite::Result<Assistant> {
    let assistant_type: String = row.get(2)?;
    Ok(Assistant {
        id: row.get(0)?,
        name: row.get(1)?,
        assistant_type: AssistantType::from_db(&assistant_type),
        model: row.get(3)?,
        instructions: row.get(4)?,
        external_assistant_id: row.get(5)?,
        created_at: parse_ts(row.get(6)?, 6)?,
    })
}

impl AssistantDatabase {
    pub fn create_assistant(&self, new: &NewAssistant) -> Result<Assistant> {
        let assistant = Assistant {
            id: new_id(),
            name: new.name.clone(),
            assistant_type: new.assistant_type.clone(),
            model: new.model.clone(),
            instructions: new.instructions.clone(),
            external_assistant_id: new.external_assistant_id.clone(),
            created_at: Utc::now(),
        };
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO assistants (id, name, assistant_type, model, instructions, external_assistant_id, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                assistant.id,
                assistant.name,
                assistant.assistant_type.as_db_str(),
                assistant.model,
                assistant.instructions,
                assistant.external_assistant_id,
                db_timestamp(assistant.created_at),
            ],
        )?;
        Ok(assistant)
    }

    pub fn get_assistant(&self, id: &str) -> Result<Option<Assistant>> {
        let conn = self.lock_conn()?;
        let assistant = conn
            .query_row(
                "SELECT id, name, assistant_type, model, instructions, external_assistant_id, created_at
                 FROM assistants WHERE id = ?1",
                [id],
                assistant_from_row,
            )
            .optional()?;
        Ok(assistant)
    }

    pub fn list_assistants(&self) -> Result<Vec<Assistant>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, name, assistant_type, model, instructions, external_assistant_id, created_at
             FROM assistants
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let assistants = stmt
            .query_map([], assistant_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(assistants)
    }

    /// Create or replace the single focus rule of an assistant.
    pub fn set_focus_rule(
        &self,
        assistant_id: &str,
        max_results: i64,
        relationship_types: &[String],
        priority_tags: &[String],
    ) -> Result<MemoryFocusRule> {
        let now = Utc::now();
        let relationship_json = serde_json::to_string(relationship_types)?;
        let tags_json = serde_json::to_string(priority_tags)?;
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO memory_focus_rules (id, assistant_id, max_results, relationship_types_json, priority_tags_json, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(assistant_id) DO UPDATE SET
                 max_results = excluded.max_results,
                 relationship_types_json = excluded.relationship_types_json,
                 priority_tags_json = excluded.priority_tags_json",
            params![
                new_id(),
                assistant_id,
                max_results,
                relationship_json,
                tags_json,
                db_timestamp(now),
            ],
        )?;
        drop(conn);

        self.get_focus_rule(assistant_id)?
            .ok_or_else(|| anyhow::anyhow!("focus rule for '{}' vanished after upsert", assistant_id))
    }

    pub fn get_focus_rule(&self, assistant_id: &str) -> Result<Option<MemoryFocusRule>> {
        let conn = self.lock_conn()?;
        let rule = conn
            .query_row(
                "SELECT id, assistant_id, max_results, relationship_types_json, priority_tags_json, created_at
                 FROM memory_focus_rules WHERE assistant_id = ?1",
                [assistant_id],
                |row| {
                    let relationship_raw: String = row.get(3)?;
                    let tags_raw: String = row.get(4)?;
                    Ok(MemoryFocusRule {
                        id: row.get(0)?,
                        assistant_id: row.get(1)?,
                        max_results: row.get(2)?,
                        relationship_types: serde_json::from_str(&relationship_raw)
                            .unwrap_or_default(),
                        priority_tags: serde_json::from_str(&tags_raw).unwrap_or_default(),
                        created_at: parse_ts(row.get(5)?, 5)?,
                    })
                },
            )
            .optional()?;
        Ok(rule)
    }

    pub fn tag_assistant(&self, assistant_id: &str, tag_name: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        let tag = upsert_tag(&conn, tag_name)?;
        conn.execute(
            "INSERT OR IGNORE INTO assistant_tags (assistant_id, tag_id) VALUES (?1, ?2)",
            params![assistant_id, tag.id],
        )?;
        Ok(())
    }

    pub fn assistant_tag_names(&self, assistant_id: &str) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT t.name FROM assistant_tags a
             JOIN tags t ON t.id = a.tag_id
             WHERE a.assistant_id = ?1
             ORDER BY t.name ASC",
        )?;
        let names = stmt
            .query_map([assistant_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_type_parses_aliases_and_keeps_unknown_raw() {
        assert_eq!(AssistantType::from_db("chat"), AssistantType::Completion);
        assert_eq!(AssistantType::from_db(" Assistant "), AssistantType::Thread);
        assert_eq!(
            AssistantType::from_db("vision"),
            AssistantType::Other("vision".to_string())
        );
        assert_eq!(String::from(AssistantType::Thread), "thread");
    }

    #[test]
    fn focus_rule_is_replaced_not_duplicated() {
        let db = AssistantDatabase::in_memory().expect("db init");
        let assistant = db
            .create_assistant(&NewAssistant::completion("Scribe", "gpt-4o-mini"))
            .expect("create assistant");

        let first = db
            .set_focus_rule(&assistant.id, 5, &[], &["sql".to_string()])
            .expect("set rule");
        let second = db
            .set_focus_rule(&assistant.id, 8, &["cites".to_string()], &[])
            .expect("replace rule");

        assert_eq!(first.id, second.id);
        assert_eq!(second.max_results, 8);
        assert_eq!(second.relationship_types, vec!["cites".to_string()]);
        assert!(second.priority_tags.is_empty());
    }

    #[test]
    fn assistant_tags_are_deduplicated() {
        let db = AssistantDatabase::in_memory().expect("db init");
        let assistant = db
            .create_assistant(&NewAssistant::thread("Helper", "asst_123"))
            .expect("create assistant");

        db.tag_assistant(&assistant.id, "databases").expect("tag");
        db.tag_assistant(&assistant.id, "databases").expect("retag");
        db.tag_assistant(&assistant.id, "rust").expect("tag");

        assert_eq!(
            db.assistant_tag_names(&assistant.id).expect("names"),
            vec!["databases".to_string(), "rust".to_string()]
        );
    }
}
