use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use super::{db_timestamp, new_id, parse_ts, AssistantDatabase};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Instruction,
    Knowledge,
    Session,
    Prompt,
    Meta,
}

impl MemoryType {
    pub fn as_db_str(self) -> &'static str {
        match self {
            MemoryType::Instruction => "instruction",
            MemoryType::Knowledge => "knowledge",
            MemoryType::Session => "session",
            MemoryType::Prompt => "prompt",
            MemoryType::Meta => "meta",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "instruction" => MemoryType::Instruction,
            "session" => MemoryType::Session,
            "prompt" => MemoryType::Prompt,
            "meta" => MemoryType::Meta,
            _ => MemoryType::Knowledge,
        }
    }
}

impl std::str::FromStr for MemoryType {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "instruction" | "knowledge" | "session" | "prompt" | "meta" => {
                Ok(MemoryType::from_db(raw))
            }
            other => anyhow::bail!("unknown memory type '{}'", other),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Memory {
    pub id: String,
    pub content: String,
    pub memory_type: MemoryType,
    /// Task that produced this memory, for assistant replies.
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub name: String,
}

/// Directed edge of the relationship graph. Cycles are allowed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Relationship {
    pub id: String,
    pub source_type: String,
    pub source_id: String,
    pub target_type: String,
    pub target_id: String,
    pub relationship: String,
    pub created_at: DateTime<Utc>,
}

const MEMORY_COLUMNS: &str = "m.id, m.content, m.memory_type, m.task_id, m.created_at, m.updated_at";

fn memory_from_row(row: &Row<'_>) -> rusqlite::Result<Memory> {
    let memory_type: String = row.get(2)?;
    Ok(Memory {
        id: row.get(0)?,
        content: row.get(1)?,
        memory_type: MemoryType::from_db(&memory_type),
        task_id: row.get(3)?,
        created_at: parse_ts(row.get(4)?, 4)?,
        updated_at: parse_ts(row.get(5)?, 5)?,
    })
}

pub(crate) fn insert_memory(
    conn: &Connection,
    content: &str,
    memory_type: MemoryType,
    task_id: Option<&str>,
) -> Result<Memory> {
    let now = Utc::now();
    let memory = Memory {
        id: new_id(),
        content: content.to_string(),
        memory_type,
        task_id: task_id.map(str::to_string),
        created_at: now,
        updated_at: now,
    };
    conn.execute(
        "INSERT INTO memories (id, content, memory_type, task_id, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            memory.id,
            memory.content,
            memory.memory_type.as_db_str(),
            memory.task_id,
            db_timestamp(now),
            db_timestamp(now),
        ],
    )
    .context("Failed to insert memory")?;
    Ok(memory)
}

/// Lookup-or-create a tag by name in one atomic upsert.
pub(crate) fn upsert_tag(conn: &Connection, name: &str) -> Result<Tag> {
    let name = name.trim();
    if name.is_empty() {
        anyhow::bail!("tag name cannot be empty");
    }
    conn.execute(
        "INSERT INTO tags (id, name, created_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(name) DO NOTHING",
        params![new_id(), name, db_timestamp(Utc::now())],
    )?;
    let id: String = conn.query_row("SELECT id FROM tags WHERE name = ?1", [name], |row| {
        row.get(0)
    })?;
    Ok(Tag {
        id,
        name: name.to_string(),
    })
}

pub(crate) fn tag_memory_in(conn: &Connection, memory_id: &str, tag_name: &str) -> Result<Tag> {
    let tag = upsert_tag(conn, tag_name)?;
    conn.execute(
        "INSERT OR IGNORE INTO memory_tags (memory_id, tag_id) VALUES (?1, ?2)",
        params![memory_id, tag.id],
    )
    .with_context(|| format!("Failed to link tag '{}'", tag.name))?;
    Ok(tag)
}

pub(crate) fn own_memory_in(conn: &Connection, assistant_id: &str, memory_id: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO owned_memories (assistant_id, memory_id, created_at) VALUES (?1, ?2, ?3)",
        params![assistant_id, memory_id, db_timestamp(Utc::now())],
    )
    .context("Failed to link owned memory")?;
    Ok(())
}

fn escape_like(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

impl AssistantDatabase {
    pub fn create_memory(
        &self,
        content: &str,
        memory_type: MemoryType,
        task_id: Option<&str>,
    ) -> Result<Memory> {
        let conn = self.lock_conn()?;
        insert_memory(&conn, content, memory_type, task_id)
    }

    pub fn get_memory(&self, id: &str) -> Result<Option<Memory>> {
        let conn = self.lock_conn()?;
        let memory = conn
            .query_row(
                &format!("SELECT {} FROM memories m WHERE m.id = ?1", MEMORY_COLUMNS),
                [id],
                memory_from_row,
            )
            .optional()?;
        Ok(memory)
    }

    pub fn tag_memory(&self, memory_id: &str, tag_name: &str) -> Result<Tag> {
        let conn = self.lock_conn()?;
        tag_memory_in(&conn, memory_id, tag_name)
    }

    pub fn memory_tag_names(&self, memory_id: &str) -> Result<Vec<String>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT t.name FROM memory_tags mt
             JOIN tags t ON t.id = mt.tag_id
             WHERE mt.memory_id = ?1
             ORDER BY t.name ASC",
        )?;
        let names = stmt
            .query_map([memory_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }

    #[cfg(test)]
    pub(crate) fn count_tags_named(&self, name: &str) -> Result<usize> {
        let conn = self.lock_conn()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tags WHERE name = ?1",
            [name.trim()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn own_memory(&self, assistant_id: &str, memory_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        own_memory_in(&conn, assistant_id, memory_id)
    }

    /// Add a memory to a focus rule's set. The set may exceed the rule's cap;
    /// the cap is applied when the set is read.
    pub fn focus_memory(&self, rule_id: &str, memory_id: &str) -> Result<()> {
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO focused_memories (rule_id, memory_id, created_at) VALUES (?1, ?2, ?3)",
            params![rule_id, memory_id, db_timestamp(Utc::now())],
        )?;
        Ok(())
    }

    /// Focused memories of a rule, most recent first, capped at `limit`.
    pub fn list_focused_memories(&self, rule_id: &str, limit: usize) -> Result<Vec<Memory>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM focused_memories f
             JOIN memories m ON m.id = f.memory_id
             WHERE f.rule_id = ?1
             ORDER BY m.created_at DESC, m.rowid DESC
             LIMIT ?2",
            MEMORY_COLUMNS
        ))?;
        let memories = stmt
            .query_map(params![rule_id, limit as i64], memory_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(memories)
    }

    /// Memories owned by an assistant, most recent first, capped at `limit`.
    pub fn list_owned_memories(&self, assistant_id: &str, limit: usize) -> Result<Vec<Memory>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM owned_memories o
             JOIN memories m ON m.id = o.memory_id
             WHERE o.assistant_id = ?1
             ORDER BY m.created_at DESC, m.rowid DESC
             LIMIT ?2",
            MEMORY_COLUMNS
        ))?;
        let memories = stmt
            .query_map(params![assistant_id, limit as i64], memory_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(memories)
    }

    pub fn owned_memory_ids(&self, assistant_id: &str) -> Result<HashSet<String>> {
        let conn = self.lock_conn()?;
        let mut stmt =
            conn.prepare("SELECT memory_id FROM owned_memories WHERE assistant_id = ?1")?;
        let ids = stmt
            .query_map([assistant_id], |row| row.get::<_, String>(0))?
            .collect::<Result<HashSet<_>, _>>()?;
        Ok(ids)
    }

    /// Memories whose content contains `text` (case-insensitive) or that carry
    /// any of `tags`. An empty `text` matches on tags only.
    pub fn search_memories(&self, text: &str, tags: &[String]) -> Result<Vec<Memory>> {
        let text = text.trim();
        let tags: Vec<&str> = tags
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .collect();
        if text.is_empty() && tags.is_empty() {
            return Ok(Vec::new());
        }

        let mut clauses = Vec::new();
        let mut values: Vec<String> = Vec::new();
        if !text.is_empty() {
            values.push(escape_like(text));
            clauses.push(format!(
                "m.content LIKE '%' || ?{} || '%' ESCAPE '\\'",
                values.len()
            ));
        }
        if !tags.is_empty() {
            let start = values.len() + 1;
            let placeholders = (start..start + tags.len())
                .map(|i| format!("?{}", i))
                .collect::<Vec<_>>()
                .join(", ");
            values.extend(tags.iter().map(|t| t.to_string()));
            clauses.push(format!(
                "m.id IN (SELECT mt.memory_id FROM memory_tags mt
                          JOIN tags t ON t.id = mt.tag_id
                          WHERE t.name IN ({}))",
                placeholders
            ));
        }

        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM memories m WHERE {} ORDER BY m.created_at DESC, m.rowid DESC",
            MEMORY_COLUMNS,
            clauses.join(" OR ")
        ))?;
        let memories = stmt
            .query_map(params_from_iter(values.iter()), memory_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(memories)
    }

    pub fn add_relationship(
        &self,
        source: (&str, &str),
        target: (&str, &str),
        relationship: &str,
    ) -> Result<Relationship> {
        let edge = Relationship {
            id: new_id(),
            source_type: source.0.to_string(),
            source_id: source.1.to_string(),
            target_type: target.0.to_string(),
            target_id: target.1.to_string(),
            relationship: relationship.to_string(),
            created_at: Utc::now(),
        };
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO relationships (id, source_type, source_id, target_type, target_id, relationship, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                edge.id,
                edge.source_type,
                edge.source_id,
                edge.target_type,
                edge.target_id,
                edge.relationship,
                db_timestamp(edge.created_at),
            ],
        )?;
        Ok(edge)
    }

    pub fn list_relationships_from(
        &self,
        source_type: &str,
        source_id: &str,
    ) -> Result<Vec<Relationship>> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT id, source_type, source_id, target_type, target_id, relationship, created_at
             FROM relationships
             WHERE source_type = ?1 AND source_id = ?2
             ORDER BY created_at ASC, rowid ASC",
        )?;
        let edges = stmt
            .query_map(params![source_type, source_id], |row| {
                Ok(Relationship {
                    id: row.get(0)?,
                    source_type: row.get(1)?,
                    source_id: row.get(2)?,
                    target_type: row.get(3)?,
                    target_id: row.get(4)?,
                    relationship: row.get(5)?,
                    created_at: parse_ts(row.get(6)?, 6)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(edges)
    }
}
