use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};

use super::{db_timestamp, new_id, parse_opt_ts, parse_ts, AssistantDatabase};

/// Task lifecycle: `Pending -> Completed | Failed`. Terminal states never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn as_db_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw {
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            _ => TaskStatus::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Pending)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub assistant_id: String,
    pub description: String,
    pub status: TaskStatus,
    pub output: Option<String>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TaskCounts {
    pub total: u64,
    pub completed: u64,
    pub failed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Feedback {
    pub id: String,
    pub task_id: Option<String>,
    pub assistant_id: Option<String>,
    pub rating: u8,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct FeedbackStats {
    pub count: u64,
    /// Mean rating, 0 when there is no feedback.
    pub average: f64,
}

impl AssistantDatabase {
    pub fn open_task(&self, assistant_id: &str, description: &str) -> Result<Task> {
        let task = Task {
            id: new_id(),
            assistant_id: assistant_id.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            output: None,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO tasks (id, assistant_id, description, status, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                task.id,
                task.assistant_id,
                task.description,
                task.status.as_db_str(),
                db_timestamp(task.created_at),
            ],
        )?;
        Ok(task)
    }

    /// Close a pending task as completed. Returns false if it was already terminal.
    pub fn complete_task(&self, task_id: &str, output: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1, output = ?2, completed_at = ?3
             WHERE id = ?4 AND status = 'pending'",
            params![
                TaskStatus::Completed.as_db_str(),
                output,
                db_timestamp(Utc::now()),
                task_id,
            ],
        )?;
        Ok(changed > 0)
    }

    /// Close a pending task as failed. Returns false if it was already terminal.
    pub fn fail_task(&self, task_id: &str, error: &str) -> Result<bool> {
        let conn = self.lock_conn()?;
        let changed = conn.execute(
            "UPDATE tasks SET status = ?1, error = ?2, completed_at = ?3
             WHERE id = ?4 AND status = 'pending'",
            params![
                TaskStatus::Failed.as_db_str(),
                error,
                db_timestamp(Utc::now()),
                task_id,
            ],
        )?;
        Ok(changed > 0)
    }

    pub fn get_task(&self, task_id: &str) -> Result<Option<Task>> {
        let conn = self.lock_conn()?;
        let task = conn
            .query_row(
                "SELECT id, assistant_id, description, status, output, error, created_at, completed_at
                 FROM tasks WHERE id = ?1",
                [task_id],
                |row| {
                    let status: String = row.get(3)?;
                    Ok(Task {
                        id: row.get(0)?,
                        assistant_id: row.get(1)?,
                        description: row.get(2)?,
                        status: TaskStatus::from_db(&status),
                        output: row.get(4)?,
                        error: row.get(5)?,
                        created_at: parse_ts(row.get(6)?, 6)?,
                        completed_at: parse_opt_ts(row.get(7)?, 7)?,
                    })
                },
            )
            .optional()?;
        Ok(task)
    }

    pub fn task_counts(&self, assistant_id: &str) -> Result<TaskCounts> {
        let conn = self.lock_conn()?;
        let (total, completed, failed): (i64, i64, i64) = conn.query_row(
            "SELECT COUNT(*),
                    COALESCE(SUM(CASE WHEN status = 'completed' THEN 1 ELSE 0 END), 0),
                    COALESCE(SUM(CASE WHEN status = 'failed' THEN 1 ELSE 0 END), 0)
             FROM tasks WHERE assistant_id = ?1",
            [assistant_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;
        Ok(TaskCounts {
            total: total as u64,
            completed: completed as u64,
            failed: failed as u64,
        })
    }

    /// Record a 1-5 rating against a task, an assistant, or both.
    pub fn add_feedback(
        &self,
        task_id: Option<&str>,
        assistant_id: Option<&str>,
        rating: u8,
        comment: Option<&str>,
    ) -> Result<Feedback> {
        if !(1..=5).contains(&rating) {
            anyhow::bail!("rating must be between 1 and 5, got {}", rating);
        }
        if task_id.is_none() && assistant_id.is_none() {
            anyhow::bail!("feedback needs a task or an assistant");
        }
        let feedback = Feedback {
            id: new_id(),
            task_id: task_id.map(str::to_string),
            assistant_id: assistant_id.map(str::to_string),
            rating,
            comment: comment.map(str::to_string),
            created_at: Utc::now(),
        };
        let conn = self.lock_conn()?;
        conn.execute(
            "INSERT INTO feedback (id, task_id, assistant_id, rating, comment, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                feedback.id,
                feedback.task_id,
                feedback.assistant_id,
                feedback.rating as i64,
                feedback.comment,
                db_timestamp(feedback.created_at),
            ],
        )?;
        Ok(feedback)
    }

    /// Feedback addressed to the assistant directly or through one of its tasks.
    pub fn feedback_stats(&self, assistant_id: &str) -> Result<FeedbackStats> {
        let conn = self.lock_conn()?;
        let (count, average): (i64, Option<f64>) = conn.query_row(
            "SELECT COUNT(*), AVG(rating) FROM feedback
             WHERE assistant_id = ?1
                OR task_id IN (SELECT id FROM tasks WHERE assistant_id = ?1)",
            [assistant_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;
        Ok(FeedbackStats {
            count: count as u64,
            average: average.unwrap_or(0.0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::NewAssistant;

    #[test]
    fn terminal_task_status_is_sticky() {
        let db = AssistantDatabase::in_memory().expect("db init");
        let task = db.open_task("a1", "prompt").expect("open");
        assert_eq!(task.status, TaskStatus::Pending);

        assert!(db.complete_task(&task.id, "done").expect("complete"));
        assert!(!db.fail_task(&task.id, "late failure").expect("fail after"));

        let stored = db.get_task(&task.id).expect("get").expect("exists");
        assert_eq!(stored.status, TaskStatus::Completed);
        assert_eq!(stored.output.as_deref(), Some("done"));
        assert!(stored.error.is_none());
        assert!(stored.completed_at.is_some());
    }

    #[test]
    fn counts_split_by_status() {
        let db = AssistantDatabase::in_memory().expect("db init");
        let a = db.open_task("a1", "one").expect("open");
        let b = db.open_task("a1", "two").expect("open");
        db.open_task("a1", "three").expect("open");
        db.open_task("a2", "other").expect("open");
        db.complete_task(&a.id, "ok").expect("complete");
        db.fail_task(&b.id, "boom").expect("fail");

        let counts = db.task_counts("a1").expect("counts");
        assert_eq!(
            counts,
            TaskCounts {
                total: 3,
                completed: 1,
                failed: 1
            }
        );
        assert_eq!(db.task_counts("nobody").expect("counts"), TaskCounts::default());
    }

    #[test]
    fn feedback_reaches_assistant_through_tasks() {
        let db = AssistantDatabase::in_memory().expect("db init");
        let assistant = db
            .create_assistant(&NewAssistant::completion("Rated", "gpt-4o-mini"))
            .expect("assistant");
        let task = db.open_task(&assistant.id, "p").expect("open");

        db.add_feedback(None, Some(&assistant.id), 4, Some("solid"))
            .expect("direct feedback");
        db.add_feedback(Some(&task.id), None, 5, None)
            .expect("task feedback");
        db.add_feedback(Some(&task.id), Some(&assistant.id), 3, None)
            .expect("both");

        let stats = db.feedback_stats(&assistant.id).expect("stats");
        assert_eq!(stats.count, 3);
        assert!((stats.average - 4.0).abs() < 1e-9);
    }

    #[test]
    fn feedback_rating_out_of_range_is_rejected() {
        let db = AssistantDatabase::in_memory().expect("db init");
        assert!(db.add_feedback(None, Some("a"), 0, None).is_err());
        assert!(db.add_feedback(None, Some("a"), 6, None).is_err());
        assert!(db.add_feedback(None, None, 3, None).is_err());
        assert_eq!(db.feedback_stats("a").expect("stats"), FeedbackStats::default());
    }
}
