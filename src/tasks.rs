//! Audit record around each prompt-response cycle.

use anyhow::Result;

use crate::database::{AssistantDatabase, Task, TaskStatus};
use crate::events::{EngineEvent, EventSink};

pub struct TaskBookkeeper<'a> {
    db: &'a AssistantDatabase,
    events: &'a EventSink,
}

impl<'a> TaskBookkeeper<'a> {
    pub fn new(db: &'a AssistantDatabase, events: &'a EventSink) -> Self {
        Self { db, events }
    }

    pub fn open(&self, assistant_id: &str, prompt: &str) -> Result<Task> {
        let task = self.db.open_task(assistant_id, prompt)?;
        tracing::debug!("Opened task {} for assistant {}", task.id, assistant_id);
        self.events.emit(EngineEvent::TaskOpened {
            task_id: task.id.clone(),
            assistant_id: assistant_id.to_string(),
        });
        Ok(task)
    }

    pub fn complete(&self, task_id: &str, output: &str) -> Result<()> {
        if self.db.complete_task(task_id, output)? {
            self.closed(task_id, TaskStatus::Completed);
        } else {
            tracing::warn!("Task {} was already closed; completion ignored", task_id);
        }
        Ok(())
    }

    pub fn fail(&self, task_id: &str, error: &str) -> Result<()> {
        if self.db.fail_task(task_id, error)? {
            self.closed(task_id, TaskStatus::Failed);
        } else {
            tracing::warn!("Task {} was already closed; failure ignored", task_id);
        }
        Ok(())
    }

    /// Mark failed without masking the error that caused it.
    pub fn fail_quietly(&self, task_id: &str, error: &str) {
        if let Err(e) = self.fail(task_id, error) {
            tracing::error!("Failed to close task {} as failed: {:#}", task_id, e);
        }
    }

    fn closed(&self, task_id: &str, status: TaskStatus) {
        tracing::debug!("Closed task {} as {}", task_id, status.as_db_str());
        self.events.emit(EngineEvent::TaskClosed {
            task_id: task_id.to_string(),
            status,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_then_close_publishes_events_once() {
        let db = AssistantDatabase::in_memory().expect("db init");
        let (tx, rx) = flume::unbounded();
        let events = EventSink::new(tx);
        let bookkeeper = TaskBookkeeper::new(&db, &events);

        let task = bookkeeper.open("a1", "hello").expect("open");
        bookkeeper.fail(&task.id, "provider down").expect("fail");
        bookkeeper.complete(&task.id, "late reply").expect("ignored");

        let received: Vec<EngineEvent> = rx.try_iter().collect();
        assert_eq!(received.len(), 2);
        assert!(matches!(received[0], EngineEvent::TaskOpened { .. }));
        assert!(matches!(
            received[1],
            EngineEvent::TaskClosed {
                status: TaskStatus::Failed,
                ..
            }
        ));

        let stored = db.get_task(&task.id).expect("get").expect("task");
        assert_eq!(stored.status, TaskStatus::Failed);
        assert_eq!(stored.error.as_deref(), Some("provider down"));
        assert!(stored.output.is_none());
    }
}
