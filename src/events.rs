use crate::database::TaskStatus;
use crate::error::PersistenceWarning;

/// Progress notifications published by the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    TaskOpened {
        task_id: String,
        assistant_id: String,
    },
    TaskClosed {
        task_id: String,
        status: TaskStatus,
    },
    TurnPersisted {
        task_id: String,
        session_id: String,
        chat_id: String,
    },
    PersistenceWarning {
        task_id: Option<String>,
        warning: PersistenceWarning,
    },
    BackendFailure {
        task_id: String,
        error: String,
    },
}

/// Optional event channel. Sends never block and a dropped receiver is ignored.
#[derive(Clone, Default)]
pub struct EventSink {
    tx: Option<flume::Sender<EngineEvent>>,
}

impl EventSink {
    pub fn new(tx: flume::Sender<EngineEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn emit(&self, event: EngineEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}
