//! Turns a user prompt into a reply and records the turn.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::backends::{AiRequest, BackendKind, BackendRegistry};
use crate::config::EngineConfig;
use crate::context::budget_context;
use crate::database::{AssistantDatabase, Memory, MemoryType};
use crate::error::{EngineError, PersistenceWarning};
use crate::evaluation::{evaluate_performance, PerformanceReport};
use crate::events::{EngineEvent, EventSink};
use crate::lifecycle::{apply_thread_override, resolve_conversation, ConversationRef, ExpiryPolicy};
use crate::persist::{TurnPersister, TurnRecord};
use crate::ranking::{suggest_assistants, AssistantSuggestion};
use crate::tasks::TaskBookkeeper;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskRequest {
    pub assistant_id: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskResponse {
    pub assistant_id: String,
    pub chat_id: Option<String>,
    pub session_id: Option<String>,
    pub response_type: String,
    pub answer: String,
    pub task_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RememberRequest {
    pub assistant_id: String,
    pub content: String,
    pub memory_type: MemoryType,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Also add the memory to the assistant's focus set.
    #[serde(default)]
    pub focus: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RememberOutcome {
    pub memory: Memory,
    pub warnings: Vec<PersistenceWarning>,
}

pub struct Orchestrator {
    db: Arc<AssistantDatabase>,
    backends: BackendRegistry,
    policy: ExpiryPolicy,
    default_focus_max_results: i64,
    atomic_turn_writes: bool,
    events: EventSink,
}

impl Orchestrator {
    pub fn new(db: Arc<AssistantDatabase>, backends: BackendRegistry, config: &EngineConfig) -> Self {
        Self {
            db,
            backends,
            policy: ExpiryPolicy::from_hours(config.chat_ttl_hours),
            default_focus_max_results: config.default_focus_max_results,
            atomic_turn_writes: config.atomic_turn_writes,
            events: EventSink::disabled(),
        }
    }

    pub fn with_events(mut self, events: EventSink) -> Self {
        self.events = events;
        self
    }

    pub fn database(&self) -> &Arc<AssistantDatabase> {
        &self.db
    }

    pub async fn ask(&self, request: &AskRequest) -> Result<AskResponse, EngineError> {
        self.ask_with_cancel(request, None).await
    }

    /// Like [`Orchestrator::ask`], but a fired token abandons a pending thread run.
    pub async fn ask_with_cancel(
        &self,
        request: &AskRequest,
        cancel: Option<CancellationToken>,
    ) -> Result<AskResponse, EngineError> {
        let assistant_id = request.assistant_id.trim();
        if assistant_id.is_empty() {
            return Err(EngineError::validation("assistantId is required"));
        }
        if request.prompt.trim().is_empty() {
            return Err(EngineError::validation("prompt is required"));
        }

        let assistant = self
            .db
            .get_assistant(assistant_id)?
            .ok_or_else(|| EngineError::not_found(format!("assistant {}", assistant_id)))?;

        let kind = BackendKind::for_assistant_type(&assistant.assistant_type)
            .filter(|_| self.backends.is_available(&assistant.assistant_type))
            .ok_or_else(|| {
                EngineError::BackendUnavailable(format!(
                    "assistant type '{}'",
                    assistant.assistant_type.as_db_str()
                ))
            })?;

        let mut conversation = resolve_conversation(
            &self.db,
            &self.policy,
            ConversationRef {
                assistant_id,
                chat_id: request.chat_id.as_deref(),
                session_id: request.session_id.as_deref(),
            },
            Utc::now(),
        )?;

        let (max_results, memories) = self.memories_in_focus(assistant_id)?;
        let budgeted = budget_context(Some(max_results), &memories, &conversation.history);

        let bookkeeper = TaskBookkeeper::new(&self.db, &self.events);
        let task = bookkeeper.open(assistant_id, &request.prompt)?;

        let ai_request = AiRequest {
            assistant: assistant.clone(),
            prompt: request.prompt.clone(),
            memories: budgeted.memories,
            history: budgeted.history,
            conversation_id: match kind {
                BackendKind::Thread => conversation.thread_id.clone(),
                BackendKind::Completion => None,
            },
            cancel,
        };

        tracing::info!(
            "Dispatching task {} to {} backend for assistant {}",
            task.id,
            kind.as_str(),
            assistant_id
        );

        let response = match self.backends.ask(&ai_request).await {
            Some(response) => response,
            None => {
                let message = "backend returned no response".to_string();
                self.backend_failed(&bookkeeper, &task.id, &message);
                return Err(EngineError::BackendFailure(message));
            }
        };

        if let Some(error) = response.error.clone() {
            self.backend_failed(&bookkeeper, &task.id, &error);
            return Ok(AskResponse {
                assistant_id: assistant_id.to_string(),
                chat_id: conversation.chat_id,
                session_id: conversation.session_id,
                response_type: response.response_type,
                answer: error,
                task_id: task.id,
            });
        }

        if kind == BackendKind::Thread {
            if let Err(e) = apply_thread_override(
                &self.db,
                assistant_id,
                &mut conversation,
                response.conversation_id.as_deref(),
            ) {
                bookkeeper.fail_quietly(&task.id, &e.to_string());
                return Err(e);
            }
        }

        let persisted = TurnPersister::new(&self.db, self.atomic_turn_writes).persist(
            &conversation,
            &TurnRecord {
                assistant_id,
                user_id: request.user_id.as_deref(),
                prompt: &request.prompt,
                reply: &response.answer,
                task_id: &task.id,
            },
        );
        let persisted = match persisted {
            Ok(persisted) => persisted,
            Err(e) => {
                tracing::error!("Failed to persist turn for task {}: {:#}", task.id, e);
                bookkeeper.fail_quietly(&task.id, &format!("persistence failed: {:#}", e));
                return Err(EngineError::Store(e));
            }
        };

        for warning in &persisted.warnings {
            self.events.emit(EngineEvent::PersistenceWarning {
                task_id: Some(task.id.clone()),
                warning: warning.clone(),
            });
        }
        self.events.emit(EngineEvent::TurnPersisted {
            task_id: task.id.clone(),
            session_id: persisted.session_id.clone(),
            chat_id: persisted.chat_id.clone(),
        });

        if let Err(e) = bookkeeper.complete(&task.id, &response.answer) {
            tracing::error!("Failed to close task {}: {:#}", task.id, e);
        }

        Ok(AskResponse {
            assistant_id: assistant_id.to_string(),
            chat_id: Some(persisted.chat_id),
            session_id: Some(persisted.session_id),
            response_type: response.response_type,
            answer: response.answer,
            task_id: task.id,
        })
    }

    /// Focused memories under the assistant's rule, or its owned memories
    /// under the default budget when it has none. Most recent first.
    fn memories_in_focus(&self, assistant_id: &str) -> Result<(i64, Vec<Memory>), EngineError> {
        match self.db.get_focus_rule(assistant_id)? {
            Some(rule) => {
                let limit = rule.max_results.max(0) as usize;
                Ok((rule.max_results, self.db.list_focused_memories(&rule.id, limit)?))
            }
            None => {
                let limit = self.default_focus_max_results.max(0) as usize;
                Ok((
                    self.default_focus_max_results,
                    self.db.list_owned_memories(assistant_id, limit)?,
                ))
            }
        }
    }

    fn backend_failed(&self, bookkeeper: &TaskBookkeeper<'_>, task_id: &str, error: &str) {
        tracing::error!("Backend failure on task {}: {}", task_id, error);
        bookkeeper.fail_quietly(task_id, error);
        self.events.emit(EngineEvent::BackendFailure {
            task_id: task_id.to_string(),
            error: error.to_string(),
        });
    }

    /// Store a memory for an assistant outside of any conversation.
    pub fn remember(&self, request: &RememberRequest) -> Result<RememberOutcome, EngineError> {
        if request.content.trim().is_empty() {
            return Err(EngineError::validation("content is required"));
        }
        if self.db.get_assistant(&request.assistant_id)?.is_none() {
            return Err(EngineError::not_found(format!("assistant {}", request.assistant_id)));
        }
        let rule = if request.focus {
            let rule = self.db.get_focus_rule(&request.assistant_id)?.ok_or_else(|| {
                EngineError::validation(format!(
                    "assistant {} has no focus rule",
                    request.assistant_id
                ))
            })?;
            Some(rule)
        } else {
            None
        };

        let memory = self
            .db
            .create_memory(&request.content, request.memory_type, None)?;
        self.db.own_memory(&request.assistant_id, &memory.id)?;
        if let Some(rule) = rule {
            self.db.focus_memory(&rule.id, &memory.id)?;
        }

        let mut warnings = Vec::new();
        for tag in &request.tags {
            if let Err(e) = self.db.tag_memory(&memory.id, tag) {
                let warning = PersistenceWarning::new(format!("tag memory with '{}'", tag), format!("{:#}", e));
                tracing::warn!("Remember: {} failed: {}", warning.step, warning.detail);
                self.events.emit(EngineEvent::PersistenceWarning {
                    task_id: None,
                    warning: warning.clone(),
                });
                warnings.push(warning);
            }
        }

        tracing::info!(
            "Remembered {} memory {} for assistant {}",
            request.memory_type.as_db_str(),
            memory.id,
            request.assistant_id
        );
        Ok(RememberOutcome { memory, warnings })
    }

    pub fn suggest_assistants(
        &self,
        description: &str,
        tags: &[String],
    ) -> Result<Vec<AssistantSuggestion>, EngineError> {
        suggest_assistants(&self.db, description, tags)
    }

    pub fn evaluate_performance(&self, assistant_id: &str) -> Result<PerformanceReport, EngineError> {
        evaluate_performance(&self.db, assistant_id)
    }
}
