//! AI backend abstraction: one closed set of backend kinds, one strategy per kind.
//!
//! Strategies never return errors. Provider failures come back as an
//! [`AiResponse`] carrying `error`; `None` means the backend produced nothing
//! usable at all.

pub mod completion;
pub mod openai;
pub mod thread;

#[cfg(test)]
pub(crate) mod testing;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

use crate::database::{Assistant, AssistantType, ConversationEntry, Memory, MessageRole};

pub use completion::CompletionBackend;
pub use openai::OpenAiClient;
pub use thread::ThreadBackend;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Completion,
    Thread,
}

impl BackendKind {
    pub fn for_assistant_type(assistant_type: &AssistantType) -> Option<Self> {
        match assistant_type {
            AssistantType::Completion => Some(BackendKind::Completion),
            AssistantType::Thread => Some(BackendKind::Thread),
            AssistantType::Other(_) => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            BackendKind::Completion => "completion",
            BackendKind::Thread => "thread",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }

    pub fn from_entry(entry: &ConversationEntry) -> Self {
        match entry.role {
            MessageRole::User => Self::user(entry.content.clone()),
            MessageRole::Assistant => Self::assistant(entry.content.clone()),
        }
    }
}

/// Everything a strategy needs for one call, already budgeted.
#[derive(Debug, Clone)]
pub struct AiRequest {
    pub assistant: Assistant,
    pub prompt: String,
    pub memories: Vec<Memory>,
    pub history: Vec<ConversationEntry>,
    /// External thread to continue, if the active chat is bound to one.
    pub conversation_id: Option<String>,
    pub cancel: Option<CancellationToken>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AiResponse {
    pub answer: String,
    pub response_type: String,
    /// Thread the reply was produced in. Completion replies carry none.
    pub conversation_id: Option<String>,
    pub error: Option<String>,
}

impl AiResponse {
    pub fn text(answer: impl Into<String>, conversation_id: Option<String>) -> Self {
        Self {
            answer: answer.into(),
            response_type: "text".to_string(),
            conversation_id,
            error: None,
        }
    }

    pub fn failure(message: impl Into<String>, conversation_id: Option<String>) -> Self {
        let message = message.into();
        Self {
            answer: String::new(),
            response_type: "error".to_string(),
            conversation_id,
            error: Some(message),
        }
    }
}

/// Stateless chat completion capability of an external provider.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    async fn complete(&self, model: &str, messages: &[ChatMessage], max_tokens: u32)
        -> Result<String>;
}

/// Run state reported by a thread provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    InProgress,
    RequiresAction,
    Cancelling,
    Cancelled,
    Failed,
    Completed,
    Incomplete,
    Expired,
    #[serde(other)]
    Unknown,
}

impl RunStatus {
    /// Whether polling should stop. Tool calls are not served, so a run that
    /// requires action will never progress on its own.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::RequiresAction
                | RunStatus::Cancelled
                | RunStatus::Failed
                | RunStatus::Completed
                | RunStatus::Incomplete
                | RunStatus::Expired
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadMessage {
    pub role: String,
    pub text: String,
}

/// Persistent-thread capability of an external provider.
#[async_trait]
pub trait ThreadProvider: Send + Sync {
    async fn create_thread(&self) -> Result<String>;
    async fn append_message(&self, thread_id: &str, role: &str, content: &str) -> Result<()>;
    async fn start_run(
        &self,
        thread_id: &str,
        remote_assistant_id: &str,
        instructions: Option<&str>,
    ) -> Result<String>;
    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<RunStatus>;
    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<()>;
    /// Messages the given run added to a thread, newest first.
    async fn list_messages(&self, thread_id: &str, run_id: &str) -> Result<Vec<ThreadMessage>>;
}

pub enum AiBackend {
    Completion(CompletionBackend),
    Thread(ThreadBackend),
}

impl AiBackend {
    pub fn kind(&self) -> BackendKind {
        match self {
            AiBackend::Completion(_) => BackendKind::Completion,
            AiBackend::Thread(_) => BackendKind::Thread,
        }
    }

    pub async fn ask(&self, request: &AiRequest) -> Option<AiResponse> {
        match self {
            AiBackend::Completion(backend) => backend.ask(request).await,
            AiBackend::Thread(backend) => backend.ask(request).await,
        }
    }
}

/// At most one backend per kind.
#[derive(Default)]
pub struct BackendRegistry {
    backends: HashMap<BackendKind, AiBackend>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend, returning the one it replaced.
    pub fn register(&mut self, backend: AiBackend) -> Option<AiBackend> {
        let kind = backend.kind();
        tracing::info!("Registered {} backend", kind.as_str());
        self.backends.insert(kind, backend)
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<BackendKind> = self.backends.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    fn backend_for(&self, assistant_type: &AssistantType) -> Option<&AiBackend> {
        BackendKind::for_assistant_type(assistant_type).and_then(|kind| self.backends.get(&kind))
    }

    pub fn is_available(&self, assistant_type: &AssistantType) -> bool {
        self.backend_for(assistant_type).is_some()
    }

    pub async fn ask(&self, request: &AiRequest) -> Option<AiResponse> {
        match self.backend_for(&request.assistant.assistant_type) {
            Some(backend) => backend.ask(request).await,
            None => {
                tracing::warn!(
                    "No backend for assistant type '{}'",
                    request.assistant.assistant_type.as_db_str()
                );
                None
            }
        }
    }
}
