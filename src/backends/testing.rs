//! Deterministic in-process providers for tests.

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::time::Instant;

use super::{
    AiRequest, ChatMessage, CompletionProvider, RunStatus, ThreadMessage, ThreadProvider,
};
use crate::database::{
    Assistant, AssistantType, ConversationEntry, Memory, MemoryType, MessageRole,
};

pub(crate) type CompletionCall = (String, Vec<ChatMessage>, u32);

pub(crate) struct FakeCompletion {
    reply: Result<String, String>,
    calls: Mutex<Vec<CompletionCall>>,
}

impl FakeCompletion {
    pub(crate) fn replying(reply: &str) -> Self {
        Self {
            reply: Ok(reply.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing(message: &str) -> Self {
        Self {
            reply: Err(message.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> Vec<CompletionCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }
}

#[async_trait]
impl CompletionProvider for FakeCompletion {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<String> {
        self.calls
            .lock()
            .expect("calls lock")
            .push((model.to_string(), messages.to_vec(), max_tokens));
        match &self.reply {
            Ok(reply) => Ok(reply.clone()),
            Err(message) => anyhow::bail!("{}", message),
        }
    }
}

pub(crate) type AppendedMessage = (String, String, String, Instant);

pub(crate) struct FakeThreads {
    reply: Option<String>,
    statuses: Mutex<VecDeque<RunStatus>>,
    threads: AtomicUsize,
    polls: AtomicUsize,
    cancels: AtomicUsize,
    appended: Mutex<Vec<AppendedMessage>>,
    runs: Mutex<Vec<(String, Option<String>)>>,
    listed: Mutex<Vec<(String, String)>>,
}

impl FakeThreads {
    pub(crate) fn replying(reply: &str) -> Self {
        Self::with_reply(Some(reply.to_string()))
    }

    /// Completes every run without ever posting an assistant message.
    pub(crate) fn silent() -> Self {
        Self::with_reply(None)
    }

    fn with_reply(reply: Option<String>) -> Self {
        Self {
            reply,
            statuses: Mutex::new(VecDeque::new()),
            threads: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            appended: Mutex::new(Vec::new()),
            runs: Mutex::new(Vec::new()),
            listed: Mutex::new(Vec::new()),
        }
    }

    /// Statuses returned by successive polls; `Completed` once exhausted.
    pub(crate) fn set_statuses(&self, statuses: Vec<RunStatus>) {
        *self.statuses.lock().expect("statuses lock") = statuses.into();
    }

    pub(crate) fn threads_created(&self) -> usize {
        self.threads.load(Ordering::SeqCst)
    }

    pub(crate) fn poll_count(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }

    pub(crate) fn cancelled_runs(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }

    pub(crate) fn appended(&self) -> Vec<AppendedMessage> {
        self.appended.lock().expect("appended lock").clone()
    }

    pub(crate) fn runs_started(&self) -> Vec<(String, Option<String>)> {
        self.runs.lock().expect("runs lock").clone()
    }

    /// `(thread, run)` pairs whose messages were read.
    pub(crate) fn listed_runs(&self) -> Vec<(String, String)> {
        self.listed.lock().expect("listed lock").clone()
    }
}

#[async_trait]
impl ThreadProvider for FakeThreads {
    async fn create_thread(&self) -> Result<String> {
        let n = self.threads.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("thread_{}", n))
    }

    async fn append_message(&self, thread_id: &str, role: &str, content: &str) -> Result<()> {
        self.appended.lock().expect("appended lock").push((
            thread_id.to_string(),
            role.to_string(),
            content.to_string(),
            Instant::now(),
        ));
        Ok(())
    }

    async fn start_run(
        &self,
        _thread_id: &str,
        remote_assistant_id: &str,
        instructions: Option<&str>,
    ) -> Result<String> {
        let mut runs = self.runs.lock().expect("runs lock");
        runs.push((
            remote_assistant_id.to_string(),
            instructions.map(str::to_string),
        ));
        Ok(format!("run_{}", runs.len()))
    }

    async fn get_run(&self, _thread_id: &str, _run_id: &str) -> Result<RunStatus> {
        self.polls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .statuses
            .lock()
            .expect("statuses lock")
            .pop_front()
            .unwrap_or(RunStatus::Completed))
    }

    async fn cancel_run(&self, _thread_id: &str, _run_id: &str) -> Result<()> {
        self.cancels.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_messages(&self, thread_id: &str, run_id: &str) -> Result<Vec<ThreadMessage>> {
        self.listed
            .lock()
            .expect("listed lock")
            .push((thread_id.to_string(), run_id.to_string()));
        Ok(self
            .reply
            .iter()
            .map(|reply| ThreadMessage {
                role: "assistant".to_string(),
                text: reply.clone(),
            })
            .collect())
    }
}

fn entry(role: MessageRole, content: &str) -> ConversationEntry {
    ConversationEntry {
        message_id: uuid::Uuid::new_v4().to_string(),
        chat_id: "chat".to_string(),
        memory_id: uuid::Uuid::new_v4().to_string(),
        role,
        content: content.to_string(),
        created_at: Utc::now(),
    }
}

/// A request with instructions, one memory and a two-message history.
pub(crate) fn sample_request(assistant_type: AssistantType) -> AiRequest {
    let now = Utc::now();
    AiRequest {
        assistant: Assistant {
            id: "assistant-1".to_string(),
            name: "Sample".to_string(),
            assistant_type,
            model: Some("gpt-4o-mini".to_string()),
            instructions: Some("Be brief.".to_string()),
            external_assistant_id: Some("asst_remote".to_string()),
            created_at: now,
        },
        prompt: "next question".to_string(),
        memories: vec![Memory {
            id: "memory-1".to_string(),
            content: "remembered fact".to_string(),
            memory_type: MemoryType::Knowledge,
            task_id: None,
            created_at: now,
            updated_at: now,
        }],
        history: vec![
            entry(MessageRole::User, "earlier question"),
            entry(MessageRole::Assistant, "earlier answer"),
        ],
        conversation_id: None,
        cancel: None,
    }
}
