use anyhow::Result;
use std::sync::Arc;
use tokio::time::{sleep, sleep_until, Instant};

use super::{AiRequest, AiResponse, RunStatus, ThreadProvider};
use crate::config::ThreadBackendConfig;
use crate::database::MessageRole;

/// Strategy for assistants whose conversation lives in an externally hosted thread.
pub struct ThreadBackend {
    provider: Arc<dyn ThreadProvider>,
    config: ThreadBackendConfig,
}

enum RunOutcome {
    Reply(String),
    NoReply,
}

impl ThreadBackend {
    pub fn new(provider: Arc<dyn ThreadProvider>, config: ThreadBackendConfig) -> Self {
        Self { provider, config }
    }

    pub async fn ask(&self, request: &AiRequest) -> Option<AiResponse> {
        let Some(remote_id) = request
            .assistant
            .external_assistant_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
        else {
            return Some(AiResponse::failure(
                format!(
                    "assistant {} has no external assistant configured",
                    request.assistant.id
                ),
                request.conversation_id.clone(),
            ));
        };

        let mut thread_id = request.conversation_id.clone();
        match self.run_turn(request, remote_id, &mut thread_id).await {
            Ok(RunOutcome::Reply(answer)) => Some(AiResponse::text(answer, thread_id)),
            Ok(RunOutcome::NoReply) => {
                tracing::warn!("Thread run finished without an assistant message");
                None
            }
            Err(e) => {
                tracing::error!("Thread run failed: {:#}", e);
                Some(AiResponse::failure(format!("{:#}", e), thread_id))
            }
        }
    }

    async fn run_turn(
        &self,
        request: &AiRequest,
        remote_id: &str,
        thread_slot: &mut Option<String>,
    ) -> Result<RunOutcome> {
        let thread_id = match thread_slot.clone() {
            Some(id) => id,
            None => {
                let id = self.provider.create_thread().await?;
                tracing::debug!("Created thread {}", id);
                *thread_slot = Some(id.clone());
                id
            }
        };

        for entry in &request.history {
            self.provider
                .append_message(&thread_id, entry.role.as_db_str(), &entry.content)
                .await?;
        }

        // Provider message ordering is coarser than call latency.
        if !request.history.is_empty() && !self.config.pre_prompt_delay().is_zero() {
            sleep(self.config.pre_prompt_delay()).await;
        }
        self.provider
            .append_message(&thread_id, MessageRole::User.as_db_str(), &request.prompt)
            .await?;

        let run_id = self
            .provider
            .start_run(
                &thread_id,
                remote_id,
                request.assistant.instructions.as_deref(),
            )
            .await?;

        let status = self.wait_for_run(request, &thread_id, &run_id).await?;
        if status != RunStatus::Completed {
            anyhow::bail!("run {} ended with status {:?}", run_id, status);
        }

        let messages = self.provider.list_messages(&thread_id, &run_id).await?;
        let reply = messages
            .into_iter()
            .find(|m| m.role == MessageRole::Assistant.as_db_str())
            .map(|m| m.text);

        Ok(match reply {
            Some(text) if !text.trim().is_empty() => RunOutcome::Reply(text),
            _ => RunOutcome::NoReply,
        })
    }

    /// Poll until the run is terminal, the deadline passes, or the request is cancelled.
    async fn wait_for_run(
        &self,
        request: &AiRequest,
        thread_id: &str,
        run_id: &str,
    ) -> Result<RunStatus> {
        let deadline = Instant::now() + self.config.run_timeout();

        loop {
            if request.cancel.as_ref().is_some_and(|t| t.is_cancelled()) {
                self.abandon_run(thread_id, run_id).await;
                anyhow::bail!("run {} cancelled by caller", run_id);
            }

            let status = self.provider.get_run(thread_id, run_id).await?;
            if status.is_terminal() {
                return Ok(status);
            }

            let now = Instant::now();
            if now >= deadline {
                self.abandon_run(thread_id, run_id).await;
                anyhow::bail!(
                    "run {} did not finish within {}s",
                    run_id,
                    self.config.run_timeout().as_secs()
                );
            }

            let wake = (now + self.config.poll_interval()).min(deadline);
            match &request.cancel {
                Some(token) => {
                    tokio::select! {
                        _ = token.cancelled() => {}
                        _ = sleep_until(wake) => {}
                    }
                }
                None => sleep_until(wake).await,
            }
        }
    }

    async fn abandon_run(&self, thread_id: &str, run_id: &str) {
        if let Err(e) = self.provider.cancel_run(thread_id, run_id).await {
            tracing::warn!("Failed to cancel run {}: {:#}", run_id, e);
        }
    }
}
