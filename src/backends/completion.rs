use std::sync::Arc;

use super::{AiRequest, AiResponse, ChatMessage, CompletionProvider};

/// Stateless request/response strategy: one provider call per prompt.
pub struct CompletionBackend {
    provider: Arc<dyn CompletionProvider>,
    default_model: String,
    max_output_tokens: u32,
}

impl CompletionBackend {
    pub fn new(
        provider: Arc<dyn CompletionProvider>,
        default_model: &str,
        max_output_tokens: u32,
    ) -> Self {
        Self {
            provider,
            default_model: default_model.to_string(),
            max_output_tokens,
        }
    }

    /// Ordered as instructions, memories, history, then the prompt.
    pub fn build_messages(request: &AiRequest) -> Vec<ChatMessage> {
        let mut messages = Vec::with_capacity(request.history.len() + 3);

        if let Some(instructions) = request
            .assistant
            .instructions
            .as_deref()
            .filter(|s| !s.trim().is_empty())
        {
            messages.push(ChatMessage::system(instructions));
        }

        if !request.memories.is_empty() {
            let mut block = String::from("Relevant memories:");
            for memory in &request.memories {
                block.push_str("\n- ");
                block.push_str(&memory.content);
            }
            messages.push(ChatMessage::system(block));
        }

        messages.extend(request.history.iter().map(ChatMessage::from_entry));
        messages.push(ChatMessage::user(request.prompt.clone()));
        messages
    }

    pub async fn ask(&self, request: &AiRequest) -> Option<AiResponse> {
        let model = request
            .assistant
            .model
            .as_deref()
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(&self.default_model);
        let messages = Self::build_messages(request);

        tracing::debug!(
            "Completion call for assistant {} ({} messages, model {})",
            request.assistant.id,
            messages.len(),
            model
        );

        match self
            .provider
            .complete(model, &messages, self.max_output_tokens)
            .await
        {
            Ok(answer) if answer.trim().is_empty() => {
                tracing::warn!("Completion provider returned an empty reply");
                None
            }
            Ok(answer) => Some(AiResponse::text(answer, None)),
            Err(e) => {
                tracing::error!("Completion call failed: {:#}", e);
                Some(AiResponse::failure(format!("{:#}", e), None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::testing::{sample_request, FakeCompletion};
    use crate::database::AssistantType;

    #[tokio::test]
    async fn builds_messages_in_fixed_order() {
        let provider = Arc::new(FakeCompletion::replying("sure"));
        let backend = CompletionBackend::new(provider.clone(), "fallback-model", 256);
        let mut request = sample_request(AssistantType::Completion);
        request.assistant.model = None;

        let response = backend.ask(&request).await.expect("response");
        assert_eq!(response.answer, "sure");
        assert_eq!(response.response_type, "text");
        assert!(response.conversation_id.is_none());

        let calls = provider.calls();
        assert_eq!(calls.len(), 1);
        let (model, messages, max_tokens) = &calls[0];
        assert_eq!(model, "fallback-model");
        assert_eq!(*max_tokens, 256);
        let roles: Vec<&str> = messages.iter().map(|m| m.role.as_str()).collect();
        assert_eq!(roles, vec!["system", "system", "user", "assistant", "user"]);
        assert_eq!(messages[0].content, "Be brief.");
        assert!(messages[1].content.contains("- remembered fact"));
        assert_eq!(messages.last().map(|m| m.content.as_str()), Some("next question"));
    }

    #[tokio::test]
    async fn provider_error_becomes_error_response() {
        let provider = Arc::new(FakeCompletion::failing("upstream 500"));
        let backend = CompletionBackend::new(provider, "m", 64);
        let response = backend
            .ask(&sample_request(AssistantType::Completion))
            .await
            .expect("error response");
        assert!(response.error.is_some());
        assert_eq!(response.response_type, "error");
        assert!(response.error.as_deref().unwrap_or_default().contains("upstream 500"));
    }

    #[tokio::test]
    async fn empty_reply_yields_nothing() {
        let backend = CompletionBackend::new(Arc::new(FakeCompletion::replying("  ")), "m", 64);
        assert!(backend
            .ask(&sample_request(AssistantType::Completion))
            .await
            .is_none());
    }
}
