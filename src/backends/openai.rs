use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

use super::{ChatMessage, CompletionProvider, RunStatus, ThreadMessage, ThreadProvider};

const RUN_MESSAGE_LIMIT: &str = "20";

/// OpenAI-compatible HTTP client covering chat completions and the threads API.
#[derive(Clone)]
pub struct OpenAiClient {
    api_url: String,
    api_key: Option<String>,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IdObject {
    id: String,
}

#[derive(Debug, Deserialize)]
struct RunObject {
    status: RunStatus,
}

#[derive(Debug, Deserialize)]
struct MessageList {
    data: Vec<ThreadMessageObject>,
}

#[derive(Debug, Deserialize)]
struct ThreadMessageObject {
    role: String,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    content: Vec<ContentPart>,
}

#[derive(Debug, Deserialize)]
struct ContentPart {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<TextPart>,
}

#[derive(Debug, Deserialize)]
struct TextPart {
    value: String,
}

impl OpenAiClient {
    pub fn new(api_url: &str, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            api_url: api_url.trim_end_matches('/').to_string(),
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            client,
        })
    }

    fn authorize(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => req.header("Authorization", format!("Bearer {}", key)),
            None => req,
        }
    }

    fn threads_request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let url = format!("{}{}", self.api_url, path);
        self.authorize(self.client.request(method, url))
            .header("OpenAI-Beta", "assistants=v2")
    }

    async fn send_json<T>(&self, req: reqwest::RequestBuilder, what: &str) -> Result<T>
    where
        T: for<'de> Deserialize<'de>,
    {
        let response = req
            .send()
            .await
            .with_context(|| format!("Failed to send {} request", what))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read body".to_string());
            anyhow::bail!("{} returned error {}: {}", what, status, body);
        }

        response
            .json()
            .await
            .with_context(|| format!("Failed to parse {} response", what))
    }
}

#[async_trait]
impl CompletionProvider for OpenAiClient {
    async fn complete(
        &self,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: u32,
    ) -> Result<String> {
        let url = format!("{}/chat/completions", self.api_url);
        let request = ChatCompletionRequest {
            model,
            messages,
            max_tokens,
        };
        let req = self.authorize(self.client.post(&url).json(&request));
        let completion: ChatCompletionResponse = self.send_json(req, "chat completion").await?;

        completion
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("No response from LLM"))
    }
}

#[async_trait]
impl ThreadProvider for OpenAiClient {
    async fn create_thread(&self) -> Result<String> {
        let req = self
            .threads_request(reqwest::Method::POST, "/threads")
            .json(&json!({}));
        let thread: IdObject = self.send_json(req, "create thread").await?;
        Ok(thread.id)
    }

    async fn append_message(&self, thread_id: &str, role: &str, content: &str) -> Result<()> {
        let req = self
            .threads_request(
                reqwest::Method::POST,
                &format!("/threads/{}/messages", thread_id),
            )
            .json(&json!({ "role": role, "content": content }));
        let _: IdObject = self.send_json(req, "append message").await?;
        Ok(())
    }

    async fn start_run(
        &self,
        thread_id: &str,
        remote_assistant_id: &str,
        instructions: Option<&str>,
    ) -> Result<String> {
        let mut body = json!({ "assistant_id": remote_assistant_id });
        if let Some(instructions) = instructions.filter(|s| !s.trim().is_empty()) {
            body["instructions"] = json!(instructions);
        }
        let req = self
            .threads_request(reqwest::Method::POST, &format!("/threads/{}/runs", thread_id))
            .json(&body);
        let run: IdObject = self.send_json(req, "start run").await?;
        Ok(run.id)
    }

    async fn get_run(&self, thread_id: &str, run_id: &str) -> Result<RunStatus> {
        let req = self.threads_request(
            reqwest::Method::GET,
            &format!("/threads/{}/runs/{}", thread_id, run_id),
        );
        let run: RunObject = self.send_json(req, "get run").await?;
        Ok(run.status)
    }

    async fn cancel_run(&self, thread_id: &str, run_id: &str) -> Result<()> {
        let req = self.threads_request(
            reqwest::Method::POST,
            &format!("/threads/{}/runs/{}/cancel", thread_id, run_id),
        );
        let _: RunObject = self.send_json(req, "cancel run").await?;
        Ok(())
    }

    async fn list_messages(&self, thread_id: &str, run_id: &str) -> Result<Vec<ThreadMessage>> {
        let req = self
            .threads_request(
                reqwest::Method::GET,
                &format!("/threads/{}/messages", thread_id),
            )
            .query(&[("order", "desc"), ("limit", RUN_MESSAGE_LIMIT), ("run_id", run_id)]);
        let list: MessageList = self.send_json(req, "list messages").await?;

        // Servers that ignore the run filter still tag messages with their run.
        Ok(list
            .data
            .into_iter()
            .filter(|message| message.run_id.as_deref().map_or(true, |id| id == run_id))
            .map(|message| {
                let text = message
                    .content
                    .into_iter()
                    .filter(|part| part.kind == "text")
                    .filter_map(|part| part.text.map(|t| t.value))
                    .collect::<Vec<_>>()
                    .join("\n");
                ThreadMessage {
                    role: message.role,
                    text,
                }
            })
            .collect())
    }
}
