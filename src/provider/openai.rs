use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::{ExecError, ExecResult};
use crate::types::TokenUsage;

use super::traits::{Completion, CompletionRequest, Provider};

/// OpenAI-compatible chat completions over server-sent events.
pub struct OpenAIProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

impl OpenAIProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url("https://api.openai.com", api_key)
    }

    pub fn with_base_url(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }

    /// Reads `OPENAI_API_KEY` and, when set, `OPENAI_BASE_URL`.
    pub fn from_env() -> ExecResult<Self> {
        let key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| ExecError::Config("OPENAI_API_KEY is not set".into()))?;
        let base = std::env::var("OPENAI_BASE_URL").unwrap_or_else(|_| "https://api.openai.com".into());
        Ok(Self::with_base_url(base, key))
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|m| json!({"role": m.role.to_string(), "content": m.content}))
            .collect();

        let mut body = json!({
            "model": request.model,
            "messages": messages,
            "temperature": request.temperature,
            "stream": true,
            "stream_options": {"include_usage": true},
        });

        if request.max_tokens > 0 {
            body["max_tokens"] = json!(request.max_tokens);
        }

        if let Some(schema) = &request.response_schema {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "output",
                    "schema": schema,
                    "strict": false,
                }
            });
        }

        body
    }
}

/// Accumulates SSE `data:` payloads into a completion.
#[derive(Default)]
struct SseAccumulator {
    buffer: String,
    text: String,
    reasoning: String,
    usage: Option<TokenUsage>,
    done: bool,
}

impl SseAccumulator {
    /// Feed raw bytes; complete lines are parsed, partial ones are kept.
    fn feed(&mut self, chunk: &str, delta_tx: &mpsc::UnboundedSender<String>) {
        self.buffer.push_str(chunk);
        while let Some(pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=pos).collect();
            self.line(line.trim_end(), delta_tx);
        }
    }

    fn finish(mut self, delta_tx: &mpsc::UnboundedSender<String>) -> Self {
        let rest = std::mem::take(&mut self.buffer);
        if !rest.trim().is_empty() {
            self.line(rest.trim_end(), delta_tx);
        }
        self
    }

    fn line(&mut self, line: &str, delta_tx: &mpsc::UnboundedSender<String>) {
        if self.done {
            return;
        }
        let Some(data) = line.strip_prefix("data:").map(str::trim) else {
            return;
        };
        if data == "[DONE]" {
            self.done = true;
            return;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return;
        };

        if let Some(delta) = event.pointer("/choices/0/delta") {
            if let Some(content) = delta.get("content").and_then(|v| v.as_str()) {
                self.text.push_str(content);
                let _ = delta_tx.send(content.to_string());
            }
            if let Some(reasoning) = delta.get("reasoning_content").and_then(|v| v.as_str()) {
                self.reasoning.push_str(reasoning);
            }
        }

        if let Some(u) = event.get("usage").filter(|u| u.is_object()) {
            let input = u.get("prompt_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
            let output = u.get("completion_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
            self.usage = Some(TokenUsage::new(input as usize, output as usize));
        }
    }
}

#[async_trait]
impl Provider for OpenAIProvider {
    fn name(&self) -> &str {
        "openai"
    }

    async fn stream(
        &self,
        request: &CompletionRequest,
        delta_tx: mpsc::UnboundedSender<String>,
    ) -> ExecResult<Completion> {
        let body = self.build_body(request);
        let url = format!("{}/v1/chat/completions", self.base_url);

        let mut response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();

            if status.as_u16() == 429 {
                return Err(ExecError::RateLimited {
                    provider: "openai".into(),
                    retry_after_ms: 5000,
                });
            }
            return Err(ExecError::Provider(format!(
                "OpenAI API error {status}: {body}"
            )));
        }

        let mut acc = SseAccumulator::default();
        while let Some(chunk) = response.chunk().await? {
            acc.feed(&String::from_utf8_lossy(&chunk), &delta_tx);
        }
        let acc = acc.finish(&delta_tx);

        Ok(Completion {
            text: acc.text,
            reasoning: (!acc.reasoning.is_empty()).then_some(acc.reasoning),
            usage: acc.usage,
            model: request.model.clone(),
        })
    }
}
