use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::ExecResult;
use crate::types::{Message, TokenUsage};

/// A single model invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub model: String,
    pub temperature: f64,
    pub max_tokens: u32,
    /// JSON Schema the output must follow, when the provider supports
    /// structured output.
    pub response_schema: Option<Value>,
}

impl CompletionRequest {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            messages: Vec::new(),
            model: model.into(),
            temperature: 0.0,
            max_tokens: 4096,
            response_schema: None,
        }
    }

    pub fn with_message(mut self, message: Message) -> Self {
        self.messages.push(message);
        self
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_response_schema(mut self, schema: Value) -> Self {
        self.response_schema = Some(schema);
        self
    }

    /// Concatenated user-visible prompt text, mostly useful in tests.
    pub fn prompt_text(&self) -> String {
        self.messages
            .iter()
            .map(|m| m.content.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// What a provider hands back once the model finishes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub text: String,
    pub reasoning: Option<String>,
    pub usage: Option<TokenUsage>,
    pub model: String,
}

impl Completion {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = Some(reasoning.into());
        self
    }
}

/// Model inference. Which model answers is the caller's concern; the engine
/// only forwards `settings.model`.
#[async_trait::async_trait]
pub trait Provider: Send + Sync {
    fn name(&self) -> &str;

    /// Stream a completion, sending text fragments through the channel as
    /// they arrive. The returned `Completion` carries the full text.
    async fn stream(
        &self,
        request: &CompletionRequest,
        delta_tx: mpsc::UnboundedSender<String>,
    ) -> ExecResult<Completion>;

    /// Non-streaming completion (default impl collects the stream)
    async fn complete(&self, request: &CompletionRequest) -> ExecResult<Completion> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let result = self.stream(request, tx).await?;
        while rx.try_recv().is_ok() {}
        Ok(result)
    }
}
