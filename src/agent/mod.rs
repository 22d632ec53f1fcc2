use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ExecError, ExecResult};
use crate::provider::{CompletionRequest, Provider};
use crate::types::Message;

/// What a delegated agent hands back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentReply {
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning: Option<String>,
}

/// Runs a named agent to completion. Called from a scheduler worker, never
/// on the request path.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    async fn run(&self, agent_id: &str, prompt: &str, context: &Value) -> ExecResult<AgentReply>;
}

/// Agent profile: a system prompt bound to a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub id: String,
    pub system_prompt: String,
    pub model: String,
    #[serde(default)]
    pub temperature: f64,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_max_tokens() -> u32 {
    4096
}

impl AgentProfile {
    pub fn new(id: impl Into<String>, system_prompt: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            system_prompt: system_prompt.into(),
            model: model.into(),
            temperature: 0.0,
            max_tokens: default_max_tokens(),
        }
    }

    pub fn with_temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }
}

/// Agent registry: runs registered profiles as stateless single-turn
/// completions on a shared provider.
pub struct AgentRegistry {
    provider: Arc<dyn Provider>,
    profiles: HashMap<String, AgentProfile>,
}

impl AgentRegistry {
    pub fn new(provider: Arc<dyn Provider>) -> Self {
        Self {
            provider,
            profiles: HashMap::new(),
        }
    }

    pub fn register(&mut self, profile: AgentProfile) {
        self.profiles.insert(profile.id.clone(), profile);
    }

    pub fn with_profile(mut self, profile: AgentProfile) -> Self {
        self.register(profile);
        self
    }

    pub fn get(&self, agent_id: &str) -> Option<&AgentProfile> {
        self.profiles.get(agent_id)
    }

    pub fn ids(&self) -> Vec<&str> {
        self.profiles.keys().map(|s| s.as_str()).collect()
    }

    fn build_request(profile: &AgentProfile, prompt: &str, context: &Value) -> CompletionRequest {
        let mut user = prompt.to_string();
        if !context.is_null() {
            let rendered = serde_json::to_string_pretty(context).unwrap_or_else(|_| context.to_string());
            user.push_str("\n\nContext:\n");
            user.push_str(&rendered);
        }
        CompletionRequest::new(profile.model.clone())
            .with_message(Message::system(profile.system_prompt.clone()))
            .with_message(Message::user(user))
            .with_temperature(profile.temperature)
            .with_max_tokens(profile.max_tokens)
    }
}

#[async_trait]
impl AgentRunner for AgentRegistry {
    async fn run(&self, agent_id: &str, prompt: &str, context: &Value) -> ExecResult<AgentReply> {
        let profile = self.get(agent_id).ok_or_else(|| ExecError::Agent {
            agent_id: agent_id.to_string(),
            message: "no such agent".into(),
        })?;

        let request = Self::build_request(profile, prompt, context);
        let completion = self
            .provider
            .complete(&request)
            .await
            .map_err(|e| ExecError::Agent {
                agent_id: agent_id.to_string(),
                message: e.to_string(),
            })?;

        let usage = completion.usage.unwrap_or_default();
        tracing::debug!(
            agent = agent_id,
            tokens = usage.total(),
            "agent run finished"
        );

        let text = completion.text.trim();
        let output = serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()));
        Ok(AgentReply {
            output,
            reasoning: completion.reasoning,
        })
    }
}
