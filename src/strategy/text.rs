//! Markdown and text-array generation.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;

use crate::provider::Provider;

use super::{complete_within, Generation, Plan};

const MARKDOWN_SYSTEM: &str = "You are a function. Respond in markdown.";
const LIST_SYSTEM: &str = "You are a function. Respond with a numbered list, one item per line, and nothing else.";

pub fn markdown_prompt(plan: &Plan<'_>) -> (String, String) {
    (MARKDOWN_SYSTEM.to_string(), plan.user_prompt())
}

pub fn list_prompt(plan: &Plan<'_>) -> (String, String) {
    let mut system = LIST_SYSTEM.to_string();
    if let Some(Value::Array(items)) = plan.request.shape.as_ref() {
        if let Some(Value::String(hint)) = items.first() {
            system.push_str("\nEach item is: ");
            system.push_str(hint);
        }
    }
    (system, plan.user_prompt())
}

pub async fn generate_text(provider: &dyn Provider, plan: &Plan<'_>) -> Generation {
    let (system, user) = markdown_prompt(plan);
    let request = plan.completion_request(system, user);
    match complete_within(provider, &request, plan.timeout_ms).await {
        Ok(completion) => Generation::new(Value::String(completion.text), completion.reasoning),
        Err(e) => Generation::failed(e.to_string()),
    }
}

pub async fn generate_text_array(provider: &dyn Provider, plan: &Plan<'_>) -> Generation {
    let (system, user) = list_prompt(plan);
    let request = plan.completion_request(system, user);
    match complete_within(provider, &request, plan.timeout_ms).await {
        Ok(completion) => {
            let items = parse_list(&completion.text)
                .into_iter()
                .map(Value::String)
                .collect();
            Generation::new(Value::Array(items), completion.reasoning)
        }
        Err(e) => Generation::failed(e.to_string()),
    }
}

fn item_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^\s*(?:\d+[.)]|[-*•])\s+(.+?)\s*$").ok())
        .as_ref()
}

/// Items of a numbered (or bulleted) list. Text without list markers falls
/// back to its non-empty lines.
pub fn parse_list(text: &str) -> Vec<String> {
    let marked: Vec<String> = match item_pattern() {
        Some(pattern) => text
            .lines()
            .filter_map(|line| pattern.captures(line))
            .filter_map(|caps| caps.get(1).map(|m| m.as_str().to_string()))
            .collect(),
        None => Vec::new(),
    };
    if !marked.is_empty() {
        return marked;
    }
    text.lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect()
}
