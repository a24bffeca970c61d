//! Completion-service client
//!
//! Narrow contract over the chat-completions API. The production client
//! speaks the OpenAI-compatible wire format with function calling; tests
//! substitute the trait with a scripted mock.

use crate::error::{AskError, Result};
use crate::schemas::{ChatMessage, FunctionCall, FunctionDefinition};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Token usage reported by the completion service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
    #[serde(default)]
    pub total_tokens: u32,
}

/// Plain-text completion.
#[derive(Debug, Clone)]
pub struct Completion {
    pub text: String,
    pub usage: Usage,
}

/// Completion forced through a function schema.
#[derive(Debug, Clone)]
pub struct FunctionCompletion {
    pub call: Option<FunctionCall>,
    pub text: Option<String>,
    pub usage: Usage,
}

#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<Completion>;

    async fn chat_with_function(
        &self,
        model: &str,
        messages: &[ChatMessage],
        function: &FunctionDefinition,
        temperature: f32,
    ) -> Result<FunctionCompletion>;
}

pub struct OpenAiClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl OpenAiClient {
    pub fn new(api_key: String, base_url: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AskError::Completion(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            api_key,
            base_url,
        })
    }

    async fn post_chat(&self, body: serde_json::Value) -> Result<serde_json::Value> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| AskError::Completion(format!("Completion API call failed: {}", e)))?;

        response
            .json()
            .await
            .map_err(|e| AskError::Completion(format!("Failed to parse completion response: {}", e)))
    }

    fn wire_messages(messages: &[ChatMessage]) -> Vec<serde_json::Value> {
        messages
            .iter()
            .map(|m| {
                let mut msg = serde_json::json!({ "role": m.role });
                if let Some(ref content) = m.content {
                    msg["content"] = serde_json::json!(content);
                }
                if let Some(ref call) = m.function_call {
                    msg["function_call"] = serde_json::json!({
                        "name": call.name,
                        "arguments": call.arguments,
                    });
                }
                if let Some(ref name) = m.name {
                    msg["name"] = serde_json::json!(name);
                }
                msg
            })
            .collect()
    }

    fn parse_usage(response: &serde_json::Value) -> Usage {
        serde_json::from_value(response["usage"].clone()).unwrap_or_default()
    }
}

#[async_trait]
impl CompletionClient for OpenAiClient {
    async fn chat(
        &self,
        model: &str,
        messages: &[ChatMessage],
        temperature: f32,
    ) -> Result<Completion> {
        let body = serde_json::json!({
            "model": model,
            "messages": Self::wire_messages(messages),
            "temperature": temperature,
        });

        let response = self.post_chat(body).await?;
        let text = response["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| AskError::Completion("No content in completion response".to_string()))?
            .trim()
            .to_string();

        Ok(Completion {
            text,
            usage: Self::parse_usage(&response),
        })
    }

    async fn chat_with_function(
        &self,
        model: &str,
        messages: &[ChatMessage],
        function: &FunctionDefinition,
        temperature: f32,
    ) -> Result<FunctionCompletion> {
        let body = serde_json::json!({
            "model": model,
            "messages": Self::wire_messages(messages),
            "functions": [{
                "name": function.name,
                "description": function.description,
                "parameters": function.parameters,
            }],
            "function_call": { "name": function.name },
            "temperature": temperature,
        });

        let response = self.post_chat(body).await?;
        let message = &response["choices"][0]["message"];

        let call = if message["function_call"].is_object() {
            Some(FunctionCall {
                name: message["function_call"]["name"]
                    .as_str()
                    .unwrap_or_default()
                    .to_string(),
                arguments: message["function_call"]["arguments"]
                    .as_str()
                    .unwrap_or("{}")
                    .to_string(),
            })
        } else {
            None
        };

        Ok(FunctionCompletion {
            call,
            text: message["content"].as_str().map(|s| s.trim().to_string()),
            usage: Self::parse_usage(&response),
        })
    }
}

/// Cost of one completion call in USD, from the per-1K-token price table.
pub fn calc_cost(model: &str, usage: &Usage) -> f64 {
    let (input, output) = match model {
        "gpt-4o-mini" => (0.00015, 0.0006),
        "gpt-4o" => (0.0025, 0.01),
        "gpt-4" => (0.03, 0.06),
        "gpt-3.5-turbo" => (0.0015, 0.002),
        // Fallback - assume the cheap tier
        _ => (0.00015, 0.0006),
    };
    (usage.prompt_tokens as f64 / 1000.0) * input
        + (usage.completion_tokens as f64 / 1000.0) * output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_calc_cost_known_model() {
        let usage = Usage {
            prompt_tokens: 1000,
            completion_tokens: 1000,
            total_tokens: 2000,
        };
        let cost = calc_cost("gpt-4o", &usage);
        assert!((cost - 0.0125).abs() < 1e-9);
    }

    #[test]
    fn test_calc_cost_unknown_model_uses_fallback() {
        let usage = Usage {
            prompt_tokens: 2000,
            completion_tokens: 0,
            total_tokens: 2000,
        };
        assert!((calc_cost("some-model", &usage) - 0.0003).abs() < 1e-9);
    }
}
