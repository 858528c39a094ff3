use crate::backend::LlmBackend;
use crate::config::{LlmProvider, ModelConfig};
use crate::history::Turn;
use async_trait::async_trait;
use parley_core::{ParleyError, ParleyResult};
use std::time::Duration;
use tracing::debug;

/// OpenAI-compatible chat completions backend.
///
/// Works with OpenAI, OpenRouter, Groq, Ollama, and any other provider
/// that implements the same API.
pub struct OpenAiBackend {
    config: ModelConfig,
    api_key: Option<String>,
    http: reqwest::Client,
}

impl OpenAiBackend {
    pub fn new(config: ModelConfig) -> ParleyResult<Self> {
        let api_key = config.resolve_api_key()?;
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| ParleyError::Llm(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            config,
            api_key,
            http,
        })
    }

    fn build_messages(
        &self,
        system: &str,
        history: &[Turn],
        user_message: &str,
    ) -> Vec<serde_json::Value> {
        let mut api_messages = Vec::with_capacity(history.len() + 2);
        if !system.trim().is_empty() {
            api_messages.push(serde_json::json!({
                "role": "system",
                "content": system
            }));
        }
        for turn in history {
            api_messages.push(serde_json::json!({
                "role": turn.role.as_str(),
                "content": turn.content
            }));
        }
        api_messages.push(serde_json::json!({
            "role": "user",
            "content": user_message
        }));
        api_messages
    }

    fn add_provider_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        };

        // OpenRouter requires extra headers
        if self.config.provider == LlmProvider::OpenRouter {
            request
                .header("HTTP-Referer", "https://github.com/parley-gateway/parley")
                .header("X-Title", "Parley")
        } else {
            request
        }
    }
}

#[async_trait]
impl LlmBackend for OpenAiBackend {
    async fn complete(
        &self,
        system: &str,
        history: &[Turn],
        user_message: &str,
    ) -> ParleyResult<String> {
        let url = format!("{}/v1/chat/completions", self.config.base_url());
        let body = serde_json::json!({
            "model": self.config.model_id,
            "max_tokens": self.config.max_tokens,
            "temperature": self.config.temperature,
            "messages": self.build_messages(system, history, user_message),
        });

        let resp = self
            .add_provider_headers(self.http.post(&url))
            .json(&body)
            .send()
            .await
            .map_err(|e| ParleyError::Llm(e.to_string()))?;

        let status = resp.status();
        let resp_body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| ParleyError::Llm(e.to_string()))?;

        if !status.is_success() {
            return Err(ParleyError::Llm(format!(
                "API error {status}: {resp_body}"
            )));
        }

        let reply = parse_completion(&resp_body)?;
        debug!(
            model = %self.config.model_id,
            history = history.len(),
            reply_chars = reply.chars().count(),
            "Completion received"
        );
        Ok(reply)
    }
}

/// Text of the first choice. An empty or missing reply is an error.
pub fn parse_completion(body: &serde_json::Value) -> ParleyResult<String> {
    let content = body["choices"][0]["message"]["content"]
        .as_str()
        .map(str::trim)
        .unwrap_or_default();
    if content.is_empty() {
        return Err(ParleyError::Llm(format!(
            "completion has no text content: {body}"
        )));
    }
    Ok(content.to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_completion_trims() {
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "  Olá!\n"}, "finish_reason": "stop"}]
        });
        assert_eq!(parse_completion(&body).unwrap(), "Olá!");
    }

    #[test]
    fn test_parse_completion_rejects_empty() {
        let body = serde_json::json!({"choices": [{"message": {"content": null}}]});
        assert!(matches!(parse_completion(&body), Err(ParleyError::Llm(_))));
        assert!(parse_completion(&serde_json::json!({})).is_err());
    }

    #[test]
    fn test_build_messages_orders_system_history_user() {
        let backend = OpenAiBackend::new(ModelConfig {
            api_key: Some("sk-test".into()),
            ..ModelConfig::default()
        })
        .unwrap();
        let history = vec![Turn::user("oi"), Turn::assistant("olá")];
        let messages = backend.build_messages("Be brief.", &history, "preço?");
        let roles: Vec<&str> = messages.iter().map(|m| m["role"].as_str().unwrap()).collect();
        assert_eq!(roles, vec!["system", "user", "assistant", "user"]);
        assert_eq!(messages[3]["content"], "preço?");

        let messages = backend.build_messages("  ", &[], "x");
        assert_eq!(messages.len(), 1);
    }
}
