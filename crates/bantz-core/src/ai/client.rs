//! LLM client contract and the OpenAI-compatible HTTP implementation.
//!
//! The kernel only needs two calls: `complete_text` for the router
//! (strict JSON output expected) and `chat_detailed` for the finalizer.
//! Streaming backends are welcome behind the trait; the core reads only
//! the finalized text.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ChatResponse {
    pub content: String,
    pub model: String,
    pub tokens_used: u64,
    pub finish_reason: String,
}

/// The two-method LLM contract consumed by the router and finalizer.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Single-prompt completion; the router expects strict JSON back.
    async fn complete_text(&self, prompt: &str, temperature: f64, max_tokens: u32)
        -> Result<String>;

    /// Chat completion with model/usage metadata for telemetry.
    async fn chat_detailed(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<ChatResponse>;
}

/// OpenAI-compatible `/v1/chat/completions` client (vLLM, llama.cpp,
/// and most gateways speak this).
pub struct HttpLlmClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    api_key: Option<String>,
}

impl HttpLlmClient {
    pub fn new(base_url: &str, model: &str, api_key: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            api_key,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<ChatResponse> {
        let url = format!("{}/v1/chat/completions", self.base_url);
        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
            "stream": false,
        });

        let mut request = self.http.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.context("LLM request failed")?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(anyhow!("LLM backend error {status}: {text}"));
        }

        let value: serde_json::Value = response.json().await.context("LLM response not JSON")?;
        let content = value["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow!("LLM response missing choices[0].message.content"))?
            .to_string();

        Ok(ChatResponse {
            content,
            model: value["model"].as_str().unwrap_or(&self.model).to_string(),
            tokens_used: value["usage"]["total_tokens"].as_u64().unwrap_or(0),
            finish_reason: value["choices"][0]["finish_reason"]
                .as_str()
                .unwrap_or("")
                .to_string(),
        })
    }
}

#[async_trait]
impl LlmClient for HttpLlmClient {
    async fn complete_text(
        &self,
        prompt: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> Result<String> {
        let messages = [ChatMessage::user(prompt)];
        let response = self.chat(&messages, temperature, max_tokens).await?;
        Ok(response.content)
    }

    async fn chat_detailed(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<ChatResponse> {
        self.chat(messages, temperature, max_tokens).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_constructors_set_roles() {
        assert_eq!(ChatMessage::system("s").role, "system");
        assert_eq!(ChatMessage::user("u").role, "user");
        assert_eq!(ChatMessage::assistant("a").role, "assistant");
    }

    #[test]
    fn base_url_trailing_slash_is_trimmed() {
        let client = HttpLlmClient::new("http://localhost:8001/", "qwen", None);
        assert_eq!(client.base_url, "http://localhost:8001");
        assert_eq!(client.model(), "qwen");
    }
}
