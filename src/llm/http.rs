// =============================================================================
// HttpLlmClient — OpenAI-compatible chat-completions client
// =============================================================================
//
// Speaks the lowest-common-denominator wire format shared by DeepSeek, the
// DashScope OpenAI-compatible mode, and arbitrary custom endpoints: a single
// struct parameterized by base URL / API key / model name rather than one
// type per vendor, since vendor selection is a configuration concern.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};

use super::{LLMClient, MAX_ATTEMPTS, MAX_TOKENS, TEMPERATURE, TIMEOUT_SECS};
use crate::error::{is_retryable_message, CoreError};

pub struct HttpLlmClient {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    model: String,
}

impl HttpLlmClient {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    fn chat_completions_url(&self) -> String {
        if self.base_url.ends_with('#') {
            self.base_url.trim_end_matches('#').to_string()
        } else {
            format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
        }
    }

    #[instrument(skip(self, system_prompt, user_prompt), name = "llm.call_once")]
    async fn call_once(&self, system_prompt: &str, user_prompt: &str) -> Result<String, CoreError> {
        let mut messages = Vec::new();
        if !system_prompt.is_empty() {
            messages.push(json!({"role": "system", "content": system_prompt}));
        }
        messages.push(json!({"role": "user", "content": user_prompt}));

        let body = json!({
            "model": self.model,
            "messages": messages,
            "temperature": TEMPERATURE,
            "max_tokens": MAX_TOKENS,
        });

        let resp = tokio::time::timeout(
            Duration::from_secs(TIMEOUT_SECS),
            self.client
                .post(self.chat_completions_url())
                .bearer_auth(&self.api_key)
                .json(&body)
                .send(),
        )
        .await
        .map_err(|_| CoreError::TransientIo("LLM call timed out".to_string()))?
        .map_err(|e| CoreError::TransientIo(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            if status.is_server_error() {
                return Err(CoreError::TransientIo(format!("{status}: {text}")));
            }
            return Err(CoreError::VendorRejection(format!("{status}: {text}")));
        }

        let parsed: ChatCompletionResponse = resp
            .json()
            .await
            .map_err(|e| CoreError::Parse(e.to_string()))?;

        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .unwrap_or_default();

        if content.trim().is_empty() {
            return Err(CoreError::VendorRejection("LLM returned empty content".to_string()));
        }

        Ok(content)
    }
}

#[async_trait]
impl LLMClient for HttpLlmClient {
    #[instrument(skip(self, system_prompt, user_prompt), name = "llm.call")]
    async fn call(&self, system_prompt: &str, user_prompt: &str) -> Result<String, CoreError> {
        let mut last_err = None;

        for attempt in 1..=MAX_ATTEMPTS {
            match self.call_once(system_prompt, user_prompt).await {
                Ok(content) => {
                    if attempt > 1 {
                        info!(attempt, "LLM call succeeded after retry");
                    }
                    return Ok(content);
                }
                Err(e) => {
                    let retryable = e.is_retryable() || is_retryable_message(&e.to_string());
                    if !retryable || attempt == MAX_ATTEMPTS {
                        return Err(e);
                    }
                    let wait_secs = 1u64 << (attempt - 1); // 1s, 2s, 4s
                    warn!(attempt, wait_secs, error = %e, "LLM call failed, retrying");
                    tokio::time::sleep(Duration::from_secs(wait_secs)).await;
                    last_err = Some(e);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| CoreError::TransientIo("LLM retries exhausted".to_string())))
    }
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Serialize, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chat_completions_url_appends_path() {
        let client = HttpLlmClient::new(
            reqwest::Client::new(),
            "https://api.deepseek.com/v1",
            "key",
            "deepseek-chat",
        );
        assert_eq!(client.chat_completions_url(), "https://api.deepseek.com/v1/chat/completions");
    }

    #[test]
    fn chat_completions_url_respects_full_url_marker() {
        let client = HttpLlmClient::new(
            reqwest::Client::new(),
            "https://custom.example.com/v1/messages#",
            "key",
            "model",
        );
        assert_eq!(client.chat_completions_url(), "https://custom.example.com/v1/messages");
    }

    #[test]
    fn backoff_sequence_is_multiplicative() {
        let waits: Vec<u64> = (1..=3).map(|attempt| 1u64 << (attempt - 1)).collect();
        assert_eq!(waits, vec![1, 2, 4]);
    }
}
