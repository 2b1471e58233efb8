/*
 * Meeting Minutes Pipeline - OpenAI-compatible Chat Provider
 * Copyright (c) 2024 Meeting Minutes Contributors
 *
 * This work is licensed under the Creative Commons Attribution-NonCommercial 4.0 International License.
 * To view a copy of this license, visit http://creativecommons.org/licenses/by-nc/4.0/
 *
 * You are free to share and adapt this work for non-commercial purposes with attribution.
 * Commercial use is prohibited without explicit written permission.
 *
 * For commercial licensing inquiries, please contact the project maintainers.
 */

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::config::LlmEndpoint;
use crate::error::{PipelineError, PipelineResult};

use super::{LlmOptions, LlmOutput, LlmProvider};

/// One chat-completions client covers both DeepSeek and Qwen (DashScope
/// compatible mode); only base URL, key and model differ.
pub struct ChatProvider {
    name: String,
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    total_tokens: u64,
}

impl ChatProvider {
    pub fn new(name: &str, client: Client, endpoint: &LlmEndpoint, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            client,
            base_url: endpoint.base_url.trim_end_matches('/').to_string(),
            api_key: endpoint.api_key.clone(),
            model: endpoint.model.clone(),
            timeout,
        }
    }

    fn classify_client_error(status: reqwest::StatusCode, body: &str) -> PipelineError {
        let lowered = body.to_ascii_lowercase();
        if lowered.contains("context_length")
            || lowered.contains("context length")
            || lowered.contains("maximum context")
        {
            return PipelineError::ContextLength(body.chars().take(300).collect());
        }
        PipelineError::from_status("llm", status, body)
    }
}

#[async_trait]
impl LlmProvider for ChatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn complete(
        &self,
        system: &str,
        user: &str,
        opts: &LlmOptions,
        cancel: &CancellationToken,
    ) -> PipelineResult<LlmOutput> {
        let model = opts.model_name.as_deref().unwrap_or(&self.model);
        let body = json!({
            "model": model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": user},
            ],
            "temperature": opts.temperature,
            "max_tokens": opts.max_tokens,
            "stream": false,
        });

        let request = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(self.timeout)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            result = request => result.map_err(|e| PipelineError::from_transport("llm", e))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::classify_client_error(status, &body));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Internal(format!("llm response parse failed: {e}")))?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .unwrap_or_default();
        if text.trim().is_empty() {
            return Err(PipelineError::UpstreamUnavailable(
                "llm returned an empty completion".into(),
            ));
        }

        Ok(LlmOutput {
            text,
            usage_tokens: parsed.usage.map(|u| u.total_tokens).unwrap_or(0),
        })
    }

    async fn ready(&self) -> bool {
        self.client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .timeout(Duration::from_secs(3))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(base_url: String) -> LlmEndpoint {
        LlmEndpoint {
            base_url,
            api_key: "sk-test".into(),
            model: "deepseek-chat".into(),
        }
    }

    #[tokio::test]
    async fn complete_returns_text_and_usage() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(200)
            .with_body(
                r#"{"choices":[{"message":{"role":"assistant","content":"# 会议纪要"}}],
                    "usage":{"prompt_tokens":10,"completion_tokens":20,"total_tokens":30}}"#,
            )
            .create_async()
            .await;

        let provider = ChatProvider::new(
            "deepseek",
            Client::new(),
            &endpoint(server.url()),
            Duration::from_secs(5),
        );
        let out = provider
            .complete("system", "user", &LlmOptions::default(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out.text, "# 会议纪要");
        assert_eq!(out.usage_tokens, 30);
    }

    #[tokio::test]
    async fn context_length_errors_are_classified() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(400)
            .with_body(r#"{"error":{"message":"This model's maximum context length is 65536 tokens"}}"#)
            .create_async()
            .await;

        let provider = ChatProvider::new(
            "deepseek",
            Client::new(),
            &endpoint(server.url()),
            Duration::from_secs(5),
        );
        let err = provider
            .complete("s", "u", &LlmOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CONTEXT_LENGTH");
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn rate_limit_is_transient() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/chat/completions")
            .with_status(429)
            .with_body("slow down")
            .create_async()
            .await;

        let provider = ChatProvider::new(
            "qwen3",
            Client::new(),
            &endpoint(server.url()),
            Duration::from_secs(5),
        );
        let err = provider
            .complete("s", "u", &LlmOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "RATE_LIMITED");
        assert!(err.is_transient());
    }
}
