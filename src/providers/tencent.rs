/*
 * Meeting Minutes Pipeline - Tencent Cloud ASR Provider
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

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, PipelineResult};

use super::{AsrInput, AsrOptions, AsrOutput, AsrProvider, AsrSegment};

const POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Client for the Tencent recording-recognition task API (behind the
/// account's API gateway). The service fetches audio itself, so only URL
/// input is supported; bytes are rejected with a distinct error instead
/// of being silently downgraded.
pub struct TencentAsrProvider {
    client: Client,
    base_url: String,
    api_key: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct CreateTaskResponse {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct TaskStatusResponse {
    /// "waiting" | "doing" | "success" | "failed"
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    result: Option<TaskResult>,
}

#[derive(Debug, Deserialize)]
struct TaskResult {
    #[serde(default)]
    text: String,
    #[serde(default)]
    sentences: Vec<TaskSentence>,
}

#[derive(Debug, Deserialize)]
struct TaskSentence {
    #[serde(default)]
    text: String,
    /// Milliseconds from audio start.
    #[serde(default)]
    start_time: f64,
    #[serde(default)]
    end_time: f64,
    #[serde(default)]
    speaker_id: Option<i64>,
}

impl TencentAsrProvider {
    pub fn new(client: Client, base_url: &str, api_key: &str, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            timeout,
        }
    }

    async fn create_task(
        &self,
        url: &str,
        opts: &AsrOptions,
        cancel: &CancellationToken,
    ) -> PipelineResult<String> {
        let mut body = json!({
            "engine_model_type": "16k_zh",
            "url": url,
            "filter_punc": if opts.enable_punctuation { 0 } else { 1 },
            "speaker_diarization": if opts.enable_diarization { 1 } else { 0 },
        });
        if !opts.hotword_blob.is_empty() {
            body["hotword_list"] = json!(opts.hotword_blob);
        }

        let request = self
            .client
            .post(format!("{}/asr/v2/tasks", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            result = request => result.map_err(|e| PipelineError::from_transport("tencent-asr", e))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_status("tencent-asr", status, &body));
        }

        let created: CreateTaskResponse = response.json().await.map_err(|e| {
            PipelineError::Internal(format!("tencent task response parse failed: {e}"))
        })?;
        Ok(created.task_id)
    }

    async fn poll_task(
        &self,
        task_id: &str,
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> PipelineResult<TaskResult> {
        loop {
            if Instant::now() >= deadline {
                return Err(PipelineError::UpstreamTimeout(format!(
                    "tencent-asr task {task_id} did not finish in time"
                )));
            }

            let request = self
                .client
                .get(format!("{}/asr/v2/tasks/{}", self.base_url, task_id))
                .bearer_auth(&self.api_key)
                .timeout(Duration::from_secs(30))
                .send();

            let response = tokio::select! {
                _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                result = request => result.map_err(|e| PipelineError::from_transport("tencent-asr", e))?,
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(PipelineError::from_status("tencent-asr", status, &body));
            }

            let parsed: TaskStatusResponse = response.json().await.map_err(|e| {
                PipelineError::Internal(format!("tencent task status parse failed: {e}"))
            })?;

            match parsed.status.as_str() {
                "success" => {
                    return parsed.result.ok_or_else(|| {
                        PipelineError::Internal("tencent-asr reported success without a result".into())
                    })
                }
                "failed" => {
                    return Err(PipelineError::UpstreamUnavailable(format!(
                        "tencent-asr task failed: {}",
                        parsed.error_message.unwrap_or_else(|| "unknown".into())
                    )))
                }
                _ => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
                        _ = tokio::time::sleep(POLL_INTERVAL) => {}
                    }
                }
            }
        }
    }
}

#[async_trait]
impl AsrProvider for TencentAsrProvider {
    fn name(&self) -> &str {
        "tencent"
    }

    fn accepts_bytes(&self) -> bool {
        false
    }

    fn accepts_url(&self) -> bool {
        true
    }

    async fn recognize(
        &self,
        input: AsrInput,
        opts: &AsrOptions,
        cancel: &CancellationToken,
    ) -> PipelineResult<AsrOutput> {
        let url = match input {
            AsrInput::Url(url) => url,
            AsrInput::Bytes { .. } => {
                return Err(PipelineError::UnsupportedFormat(
                    "tencent asr requires a fetchable audio url, not raw bytes".into(),
                ))
            }
        };

        let deadline = Instant::now() + self.timeout;
        let task_id = self.create_task(&url, opts, cancel).await?;
        tracing::info!("tencent-asr task created: {}", task_id);
        let result = self.poll_task(&task_id, deadline, cancel).await?;

        let segments = result
            .sentences
            .into_iter()
            .filter(|s| !s.text.trim().is_empty())
            .map(|s| AsrSegment {
                text: s.text.trim().to_string(),
                start_s: s.start_time / 1000.0,
                end_s: s.end_time / 1000.0,
                speaker_label: s.speaker_id.map(|id| id.to_string()),
            })
            .collect();

        Ok(AsrOutput {
            full_text: result.text.trim().to_string(),
            segments,
        })
    }

    async fn ready(&self) -> bool {
        self.client
            .get(format!("{}/asr/v2/health", self.base_url))
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

    #[tokio::test]
    async fn bytes_input_is_rejected_without_network() {
        let provider = TencentAsrProvider::new(
            Client::new(),
            "http://localhost:1",
            "key",
            Duration::from_secs(1),
        );
        let err = provider
            .recognize(
                AsrInput::Bytes {
                    data: vec![0u8; 4],
                    file_name: "a.wav".into(),
                },
                &AsrOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_FORMAT");
    }

    #[tokio::test]
    async fn create_then_poll_until_success() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/asr/v2/tasks")
            .with_status(200)
            .with_body(r#"{"task_id":"t-1"}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/asr/v2/tasks/t-1")
            .with_status(200)
            .with_body(
                r#"{"status":"success","result":{"text":"大家好。","sentences":[
                    {"text":"大家好。","start_time":0,"end_time":1500,"speaker_id":0}
                ]}}"#,
            )
            .create_async()
            .await;

        let provider = TencentAsrProvider::new(
            Client::new(),
            &server.url(),
            "key",
            Duration::from_secs(30),
        );
        let out = provider
            .recognize(
                AsrInput::Url("http://example.com/a.wav".into()),
                &AsrOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out.full_text, "大家好。");
        assert_eq!(out.segments[0].speaker_label.as_deref(), Some("0"));
    }
}
