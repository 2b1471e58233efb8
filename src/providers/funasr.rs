/*
 * Meeting Minutes Pipeline - FunASR Gateway Provider
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
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, PipelineResult};

use super::{AsrInput, AsrOptions, AsrOutput, AsrProvider, AsrSegment};

/// Client for a local FunASR offline gateway. Takes raw audio bytes as a
/// multipart upload and returns sentence-level segments with raw speaker
/// labels when diarization is requested.
pub struct FunAsrProvider {
    client: Client,
    base_url: String,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct GatewayResponse {
    #[serde(default)]
    text: String,
    #[serde(default)]
    segments: Vec<GatewaySegment>,
}

#[derive(Debug, Deserialize)]
struct GatewaySegment {
    #[serde(default)]
    text: String,
    /// Milliseconds from audio start.
    #[serde(default)]
    start: f64,
    #[serde(default)]
    end: f64,
    /// Raw speaker label; integer or string depending on gateway version.
    #[serde(default)]
    spk: Option<serde_json::Value>,
}

impl FunAsrProvider {
    pub fn new(client: Client, base_url: &str, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn speaker_label(raw: Option<serde_json::Value>) -> Option<String> {
        match raw {
            Some(serde_json::Value::Number(n)) => Some(n.to_string()),
            Some(serde_json::Value::String(s)) if !s.is_empty() => Some(s),
            _ => None,
        }
    }
}

#[async_trait]
impl AsrProvider for FunAsrProvider {
    fn name(&self) -> &str {
        "funasr"
    }

    fn accepts_bytes(&self) -> bool {
        true
    }

    fn accepts_url(&self) -> bool {
        false
    }

    async fn recognize(
        &self,
        input: AsrInput,
        opts: &AsrOptions,
        cancel: &CancellationToken,
    ) -> PipelineResult<AsrOutput> {
        let (data, file_name) = match input {
            AsrInput::Bytes { data, file_name } => (data, file_name),
            AsrInput::Url(_) => {
                return Err(PipelineError::UnsupportedFormat(
                    "funasr gateway only accepts uploaded audio bytes".into(),
                ))
            }
        };

        let part = reqwest::multipart::Part::bytes(data)
            .file_name(file_name)
            .mime_str("audio/wav")
            .map_err(|e| PipelineError::Internal(format!("multipart build failed: {e}")))?;

        let mut form = reqwest::multipart::Form::new()
            .part("file", part)
            .text("use_punc", if opts.enable_punctuation { "1" } else { "0" })
            .text("use_spk", if opts.enable_diarization { "1" } else { "0" });
        if !opts.hotword_blob.is_empty() {
            form = form.text("hotword", opts.hotword_blob.clone());
        }
        if let Some(lang) = &opts.language_hint {
            form = form.text("language", lang.clone());
        }

        let request = self
            .client
            .post(format!("{}/api/v1/asr", self.base_url))
            .multipart(form)
            .timeout(self.timeout)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(PipelineError::Cancelled),
            result = request => result.map_err(|e| PipelineError::from_transport("funasr", e))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::from_status("funasr", status, &body));
        }

        let parsed: GatewayResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Internal(format!("funasr response parse failed: {e}")))?;

        let segments = parsed
            .segments
            .into_iter()
            .filter(|s| !s.text.trim().is_empty())
            .map(|s| AsrSegment {
                text: s.text.trim().to_string(),
                start_s: s.start / 1000.0,
                end_s: s.end / 1000.0,
                speaker_label: Self::speaker_label(s.spk),
            })
            .collect();

        Ok(AsrOutput {
            full_text: parsed.text.trim().to_string(),
            segments,
        })
    }

    async fn ready(&self) -> bool {
        self.client
            .get(format!("{}/health", self.base_url))
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
    async fn recognize_parses_gateway_segments() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/api/v1/asr")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(
                r#"{"text":"你好 世界","segments":[
                    {"text":"你好","start":0,"end":1200,"spk":0},
                    {"text":"世界","start":1200,"end":2400,"spk":1}
                ]}"#,
            )
            .create_async()
            .await;

        let provider = FunAsrProvider::new(
            Client::new(),
            &server.url(),
            Duration::from_secs(5),
        );
        let cancel = CancellationToken::new();
        let out = provider
            .recognize(
                AsrInput::Bytes {
                    data: vec![0u8; 16],
                    file_name: "a.wav".into(),
                },
                &AsrOptions {
                    enable_punctuation: true,
                    enable_diarization: true,
                    hotword_blob: "产品 迭代".into(),
                    language_hint: None,
                },
                &cancel,
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(out.full_text, "你好 世界");
        assert_eq!(out.segments.len(), 2);
        assert_eq!(out.segments[0].start_s, 0.0);
        assert_eq!(out.segments[1].end_s, 2.4);
        assert_eq!(out.segments[0].speaker_label.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn url_input_is_rejected() {
        let provider = FunAsrProvider::new(
            Client::new(),
            "http://localhost:1",
            Duration::from_secs(1),
        );
        let err = provider
            .recognize(
                AsrInput::Url("http://example.com/a.wav".into()),
                &AsrOptions::default(),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_FORMAT");
    }
}
