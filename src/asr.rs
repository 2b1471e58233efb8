/*
 * Meeting Minutes Pipeline - ASR Engine
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

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::AsrConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::hotwords::HotwordRegistry;
use crate::providers::{AsrInput, AsrOptions, AsrOutput, AsrProvider};
use crate::types::join_segment_texts;

/// What the controller hands the engine after source resolution.
#[derive(Debug, Clone)]
pub enum EngineInput {
    /// Local file, with the probed duration when it could be determined.
    File {
        path: PathBuf,
        duration_s: Option<f64>,
    },
    /// Remote URL, passed through to URL-capable providers.
    Url(String),
}

/// Drives one ASR provider with hotword biasing, the duration cap and the
/// per-call timeout. The hotword table is snapshotted once per call, so a
/// concurrent reload never produces a mixed word list.
pub struct AsrEngine {
    provider: Arc<dyn AsrProvider>,
    hotwords: Arc<HotwordRegistry>,
    max_audio_seconds: f64,
    call_timeout: Duration,
    enable_punctuation: bool,
    enable_diarization: bool,
    language_hint: Option<String>,
}

impl AsrEngine {
    pub fn new(
        provider: Arc<dyn AsrProvider>,
        hotwords: Arc<HotwordRegistry>,
        config: &AsrConfig,
    ) -> Self {
        Self {
            provider,
            hotwords,
            max_audio_seconds: config.max_audio_seconds,
            call_timeout: Duration::from_secs(config.call_timeout_s),
            enable_punctuation: config.enable_punctuation,
            enable_diarization: config.enable_diarization,
            language_hint: config.language_hint.clone(),
        }
    }

    pub fn provider_name(&self) -> &str {
        self.provider.name()
    }

    /// Whether the selected provider can fetch remote URLs itself.
    pub fn accepts_url(&self) -> bool {
        self.provider.accepts_url()
    }

    pub async fn transcribe(
        &self,
        input: EngineInput,
        cancel: &CancellationToken,
    ) -> PipelineResult<AsrOutput> {
        let table = self.hotwords.snapshot();
        let opts = AsrOptions {
            enable_punctuation: self.enable_punctuation,
            enable_diarization: self.enable_diarization,
            hotword_blob: table.render(),
            language_hint: self.language_hint.clone(),
        };

        let provider_input = match input {
            EngineInput::File { path, duration_s } => {
                if let Some(duration) = duration_s {
                    if duration > self.max_audio_seconds {
                        return Err(PipelineError::DurationExceeded {
                            actual: duration,
                            cap: self.max_audio_seconds,
                        });
                    }
                }
                if !self.provider.accepts_bytes() {
                    return Err(PipelineError::UnsupportedFormat(format!(
                        "asr provider '{}' requires a fetchable url, got a local file",
                        self.provider.name()
                    )));
                }
                let data = tokio::fs::read(&path).await.map_err(|e| {
                    PipelineError::Internal(format!("cannot read {}: {e}", path.display()))
                })?;
                let file_name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or("audio.wav")
                    .to_string();
                AsrInput::Bytes { data, file_name }
            }
            EngineInput::Url(url) => {
                if !self.provider.accepts_url() {
                    return Err(PipelineError::UnsupportedFormat(format!(
                        "asr provider '{}' cannot fetch urls",
                        self.provider.name()
                    )));
                }
                AsrInput::Url(url)
            }
        };

        let recognized = tokio::time::timeout(
            self.call_timeout,
            self.provider.recognize(provider_input, &opts, cancel),
        )
        .await
        .map_err(|_| {
            PipelineError::UpstreamTimeout(format!(
                "asr call exceeded {}s",
                self.call_timeout.as_secs()
            ))
        })??;

        // Alias-substitution pass over the recognized text.
        let mut output = recognized;
        for segment in &mut output.segments {
            segment.text = table.apply_mappings(&segment.text);
        }
        output.full_text = if output.full_text.is_empty() && !output.segments.is_empty() {
            join_segment_texts(output.segments.iter().map(|s| s.text.as_str()))
        } else {
            table.apply_mappings(&output.full_text)
        };

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::AsrSegment;
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct ScriptedAsr {
        bytes_ok: bool,
        url_ok: bool,
        seen_hotwords: Mutex<Vec<String>>,
    }

    impl ScriptedAsr {
        fn bytes_provider() -> Self {
            Self {
                bytes_ok: true,
                url_ok: false,
                seen_hotwords: Mutex::new(Vec::new()),
            }
        }

        fn url_provider() -> Self {
            Self {
                bytes_ok: false,
                url_ok: true,
                seen_hotwords: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AsrProvider for ScriptedAsr {
        fn name(&self) -> &str {
            "scripted"
        }

        fn accepts_bytes(&self) -> bool {
            self.bytes_ok
        }

        fn accepts_url(&self) -> bool {
            self.url_ok
        }

        async fn recognize(
            &self,
            _input: AsrInput,
            opts: &AsrOptions,
            _cancel: &CancellationToken,
        ) -> PipelineResult<AsrOutput> {
            self.seen_hotwords.lock().push(opts.hotword_blob.clone());
            Ok(AsrOutput {
                full_text: "提到了灰度".into(),
                segments: vec![AsrSegment {
                    text: "提到了灰度".into(),
                    start_s: 0.0,
                    end_s: 2.0,
                    speaker_label: None,
                }],
            })
        }

        async fn ready(&self) -> bool {
            true
        }
    }

    fn engine_with(provider: ScriptedAsr, max_audio_seconds: f64) -> (AsrEngine, tempfile::NamedTempFile) {
        let hotword_file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(
            hotword_file.path(),
            r#"{"产品": ["灰度发布"], "mappings": {"产品": {"灰度": "灰度发布"}}}"#,
        )
        .unwrap();
        let hotwords = Arc::new(HotwordRegistry::load(hotword_file.path()));
        let config = AsrConfig {
            funasr_base_url: String::new(),
            tencent_base_url: String::new(),
            tencent_api_key: String::new(),
            max_audio_seconds,
            call_timeout_s: 5,
            enable_punctuation: true,
            enable_diarization: true,
            language_hint: None,
        };
        (AsrEngine::new(Arc::new(provider), hotwords, &config), hotword_file)
    }

    fn temp_audio() -> tempfile::NamedTempFile {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), [0u8; 64]).unwrap();
        file
    }

    #[tokio::test]
    async fn duration_at_cap_passes_and_over_cap_fails() {
        let (engine, _hw) = engine_with(ScriptedAsr::bytes_provider(), 30.0);
        let audio = temp_audio();

        let at_cap = engine
            .transcribe(
                EngineInput::File {
                    path: audio.path().to_path_buf(),
                    duration_s: Some(30.0),
                },
                &CancellationToken::new(),
            )
            .await;
        assert!(at_cap.is_ok());

        let over_cap = engine
            .transcribe(
                EngineInput::File {
                    path: audio.path().to_path_buf(),
                    duration_s: Some(31.0),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(over_cap.code(), "DURATION_EXCEEDED");
    }

    #[tokio::test]
    async fn local_file_with_url_only_provider_is_rejected() {
        let (engine, _hw) = engine_with(ScriptedAsr::url_provider(), 30.0);
        let audio = temp_audio();
        let err = engine
            .transcribe(
                EngineInput::File {
                    path: audio.path().to_path_buf(),
                    duration_s: Some(5.0),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_FORMAT");
    }

    #[tokio::test]
    async fn hotword_blob_and_alias_mapping_are_applied() {
        let (engine, _hw) = engine_with(ScriptedAsr::bytes_provider(), 30.0);
        let audio = temp_audio();
        let out = engine
            .transcribe(
                EngineInput::File {
                    path: audio.path().to_path_buf(),
                    duration_s: Some(5.0),
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        // Provider saw the rendered blob; output text got the alias pass.
        assert_eq!(out.full_text, "提到了灰度发布");
        assert_eq!(out.segments[0].text, "提到了灰度发布");
    }
}
