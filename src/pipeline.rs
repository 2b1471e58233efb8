/*
 * Meeting Minutes Pipeline - Pipeline Controller
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

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::asr::{AsrEngine, EngineInput};
use crate::audio::{read_wav_mono, resolve_source, AudioPreprocessor};
use crate::config::{AsrModelChoice, Config, LlmModelChoice};
use crate::diarize::{assign_by_overlap, densify_labels, Diarizer, DiarizerConfig};
use crate::document::extract_text;
use crate::error::{PipelineError, PipelineResult};
use crate::history::HistoryService;
use crate::hotwords::HotwordRegistry;
use crate::llm::LlmOrchestrator;
use crate::providers::{LlmOptions, ProviderSet};
use crate::template::TemplateResolver;
use crate::types::{AudioSource, HistoryRequest, Transcript, TranscriptSegment};
use crate::voiceprint::VoiceprintMatcher;

/// A document handed to the pipeline, either staged bytes or a path.
#[derive(Debug, Clone)]
pub enum DocumentInput {
    Path(PathBuf),
    Upload { file_name: String, data: Vec<u8> },
}

/// Exactly one input kind per request; the API layer validates the raw
/// form before constructing this.
#[derive(Debug, Clone)]
pub enum MeetingInput {
    Audio(Vec<AudioSource>),
    Document(DocumentInput),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct ProcessRequest {
    pub input: MeetingInput,
    pub template: String,
    pub user_requirement: Option<String>,
    pub history: HistoryRequest,
    pub asr_model: AsrModelChoice,
    pub llm_model: LlmModelChoice,
    pub llm_temperature: f32,
    pub llm_max_tokens: u32,
}

impl ProcessRequest {
    pub fn new(input: MeetingInput) -> Self {
        Self {
            input,
            template: "default".to_string(),
            user_requirement: None,
            history: HistoryRequest::default(),
            asr_model: AsrModelChoice::Auto,
            llm_model: LlmModelChoice::Auto,
            llm_temperature: 0.7,
            llm_max_tokens: 2_000,
        }
    }
}

/// Failure of one file in a multi-audio batch.
#[derive(Debug, Clone, Serialize)]
pub struct FileError {
    pub index: usize,
    pub source: String,
    pub code: String,
    pub message: String,
}

/// Everything the response surface needs from a completed request.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub raw_text: String,
    pub transcript: Vec<TranscriptSegment>,
    pub markdown: String,
    pub need_rag: bool,
    pub usage_tokens: u64,
    pub per_file_errors: Vec<FileError>,
}

/// Per-request state machine: validate, normalize the input into a
/// transcript, gather history, drive the LLM, clean up.
pub struct MinutesPipeline {
    config: Arc<Config>,
    providers: Arc<ProviderSet>,
    hotwords: Arc<HotwordRegistry>,
    preprocessor: Arc<AudioPreprocessor>,
    http: reqwest::Client,
}

impl MinutesPipeline {
    pub fn new(
        config: Arc<Config>,
        providers: Arc<ProviderSet>,
        hotwords: Arc<HotwordRegistry>,
        preprocessor: AudioPreprocessor,
    ) -> Self {
        Self {
            config,
            providers,
            hotwords,
            preprocessor: Arc::new(preprocessor),
            http: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &Arc<Config> {
        &self.config
    }

    pub fn providers(&self) -> &Arc<ProviderSet> {
        &self.providers
    }

    pub fn hotwords(&self) -> &Arc<HotwordRegistry> {
        &self.hotwords
    }

    pub async fn process(
        &self,
        request: ProcessRequest,
        cancel: &CancellationToken,
    ) -> PipelineResult<ProcessOutcome> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // Per-request working directory, removed on every exit path.
        let work_dir = tempfile::Builder::new()
            .prefix("minutes-req-")
            .tempdir_in(&self.config.temp_dir)
            .map_err(|e| PipelineError::Internal(format!("cannot create temp dir: {e}")))?;

        let mut per_file_errors = Vec::new();
        let (transcript, prompt_text) = match &request.input {
            MeetingInput::Text(text) => {
                let text = text.trim();
                if text.is_empty() {
                    return Err(PipelineError::BadInput("text_content is empty".into()));
                }
                (Transcript::default(), text.to_string())
            }
            MeetingInput::Document(document) => {
                let text = self.parse_document(document, work_dir.path()).await?;
                (Transcript::default(), text)
            }
            MeetingInput::Audio(sources) => {
                if sources.is_empty() {
                    return Err(PipelineError::BadInput("no audio supplied".into()));
                }
                let (transcript, errors) = self
                    .transcribe_batch(sources, &request, work_dir.path(), cancel)
                    .await?;
                per_file_errors = errors;
                let prompt_text = format_for_prompt(&transcript);
                (transcript, prompt_text)
            }
        };

        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // History and the LLM run serially after the merge.
        let llm_provider = self.providers.select_llm(request.llm_model)?;
        let history = HistoryService::new(
            llm_provider.clone(),
            self.providers.embedding(),
            self.providers.vector(),
            self.config.vector.archive_collection.clone(),
            self.config.retrieval.clone(),
        );
        let history_outcome = history.resolve(&request.history, &prompt_text, cancel).await;

        let resolver =
            TemplateResolver::new(&self.config.template_dir, self.config.max_prompt_tokens);
        let system = resolver.resolve(&request.template)?;
        let prompt = resolver.build_prompt(
            &system,
            &prompt_text,
            &history_outcome.context,
            request.user_requirement.as_deref(),
        )?;

        let orchestrator = LlmOrchestrator::new(llm_provider);
        let opts = LlmOptions {
            temperature: request.llm_temperature,
            max_tokens: request.llm_max_tokens,
            model_name: None,
        };
        let llm_output = tokio::time::timeout(
            Duration::from_secs(self.config.llm_budget_s),
            orchestrator.generate(&prompt, &opts, cancel),
        )
        .await
        .map_err(|_| PipelineError::DeadlineExceeded("llm stage exceeded its budget".into()))??;

        let raw_text = if transcript.segments.is_empty() {
            prompt_text
        } else {
            transcript.full_text.clone()
        };

        Ok(ProcessOutcome {
            raw_text,
            transcript: transcript.segments,
            markdown: llm_output.text,
            need_rag: history_outcome.attached,
            usage_tokens: llm_output.usage_tokens,
            per_file_errors,
        })
    }

    async fn parse_document(
        &self,
        document: &DocumentInput,
        work_dir: &Path,
    ) -> PipelineResult<String> {
        let path = match document {
            DocumentInput::Path(path) => path.clone(),
            DocumentInput::Upload { file_name, data } => {
                if data.is_empty() {
                    return Err(PipelineError::BadInput(format!(
                        "uploaded document '{file_name}' is empty"
                    )));
                }
                let staged = work_dir.join(
                    Path::new(file_name)
                        .file_name()
                        .map(|n| n.to_os_string())
                        .unwrap_or_else(|| "document.txt".into()),
                );
                tokio::fs::write(&staged, data).await.map_err(|e| {
                    PipelineError::Internal(format!("failed to stage document: {e}"))
                })?;
                staged
            }
        };
        extract_text(&path).await
    }

    /// Fan the batch out over the bounded worker pool, then merge in
    /// submission order with a monotonic timeline.
    async fn transcribe_batch(
        &self,
        sources: &[AudioSource],
        request: &ProcessRequest,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> PipelineResult<(Transcript, Vec<FileError>)> {
        let provider = self.providers.select_asr(request.asr_model)?;
        let engine = Arc::new(AsrEngine::new(
            provider,
            self.hotwords.clone(),
            &self.config.asr,
        ));

        let pool = self.config.worker_pool_size(sources.len());
        tracing::info!(
            "transcribing {} file(s) with '{}' over {pool} worker(s)",
            sources.len(),
            engine.provider_name()
        );

        let results: Vec<PipelineResult<(Transcript, f64)>> = tokio::time::timeout(
            Duration::from_secs(self.config.asr_budget_s),
            futures::stream::iter(sources.iter())
                .map(|source| {
                    let engine = engine.clone();
                    async move { self.process_one_audio(&engine, source, work_dir, cancel).await }
                })
                .buffered(pool)
                .collect::<Vec<_>>(),
        )
        .await
        .map_err(|_| PipelineError::DeadlineExceeded("asr stage exceeded its budget".into()))?;

        let mut errors = Vec::new();
        let mut merged: Vec<TranscriptSegment> = Vec::new();
        let mut speaker_keys: Vec<String> = Vec::new();
        let mut offset = 0.0f64;
        let mut first_error: Option<PipelineError> = None;
        let mut successes = 0usize;

        for (index, result) in results.into_iter().enumerate() {
            match result {
                Ok((mut transcript, file_duration)) => {
                    successes += 1;
                    transcript.shift(offset);
                    offset += file_duration;
                    for seg in transcript.segments {
                        speaker_keys.push(format!("f{index}:{}", seg.speaker_id));
                        merged.push(seg);
                    }
                }
                Err(e) => {
                    if matches!(e, PipelineError::Cancelled) {
                        return Err(e);
                    }
                    tracing::error!("file {index} ({}) failed: {e}", sources[index]);
                    errors.push(FileError {
                        index,
                        source: sources[index].to_string(),
                        code: e.code().to_string(),
                        message: e.to_string(),
                    });
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
            }
        }

        if successes == 0 {
            return Err(first_error
                .unwrap_or_else(|| PipelineError::Internal("no audio was processed".into())));
        }

        // Speaker ids are dense over the merged transcript; ids from
        // different files never collide.
        let dense = densify_labels(&speaker_keys);
        for (seg, id) in merged.iter_mut().zip(dense) {
            seg.speaker_id = id;
        }

        Ok((Transcript::from_segments(merged), errors))
    }

    async fn process_one_audio(
        &self,
        engine: &AsrEngine,
        source: &AudioSource,
        work_dir: &Path,
        cancel: &CancellationToken,
    ) -> PipelineResult<(Transcript, f64)> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }

        // URL-capable providers fetch the audio themselves; everything
        // else is materialized and preprocessed locally.
        let (input, local_wav, duration) = match source {
            AudioSource::RemoteUrl(url) if engine.accepts_url() => {
                (EngineInput::Url(url.clone()), None, None)
            }
            _ => {
                let resolved = resolve_source(
                    source,
                    work_dir,
                    &self.http,
                    &self.config.audio_store_dir,
                )
                .await?;
                let processed = self.preprocessor.preprocess(&resolved, work_dir).await;
                let duration = self.preprocessor.duration_seconds(&processed).await;
                (
                    EngineInput::File {
                        path: processed.clone(),
                        duration_s: duration,
                    },
                    Some(processed),
                    duration,
                )
            }
        };

        let output = engine.transcribe(input, cancel).await?;
        let mut segments = self.build_segments(&output, local_wav.as_deref());

        if self.config.asr.enable_diarization && !segments.is_empty() {
            if let Some(wav) = &local_wav {
                let matcher = VoiceprintMatcher::new(self.config.voiceprint_threshold);
                matcher
                    .annotate(self.providers.voiceprints(), wav, &mut segments, cancel)
                    .await;
            }
        }

        let transcript = Transcript::from_segments(segments);
        let file_duration = duration.unwrap_or_else(|| transcript.end_s());
        Ok((transcript, file_duration))
    }

    /// Turn provider output into chronologically ordered segments with
    /// dense speaker ids, running the built-in diarizer when the provider
    /// returned no labels.
    fn build_segments(
        &self,
        output: &crate::providers::AsrOutput,
        local_wav: Option<&Path>,
    ) -> Vec<TranscriptSegment> {
        if output.segments.is_empty() {
            if output.full_text.is_empty() {
                return Vec::new();
            }
            return vec![TranscriptSegment::new(output.full_text.clone(), 0.0, 0.0, 0)];
        }

        let mut ordered: Vec<&crate::providers::AsrSegment> = output.segments.iter().collect();
        ordered.sort_by(|a, b| a.start_s.total_cmp(&b.start_s));

        let has_labels = ordered.iter().any(|s| s.speaker_label.is_some());
        let labels: Vec<String> = if has_labels {
            ordered
                .iter()
                .map(|s| s.speaker_label.clone().unwrap_or_else(|| "unlabeled".into()))
                .collect()
        } else if self.config.asr.enable_diarization {
            self.diarize_labels(&ordered, local_wav)
        } else {
            vec!["0".to_string(); ordered.len()]
        };

        let dense = densify_labels(&labels);
        ordered
            .iter()
            .zip(dense)
            .map(|(seg, speaker_id)| {
                TranscriptSegment::new(
                    seg.text.clone(),
                    seg.start_s,
                    seg.end_s.max(seg.start_s),
                    speaker_id,
                )
            })
            .collect()
    }

    fn diarize_labels(
        &self,
        ordered: &[&crate::providers::AsrSegment],
        local_wav: Option<&Path>,
    ) -> Vec<String> {
        let fallback = vec!["0".to_string(); ordered.len()];
        let Some(wav) = local_wav else {
            return fallback;
        };
        let (samples, sample_rate) = match read_wav_mono(wav) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!("diarization skipped: {e}");
                return fallback;
            }
        };

        let turns = Diarizer::new(DiarizerConfig::default()).diarize(&samples, sample_rate);
        if turns.is_empty() {
            return fallback;
        }
        let spans: Vec<(f64, f64)> = ordered.iter().map(|s| (s.start_s, s.end_s)).collect();
        assign_by_overlap(&spans, &turns)
            .into_iter()
            .map(|cluster| cluster.to_string())
            .collect()
    }
}

/// Speaker-attributed rendering used as the LLM's transcript section.
pub fn format_for_prompt(transcript: &Transcript) -> String {
    if transcript.segments.is_empty() {
        return transcript.full_text.clone();
    }
    let mut out = String::new();
    for seg in &transcript.segments {
        let speaker = match &seg.speaker_name {
            Some(name) => name.clone(),
            None => format!("发言人{}", seg.speaker_id),
        };
        out.push_str(&format!(
            "[{:.1}s-{:.1}s] {speaker}: {}\n",
            seg.start_s, seg.end_s, seg.text
        ));
    }
    out
}
