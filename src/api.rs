/*
 * Meeting Minutes Pipeline - External Interface Types
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

use std::collections::HashMap;

use chrono::NaiveDate;
use pulldown_cmark::{html, Options, Parser};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::hotwords::ReloadStats;
use crate::pipeline::{
    DocumentInput, FileError, MeetingInput, MinutesPipeline, ProcessOutcome, ProcessRequest,
};
use crate::providers::ProviderHealth;
use crate::types::{AudioSource, HistoryRequest, MinuteRecord, TranscriptSegment, VOICEPRINT_DIM};
use crate::voiceprint::register_voiceprint;

/// One uploaded part from the multipart form.
#[derive(Debug, Clone)]
pub struct UploadedFile {
    pub file_name: String,
    pub data: Vec<u8>,
}

/// The `/process` form as the HTTP layer hands it over, before
/// validation.
#[derive(Debug, Clone, Default)]
pub struct RawProcessRequest {
    pub files: Vec<UploadedFile>,
    pub file_paths: Vec<String>,
    pub audio_urls: Vec<String>,
    pub audio_id: Option<String>,
    pub document_file: Option<UploadedFile>,
    pub text_content: Option<String>,
    pub template: Option<String>,
    pub user_requirement: Option<String>,
    pub history_meeting_ids: Option<String>,
    pub history_mode: Option<String>,
    pub asr_model: Option<String>,
    pub llm_model: Option<String>,
    pub llm_temperature: Option<f32>,
    pub llm_max_tokens: Option<u32>,
}

impl RawProcessRequest {
    /// Validate the form and build the typed request. Exactly one input
    /// kind must be present.
    pub fn into_request(self) -> PipelineResult<ProcessRequest> {
        let mut inputs: Vec<MeetingInput> = Vec::new();
        if !self.files.is_empty() {
            inputs.push(MeetingInput::Audio(
                self.files
                    .into_iter()
                    .map(|f| AudioSource::Upload {
                        file_name: f.file_name,
                        data: f.data,
                    })
                    .collect(),
            ));
        }
        if !self.file_paths.is_empty() {
            inputs.push(MeetingInput::Audio(
                self.file_paths
                    .into_iter()
                    .map(|p| AudioSource::LocalPath(p.into()))
                    .collect(),
            ));
        }
        if !self.audio_urls.is_empty() {
            inputs.push(MeetingInput::Audio(
                self.audio_urls
                    .into_iter()
                    .map(AudioSource::RemoteUrl)
                    .collect(),
            ));
        }
        if let Some(id) = self.audio_id {
            inputs.push(MeetingInput::Audio(vec![AudioSource::StoredId(id)]));
        }
        if let Some(document) = self.document_file {
            inputs.push(MeetingInput::Document(DocumentInput::Upload {
                file_name: document.file_name,
                data: document.data,
            }));
        }
        if let Some(text) = self.text_content {
            inputs.push(MeetingInput::Text(text));
        }

        let input = match inputs.len() {
            0 => {
                return Err(PipelineError::BadInput(
                    "supply exactly one of files, file_paths, audio_urls, audio_id, \
                     document_file or text_content"
                        .into(),
                ))
            }
            1 => inputs.remove(0),
            n => {
                return Err(PipelineError::BadInput(format!(
                    "{n} input kinds supplied; exactly one is allowed"
                )))
            }
        };

        let history = HistoryRequest {
            ids: parse_id_list(self.history_meeting_ids.as_deref())?,
            mode: match self.history_mode.as_deref() {
                None | Some("") => Default::default(),
                Some(raw) => raw.parse().map_err(PipelineError::BadInput)?,
            },
        };

        let asr_model = match self.asr_model.as_deref() {
            None => Default::default(),
            Some(raw) => raw.parse().map_err(PipelineError::BadInput)?,
        };
        let llm_model = match self.llm_model.as_deref() {
            None => Default::default(),
            Some(raw) => raw.parse().map_err(PipelineError::BadInput)?,
        };

        let llm_temperature = self.llm_temperature.unwrap_or(0.7);
        if !(0.0..=1.0).contains(&llm_temperature) {
            return Err(PipelineError::BadInput(format!(
                "llm_temperature {llm_temperature} outside [0, 1]"
            )));
        }
        let llm_max_tokens = self.llm_max_tokens.unwrap_or(2_000);
        if llm_max_tokens == 0 {
            return Err(PipelineError::BadInput("llm_max_tokens must be positive".into()));
        }

        Ok(ProcessRequest {
            input,
            template: self
                .template
                .filter(|t| !t.trim().is_empty())
                .unwrap_or_else(|| "default".into()),
            user_requirement: self.user_requirement,
            history,
            asr_model,
            llm_model,
            llm_temperature,
            llm_max_tokens,
        })
    }
}

fn parse_id_list(raw: Option<&str>) -> PipelineResult<Vec<i64>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    raw.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(|part| {
            part.parse::<i64>().map_err(|_| {
                PipelineError::BadInput(format!("invalid meeting id '{part}' in history_meeting_ids"))
            })
        })
        .collect()
}

/// Markdown rendering used for `html_content`.
pub fn markdown_to_html(markdown: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    let parser = Parser::new_ext(markdown, options);
    let mut out = String::new();
    html::push_html(&mut out, parser);
    out
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessResponse {
    pub status: String,
    pub message: String,
    pub raw_text: String,
    pub transcript: Vec<TranscriptSegment>,
    pub need_rag: bool,
    pub html_content: String,
    pub usage_tokens: u64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub per_file_errors: Vec<FileError>,
}

impl ProcessResponse {
    pub fn success(outcome: ProcessOutcome) -> Self {
        let message = if outcome.per_file_errors.is_empty() {
            "ok".to_string()
        } else {
            format!("{} file(s) failed", outcome.per_file_errors.len())
        };
        Self {
            status: "success".into(),
            message,
            raw_text: outcome.raw_text,
            transcript: outcome.transcript,
            need_rag: outcome.need_rag,
            html_content: markdown_to_html(&outcome.markdown),
            usage_tokens: outcome.usage_tokens,
            per_file_errors: outcome.per_file_errors,
        }
    }

    pub fn failure(error: &PipelineError) -> Self {
        Self {
            status: "error".into(),
            message: format!("{}: {error}", error.code()),
            raw_text: String::new(),
            transcript: Vec::new(),
            need_rag: false,
            html_content: String::new(),
            usage_tokens: 0,
            per_file_errors: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArchiveRequest {
    pub minutes_id: i64,
    pub markdown_content: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub meeting_date: Option<String>,
    #[serde(default)]
    pub department: Option<String>,
}

impl ArchiveRequest {
    pub fn into_record(self) -> PipelineResult<MinuteRecord> {
        let meeting_date = match self.meeting_date.as_deref().filter(|d| !d.is_empty()) {
            Some(raw) => Some(NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
                PipelineError::BadInput(format!("meeting_date '{raw}' is not YYYY-MM-DD"))
            })?),
            None => None,
        };
        Ok(MinuteRecord {
            markdown: self.markdown_content,
            source_id: self.minutes_id,
            user_id: self.user_id,
            meeting_date,
            department: self.department,
        })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ArchiveResponse {
    pub status: String,
    pub message: String,
    pub chunks_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceRegisterData {
    pub employee_id: String,
    pub name: String,
    pub vector_dim: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct VoiceRegisterResponse {
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<VoiceRegisterData>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HotwordReport {
    pub categories: Vec<String>,
    pub hotwords: HashMap<String, Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<ReloadStats>,
    pub total: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: String,
    pub mode: String,
    pub providers: ProviderHealth,
}

/// Endpoint facade over the pipeline: one entry function per §6 contract,
/// called directly by the external HTTP layer or the CLI launcher.
pub struct MinutesApi {
    pipeline: MinutesPipeline,
}

impl MinutesApi {
    pub fn new(pipeline: MinutesPipeline) -> Self {
        Self { pipeline }
    }

    pub fn pipeline(&self) -> &MinutesPipeline {
        &self.pipeline
    }

    /// `POST /process`
    pub async fn process(
        &self,
        raw: RawProcessRequest,
        cancel: &CancellationToken,
    ) -> ProcessResponse {
        let request = match raw.into_request() {
            Ok(request) => request,
            Err(e) => return ProcessResponse::failure(&e),
        };
        match self.pipeline.process(request, cancel).await {
            Ok(outcome) => ProcessResponse::success(outcome),
            Err(e) => ProcessResponse::failure(&e),
        }
    }

    /// `POST /archive`
    pub async fn archive(
        &self,
        request: ArchiveRequest,
        cancel: &CancellationToken,
    ) -> ArchiveResponse {
        let result = async {
            let record = request.into_record()?;
            let service = crate::archive::ArchiveService::new(
                self.pipeline.providers().embedding(),
                self.pipeline.providers().vector(),
                self.pipeline.config().vector.archive_collection.clone(),
            );
            service.archive(&record, cancel).await
        }
        .await;

        match result {
            Ok(chunks_count) => ArchiveResponse {
                status: "success".into(),
                message: "ok".into(),
                chunks_count,
            },
            Err(e) => ArchiveResponse {
                status: "error".into(),
                message: format!("{}: {e}", e.code()),
                chunks_count: 0,
            },
        }
    }

    /// `POST /voice/register`
    pub async fn register_voiceprint(
        &self,
        file: UploadedFile,
        name: &str,
        employee_id: &str,
    ) -> VoiceRegisterResponse {
        let staged = self
            .pipeline
            .config()
            .temp_dir
            .join(format!("voiceprint_{}.wav", Uuid::new_v4()));
        let result = async {
            tokio::fs::write(&staged, &file.data)
                .await
                .map_err(|e| PipelineError::Internal(format!("failed to stage clip: {e}")))?;
            register_voiceprint(
                self.pipeline.providers().voiceprints(),
                &staged,
                name,
                employee_id,
            )
            .await
        }
        .await;
        let _ = tokio::fs::remove_file(&staged).await;

        match result {
            Ok(record) => VoiceRegisterResponse {
                code: 200,
                message: "ok".into(),
                data: Some(VoiceRegisterData {
                    employee_id: record.employee_id,
                    name: record.name,
                    vector_dim: VOICEPRINT_DIM,
                }),
            },
            Err(e) => VoiceRegisterResponse {
                code: match e.kind() {
                    crate::error::ErrorKind::BadInput => 400,
                    _ => 500,
                },
                message: e.to_string(),
                data: None,
            },
        }
    }

    /// `GET /hotwords`
    pub fn hotword_listing(&self) -> HotwordReport {
        let table = self.pipeline.hotwords().snapshot();
        HotwordReport {
            categories: table.categories.iter().map(|c| c.name.clone()).collect(),
            hotwords: table
                .categories
                .iter()
                .map(|c| (c.name.clone(), c.words.clone()))
                .collect(),
            stats: None,
            total: table.total_words(),
        }
    }

    /// `POST /hotwords/reload`
    pub fn reload_hotwords(&self) -> PipelineResult<HotwordReport> {
        let stats = self.pipeline.hotwords().reload()?;
        let mut report = self.hotword_listing();
        report.stats = Some(stats);
        Ok(report)
    }

    /// `GET /health`
    pub async fn health(&self) -> HealthReport {
        let providers = self.pipeline.providers().health().await;
        let critical_ready = providers.asr == "ready" && providers.llm == "ready";
        let all_ready = critical_ready
            && providers.embedding == "ready"
            && providers.vector == "ready";
        HealthReport {
            status: if critical_ready { "healthy" } else { "unhealthy" }.into(),
            mode: if all_ready { "full" } else { "degraded" }.into(),
            providers,
        }
    }
}
