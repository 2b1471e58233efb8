/*
 * Meeting Minutes Pipeline - History / RAG Service
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

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::config::RetrievalConfig;
use crate::error::PipelineResult;
use crate::providers::{EmbeddingProvider, LlmOptions, LlmProvider, VectorStore};
use crate::types::{HistoryMode, HistoryRequest, Metadata, MetadataValue};

/// Transcript prefix used for the auto gate and key-phrase distillation.
const GATE_PREFIX_CHARS: usize = 800;
/// Chunks pulled per referenced minute in summary mode.
const SUMMARY_CHUNKS_PER_MINUTE: usize = 3;

/// Result of history resolution. `attached` is the `need_rag` surface:
/// true iff a non-empty context string was added to the prompt.
#[derive(Debug, Clone, Default)]
pub struct HistoryOutcome {
    pub context: String,
    pub attached: bool,
}

/// Gathers historical meeting context for the prompt. The whole service
/// is best-effort: failures log and yield an empty context.
pub struct HistoryService {
    llm: Arc<dyn LlmProvider>,
    embedding: Arc<dyn EmbeddingProvider>,
    vector: Arc<dyn VectorStore>,
    collection: String,
    retrieval: RetrievalConfig,
}

impl HistoryService {
    pub fn new(
        llm: Arc<dyn LlmProvider>,
        embedding: Arc<dyn EmbeddingProvider>,
        vector: Arc<dyn VectorStore>,
        collection: impl Into<String>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            llm,
            embedding,
            vector,
            collection: collection.into(),
            retrieval,
        }
    }

    pub async fn resolve(
        &self,
        request: &HistoryRequest,
        transcript: &str,
        cancel: &CancellationToken,
    ) -> HistoryOutcome {
        let context = match self.try_resolve(request, transcript, cancel).await {
            Ok(context) => context,
            Err(e) => {
                tracing::warn!("history resolution failed ({e}); continuing without context");
                String::new()
            }
        };
        HistoryOutcome {
            attached: !context.is_empty(),
            context,
        }
    }

    async fn try_resolve(
        &self,
        request: &HistoryRequest,
        transcript: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<String> {
        match request.mode {
            HistoryMode::Summary => self.summary(&request.ids).await,
            HistoryMode::Retrieval => self.retrieval(transcript, cancel).await,
            HistoryMode::Auto => {
                if transcript.trim().is_empty() {
                    return Ok(String::new());
                }
                if self.should_retrieve(transcript, cancel).await? {
                    self.retrieval(transcript, cancel).await
                } else {
                    Ok(String::new())
                }
            }
        }
    }

    /// Summary mode: the leading chunks of each referenced minute,
    /// concatenated under per-id headers.
    async fn summary(&self, ids: &[i64]) -> PipelineResult<String> {
        let mut out = String::new();
        for &id in ids {
            let mut filter = Metadata::new();
            filter.insert("source_id".to_string(), MetadataValue::Int(id));
            let mut hits = self
                .vector
                .get_where(&self.collection, &filter, 64)
                .await?;
            hits.sort_by_key(|hit| match hit.metadata.get("chunk_index") {
                Some(MetadataValue::Int(i)) => *i,
                _ => i64::MAX,
            });
            let lead: Vec<&str> = hits
                .iter()
                .take(SUMMARY_CHUNKS_PER_MINUTE)
                .map(|hit| hit.document.as_str())
                .collect();
            if lead.is_empty() {
                tracing::warn!("no archived chunks found for minute {id}");
                continue;
            }
            out.push_str(&format!("### 会议 {id}\n"));
            out.push_str(&lead.join("\n"));
            out.push_str("\n\n");
        }
        Ok(out.trim_end().to_string())
    }

    /// Retrieval mode: distill key phrases, embed, query the archive,
    /// keep hits above the similarity floor, cite their sources.
    async fn retrieval(
        &self,
        transcript: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<String> {
        let query_text = self.distill_query(transcript, cancel).await;
        let vectors = self.embedding.embed(&[query_text], cancel).await?;
        let Some(vector) = vectors.into_iter().next() else {
            return Ok(String::new());
        };

        let hits = self
            .vector
            .query(&self.collection, &vector, self.retrieval.top_k, None)
            .await?;

        let mut out = String::new();
        for hit in hits {
            let similarity = hit.similarity();
            if similarity < self.retrieval.min_similarity {
                continue;
            }
            let source_id = hit
                .metadata
                .get("source_id")
                .map(|v| v.to_string())
                .unwrap_or_else(|| "?".into());
            let chunk_index = hit
                .metadata
                .get("chunk_index")
                .map(|v| v.to_string())
                .unwrap_or_else(|| "?".into());
            out.push_str(&format!(
                "[来源: 会议{source_id}#{chunk_index}] {}\n",
                hit.document.trim()
            ));
        }
        Ok(out.trim_end().to_string())
    }

    /// Ask the LLM for a compact retrieval query; fall back to the raw
    /// prefix when the call fails.
    async fn distill_query(&self, transcript: &str, cancel: &CancellationToken) -> String {
        let prefix: String = transcript.chars().take(GATE_PREFIX_CHARS).collect();
        let opts = LlmOptions {
            temperature: 0.0,
            max_tokens: 64,
            model_name: None,
        };
        match self
            .llm
            .complete(
                "你负责为语义检索生成查询。只输出3到5个关键词,用空格分隔,不要解释。",
                &format!("会议内容开头:\n{prefix}"),
                &opts,
                cancel,
            )
            .await
        {
            Ok(output) if !output.text.trim().is_empty() => output.text.trim().to_string(),
            Ok(_) => prefix,
            Err(e) => {
                tracing::debug!("key-phrase distillation failed ({e}); using raw prefix");
                prefix
            }
        }
    }

    /// Auto-mode gate: a single yes/no question over the transcript prefix.
    async fn should_retrieve(
        &self,
        transcript: &str,
        cancel: &CancellationToken,
    ) -> PipelineResult<bool> {
        let prefix: String = transcript.chars().take(GATE_PREFIX_CHARS).collect();
        let opts = LlmOptions {
            temperature: 0.0,
            max_tokens: 8,
            model_name: None,
        };
        let output = self
            .llm
            .complete(
                "判断整理这份会议纪要是否需要参考历史会议的背景信息。只回答\"是\"或\"否\"。",
                &prefix,
                &opts,
                cancel,
            )
            .await?;
        let answer = output.text.trim().to_ascii_lowercase();
        Ok(answer.contains('是') || answer.contains("yes"))
    }
}
