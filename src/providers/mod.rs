/*
 * Meeting Minutes Pipeline - Provider Layer
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

pub mod chat;
pub mod chroma;
pub mod embedding;
pub mod funasr;
pub mod tencent;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::{AsrModelChoice, Config, LlmModelChoice};
use crate::error::{PipelineError, PipelineResult};
use crate::types::{Metadata, MetadataValue, VectorRecord, VoiceprintRecord, VOICEPRINT_DIM};

pub use chat::ChatProvider;
pub use chroma::ChromaStore;
pub use embedding::RemoteEmbeddingProvider;
pub use funasr::FunAsrProvider;
pub use tencent::TencentAsrProvider;

/// Audio handed to an ASR provider, matching its capability flags.
#[derive(Debug, Clone)]
pub enum AsrInput {
    Bytes { data: Vec<u8>, file_name: String },
    Url(String),
}

#[derive(Debug, Clone, Default)]
pub struct AsrOptions {
    pub enable_punctuation: bool,
    pub enable_diarization: bool,
    pub hotword_blob: String,
    pub language_hint: Option<String>,
}

/// One recognized span. Speaker labels are raw provider labels; the
/// diarization stage densifies them later.
#[derive(Debug, Clone)]
pub struct AsrSegment {
    pub text: String,
    pub start_s: f64,
    pub end_s: f64,
    pub speaker_label: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct AsrOutput {
    pub full_text: String,
    pub segments: Vec<AsrSegment>,
}

#[async_trait]
pub trait AsrProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Whether the provider can take raw bytes, or only a fetchable URL.
    fn accepts_bytes(&self) -> bool;
    fn accepts_url(&self) -> bool;

    async fn recognize(
        &self,
        input: AsrInput,
        opts: &AsrOptions,
        cancel: &CancellationToken,
    ) -> PipelineResult<AsrOutput>;

    async fn ready(&self) -> bool;
}

#[derive(Debug, Clone)]
pub struct LlmOptions {
    pub temperature: f32,
    pub max_tokens: u32,
    pub model_name: Option<String>,
}

impl Default for LlmOptions {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 2_000,
            model_name: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LlmOutput {
    pub text: String,
    pub usage_tokens: u64,
}

#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn complete(
        &self,
        system: &str,
        user: &str,
        opts: &LlmOptions,
        cancel: &CancellationToken,
    ) -> PipelineResult<LlmOutput>;

    async fn ready(&self) -> bool;
}

#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    fn name(&self) -> &str;

    /// Declared output width; must match the target collection.
    fn dimension(&self) -> usize;

    async fn embed(
        &self,
        texts: &[String],
        cancel: &CancellationToken,
    ) -> PipelineResult<Vec<Vec<f32>>>;

    async fn ready(&self) -> bool;
}

/// A query result. Stores report L2 distance; call sites compare via
/// [`QueryHit::similarity`].
#[derive(Debug, Clone)]
pub struct QueryHit {
    pub id: String,
    pub distance: f64,
    pub document: String,
    pub metadata: Metadata,
}

impl QueryHit {
    pub fn similarity(&self) -> f64 {
        l2_to_similarity(self.distance)
    }
}

/// Convert an L2 distance to the similarity used everywhere in the core.
pub fn l2_to_similarity(distance: f64) -> f64 {
    1.0 / (1.0 + distance.max(0.0))
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    fn name(&self) -> &str;

    async fn ensure_collection(&self, collection: &str, dim: usize) -> PipelineResult<()>;

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> PipelineResult<()>;

    /// Delete all records whose metadata matches every filter entry.
    async fn delete_where(&self, collection: &str, filter: &Metadata) -> PipelineResult<()>;

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&Metadata>,
    ) -> PipelineResult<Vec<QueryHit>>;

    /// Fetch by metadata filter without a query vector (distance is zero).
    async fn get_where(
        &self,
        collection: &str,
        filter: &Metadata,
        limit: usize,
    ) -> PipelineResult<Vec<QueryHit>>;

    async fn count(&self, collection: &str) -> PipelineResult<usize>;

    async fn ready(&self) -> bool;
}

/// Thin facade over the vector store bound to the 192-dim voiceprint
/// collection.
#[derive(Clone)]
pub struct VoiceprintStore {
    store: Arc<dyn VectorStore>,
    collection: String,
}

impl VoiceprintStore {
    pub fn new(store: Arc<dyn VectorStore>, collection: impl Into<String>) -> Self {
        Self {
            store,
            collection: collection.into(),
        }
    }

    pub async fn ensure(&self) -> PipelineResult<()> {
        self.store
            .ensure_collection(&self.collection, VOICEPRINT_DIM)
            .await
    }

    /// One logical record per employee_id: upsert replaces any prior print.
    pub async fn register(&self, record: &VoiceprintRecord) -> PipelineResult<()> {
        if record.embedding.len() != VOICEPRINT_DIM {
            return Err(PipelineError::VectorDimMismatch {
                expected: VOICEPRINT_DIM,
                actual: record.embedding.len(),
            });
        }
        self.ensure().await?;
        let mut metadata = record.metadata.clone();
        metadata.insert(
            "employee_id".to_string(),
            MetadataValue::Str(record.employee_id.clone()),
        );
        self.store
            .upsert(
                &self.collection,
                vec![VectorRecord {
                    id: record.employee_id.clone(),
                    embedding: record.embedding.clone(),
                    document: record.name.clone(),
                    metadata,
                }],
            )
            .await
    }

    /// Nearest registered voiceprint with its similarity score.
    pub async fn best_match(
        &self,
        embedding: &[f32],
        cancel: &CancellationToken,
    ) -> PipelineResult<Option<(String, String, f64)>> {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let hits = self
            .store
            .query(&self.collection, embedding, 1, None)
            .await?;
        Ok(hits.into_iter().next().map(|hit| {
            let similarity = hit.similarity();
            let employee_id = match hit.metadata.get("employee_id") {
                Some(v) => v.to_string(),
                None => hit.id.clone(),
            };
            (employee_id, hit.document, similarity)
        }))
    }

    pub async fn is_empty(&self) -> bool {
        match self.store.count(&self.collection).await {
            Ok(n) => n == 0,
            // An unreachable store means the matcher has nothing to match
            // against; the caller degrades to numeric speaker ids.
            Err(_) => true,
        }
    }
}

/// Readiness of one provider slot, as reported by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ProviderHealth {
    pub asr: String,
    pub llm: String,
    pub embedding: String,
    pub vector: String,
}

/// All providers for the process, constructed once at startup and passed
/// by reference to the controller.
pub struct ProviderSet {
    funasr: Option<Arc<dyn AsrProvider>>,
    tencent: Option<Arc<dyn AsrProvider>>,
    deepseek: Option<Arc<dyn LlmProvider>>,
    qwen: Option<Arc<dyn LlmProvider>>,
    embedding: Arc<dyn EmbeddingProvider>,
    vector: Arc<dyn VectorStore>,
    voiceprints: VoiceprintStore,
}

impl ProviderSet {
    /// Construct concrete providers from configuration. Fails when a
    /// required provider cannot be built (launcher exits with code 3).
    pub fn build(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;

        let funasr = if config.asr.funasr_base_url.is_empty() {
            None
        } else {
            Some(Arc::new(FunAsrProvider::new(
                client.clone(),
                &config.asr.funasr_base_url,
                Duration::from_secs(config.asr.call_timeout_s),
            )) as Arc<dyn AsrProvider>)
        };

        let tencent = if config.asr.tencent_base_url.is_empty() {
            None
        } else {
            Some(Arc::new(TencentAsrProvider::new(
                client.clone(),
                &config.asr.tencent_base_url,
                &config.asr.tencent_api_key,
                Duration::from_secs(config.asr.call_timeout_s),
            )) as Arc<dyn AsrProvider>)
        };

        if funasr.is_none() && tencent.is_none() {
            anyhow::bail!("no ASR provider configured: set FUNASR_BASE_URL or TENCENT_ASR_BASE_URL");
        }

        let llm_timeout = Duration::from_secs(config.llm.call_timeout_s);
        let deepseek = config.llm.deepseek.as_ref().map(|ep| {
            Arc::new(ChatProvider::new("deepseek", client.clone(), ep, llm_timeout))
                as Arc<dyn LlmProvider>
        });
        let qwen = config.llm.qwen.as_ref().map(|ep| {
            Arc::new(ChatProvider::new("qwen3", client.clone(), ep, llm_timeout))
                as Arc<dyn LlmProvider>
        });

        let embedding: Arc<dyn EmbeddingProvider> = Arc::new(RemoteEmbeddingProvider::new(
            client.clone(),
            &config.embedding,
        ));

        let vector: Arc<dyn VectorStore> = Arc::new(ChromaStore::new(
            client,
            &config.vector.base_url,
            Duration::from_secs(config.vector.op_timeout_s),
        ));

        let voiceprints =
            VoiceprintStore::new(vector.clone(), config.vector.voiceprint_collection.clone());

        Ok(Self {
            funasr,
            tencent,
            deepseek,
            qwen,
            embedding,
            vector,
            voiceprints,
        })
    }

    /// Assemble a set from pre-built providers. Used by tests to inject
    /// scripted implementations.
    pub fn from_parts(
        funasr: Option<Arc<dyn AsrProvider>>,
        tencent: Option<Arc<dyn AsrProvider>>,
        deepseek: Option<Arc<dyn LlmProvider>>,
        qwen: Option<Arc<dyn LlmProvider>>,
        embedding: Arc<dyn EmbeddingProvider>,
        vector: Arc<dyn VectorStore>,
        voiceprint_collection: &str,
    ) -> Self {
        let voiceprints = VoiceprintStore::new(vector.clone(), voiceprint_collection);
        Self {
            funasr,
            tencent,
            deepseek,
            qwen,
            embedding,
            vector,
            voiceprints,
        }
    }

    pub fn select_asr(&self, choice: AsrModelChoice) -> PipelineResult<Arc<dyn AsrProvider>> {
        let selected = match choice {
            AsrModelChoice::Auto => self.funasr.clone().or_else(|| self.tencent.clone()),
            AsrModelChoice::FunAsr => self.funasr.clone(),
            AsrModelChoice::Tencent => self.tencent.clone(),
        };
        selected.ok_or_else(|| {
            PipelineError::UpstreamUnavailable(format!("asr provider not configured: {choice:?}"))
        })
    }

    pub fn select_llm(&self, choice: LlmModelChoice) -> PipelineResult<Arc<dyn LlmProvider>> {
        let selected = match choice {
            LlmModelChoice::Auto => self.deepseek.clone().or_else(|| self.qwen.clone()),
            LlmModelChoice::DeepSeek => self.deepseek.clone(),
            LlmModelChoice::Qwen3 => self.qwen.clone(),
        };
        selected.ok_or_else(|| {
            PipelineError::UpstreamUnavailable(format!("llm provider not configured: {choice:?}"))
        })
    }

    pub fn embedding(&self) -> Arc<dyn EmbeddingProvider> {
        self.embedding.clone()
    }

    pub fn vector(&self) -> Arc<dyn VectorStore> {
        self.vector.clone()
    }

    pub fn voiceprints(&self) -> &VoiceprintStore {
        &self.voiceprints
    }

    pub async fn health(&self) -> ProviderHealth {
        fn slot(ready: Option<bool>) -> String {
            match ready {
                Some(true) => "ready".to_string(),
                Some(false) => "unavailable".to_string(),
                None => "disabled".to_string(),
            }
        }

        let asr = match (&self.funasr, &self.tencent) {
            (Some(p), _) => slot(Some(p.ready().await)),
            (None, Some(p)) => slot(Some(p.ready().await)),
            (None, None) => slot(None),
        };
        let llm = match (&self.deepseek, &self.qwen) {
            (Some(p), _) => slot(Some(p.ready().await)),
            (None, Some(p)) => slot(Some(p.ready().await)),
            (None, None) => slot(None),
        };
        let embedding = slot(Some(self.embedding.ready().await));
        let vector = slot(Some(self.vector.ready().await));

        ProviderHealth {
            asr,
            llm,
            embedding,
            vector,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn similarity_is_monotone_in_distance() {
        assert_eq!(l2_to_similarity(0.0), 1.0);
        let mut prev = f64::INFINITY;
        for d in [0.0, 0.1, 0.5, 1.0, 3.0, 100.0] {
            let s = l2_to_similarity(d);
            assert!(s <= prev);
            assert!(s > 0.0 && s <= 1.0);
            prev = s;
        }
        // Negative distances are clamped rather than inflating similarity.
        assert_eq!(l2_to_similarity(-1.0), 1.0);
    }
}
