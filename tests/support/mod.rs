/*
 * Meeting Minutes Pipeline - Test Support
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

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use meeting_minutes::audio::AudioPreprocessor;
use meeting_minutes::hotwords::HotwordRegistry;
use meeting_minutes::providers::{
    AsrInput, AsrOptions, AsrOutput, AsrProvider, AsrSegment, EmbeddingProvider, LlmOptions,
    LlmOutput, LlmProvider, ProviderSet, QueryHit, VectorStore,
};
use meeting_minutes::types::{Metadata, VectorRecord};
use meeting_minutes::{Config, MinutesApi, MinutesPipeline, PipelineError, PipelineResult};

/// Scripted ASR provider: returns the same output for every call.
pub struct MockAsr {
    pub output: AsrOutput,
    pub calls: AtomicUsize,
}

impl MockAsr {
    pub fn new(segments: Vec<(&str, f64, f64, Option<&str>)>) -> Self {
        let segments: Vec<AsrSegment> = segments
            .into_iter()
            .map(|(text, start_s, end_s, label)| AsrSegment {
                text: text.to_string(),
                start_s,
                end_s,
                speaker_label: label.map(|l| l.to_string()),
            })
            .collect();
        Self {
            output: AsrOutput {
                full_text: String::new(),
                segments,
            },
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl AsrProvider for MockAsr {
    fn name(&self) -> &str {
        "mock-asr"
    }

    fn accepts_bytes(&self) -> bool {
        true
    }

    fn accepts_url(&self) -> bool {
        false
    }

    async fn recognize(
        &self,
        _input: AsrInput,
        _opts: &AsrOptions,
        _cancel: &CancellationToken,
    ) -> PipelineResult<AsrOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.output.clone())
    }

    async fn ready(&self) -> bool {
        true
    }
}

/// Scripted LLM: plays a queue of results, then falls back to a default
/// completion. Records every user prompt it saw.
pub struct MockLlm {
    script: Mutex<Vec<PipelineResult<LlmOutput>>>,
    pub default_text: String,
    pub calls: AtomicUsize,
    pub seen_prompts: Mutex<Vec<String>>,
}

impl MockLlm {
    pub fn new(default_text: &str) -> Self {
        Self {
            script: Mutex::new(Vec::new()),
            default_text: default_text.to_string(),
            calls: AtomicUsize::new(0),
            seen_prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn with_script(default_text: &str, script: Vec<PipelineResult<LlmOutput>>) -> Self {
        Self {
            script: Mutex::new(script),
            default_text: default_text.to_string(),
            calls: AtomicUsize::new(0),
            seen_prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn ok(text: &str) -> PipelineResult<LlmOutput> {
        Ok(LlmOutput {
            text: text.to_string(),
            usage_tokens: 128,
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    fn name(&self) -> &str {
        "mock-llm"
    }

    async fn complete(
        &self,
        _system: &str,
        user: &str,
        _opts: &LlmOptions,
        _cancel: &CancellationToken,
    ) -> PipelineResult<LlmOutput> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen_prompts.lock().push(user.to_string());
        let mut script = self.script.lock();
        if script.is_empty() {
            MockLlm::ok(&self.default_text)
        } else {
            script.remove(0)
        }
    }

    async fn ready(&self) -> bool {
        true
    }
}

/// Deterministic character-histogram embedding, L2-normalized so any two
/// embeddings are within L2 distance 2 of each other.
pub struct HistogramEmbedding {
    dim: usize,
}

impl HistogramEmbedding {
    pub fn new(dim: usize) -> Self {
        Self { dim }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dim];
        for c in text.chars() {
            vector[(c as usize) % self.dim] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            for v in &mut vector {
                *v /= norm;
            }
        }
        vector
    }
}

#[async_trait]
impl EmbeddingProvider for HistogramEmbedding {
    fn name(&self) -> &str {
        "histogram-embedding"
    }

    fn dimension(&self) -> usize {
        self.dim
    }

    async fn embed(
        &self,
        texts: &[String],
        _cancel: &CancellationToken,
    ) -> PipelineResult<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    async fn ready(&self) -> bool {
        true
    }
}

struct MemCollection {
    dim: usize,
    records: BTreeMap<String, VectorRecord>,
}

/// In-process vector store with L2 semantics and equality filters.
pub struct MemoryVectorStore {
    inner: Mutex<HashMap<String, MemCollection>>,
}

impl MemoryVectorStore {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn ids(&self, collection: &str) -> Vec<String> {
        self.inner
            .lock()
            .get(collection)
            .map(|c| c.records.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn documents(&self, collection: &str) -> Vec<String> {
        self.inner
            .lock()
            .get(collection)
            .map(|c| c.records.values().map(|r| r.document.clone()).collect())
            .unwrap_or_default()
    }
}

fn matches_filter(metadata: &Metadata, filter: &Metadata) -> bool {
    filter
        .iter()
        .all(|(key, value)| metadata.get(key) == Some(value))
}

fn l2_distance(a: &[f32], b: &[f32]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(x, y)| ((x - y) as f64).powi(2))
        .sum::<f64>()
        .sqrt()
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn ensure_collection(&self, collection: &str, dim: usize) -> PipelineResult<()> {
        let mut inner = self.inner.lock();
        match inner.get(collection) {
            Some(existing) if existing.dim != dim => Err(PipelineError::VectorDimMismatch {
                expected: existing.dim,
                actual: dim,
            }),
            Some(_) => Ok(()),
            None => {
                inner.insert(
                    collection.to_string(),
                    MemCollection {
                        dim,
                        records: BTreeMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn upsert(&self, collection: &str, records: Vec<VectorRecord>) -> PipelineResult<()> {
        let mut inner = self.inner.lock();
        let entry = inner.entry(collection.to_string()).or_insert_with(|| MemCollection {
            dim: records.first().map(|r| r.embedding.len()).unwrap_or(0),
            records: BTreeMap::new(),
        });
        for record in records {
            if record.embedding.len() != entry.dim {
                return Err(PipelineError::VectorDimMismatch {
                    expected: entry.dim,
                    actual: record.embedding.len(),
                });
            }
            entry.records.insert(record.id.clone(), record);
        }
        Ok(())
    }

    async fn delete_where(&self, collection: &str, filter: &Metadata) -> PipelineResult<()> {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.get_mut(collection) {
            entry
                .records
                .retain(|_, record| !matches_filter(&record.metadata, filter));
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: Option<&Metadata>,
    ) -> PipelineResult<Vec<QueryHit>> {
        let inner = self.inner.lock();
        let Some(entry) = inner.get(collection) else {
            return Ok(Vec::new());
        };
        let mut hits: Vec<QueryHit> = entry
            .records
            .values()
            .filter(|record| filter.map_or(true, |f| matches_filter(&record.metadata, f)))
            .map(|record| QueryHit {
                id: record.id.clone(),
                distance: l2_distance(&record.embedding, vector),
                document: record.document.clone(),
                metadata: record.metadata.clone(),
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits.truncate(k);
        Ok(hits)
    }

    async fn get_where(
        &self,
        collection: &str,
        filter: &Metadata,
        limit: usize,
    ) -> PipelineResult<Vec<QueryHit>> {
        let inner = self.inner.lock();
        let Some(entry) = inner.get(collection) else {
            return Ok(Vec::new());
        };
        Ok(entry
            .records
            .values()
            .filter(|record| matches_filter(&record.metadata, filter))
            .take(limit)
            .map(|record| QueryHit {
                id: record.id.clone(),
                distance: 0.0,
                document: record.document.clone(),
                metadata: record.metadata.clone(),
            })
            .collect())
    }

    async fn count(&self, collection: &str) -> PipelineResult<usize> {
        Ok(self
            .inner
            .lock()
            .get(collection)
            .map(|c| c.records.len())
            .unwrap_or(0))
    }

    async fn ready(&self) -> bool {
        true
    }
}

/// Wire an API instance over mock providers.
pub fn build_api(
    config: Config,
    asr: Arc<dyn AsrProvider>,
    llm: Arc<dyn LlmProvider>,
    embedding: Arc<dyn EmbeddingProvider>,
    vector: Arc<dyn VectorStore>,
) -> MinutesApi {
    let voiceprint_collection = config.vector.voiceprint_collection.clone();
    let hotword_file = config.hotword_file.clone();
    let providers = ProviderSet::from_parts(
        Some(asr),
        None,
        Some(llm),
        None,
        embedding,
        vector,
        &voiceprint_collection,
    );
    let pipeline = MinutesPipeline::new(
        Arc::new(config),
        Arc::new(providers),
        Arc::new(HotwordRegistry::load(hotword_file)),
        AudioPreprocessor::disabled(),
    );
    MinutesApi::new(pipeline)
}

/// Write a mono 16 kHz WAV of the given duration; `tone_hz` of zero means
/// silence.
pub fn write_wav(path: &Path, seconds: f64, tone_hz: f64) {
    let spec = hound::WavSpec {
        channels: 1,
        sample_rate: 16_000,
        bits_per_sample: 16,
        sample_format: hound::SampleFormat::Int,
    };
    let mut writer = hound::WavWriter::create(path, spec).unwrap();
    let total = (seconds * 16_000.0) as usize;
    for i in 0..total {
        let value = if tone_hz > 0.0 {
            (i as f64 * tone_hz * 2.0 * std::f64::consts::PI / 16_000.0).sin() * 0.5
        } else {
            0.0
        };
        writer
            .write_sample((value * i16::MAX as f64) as i16)
            .unwrap();
    }
    writer.finalize().unwrap();
}
