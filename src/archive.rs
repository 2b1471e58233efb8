/*
 * Meeting Minutes Pipeline - Archive Service
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

use crate::error::{PipelineError, PipelineResult};
use crate::providers::{EmbeddingProvider, VectorStore};
use crate::types::{Metadata, MetadataValue, MinuteRecord, VectorRecord};

/// Greedy packing target, in characters.
const CHUNK_MAX: usize = 800;
/// Overlap carried between adjacent chunks of the same section.
const CHUNK_OVERLAP: usize = 80;
/// Texts per embedding call.
const EMBED_BATCH: usize = 16;

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub section_title: String,
    pub index: usize,
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn tail_chars(text: &str, n: usize) -> String {
    let total = char_len(text);
    if total <= n {
        return text.to_string();
    }
    text.chars().skip(total - n).collect()
}

/// Split an oversized paragraph at sentence boundaries, hard-splitting
/// any single sentence that still exceeds the chunk cap.
fn split_sentences(paragraph: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut current = String::new();
    for c in paragraph.chars() {
        current.push(c);
        if matches!(c, '。' | '!' | '?' | '.' | '!' | '?') {
            let trimmed = current.trim();
            if !trimmed.is_empty() {
                sentences.push(trimmed.to_string());
            }
            current.clear();
        }
    }
    let trimmed = current.trim();
    if !trimmed.is_empty() {
        sentences.push(trimmed.to_string());
    }

    let mut pieces = Vec::new();
    for sentence in sentences {
        if char_len(&sentence) <= CHUNK_MAX {
            pieces.push(sentence);
            continue;
        }
        let chars: Vec<char> = sentence.chars().collect();
        for window in chars.chunks(CHUNK_MAX) {
            pieces.push(window.iter().collect());
        }
    }
    pieces
}

/// Split approved markdown into chunks along semantic boundaries:
/// headings first, then paragraphs, then sentences, greedily packed with
/// a tail overlap inside each section.
pub fn chunk_markdown(markdown: &str) -> Vec<Chunk> {
    // Section split on top-level headings.
    let mut sections: Vec<(String, String)> = Vec::new();
    let mut title = String::new();
    let mut body = String::new();
    for line in markdown.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("# ") || trimmed.starts_with("## ") {
            if !body.trim().is_empty() {
                sections.push((title.clone(), body.clone()));
            }
            title = trimmed.trim_start_matches('#').trim().to_string();
            body.clear();
        } else {
            body.push_str(line);
            body.push('\n');
        }
    }
    if !body.trim().is_empty() {
        sections.push((title, body));
    }

    let mut chunks = Vec::new();
    for (section_title, body) in sections {
        // Paragraphs, then sentence pieces where a paragraph is too long.
        let mut pieces: Vec<String> = Vec::new();
        for paragraph in body.split("\n\n") {
            let paragraph = paragraph.trim();
            if paragraph.is_empty() {
                continue;
            }
            if char_len(paragraph) <= CHUNK_MAX {
                pieces.push(paragraph.to_string());
            } else {
                pieces.extend(split_sentences(paragraph));
            }
        }

        let mut current = String::new();
        let mut has_content = false;
        for piece in pieces {
            let needed = char_len(&current) + 1 + char_len(&piece);
            if has_content && needed > CHUNK_MAX {
                let tail = tail_chars(&current, CHUNK_OVERLAP);
                chunks.push(Chunk {
                    text: current,
                    section_title: section_title.clone(),
                    index: chunks.len(),
                });
                current = tail;
                has_content = false;
            }
            if !current.is_empty() {
                current.push('\n');
            }
            current.push_str(&piece);
            has_content = true;
        }
        if has_content {
            chunks.push(Chunk {
                text: current,
                section_title: section_title.clone(),
                index: chunks.len(),
            });
        }
    }
    chunks
}

/// Embeds approved minutes and replaces their chunk set in the archive
/// collection. Idempotent per source id: re-archiving deletes the prior
/// chunks, then inserts the new set.
pub struct ArchiveService {
    embedding: Arc<dyn EmbeddingProvider>,
    vector: Arc<dyn VectorStore>,
    collection: String,
}

impl ArchiveService {
    pub fn new(
        embedding: Arc<dyn EmbeddingProvider>,
        vector: Arc<dyn VectorStore>,
        collection: impl Into<String>,
    ) -> Self {
        Self {
            embedding,
            vector,
            collection: collection.into(),
        }
    }

    /// Returns the number of chunks written.
    pub async fn archive(
        &self,
        minute: &MinuteRecord,
        cancel: &CancellationToken,
    ) -> PipelineResult<usize> {
        if minute.markdown.trim().is_empty() {
            return Err(PipelineError::BadInput("markdown_content is empty".into()));
        }
        let chunks = chunk_markdown(&minute.markdown);
        if chunks.is_empty() {
            return Err(PipelineError::BadInput(
                "markdown_content produced no chunks".into(),
            ));
        }

        let dim = self.embedding.dimension();
        self.vector.ensure_collection(&self.collection, dim).await?;

        // Embed every chunk before touching the store, so a mismatch or
        // provider failure leaves the prior archive intact.
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH) {
            if cancel.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            embeddings.extend(self.embedding.embed(batch, cancel).await?);
        }
        for embedding in &embeddings {
            if embedding.len() != dim {
                return Err(PipelineError::VectorDimMismatch {
                    expected: dim,
                    actual: embedding.len(),
                });
            }
        }

        let records: Vec<VectorRecord> = chunks
            .iter()
            .zip(embeddings)
            .map(|(chunk, embedding)| {
                let mut metadata = Metadata::new();
                metadata.insert("source_id".into(), MetadataValue::Int(minute.source_id));
                metadata.insert("chunk_index".into(), MetadataValue::Int(chunk.index as i64));
                metadata.insert(
                    "section_title".into(),
                    MetadataValue::Str(chunk.section_title.clone()),
                );
                if let Some(user_id) = &minute.user_id {
                    metadata.insert("user_id".into(), MetadataValue::Str(user_id.clone()));
                }
                if let Some(date) = &minute.meeting_date {
                    metadata.insert("meeting_date".into(), MetadataValue::Str(date.to_string()));
                }
                if let Some(department) = &minute.department {
                    metadata.insert("department".into(), MetadataValue::Str(department.clone()));
                }
                VectorRecord {
                    id: format!("minute-{}-{}", minute.source_id, chunk.index),
                    embedding,
                    document: chunk.text.clone(),
                    metadata,
                }
            })
            .collect();

        // Delete-then-insert; the delete is logged so an interrupted run
        // can be completed by retrying.
        let mut filter = Metadata::new();
        filter.insert("source_id".into(), MetadataValue::Int(minute.source_id));
        tracing::info!(
            "replacing archived chunks for minute {} ({} new chunks)",
            minute.source_id,
            records.len()
        );
        self.vector.delete_where(&self.collection, &filter).await?;
        self.vector.upsert(&self.collection, records).await?;

        Ok(chunks.len())
    }
}
