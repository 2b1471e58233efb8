/*
 * Meeting Minutes Pipeline - Rust Edition
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

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

/// One audio item submitted for processing. Exactly one variant per item;
/// a request may batch several items.
#[derive(Debug, Clone)]
pub enum AudioSource {
    /// Bytes received from an upload, with the original file name.
    Upload { file_name: String, data: Vec<u8> },
    /// A path already on this machine.
    LocalPath(PathBuf),
    /// A remote URL the pipeline (or a URL-capable ASR provider) fetches.
    RemoteUrl(String),
    /// An identifier resolved against the configured audio store directory.
    StoredId(String),
}

impl fmt::Display for AudioSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioSource::Upload { file_name, data } => {
                write!(f, "upload:{} ({} bytes)", file_name, data.len())
            }
            AudioSource::LocalPath(p) => write!(f, "path:{}", p.display()),
            AudioSource::RemoteUrl(u) => write!(f, "url:{u}"),
            AudioSource::StoredId(id) => write!(f, "stored:{id}"),
        }
    }
}

/// A single speaker-attributed, time-stamped span of transcript text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub text: String,
    pub start_s: f64,
    pub end_s: f64,
    /// Dense 0-based speaker index, assigned in order of first appearance.
    pub speaker_id: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub speaker_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employee_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub voice_similarity: Option<f64>,
}

impl TranscriptSegment {
    pub fn new(text: impl Into<String>, start_s: f64, end_s: f64, speaker_id: usize) -> Self {
        Self {
            text: text.into(),
            start_s,
            end_s,
            speaker_id,
            speaker_name: None,
            employee_id: None,
            voice_similarity: None,
        }
    }

    pub fn duration(&self) -> f64 {
        (self.end_s - self.start_s).max(0.0)
    }
}

/// An ordered transcript plus its flattened text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Transcript {
    pub segments: Vec<TranscriptSegment>,
    pub full_text: String,
}

impl Transcript {
    /// Build a transcript from segments, deriving `full_text` with the
    /// separator rule: single spaces, except after text that already ends
    /// in sentence punctuation (CJK or ASCII), which joins directly.
    pub fn from_segments(segments: Vec<TranscriptSegment>) -> Self {
        let full_text = join_segment_texts(segments.iter().map(|s| s.text.as_str()));
        Self { segments, full_text }
    }

    /// Shift every timestamp forward, used when merging multi-file batches
    /// into one monotonic timeline.
    pub fn shift(&mut self, offset_s: f64) {
        for seg in &mut self.segments {
            seg.start_s += offset_s;
            seg.end_s += offset_s;
        }
    }

    /// End of the last segment, or zero for an empty transcript.
    pub fn end_s(&self) -> f64 {
        self.segments.last().map(|s| s.end_s).unwrap_or(0.0)
    }
}

/// Join segment texts under the transcript separator rule.
pub fn join_segment_texts<'a>(texts: impl Iterator<Item = &'a str>) -> String {
    let mut out = String::new();
    for text in texts {
        let text = text.trim();
        if text.is_empty() {
            continue;
        }
        if !out.is_empty() {
            let last = out.chars().last().unwrap_or(' ');
            if !matches!(last, '。' | '！' | '？' | '，' | '；' | '.' | '!' | '?') {
                out.push(' ');
            }
        }
        out.push_str(text);
    }
    out
}

/// How historical meeting context is gathered for the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HistoryMode {
    #[default]
    Auto,
    Retrieval,
    Summary,
}

impl std::str::FromStr for HistoryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(HistoryMode::Auto),
            "retrieval" => Ok(HistoryMode::Retrieval),
            "summary" => Ok(HistoryMode::Summary),
            other => Err(format!("unknown history mode: {other}")),
        }
    }
}

/// Which prior minutes to consider, and how.
#[derive(Debug, Clone, Default)]
pub struct HistoryRequest {
    pub ids: Vec<i64>,
    pub mode: HistoryMode,
}

/// An approved minute submitted for archival.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MinuteRecord {
    pub markdown: String,
    pub source_id: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meeting_date: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub department: Option<String>,
}

/// Scalar metadata value accepted by the vector store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Str(String),
    Int(i64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Str(s) => write!(f, "{s}"),
            MetadataValue::Int(i) => write!(f, "{i}"),
            MetadataValue::Float(x) => write!(f, "{x}"),
            MetadataValue::Bool(b) => write!(f, "{b}"),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Str(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Str(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        MetadataValue::Int(i)
    }
}

pub type Metadata = HashMap<String, MetadataValue>;

/// A record as stored in (or read from) the vector store.
#[derive(Debug, Clone)]
pub struct VectorRecord {
    pub id: String,
    pub embedding: Vec<f32>,
    pub document: String,
    pub metadata: Metadata,
}

/// One registered speaker voiceprint. Dimension is fixed at 192.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VoiceprintRecord {
    pub employee_id: String,
    pub name: String,
    pub embedding: Vec<f32>,
    pub metadata: Metadata,
}

pub const VOICEPRINT_DIM: usize = 192;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_uses_spaces_between_plain_texts() {
        let joined = join_segment_texts(["hello", "world"].into_iter());
        assert_eq!(joined, "hello world");
    }

    #[test]
    fn join_skips_space_after_cjk_punctuation() {
        let joined = join_segment_texts(["今天讨论了产品迭代。", "大家没有异议。"].into_iter());
        assert_eq!(joined, "今天讨论了产品迭代。大家没有异议。");
    }

    #[test]
    fn join_ignores_empty_segments() {
        let joined = join_segment_texts(["a", "  ", "b"].into_iter());
        assert_eq!(joined, "a b");
    }

    #[test]
    fn shift_moves_all_timestamps() {
        let mut t = Transcript::from_segments(vec![
            TranscriptSegment::new("a", 0.0, 1.0, 0),
            TranscriptSegment::new("b", 1.0, 2.5, 1),
        ]);
        t.shift(10.0);
        assert_eq!(t.segments[0].start_s, 10.0);
        assert_eq!(t.segments[1].end_s, 12.5);
        assert_eq!(t.end_s(), 12.5);
    }
}
