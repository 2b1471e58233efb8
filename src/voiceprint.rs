/*
 * Meeting Minutes Pipeline - Voiceprint Matcher
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
use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::audio::read_wav_mono;
use crate::diarize::{Diarizer, DiarizerConfig, SpeakerEmbedder};
use crate::error::{PipelineError, PipelineResult};
use crate::providers::VoiceprintStore;
use crate::types::{Metadata, MetadataValue, TranscriptSegment, VoiceprintRecord};

/// Shortest usable speech span for matching an existing voiceprint.
const MIN_MATCH_SECONDS: f64 = 1.0;
/// The matcher samples at most this much contiguous speech per speaker.
const MAX_SAMPLE_SECONDS: f64 = 10.0;
/// Registration needs more material than matching.
const MIN_REGISTER_SECONDS: f64 = 3.0;

/// Attaches registered speaker identities to diarized segments. Every
/// failure path here is non-fatal: segments keep their numeric ids.
pub struct VoiceprintMatcher {
    threshold: f64,
}

impl VoiceprintMatcher {
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }

    pub async fn annotate(
        &self,
        store: &VoiceprintStore,
        wav_path: &Path,
        segments: &mut [TranscriptSegment],
        cancel: &CancellationToken,
    ) {
        if segments.is_empty() || store.is_empty().await {
            return;
        }

        let (samples, sample_rate) = match read_wav_mono(wav_path) {
            Ok(loaded) => loaded,
            Err(e) => {
                tracing::warn!("voiceprint matching skipped: {e}");
                return;
            }
        };

        // Longest single segment per speaker gives the cleanest sample.
        let mut longest: HashMap<usize, (f64, f64)> = HashMap::new();
        for seg in segments.iter() {
            let entry = longest.entry(seg.speaker_id).or_insert((seg.start_s, seg.end_s));
            if seg.duration() > entry.1 - entry.0 {
                *entry = (seg.start_s, seg.end_s);
            }
        }

        let mut identities: HashMap<usize, (String, String, f64)> = HashMap::new();
        for (&speaker_id, &(start_s, end_s)) in &longest {
            if cancel.is_cancelled() {
                return;
            }
            let span = trim_to_window(start_s, end_s, MAX_SAMPLE_SECONDS);
            match self.identify(store, &samples, sample_rate, span, cancel).await {
                Ok(Some(identity)) => {
                    identities.insert(speaker_id, identity);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!("voiceprint match failed for speaker {speaker_id}: {e}");
                }
            }
        }

        for seg in segments.iter_mut() {
            if let Some((employee_id, name, similarity)) = identities.get(&seg.speaker_id) {
                seg.employee_id = Some(employee_id.clone());
                seg.speaker_name = Some(name.clone());
                seg.voice_similarity = Some(*similarity);
            }
        }
    }

    async fn identify(
        &self,
        store: &VoiceprintStore,
        samples: &[f32],
        sample_rate: u32,
        (start_s, end_s): (f64, f64),
        cancel: &CancellationToken,
    ) -> PipelineResult<Option<(String, String, f64)>> {
        if end_s - start_s < MIN_MATCH_SECONDS {
            return Ok(None);
        }
        let lo = ((start_s * sample_rate as f64) as usize).min(samples.len());
        let hi = ((end_s * sample_rate as f64) as usize).min(samples.len());
        if hi <= lo {
            return Ok(None);
        }

        let embedding = match SpeakerEmbedder::embed(&samples[lo..hi], sample_rate) {
            Some(e) => e,
            None => return Ok(None),
        };

        match store.best_match(&embedding, cancel).await? {
            Some((employee_id, name, similarity)) if similarity >= self.threshold => {
                tracing::info!(
                    "voiceprint match: {name} ({employee_id}) similarity {similarity:.3}"
                );
                Ok(Some((employee_id, name, similarity)))
            }
            Some((_, _, similarity)) => {
                tracing::debug!("best voiceprint below threshold: {similarity:.3}");
                Ok(None)
            }
            None => Ok(None),
        }
    }
}

/// Center-trim a `[start, end]` span to at most `window` seconds.
fn trim_to_window(start_s: f64, end_s: f64, window: f64) -> (f64, f64) {
    let length = end_s - start_s;
    if length <= window {
        return (start_s, end_s);
    }
    let center = (start_s + end_s) / 2.0;
    (center - window / 2.0, center + window / 2.0)
}

/// Total seconds of detected speech, used to gate registration quality.
fn speech_seconds(samples: &[f32], sample_rate: u32) -> f64 {
    let diarizer = Diarizer::new(DiarizerConfig::default());
    diarizer
        .diarize(samples, sample_rate)
        .iter()
        .map(|t| t.end_s - t.start_s)
        .sum()
}

/// Extract an embedding from a registration clip and store it under the
/// employee id. One logical record per employee: re-registration replaces
/// the prior print.
pub async fn register_voiceprint(
    store: &VoiceprintStore,
    wav_path: &Path,
    name: &str,
    employee_id: &str,
) -> PipelineResult<VoiceprintRecord> {
    if name.trim().is_empty() || employee_id.trim().is_empty() {
        return Err(PipelineError::BadInput(
            "voiceprint registration requires both name and employee_id".into(),
        ));
    }

    let (samples, sample_rate) = read_wav_mono(wav_path)?;
    let speech = speech_seconds(&samples, sample_rate);
    if speech < MIN_REGISTER_SECONDS {
        return Err(PipelineError::BadInput(format!(
            "audio too short: {speech:.1}s of speech, need at least {MIN_REGISTER_SECONDS:.0}s"
        )));
    }

    let embedding = SpeakerEmbedder::embed(&samples, sample_rate).ok_or_else(|| {
        PipelineError::BadInput("audio quality insufficient for voiceprint extraction".into())
    })?;

    let mut metadata = Metadata::new();
    metadata.insert(
        "employee_id".to_string(),
        MetadataValue::Str(employee_id.to_string()),
    );
    metadata.insert(
        "registered_at".to_string(),
        MetadataValue::Str(chrono::Utc::now().to_rfc3339()),
    );

    let record = VoiceprintRecord {
        employee_id: employee_id.to_string(),
        name: name.to_string(),
        embedding,
        metadata,
    };
    store.register(&record).await?;
    tracing::info!("registered voiceprint for {name} ({employee_id})");
    Ok(record)
}
