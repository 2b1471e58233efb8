/*
 * Meeting Minutes Pipeline - Speaker Diarization
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

use rustfft::num_complex::Complex;
use rustfft::FftPlanner;
use serde::{Deserialize, Serialize};

use crate::types::VOICEPRINT_DIM;

/// One speaker-homogeneous region produced by the diarizer.
#[derive(Debug, Clone, PartialEq)]
pub struct DiarizerTurn {
    pub start_s: f64,
    pub end_s: f64,
    pub cluster: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiarizerConfig {
    /// Energy threshold relative to the mean frame energy.
    pub vad_energy_factor: f32,
    /// Minimum speech region length in seconds.
    pub min_speech_duration: f64,
    /// Silence shorter than this merges adjacent regions.
    pub max_silence_duration: f64,
    /// Cosine similarity above which a region joins an existing cluster.
    pub similarity_threshold: f32,
    pub max_speakers: usize,
}

impl Default for DiarizerConfig {
    fn default() -> Self {
        Self {
            vad_energy_factor: 0.5,
            min_speech_duration: 0.3,
            max_silence_duration: 0.6,
            similarity_threshold: 0.65,
            max_speakers: 8,
        }
    }
}

const TARGET_RATE: u32 = 16_000;
const FRAME_SIZE: usize = 512;
const FRAME_HOP: usize = 256;
const VAD_WINDOW: usize = 400; // 25 ms at 16 kHz
const VAD_HOP: usize = 160; // 10 ms
const VAD_FLOOR: f32 = 1e-4;
const MEL_BANDS: usize = 64;
const CONTOUR_BANDS: usize = 56;

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        0.0
    } else {
        dot / (na * nb)
    }
}

/// Linear resampler, adequate for feature extraction.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }
    let ratio = from_rate as f64 / to_rate as f64;
    let out_len = (samples.len() as f64 / ratio) as usize;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * ratio;
            let idx = pos as usize;
            let frac = (pos - idx as f64) as f32;
            let a = samples[idx.min(samples.len() - 1)];
            let b = samples[(idx + 1).min(samples.len() - 1)];
            a + (b - a) * frac
        })
        .collect()
}

/// Fixed-width spectral speaker embedding shared by the diarizer and the
/// voiceprint matcher: log filterbank statistics plus a coarse spectral
/// contour, L2-normalized to [`VOICEPRINT_DIM`] values.
pub struct SpeakerEmbedder;

impl SpeakerEmbedder {
    /// Embed a span of mono samples. Returns `None` when the span is too
    /// short to yield a single analysis frame.
    pub fn embed(samples: &[f32], sample_rate: u32) -> Option<Vec<f32>> {
        let samples = resample_linear(samples, sample_rate, TARGET_RATE);
        if samples.len() < FRAME_SIZE {
            return None;
        }

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(FRAME_SIZE);
        let hann: Vec<f32> = (0..FRAME_SIZE)
            .map(|i| {
                0.5 - 0.5 * (2.0 * std::f32::consts::PI * i as f32 / FRAME_SIZE as f32).cos()
            })
            .collect();

        let bins = FRAME_SIZE / 2;
        let n_frames = (samples.len() - FRAME_SIZE) / FRAME_HOP + 1;
        let mut mel_frames: Vec<Vec<f32>> = Vec::with_capacity(n_frames);
        let mut centroids = Vec::with_capacity(n_frames);
        let mut rolloffs = Vec::with_capacity(n_frames);
        let mut flatnesses = Vec::with_capacity(n_frames);
        let mut zcrs = Vec::with_capacity(n_frames);
        let mut avg_spectrum = vec![0.0f32; bins];

        let filters = mel_filterbank(MEL_BANDS, bins, TARGET_RATE);
        let mut buffer: Vec<Complex<f32>> = vec![Complex::new(0.0, 0.0); FRAME_SIZE];

        for frame_idx in 0..n_frames {
            let offset = frame_idx * FRAME_HOP;
            let frame = &samples[offset..offset + FRAME_SIZE];

            for (i, (s, w)) in frame.iter().zip(&hann).enumerate() {
                buffer[i] = Complex::new(s * w, 0.0);
            }
            fft.process(&mut buffer);

            let power: Vec<f32> = buffer[..bins].iter().map(|c| c.norm_sqr()).collect();
            let total: f32 = power.iter().sum::<f32>().max(1e-10);

            for (acc, p) in avg_spectrum.iter_mut().zip(&power) {
                *acc += p;
            }

            let mel: Vec<f32> = filters
                .iter()
                .map(|filter| {
                    let energy: f32 = filter
                        .iter()
                        .map(|&(bin, weight)| power[bin] * weight)
                        .sum();
                    (energy + 1e-10).ln()
                })
                .collect();
            mel_frames.push(mel);

            let centroid: f32 = power
                .iter()
                .enumerate()
                .map(|(i, p)| i as f32 * p)
                .sum::<f32>()
                / total;
            centroids.push(centroid / bins as f32);

            let mut cumulative = 0.0f32;
            let mut rolloff = bins - 1;
            for (i, p) in power.iter().enumerate() {
                cumulative += p;
                if cumulative >= 0.85 * total {
                    rolloff = i;
                    break;
                }
            }
            rolloffs.push(rolloff as f32 / bins as f32);

            let log_mean = power.iter().map(|p| (p + 1e-10).ln()).sum::<f32>() / bins as f32;
            flatnesses.push((log_mean.exp() * bins as f32 / total).min(1.0));

            let crossings = frame
                .windows(2)
                .filter(|w| (w[0] >= 0.0) != (w[1] >= 0.0))
                .count();
            zcrs.push(crossings as f32 / FRAME_SIZE as f32);
        }

        let mut features = Vec::with_capacity(VOICEPRINT_DIM);

        // 64 filterbank means + 64 standard deviations.
        for band in 0..MEL_BANDS {
            let mean = mel_frames.iter().map(|f| f[band]).sum::<f32>() / n_frames as f32;
            features.push(mean);
        }
        for band in 0..MEL_BANDS {
            let mean = features[band];
            let var = mel_frames
                .iter()
                .map(|f| (f[band] - mean).powi(2))
                .sum::<f32>()
                / n_frames as f32;
            features.push(var.sqrt());
        }

        // 8 scalar contour statistics.
        for series in [&centroids, &rolloffs, &flatnesses, &zcrs] {
            let mean = series.iter().sum::<f32>() / n_frames as f32;
            let var = series.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n_frames as f32;
            features.push(mean);
            features.push(var.sqrt());
        }

        // 56-band normalized average spectrum envelope.
        let spectrum_total: f32 = avg_spectrum.iter().sum::<f32>().max(1e-10);
        let band_width = bins / CONTOUR_BANDS;
        for band in 0..CONTOUR_BANDS {
            let start = band * band_width;
            let end = if band == CONTOUR_BANDS - 1 {
                bins
            } else {
                start + band_width
            };
            let energy: f32 = avg_spectrum[start..end].iter().sum();
            features.push(energy / spectrum_total);
        }

        debug_assert_eq!(features.len(), VOICEPRINT_DIM);

        let norm = features.iter().map(|f| f * f).sum::<f32>().sqrt();
        if norm > 0.0 {
            for f in &mut features {
                *f /= norm;
            }
        }
        Some(features)
    }
}

fn mel_filterbank(bands: usize, bins: usize, sample_rate: u32) -> Vec<Vec<(usize, f32)>> {
    fn hz_to_mel(hz: f32) -> f32 {
        2595.0 * (1.0 + hz / 700.0).log10()
    }
    fn mel_to_hz(mel: f32) -> f32 {
        700.0 * (10f32.powf(mel / 2595.0) - 1.0)
    }

    let f_min = 80.0f32;
    let f_max = (sample_rate as f32 / 2.0).min(7_600.0);
    let mel_min = hz_to_mel(f_min);
    let mel_max = hz_to_mel(f_max);
    let hz_per_bin = sample_rate as f32 / 2.0 / bins as f32;

    let edges: Vec<f32> = (0..bands + 2)
        .map(|i| mel_to_hz(mel_min + (mel_max - mel_min) * i as f32 / (bands + 1) as f32))
        .collect();

    (0..bands)
        .map(|b| {
            let (lo, mid, hi) = (edges[b], edges[b + 1], edges[b + 2]);
            let mut filter = Vec::new();
            let first = (lo / hz_per_bin) as usize;
            let last = ((hi / hz_per_bin) as usize + 1).min(bins);
            for bin in first..last {
                let hz = bin as f32 * hz_per_bin;
                let weight = if hz <= mid {
                    (hz - lo) / (mid - lo).max(1e-3)
                } else {
                    (hi - hz) / (hi - mid).max(1e-3)
                };
                if weight > 0.0 {
                    filter.push((bin, weight));
                }
            }
            filter
        })
        .collect()
}

/// Voice-activity segmentation plus greedy clustering over spectral
/// embeddings. Used only when the ASR provider returned no speaker
/// labels and diarization was requested.
pub struct Diarizer {
    config: DiarizerConfig,
}

impl Diarizer {
    pub fn new(config: DiarizerConfig) -> Self {
        Self { config }
    }

    pub fn diarize(&self, samples: &[f32], sample_rate: u32) -> Vec<DiarizerTurn> {
        let samples = resample_linear(samples, sample_rate, TARGET_RATE);
        let regions = self.speech_regions(&samples);
        if regions.is_empty() {
            return Vec::new();
        }

        let mut centroids: Vec<Vec<f32>> = Vec::new();
        let mut counts: Vec<usize> = Vec::new();
        let mut turns = Vec::with_capacity(regions.len());

        for &(start, end) in &regions {
            let embedding = match SpeakerEmbedder::embed(&samples[start..end], TARGET_RATE) {
                Some(e) => e,
                None => continue,
            };

            let best = centroids
                .iter()
                .enumerate()
                .map(|(i, c)| (i, cosine_similarity(c, &embedding)))
                .max_by(|a, b| a.1.total_cmp(&b.1));

            let cluster = match best {
                Some((i, sim))
                    if sim >= self.config.similarity_threshold
                        || centroids.len() >= self.config.max_speakers =>
                {
                    let count = counts[i] as f32;
                    for (c, e) in centroids[i].iter_mut().zip(&embedding) {
                        *c = (*c * count + e) / (count + 1.0);
                    }
                    counts[i] += 1;
                    i
                }
                _ => {
                    centroids.push(embedding);
                    counts.push(1);
                    centroids.len() - 1
                }
            };

            turns.push(DiarizerTurn {
                start_s: start as f64 / TARGET_RATE as f64,
                end_s: end as f64 / TARGET_RATE as f64,
                cluster,
            });
        }

        merge_adjacent(turns, self.config.max_silence_duration)
    }

    /// Energy-based VAD: sample ranges of contiguous speech.
    fn speech_regions(&self, samples: &[f32]) -> Vec<(usize, usize)> {
        if samples.len() < VAD_WINDOW {
            return Vec::new();
        }
        let n_windows = (samples.len() - VAD_WINDOW) / VAD_HOP + 1;
        let energies: Vec<f32> = (0..n_windows)
            .map(|w| {
                let offset = w * VAD_HOP;
                let frame = &samples[offset..offset + VAD_WINDOW];
                (frame.iter().map(|s| s * s).sum::<f32>() / VAD_WINDOW as f32).sqrt()
            })
            .collect();

        let mean = energies.iter().sum::<f32>() / energies.len() as f32;
        let threshold = (mean * self.config.vad_energy_factor).max(VAD_FLOOR);

        let mut regions: Vec<(usize, usize)> = Vec::new();
        let mut active: Option<usize> = None;
        for (w, &energy) in energies.iter().enumerate() {
            let offset = w * VAD_HOP;
            if energy >= threshold {
                if active.is_none() {
                    active = Some(offset);
                }
            } else if let Some(start) = active.take() {
                regions.push((start, offset + VAD_WINDOW));
            }
        }
        if let Some(start) = active {
            regions.push((start, samples.len()));
        }

        // Bridge short silences, then drop regions below the minimum.
        let max_gap = (self.config.max_silence_duration * TARGET_RATE as f64) as usize;
        let mut merged: Vec<(usize, usize)> = Vec::new();
        for region in regions {
            match merged.last_mut() {
                Some(last) if region.0.saturating_sub(last.1) <= max_gap => {
                    last.1 = region.1;
                }
                _ => merged.push(region),
            }
        }
        let min_len = (self.config.min_speech_duration * TARGET_RATE as f64) as usize;
        merged.retain(|(s, e)| e - s >= min_len);
        merged
    }
}

fn merge_adjacent(turns: Vec<DiarizerTurn>, max_gap_s: f64) -> Vec<DiarizerTurn> {
    let mut merged: Vec<DiarizerTurn> = Vec::with_capacity(turns.len());
    for turn in turns {
        match merged.last_mut() {
            Some(last)
                if last.cluster == turn.cluster && turn.start_s - last.end_s <= max_gap_s =>
            {
                last.end_s = turn.end_s;
            }
            _ => merged.push(turn),
        }
    }
    merged
}

/// Remap arbitrary raw speaker labels to dense 0-based indices in order
/// of first appearance.
pub fn densify_labels(labels: &[String]) -> Vec<usize> {
    let mut index: std::collections::HashMap<&str, usize> = std::collections::HashMap::new();
    labels
        .iter()
        .map(|label| {
            let next = index.len();
            *index.entry(label.as_str()).or_insert(next)
        })
        .collect()
}

/// Assign each `[start, end]` span the diarizer turn with maximal time
/// overlap; ties break toward the earlier turn start, and a span that
/// overlaps nothing takes the turn nearest by midpoint.
pub fn assign_by_overlap(spans: &[(f64, f64)], turns: &[DiarizerTurn]) -> Vec<usize> {
    spans
        .iter()
        .map(|&(a, b)| {
            let mut best: Option<(usize, f64, f64)> = None; // (cluster, overlap, t_start)
            for turn in turns {
                let overlap = (b.min(turn.end_s) - a.max(turn.start_s)).max(0.0);
                let replace = match best {
                    None => true,
                    Some((_, best_overlap, best_start)) => {
                        overlap > best_overlap
                            || (overlap == best_overlap && turn.start_s < best_start)
                    }
                };
                if replace {
                    best = Some((turn.cluster, overlap, turn.start_s));
                }
            }

            match best {
                Some((cluster, overlap, _)) if overlap > 0.0 => cluster,
                _ => {
                    // No overlap anywhere: nearest turn by midpoint.
                    let mid = (a + b) / 2.0;
                    turns
                        .iter()
                        .min_by(|x, y| {
                            let dx = ((x.start_s + x.end_s) / 2.0 - mid).abs();
                            let dy = ((y.start_s + y.end_s) / 2.0 - mid).abs();
                            dx.total_cmp(&dy)
                        })
                        .map(|t| t.cluster)
                        .unwrap_or(0)
                }
            }
        })
        .collect()
}
