/*
 * Meeting Minutes Pipeline - Audio Preprocessor
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
use std::process::Stdio;
use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use uuid::Uuid;

use crate::error::{PipelineError, PipelineResult};
use crate::types::AudioSource;

const FFMPEG_TIMEOUT: Duration = Duration::from_secs(600);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Normalizes audio for recognition when ffmpeg is present; passes the
/// source through untouched otherwise. Preprocessing never fails a
/// request.
pub struct AudioPreprocessor {
    ffmpeg_available: bool,
    ffprobe_available: bool,
}

impl AudioPreprocessor {
    /// Capability probe, run once at startup.
    pub async fn probe() -> Self {
        let ffmpeg_available = Self::tool_responds("ffmpeg").await;
        let ffprobe_available = Self::tool_responds("ffprobe").await;
        if ffmpeg_available {
            tracing::info!("ffmpeg detected; audio preprocessing enabled");
        } else {
            tracing::warn!("ffmpeg not found; audio will be passed to ASR unprocessed");
        }
        Self {
            ffmpeg_available,
            ffprobe_available,
        }
    }

    /// Build with explicit capabilities (tests).
    pub fn disabled() -> Self {
        Self {
            ffmpeg_available: false,
            ffprobe_available: false,
        }
    }

    async fn tool_responds(tool: &str) -> bool {
        Command::new(tool)
            .arg("-version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }

    pub fn ffmpeg_available(&self) -> bool {
        self.ffmpeg_available
    }

    /// Produce a 16 kHz mono WAV with band-pass and loudness normalization
    /// applied. On any failure the original file is returned and the error
    /// is only logged.
    pub async fn preprocess(&self, input: &Path, work_dir: &Path) -> PathBuf {
        if !self.ffmpeg_available {
            return input.to_path_buf();
        }

        let output = work_dir.join(format!("preprocessed_{}.wav", Uuid::new_v4()));
        let result = tokio::time::timeout(
            FFMPEG_TIMEOUT,
            Command::new("ffmpeg")
                .arg("-i")
                .arg(input)
                .args(["-ac", "1", "-ar", "16000"])
                .args(["-af", "highpass=f=200,lowpass=f=3000,loudnorm"])
                .arg("-y")
                .arg(&output)
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .status(),
        )
        .await;

        match result {
            Ok(Ok(status)) if status.success() && output.exists() => {
                tracing::debug!("preprocessed {} -> {}", input.display(), output.display());
                output
            }
            Ok(Ok(status)) => {
                tracing::warn!("ffmpeg exited with {status:?}; using original audio");
                input.to_path_buf()
            }
            Ok(Err(e)) => {
                tracing::warn!("ffmpeg failed to start ({e}); using original audio");
                input.to_path_buf()
            }
            Err(_) => {
                tracing::warn!("ffmpeg timed out; using original audio");
                input.to_path_buf()
            }
        }
    }

    /// Audio duration in seconds, when it can be determined. WAV headers
    /// are read directly; other containers go through ffprobe.
    pub async fn duration_seconds(&self, path: &Path) -> Option<f64> {
        if let Ok(reader) = hound::WavReader::open(path) {
            let spec = reader.spec();
            if spec.sample_rate > 0 {
                return Some(reader.duration() as f64 / spec.sample_rate as f64);
            }
        }

        if !self.ffprobe_available {
            tracing::warn!(
                "cannot determine duration of {}; duration cap not enforced for it",
                path.display()
            );
            return None;
        }

        let output = Command::new("ffprobe")
            .args(["-v", "error", "-show_entries", "format=duration"])
            .args(["-of", "default=noprint_wrappers=1:nokey=1"])
            .arg(path)
            .output()
            .await
            .ok()?;
        String::from_utf8_lossy(&output.stdout)
            .trim()
            .parse::<f64>()
            .ok()
    }
}

fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("upload.wav");
    base.chars()
        .map(|c| if c.is_control() || c == '/' { '_' } else { c })
        .collect()
}

fn url_extension(url: &str) -> &str {
    url.rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext.split(['?', '#']).next().unwrap_or("wav"))
        .filter(|ext| ext.len() <= 5 && ext.chars().all(|c| c.is_ascii_alphanumeric()))
        .unwrap_or("wav")
}

/// Materialize one [`AudioSource`] as a local file inside the request's
/// working directory. Unlike preprocessing, resolution failures fail the
/// request.
pub async fn resolve_source(
    source: &AudioSource,
    work_dir: &Path,
    client: &Client,
    audio_store_dir: &Path,
) -> PipelineResult<PathBuf> {
    match source {
        AudioSource::Upload { file_name, data } => {
            if data.is_empty() {
                return Err(PipelineError::BadInput(format!(
                    "uploaded file '{file_name}' is empty"
                )));
            }
            let path = work_dir.join(sanitize_file_name(file_name));
            tokio::fs::write(&path, data)
                .await
                .map_err(|e| PipelineError::Internal(format!("failed to stage upload: {e}")))?;
            Ok(path)
        }
        AudioSource::LocalPath(path) => {
            if !path.exists() {
                return Err(PipelineError::BadInput(format!(
                    "audio path does not exist: {}",
                    path.display()
                )));
            }
            Ok(path.clone())
        }
        AudioSource::RemoteUrl(url) => {
            let response = client
                .get(url)
                .timeout(DOWNLOAD_TIMEOUT)
                .send()
                .await
                .map_err(|e| PipelineError::from_transport("audio-download", e))?;
            let status = response.status();
            if !status.is_success() {
                return Err(PipelineError::UpstreamUnavailable(format!(
                    "audio download from {url} returned {status}"
                )));
            }

            let path = work_dir.join(format!("download_{}.{}", Uuid::new_v4(), url_extension(url)));
            let mut file = tokio::fs::File::create(&path)
                .await
                .map_err(|e| PipelineError::Internal(format!("failed to create download: {e}")))?;
            let mut stream = response.bytes_stream();
            let mut written = 0usize;
            while let Some(chunk) = stream.next().await {
                let chunk =
                    chunk.map_err(|e| PipelineError::from_transport("audio-download", e))?;
                written += chunk.len();
                file.write_all(&chunk)
                    .await
                    .map_err(|e| PipelineError::Internal(format!("failed to write download: {e}")))?;
            }
            file.flush()
                .await
                .map_err(|e| PipelineError::Internal(format!("failed to flush download: {e}")))?;
            if written == 0 {
                return Err(PipelineError::BadInput(format!(
                    "audio download from {url} was empty"
                )));
            }
            Ok(path)
        }
        AudioSource::StoredId(id) => {
            let direct = audio_store_dir.join(sanitize_file_name(id));
            if direct.exists() {
                return Ok(direct);
            }
            let with_ext = audio_store_dir.join(format!("{}.wav", sanitize_file_name(id)));
            if with_ext.exists() {
                return Ok(with_ext);
            }
            Err(PipelineError::BadInput(format!(
                "stored audio id not found: {id}"
            )))
        }
    }
}

/// Decode a WAV file to mono f32 samples, averaging channels.
pub fn read_wav_mono(path: &Path) -> PipelineResult<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::open(path)
        .map_err(|e| PipelineError::UnsupportedFormat(format!("cannot open wav: {e}")))?;
    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .samples::<f32>()
            .filter_map(Result::ok)
            .collect(),
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample - 1)) as f32;
            reader
                .samples::<i32>()
                .filter_map(Result::ok)
                .map(|s| s as f32 / scale)
                .collect()
        }
    };

    let mut mono = Vec::with_capacity(interleaved.len() / channels);
    for frame in interleaved.chunks_exact(channels) {
        mono.push(frame.iter().sum::<f32>() / channels as f32);
    }
    Ok((mono, spec.sample_rate))
}
