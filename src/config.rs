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

use anyhow::{Context, Result};
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use dirs::home_dir;

/// Per-request ASR provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AsrModelChoice {
    #[default]
    Auto,
    FunAsr,
    Tencent,
}

impl FromStr for AsrModelChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(AsrModelChoice::Auto),
            "funasr" => Ok(AsrModelChoice::FunAsr),
            "tencent" => Ok(AsrModelChoice::Tencent),
            other => Err(format!("unknown asr model: {other}")),
        }
    }
}

/// Per-request LLM selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LlmModelChoice {
    #[default]
    Auto,
    DeepSeek,
    Qwen3,
}

impl FromStr for LlmModelChoice {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" | "" => Ok(LlmModelChoice::Auto),
            "deepseek" => Ok(LlmModelChoice::DeepSeek),
            "qwen3" | "qwen" => Ok(LlmModelChoice::Qwen3),
            other => Err(format!("unknown llm model: {other}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AsrConfig {
    /// FunASR gateway base URL; empty disables the provider.
    pub funasr_base_url: String,
    /// Tencent recognition gateway base URL; empty disables the provider.
    pub tencent_base_url: String,
    pub tencent_api_key: String,
    /// Per-file duration cap, enforced for every provider.
    pub max_audio_seconds: f64,
    /// Per-call timeout for one recognition request.
    pub call_timeout_s: u64,
    pub enable_punctuation: bool,
    pub enable_diarization: bool,
    pub language_hint: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LlmEndpoint {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Clone)]
pub struct LlmConfig {
    pub deepseek: Option<LlmEndpoint>,
    pub qwen: Option<LlmEndpoint>,
    pub call_timeout_s: u64,
    pub default_temperature: f32,
    pub default_max_tokens: u32,
}

#[derive(Debug, Clone)]
pub struct EmbeddingConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub dimension: usize,
    pub batch_timeout_s: u64,
}

#[derive(Debug, Clone)]
pub struct VectorConfig {
    pub base_url: String,
    pub archive_collection: String,
    pub voiceprint_collection: String,
    pub op_timeout_s: u64,
}

#[derive(Debug, Clone)]
pub struct RetrievalConfig {
    pub top_k: usize,
    pub min_similarity: f64,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub asr: AsrConfig,
    pub llm: LlmConfig,
    pub embedding: EmbeddingConfig,
    pub vector: VectorConfig,
    pub retrieval: RetrievalConfig,
    /// Minimum similarity for attaching a voiceprint identity.
    pub voiceprint_threshold: f64,
    pub hotword_file: PathBuf,
    pub template_dir: PathBuf,
    pub max_prompt_tokens: usize,
    /// Root under which each request creates its own temp subdirectory.
    pub temp_dir: PathBuf,
    /// Directory resolved against for `audio_id` inputs.
    pub audio_store_dir: PathBuf,
    /// Upper bound on the per-request audio worker pool.
    pub worker_pool_max: usize,
    /// Soft-deadline budget for the audio stage of one request.
    pub asr_budget_s: u64,
    /// Soft-deadline budget for the LLM stage of one request.
    pub llm_budget_s: u64,
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse::<T>().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn load() -> Result<Self> {
        // Load environment variables from .env file if it exists
        dotenv::dotenv().ok();

        let asr = AsrConfig {
            funasr_base_url: env_or("FUNASR_BASE_URL", "http://localhost:10095"),
            tencent_base_url: env_or("TENCENT_ASR_BASE_URL", ""),
            tencent_api_key: env_or("TENCENT_ASR_API_KEY", ""),
            max_audio_seconds: env_parse("ASR_MAX_AUDIO_SECONDS", 18_000.0),
            call_timeout_s: env_parse("ASR_CALL_TIMEOUT_S", 7_200),
            enable_punctuation: env_parse("ASR_ENABLE_PUNCTUATION", true),
            enable_diarization: env_parse("ASR_ENABLE_DIARIZATION", true),
            language_hint: env::var("ASR_LANGUAGE_HINT").ok().filter(|v| !v.is_empty()),
        };

        let deepseek = match env::var("DEEPSEEK_API_KEY") {
            Ok(api_key) if !api_key.is_empty() => Some(LlmEndpoint {
                base_url: env_or("DEEPSEEK_BASE_URL", "https://api.deepseek.com/v1"),
                api_key,
                model: env_or("DEEPSEEK_MODEL", "deepseek-chat"),
            }),
            _ => None,
        };

        let qwen = match env::var("QWEN_API_KEY") {
            Ok(api_key) if !api_key.is_empty() => Some(LlmEndpoint {
                base_url: env_or(
                    "QWEN_BASE_URL",
                    "https://dashscope.aliyuncs.com/compatible-mode/v1",
                ),
                api_key,
                model: env_or("QWEN_MODEL", "qwen3-235b-a22b"),
            }),
            _ => None,
        };

        if deepseek.is_none() && qwen.is_none() {
            anyhow::bail!("no LLM configured: set DEEPSEEK_API_KEY or QWEN_API_KEY");
        }

        let llm = LlmConfig {
            deepseek,
            qwen,
            call_timeout_s: env_parse("LLM_CALL_TIMEOUT_S", 180),
            default_temperature: env_parse("LLM_TEMPERATURE", 0.7),
            default_max_tokens: env_parse("LLM_MAX_TOKENS", 2_000),
        };

        let embedding = EmbeddingConfig {
            base_url: env_or("EMBEDDING_BASE_URL", "http://localhost:9997/v1"),
            api_key: env_or("EMBEDDING_API_KEY", ""),
            model: env_or("EMBEDDING_MODEL", "bge-m3"),
            dimension: env_parse("EMBEDDING_DIMENSION", 1024),
            batch_timeout_s: env_parse("EMBEDDING_BATCH_TIMEOUT_S", 30),
        };

        let vector = VectorConfig {
            base_url: env_or("VECTOR_BASE_URL", "http://localhost:8000"),
            archive_collection: env_or("ARCHIVE_COLLECTION", "meeting_minutes"),
            voiceprint_collection: env_or("VOICEPRINT_COLLECTION", "voiceprints"),
            op_timeout_s: env_parse("VECTOR_OP_TIMEOUT_S", 10),
        };

        let retrieval = RetrievalConfig {
            top_k: env_parse("RETRIEVAL_TOP_K", 5),
            min_similarity: env_parse("RETRIEVAL_MIN_SIMILARITY", 0.3),
        };

        let data_root = env::var("DATA_DIR").map(PathBuf::from).unwrap_or_else(|_| {
            home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".meeting-minutes")
        });

        let temp_dir = env::var("TEMP_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_root.join("temp"));
        std::fs::create_dir_all(&temp_dir).context("Failed to create temporary directory")?;

        let audio_store_dir = env::var("AUDIO_STORE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_root.join("audio"));

        let hotword_file = env::var("HOTWORD_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_root.join("hotwords.json"));

        let template_dir = env::var("TEMPLATE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_root.join("templates"));

        Ok(Config {
            asr,
            llm,
            embedding,
            vector,
            retrieval,
            voiceprint_threshold: env_parse("VOICEPRINT_THRESHOLD", 0.75),
            hotword_file,
            template_dir,
            max_prompt_tokens: env_parse("MAX_PROMPT_TOKENS", 8_000),
            temp_dir,
            audio_store_dir,
            worker_pool_max: env_parse("WORKER_POOL_MAX", 4),
            asr_budget_s: env_parse("ASR_BUDGET_S", 7_200),
            llm_budget_s: env_parse("LLM_BUDGET_S", 180),
        })
    }

    /// Pool size for one request's audio fan-out.
    pub fn worker_pool_size(&self, n_audio: usize) -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        n_audio.min(cpus).min(self.worker_pool_max).max(1)
    }
}

impl Default for Config {
    /// Offline defaults: no remote endpoints, temp-dir storage. Used by
    /// tests and as the base the loader fills in.
    fn default() -> Self {
        Config {
            asr: AsrConfig {
                funasr_base_url: String::new(),
                tencent_base_url: String::new(),
                tencent_api_key: String::new(),
                max_audio_seconds: 18_000.0,
                call_timeout_s: 7_200,
                enable_punctuation: true,
                enable_diarization: true,
                language_hint: None,
            },
            llm: LlmConfig {
                deepseek: None,
                qwen: None,
                call_timeout_s: 180,
                default_temperature: 0.7,
                default_max_tokens: 2_000,
            },
            embedding: EmbeddingConfig {
                base_url: String::new(),
                api_key: String::new(),
                model: "bge-m3".into(),
                dimension: 1024,
                batch_timeout_s: 30,
            },
            vector: VectorConfig {
                base_url: String::new(),
                archive_collection: "meeting_minutes".into(),
                voiceprint_collection: "voiceprints".into(),
                op_timeout_s: 10,
            },
            retrieval: RetrievalConfig {
                top_k: 5,
                min_similarity: 0.3,
            },
            voiceprint_threshold: 0.75,
            hotword_file: PathBuf::from("hotwords.json"),
            template_dir: PathBuf::from("templates"),
            max_prompt_tokens: 8_000,
            temp_dir: std::env::temp_dir(),
            audio_store_dir: std::env::temp_dir(),
            worker_pool_max: 4,
            asr_budget_s: 7_200,
            llm_budget_s: 180,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_size_is_bounded() {
        let mut config = Config::default();
        config.worker_pool_max = 4;
        assert_eq!(config.worker_pool_size(1), 1);
        assert!(config.worker_pool_size(16) <= 4);
        assert!(config.worker_pool_size(0) >= 1);
    }
}
