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

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use tokio_util::sync::CancellationToken;

use meeting_minutes::api::{ArchiveRequest, MinutesApi, RawProcessRequest, UploadedFile};
use meeting_minutes::audio::AudioPreprocessor;
use meeting_minutes::hotwords::HotwordRegistry;
use meeting_minutes::{Config, MinutesPipeline, ProviderSet};

const EXIT_OK: i32 = 0;
const EXIT_CONFIG: i32 = 2;
const EXIT_PROVIDER_INIT: i32 = 3;
const EXIT_SIGNAL: i32 = 130;

/// Meeting Minutes Pipeline - structured minutes from audio, documents or text
#[derive(Parser)]
#[command(name = "meeting-minutes")]
#[command(version = "0.1.0")]
#[command(about = "Turns meeting audio, documents or raw text into structured, archivable minutes")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Process one meeting input into structured minutes
    Process {
        /// Local audio file(s), processed in submission order
        #[arg(long = "audio", num_args = 1..)]
        audio: Vec<PathBuf>,

        /// Remote audio URL(s)
        #[arg(long = "audio-url", num_args = 1..)]
        audio_urls: Vec<String>,

        /// Identifier of a stored recording
        #[arg(long)]
        audio_id: Option<String>,

        /// Document file (docx, pdf, txt, md)
        #[arg(long)]
        document: Option<PathBuf>,

        /// Raw meeting text
        #[arg(long)]
        text: Option<String>,

        /// Template: preset id, file path, inline JSON, or raw prompt
        #[arg(long, default_value = "default")]
        template: String,

        /// Extra instruction appended to the prompt
        #[arg(long)]
        requirement: Option<String>,

        /// Comma-separated prior minute ids
        #[arg(long)]
        history_ids: Option<String>,

        /// History mode: auto, retrieval or summary
        #[arg(long)]
        history_mode: Option<String>,

        /// ASR provider: auto, funasr or tencent
        #[arg(long)]
        asr_model: Option<String>,

        /// LLM: auto, deepseek or qwen3
        #[arg(long)]
        llm_model: Option<String>,

        #[arg(long)]
        temperature: Option<f32>,

        #[arg(long)]
        max_tokens: Option<u32>,
    },

    /// Archive an approved minute into the semantic knowledge base
    Archive {
        /// Minute id upstream
        #[arg(long)]
        id: i64,

        /// Markdown file with the approved minute
        #[arg(long)]
        file: PathBuf,

        #[arg(long)]
        user: Option<String>,

        /// Meeting date, YYYY-MM-DD
        #[arg(long)]
        date: Option<String>,

        #[arg(long)]
        department: Option<String>,
    },

    /// Register a speaker voiceprint from a short clip
    VoiceRegister {
        /// WAV clip with at least 3 seconds of speech
        #[arg(long)]
        file: PathBuf,

        #[arg(long)]
        name: String,

        #[arg(long)]
        employee_id: String,
    },

    /// Show the hotword table, optionally reloading it first
    Hotwords {
        #[arg(long)]
        reload: bool,
    },

    /// Show provider health
    Status,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = setup_logging() {
        eprintln!("{} {e:#}", "logging setup failed:".red());
    }

    let config = match Config::load() {
        Ok(config) => Arc::new(config),
        Err(e) => {
            eprintln!("{} {e:#}", "configuration error:".red().bold());
            std::process::exit(EXIT_CONFIG);
        }
    };

    let providers = match ProviderSet::build(&config) {
        Ok(providers) => Arc::new(providers),
        Err(e) => {
            eprintln!("{} {e:#}", "provider initialization failed:".red().bold());
            std::process::exit(EXIT_PROVIDER_INIT);
        }
    };

    let hotwords = Arc::new(HotwordRegistry::load(&config.hotword_file));
    let preprocessor = AudioPreprocessor::probe().await;
    let pipeline = MinutesPipeline::new(config, providers, hotwords, preprocessor);
    let api = MinutesApi::new(pipeline);

    let cancel = CancellationToken::new();
    let handler_token = cancel.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        handler_token.cancel();
    }) {
        tracing::warn!("could not install signal handler: {e}");
    }

    let code = match run(cli.command, &api, &cancel).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {e:#}", "error:".red().bold());
            1
        }
    };
    let code = if cancel.is_cancelled() { EXIT_SIGNAL } else { code };
    std::process::exit(code);
}

async fn run(command: Commands, api: &MinutesApi, cancel: &CancellationToken) -> Result<i32> {
    match command {
        Commands::Process {
            audio,
            audio_urls,
            audio_id,
            document,
            text,
            template,
            requirement,
            history_ids,
            history_mode,
            asr_model,
            llm_model,
            temperature,
            max_tokens,
        } => {
            let document_file = match document {
                Some(path) => Some(UploadedFile {
                    file_name: path
                        .file_name()
                        .and_then(|n| n.to_str())
                        .unwrap_or("document.txt")
                        .to_string(),
                    data: std::fs::read(&path)
                        .with_context(|| format!("cannot read {}", path.display()))?,
                }),
                None => None,
            };

            let raw = RawProcessRequest {
                files: Vec::new(),
                file_paths: audio
                    .iter()
                    .map(|p| p.to_string_lossy().into_owned())
                    .collect(),
                audio_urls,
                audio_id,
                document_file,
                text_content: text,
                template: Some(template),
                user_requirement: requirement,
                history_meeting_ids: history_ids,
                history_mode,
                asr_model,
                llm_model,
                llm_temperature: temperature,
                llm_max_tokens: max_tokens,
            };

            let response = api.process(raw, cancel).await;
            let ok = response.status == "success";
            println!("{}", serde_json::to_string_pretty(&response)?);
            if ok {
                println!("{}", "minutes generated".green().bold());
                Ok(EXIT_OK)
            } else {
                println!("{} {}", "failed:".red().bold(), response.message);
                Ok(1)
            }
        }

        Commands::Archive {
            id,
            file,
            user,
            date,
            department,
        } => {
            let markdown_content = std::fs::read_to_string(&file)
                .with_context(|| format!("cannot read {}", file.display()))?;
            let response = api
                .archive(
                    ArchiveRequest {
                        minutes_id: id,
                        markdown_content,
                        user_id: user,
                        meeting_date: date,
                        department,
                    },
                    cancel,
                )
                .await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(if response.status == "success" { EXIT_OK } else { 1 })
        }

        Commands::VoiceRegister {
            file,
            name,
            employee_id,
        } => {
            let data = std::fs::read(&file)
                .with_context(|| format!("cannot read {}", file.display()))?;
            let response = api
                .register_voiceprint(
                    UploadedFile {
                        file_name: file
                            .file_name()
                            .and_then(|n| n.to_str())
                            .unwrap_or("clip.wav")
                            .to_string(),
                        data,
                    },
                    &name,
                    &employee_id,
                )
                .await;
            println!("{}", serde_json::to_string_pretty(&response)?);
            Ok(if response.code == 200 { EXIT_OK } else { 1 })
        }

        Commands::Hotwords { reload } => {
            let report = if reload {
                api.reload_hotwords()?
            } else {
                api.hotword_listing()
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(EXIT_OK)
        }

        Commands::Status => {
            let report = api.health().await;
            let banner = if report.status == "healthy" {
                report.status.green().bold()
            } else {
                report.status.red().bold()
            };
            println!("status: {banner} (mode: {})", report.mode);
            println!("{}", serde_json::to_string_pretty(&report)?);
            Ok(EXIT_OK)
        }
    }
}

fn setup_logging() -> Result<()> {
    use tracing_appender::rolling::{RollingFileAppender, Rotation};
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let log_dir = dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".meeting-minutes")
        .join("logs");
    std::fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, "meeting-minutes.log");

    let subscriber = tracing_subscriber::registry()
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_filter(
                    EnvFilter::from_default_env()
                        .add_directive("meeting_minutes=debug".parse()?),
                ),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .with_ansi(true)
                .with_target(false)
                .with_filter(
                    EnvFilter::try_from_default_env()
                        .unwrap_or_else(|_| EnvFilter::new("warn")),
                ),
        );
    subscriber.init();
    Ok(())
}
