/*
 * Meeting Minutes Pipeline - Integration Tests
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

mod support;

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use meeting_minutes::api::{ArchiveRequest, RawProcessRequest, UploadedFile};
use meeting_minutes::providers::VectorStore;
use meeting_minutes::{Config, PipelineError};

use support::{build_api, write_wav, HistogramEmbedding, MemoryVectorStore, MockAsr, MockLlm};

const MINUTES_MD: &str = "# 会议纪要\n\n- 确认产品迭代方案\n- 下周发布灰度版本\n";

fn base_config() -> Config {
    Config::default()
}

#[tokio::test]
async fn text_only_request_generates_minutes() {
    let llm = Arc::new(MockLlm::with_script(
        MINUTES_MD,
        vec![MockLlm::ok("否")], // auto-history gate declines retrieval
    ));
    let api = build_api(
        base_config(),
        Arc::new(MockAsr::new(vec![])),
        llm.clone(),
        Arc::new(HistogramEmbedding::new(8)),
        Arc::new(MemoryVectorStore::new()),
    );

    let response = api
        .process(
            RawProcessRequest {
                text_content: Some("今天讨论了产品迭代".into()),
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(response.status, "success");
    assert!(response.transcript.is_empty());
    assert_eq!(response.raw_text, "今天讨论了产品迭代");
    assert!(response.html_content.contains("<h1>"));
    assert!(!response.need_rag);
    assert!(response.usage_tokens > 0);
    // One gate call plus one generation call.
    assert_eq!(llm.call_count(), 2);
}

#[tokio::test]
async fn two_speaker_audio_gets_dense_ids() {
    let dir = tempfile::tempdir().unwrap();
    let wav = dir.path().join("meeting.wav");
    write_wav(&wav, 6.0, 300.0);

    let api = build_api(
        base_config(),
        Arc::new(MockAsr::new(vec![
            ("大家好。", 0.0, 2.0, Some("7")),
            ("收到。", 2.0, 4.0, Some("3")),
            ("继续推进。", 4.0, 6.0, Some("7")),
        ])),
        Arc::new(MockLlm::new(MINUTES_MD)),
        Arc::new(HistogramEmbedding::new(8)),
        Arc::new(MemoryVectorStore::new()),
    );

    let response = api
        .process(
            RawProcessRequest {
                file_paths: vec![wav.to_string_lossy().into_owned()],
                history_mode: Some("summary".into()),
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(response.status, "success");
    let ids: Vec<usize> = response.transcript.iter().map(|s| s.speaker_id).collect();
    assert_eq!(ids, vec![0, 1, 0]);
    assert_eq!(response.transcript[0].speaker_id, 0);

    for window in response.transcript.windows(2) {
        assert!(window[1].start_s >= window[0].start_s);
    }
    for seg in &response.transcript {
        assert!(seg.end_s >= seg.start_s);
        assert!(seg.start_s >= 0.0 && seg.end_s <= 6.0);
    }
    assert_eq!(response.raw_text, "大家好。收到。继续推进。");
}

#[tokio::test]
async fn multi_file_merge_keeps_monotonic_timeline() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first.wav");
    let second = dir.path().join("second.wav");
    write_wav(&first, 2.0, 300.0);
    write_wav(&second, 3.0, 300.0);

    let api = build_api(
        base_config(),
        Arc::new(MockAsr::new(vec![
            ("第一句", 0.0, 1.0, Some("0")),
            ("第二句", 1.0, 2.0, Some("1")),
        ])),
        Arc::new(MockLlm::new(MINUTES_MD)),
        Arc::new(HistogramEmbedding::new(8)),
        Arc::new(MemoryVectorStore::new()),
    );

    let response = api
        .process(
            RawProcessRequest {
                file_paths: vec![
                    first.to_string_lossy().into_owned(),
                    second.to_string_lossy().into_owned(),
                ],
                history_mode: Some("summary".into()),
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(response.status, "success");
    assert_eq!(response.transcript.len(), 4);
    // Second file's timestamps are shifted by the first file's duration.
    assert_eq!(response.transcript[2].start_s, 2.0);
    assert_eq!(response.transcript[3].end_s, 4.0);
    for window in response.transcript.windows(2) {
        assert!(window[1].start_s >= window[0].start_s);
    }
    // Speakers from different files never collide.
    let ids: Vec<usize> = response.transcript.iter().map(|s| s.speaker_id).collect();
    assert_eq!(ids, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn partial_batch_reports_file_errors() {
    let dir = tempfile::tempdir().unwrap();
    let good = dir.path().join("good.wav");
    write_wav(&good, 2.0, 300.0);

    let api = build_api(
        base_config(),
        Arc::new(MockAsr::new(vec![("内容", 0.0, 1.5, Some("0"))])),
        Arc::new(MockLlm::new(MINUTES_MD)),
        Arc::new(HistogramEmbedding::new(8)),
        Arc::new(MemoryVectorStore::new()),
    );

    let response = api
        .process(
            RawProcessRequest {
                file_paths: vec![
                    good.to_string_lossy().into_owned(),
                    "/nonexistent/missing.wav".into(),
                ],
                history_mode: Some("summary".into()),
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(response.status, "success");
    assert_eq!(response.per_file_errors.len(), 1);
    assert_eq!(response.per_file_errors[0].index, 1);
    assert_eq!(response.per_file_errors[0].code, "BAD_INPUT");
    assert_eq!(response.transcript.len(), 1);
}

#[tokio::test]
async fn all_files_failing_is_an_error() {
    let api = build_api(
        base_config(),
        Arc::new(MockAsr::new(vec![("x", 0.0, 1.0, None)])),
        Arc::new(MockLlm::new(MINUTES_MD)),
        Arc::new(HistogramEmbedding::new(8)),
        Arc::new(MemoryVectorStore::new()),
    );

    let response = api
        .process(
            RawProcessRequest {
                files: vec![UploadedFile {
                    file_name: "empty.wav".into(),
                    data: Vec::new(),
                }],
                history_mode: Some("summary".into()),
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(response.status, "error");
    assert!(response.message.contains("BAD_INPUT"));
}

#[tokio::test]
async fn archive_is_idempotent_per_source_id() {
    let store = Arc::new(MemoryVectorStore::new());
    let api = build_api(
        base_config(),
        Arc::new(MockAsr::new(vec![])),
        Arc::new(MockLlm::new(MINUTES_MD)),
        Arc::new(HistogramEmbedding::new(8)),
        store.clone(),
    );

    // Four ~400-character paragraphs across two sections, ~2,000
    // characters in total.
    let long_markdown = format!(
        "# 会议纪要\n\n{}\n\n{}\n\n## 行动项\n\n{}\n\n{}\n",
        "讨论要点一。".repeat(67),
        "讨论要点二。".repeat(67),
        "行动项甲乙。".repeat(67),
        "行动项丙丁。".repeat(67),
    );

    let request = ArchiveRequest {
        minutes_id: 9,
        markdown_content: long_markdown,
        user_id: Some("u-1".into()),
        meeting_date: Some("2024-06-01".into()),
        department: Some("研发".into()),
    };

    let first = api.archive(request.clone(), &CancellationToken::new()).await;
    assert_eq!(first.status, "success");
    assert!((3..=6).contains(&first.chunks_count), "{}", first.chunks_count);

    let ids_after_first = store.ids("meeting_minutes");
    let second = api.archive(request, &CancellationToken::new()).await;
    assert_eq!(second.status, "success");
    assert_eq!(second.chunks_count, first.chunks_count);
    assert_eq!(store.ids("meeting_minutes"), ids_after_first);
    assert_eq!(
        store.count("meeting_minutes").await.unwrap(),
        first.chunks_count
    );
}

#[tokio::test]
async fn archive_dimension_mismatch_writes_nothing() {
    let store = Arc::new(MemoryVectorStore::new());
    store.ensure_collection("meeting_minutes", 4).await.unwrap();

    let api = build_api(
        base_config(),
        Arc::new(MockAsr::new(vec![])),
        Arc::new(MockLlm::new(MINUTES_MD)),
        Arc::new(HistogramEmbedding::new(8)),
        store.clone(),
    );

    let response = api
        .archive(
            ArchiveRequest {
                minutes_id: 1,
                markdown_content: "# 标题\n\n正文内容。".into(),
                user_id: None,
                meeting_date: None,
                department: None,
            },
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(response.status, "error");
    assert!(response.message.contains("VECTOR_DIM_MISMATCH"));
    assert_eq!(store.count("meeting_minutes").await.unwrap(), 0);
}

#[tokio::test]
async fn archived_minutes_are_retrievable_as_history() {
    let store = Arc::new(MemoryVectorStore::new());
    let llm = Arc::new(MockLlm::new(MINUTES_MD));
    let api = build_api(
        base_config(),
        Arc::new(MockAsr::new(vec![])),
        llm.clone(),
        Arc::new(HistogramEmbedding::new(8)),
        store.clone(),
    );

    let archived = api
        .archive(
            ArchiveRequest {
                minutes_id: 9,
                markdown_content: "# 灰度发布计划\n\n决定下周开始灰度发布,按百分之五逐步放量。".into(),
                user_id: None,
                meeting_date: None,
                department: None,
            },
            &CancellationToken::new(),
        )
        .await;
    assert_eq!(archived.status, "success");

    let response = api
        .process(
            RawProcessRequest {
                text_content: Some("继续讨论灰度发布的放量节奏".into()),
                history_mode: Some("retrieval".into()),
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(response.status, "success");
    assert!(response.need_rag);
    let prompts = llm.seen_prompts.lock();
    let final_prompt = prompts.last().unwrap();
    assert!(final_prompt.contains("来源: 会议9"));
    assert!(final_prompt.contains("历史会议参考"));
}

#[tokio::test]
async fn transient_llm_failure_retries_once() {
    let llm = Arc::new(MockLlm::with_script(
        MINUTES_MD,
        vec![
            Err(PipelineError::UpstreamTimeout("injected".into())),
            MockLlm::ok(MINUTES_MD),
        ],
    ));
    let api = build_api(
        base_config(),
        Arc::new(MockAsr::new(vec![])),
        llm.clone(),
        Arc::new(HistogramEmbedding::new(8)),
        Arc::new(MemoryVectorStore::new()),
    );

    let response = api
        .process(
            RawProcessRequest {
                text_content: Some("文本".into()),
                history_mode: Some("summary".into()),
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(response.status, "success");
    // Summary mode with no ids makes no LLM call, so both calls are the
    // generation attempt and its retry.
    assert_eq!(llm.call_count(), 2);
}

#[tokio::test]
async fn hotword_reload_reflects_file_edits() {
    let hotword_file = tempfile::NamedTempFile::new().unwrap();
    std::fs::write(hotword_file.path(), r#"{"产品": ["灰度发布", "迭代"]}"#).unwrap();

    let mut config = base_config();
    config.hotword_file = hotword_file.path().to_path_buf();

    let api = build_api(
        config,
        Arc::new(MockAsr::new(vec![])),
        Arc::new(MockLlm::new(MINUTES_MD)),
        Arc::new(HistogramEmbedding::new(8)),
        Arc::new(MemoryVectorStore::new()),
    );

    let baseline = api.hotword_listing();
    assert_eq!(baseline.total, 2);

    std::fs::write(
        hotword_file.path(),
        r#"{"产品": ["灰度发布", "迭代", "路线图", "里程碑", "复盘"]}"#,
    )
    .unwrap();

    let reloaded = api.reload_hotwords().unwrap();
    assert_eq!(reloaded.total, baseline.total + 3);
    assert_eq!(reloaded.stats.unwrap().total_words, 5);
}

#[tokio::test]
async fn registered_voiceprint_is_matched_in_meetings() {
    let dir = tempfile::tempdir().unwrap();

    let clip = dir.path().join("clip.wav");
    write_wav(&clip, 5.0, 220.0);
    let meeting = dir.path().join("meeting.wav");
    write_wav(&meeting, 4.0, 220.0);

    let api = build_api(
        base_config(),
        Arc::new(MockAsr::new(vec![("项目进展顺利", 0.0, 4.0, None)])),
        Arc::new(MockLlm::new(MINUTES_MD)),
        Arc::new(HistogramEmbedding::new(8)),
        Arc::new(MemoryVectorStore::new()),
    );

    let registered = api
        .register_voiceprint(
            UploadedFile {
                file_name: "clip.wav".into(),
                data: std::fs::read(&clip).unwrap(),
            },
            "张三",
            "EMP001",
        )
        .await;
    assert_eq!(registered.code, 200, "{}", registered.message);
    let data = registered.data.unwrap();
    assert_eq!(data.vector_dim, 192);
    assert_eq!(data.employee_id, "EMP001");

    let response = api
        .process(
            RawProcessRequest {
                file_paths: vec![meeting.to_string_lossy().into_owned()],
                history_mode: Some("summary".into()),
                ..Default::default()
            },
            &CancellationToken::new(),
        )
        .await;

    assert_eq!(response.status, "success");
    let matched = &response.transcript[0];
    assert_eq!(matched.speaker_name.as_deref(), Some("张三"));
    assert_eq!(matched.employee_id.as_deref(), Some("EMP001"));
    assert!(matched.voice_similarity.unwrap() >= 0.75);
}

#[tokio::test]
async fn short_clip_registration_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let clip = dir.path().join("short.wav");
    write_wav(&clip, 1.0, 220.0);

    let api = build_api(
        base_config(),
        Arc::new(MockAsr::new(vec![])),
        Arc::new(MockLlm::new(MINUTES_MD)),
        Arc::new(HistogramEmbedding::new(8)),
        Arc::new(MemoryVectorStore::new()),
    );

    let response = api
        .register_voiceprint(
            UploadedFile {
                file_name: "short.wav".into(),
                data: std::fs::read(&clip).unwrap(),
            },
            "李四",
            "EMP002",
        )
        .await;
    assert_eq!(response.code, 400);
    assert!(response.message.contains("short"));
}

#[tokio::test]
async fn cancelled_request_returns_cancelled() {
    let api = build_api(
        base_config(),
        Arc::new(MockAsr::new(vec![])),
        Arc::new(MockLlm::new(MINUTES_MD)),
        Arc::new(HistogramEmbedding::new(8)),
        Arc::new(MemoryVectorStore::new()),
    );

    let cancel = CancellationToken::new();
    cancel.cancel();
    let response = api
        .process(
            RawProcessRequest {
                text_content: Some("文本".into()),
                ..Default::default()
            },
            &cancel,
        )
        .await;
    assert_eq!(response.status, "error");
    assert!(response.message.contains("CANCELLED"));
}

#[tokio::test]
async fn health_reports_ready_providers() {
    let api = build_api(
        base_config(),
        Arc::new(MockAsr::new(vec![])),
        Arc::new(MockLlm::new(MINUTES_MD)),
        Arc::new(HistogramEmbedding::new(8)),
        Arc::new(MemoryVectorStore::new()),
    );

    let report = api.health().await;
    assert_eq!(report.status, "healthy");
    assert_eq!(report.mode, "full");
    assert_eq!(report.providers.asr, "ready");
    assert_eq!(report.providers.vector, "ready");
}
