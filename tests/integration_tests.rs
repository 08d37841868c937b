mod test_helpers;

use std::sync::atomic::Ordering;
use std::time::Duration;

use reverse_prompt::*;
use test_helpers::{
    direct_client, fast_config, http_stub, image_dir, png_payload, silent_stub, FailingStore,
    ScriptedCaptioner, Step,
};

fn csv_rows(path: &std::path::Path) -> usize {
    std::fs::read_to_string(path).unwrap().lines().count() - 1
}

#[tokio::test(start_paused = true)]
async fn test_mixed_outcomes() {
    let (dir, records) = image_dir(&["a.png", "b.png", "c.png"]);
    let store_path = dir.path().join("reverse_prompts.csv");
    let captioner = ScriptedCaptioner::new()
        .script("a.png", vec![Step::Caption("Amber dunes at noon.")])
        .script(
            "b.png",
            vec![Step::Transient, Step::Transient, Step::Caption("Blue glacier.")],
        )
        .script("c.png", vec![Step::Permanent]);
    let runner = BatchRunner::new(captioner, fast_config()).unwrap();
    let mut store = CsvStore::open(&store_path).unwrap();

    let started = tokio::time::Instant::now();
    let summary = runner.run(&records, &mut store).await.unwrap();

    assert_eq!(summary.discovered, 3);
    assert_eq!(summary.done, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.failed_ids, vec!["c.png"]);
    assert_eq!(summary.api_calls, 5);
    assert_eq!(runner.captioner().calls_for("b.png"), 3);
    assert_eq!(runner.captioner().calls_for("c.png"), 1);
    // Backoff for b: 2s then 4s.
    assert!(started.elapsed() >= Duration::from_secs(6));

    let reopened = CsvStore::open(&store_path).unwrap();
    let a = reopened.get("a.png").unwrap();
    assert_eq!(a.description.as_deref(), Some("Amber dunes at noon."));
    let b = reopened.get("b.png").unwrap();
    assert_eq!(b.status, RecordStatus::Done);
    assert_eq!(b.attempts, 3);
    let c = reopened.get("c.png").unwrap();
    assert_eq!(c.status, RecordStatus::Failed);
    assert_eq!(c.attempts, 1);
    assert!(c.error.as_deref().unwrap().contains("400"));
}

#[tokio::test(start_paused = true)]
async fn test_second_run_makes_no_calls() {
    let (dir, records) = image_dir(&["a.png", "b.png", "nested/c.png"]);
    let store_path = dir.path().join("rp.csv");

    let first = BatchRunner::new(ScriptedCaptioner::new(), fast_config()).unwrap();
    let mut store = CsvStore::open(&store_path).unwrap();
    let summary = first.run(&records, &mut store).await.unwrap();
    assert_eq!(summary.done, 3);
    let before = std::fs::read(&store_path).unwrap();

    let second = BatchRunner::new(ScriptedCaptioner::new(), fast_config()).unwrap();
    let mut store = CsvStore::open(&store_path).unwrap();
    let summary = second.run(&records, &mut store).await.unwrap();

    assert_eq!(summary.skipped, 3);
    assert_eq!(summary.done, 0);
    assert_eq!(summary.api_calls, 0);
    assert_eq!(second.captioner().total_calls(), 0);
    assert_eq!(std::fs::read(&store_path).unwrap(), before);
}

#[tokio::test(start_paused = true)]
async fn test_interrupted_run_resumes_remaining() {
    let (dir, records) = image_dir(&["a.png", "b.png", "c.png"]);
    let store_path = dir.path().join("rp.csv");

    let flag = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));
    let captioner = ScriptedCaptioner::new().cancel_on_call(1, flag.clone());
    let runner = BatchRunner::new(captioner, fast_config())
        .unwrap()
        .with_cancel_flag(flag.clone());
    let mut store = CsvStore::open(&store_path).unwrap();
    let summary = runner.run(&records, &mut store).await.unwrap();

    // The item in flight finishes; the rest are left for the next run.
    assert_eq!(summary.done, 1);
    assert_eq!(summary.not_attempted, 2);
    assert!(flag.load(Ordering::SeqCst));

    let resumed = BatchRunner::new(ScriptedCaptioner::new(), fast_config()).unwrap();
    let mut store = CsvStore::open(&store_path).unwrap();
    let summary = resumed.run(&records, &mut store).await.unwrap();

    assert_eq!(summary.skipped, 1);
    assert_eq!(summary.done, 2);
    assert_eq!(resumed.captioner().calls_for("a.png"), 0);
    assert_eq!(resumed.captioner().calls_for("b.png"), 1);
    assert_eq!(resumed.captioner().calls_for("c.png"), 1);
    assert_eq!(csv_rows(&store_path), 3);
}

#[tokio::test(start_paused = true)]
async fn test_retry_bound() {
    let (dir, records) = image_dir(&["a.png", "b.png"]);
    let captioner = ScriptedCaptioner::new().script("a.png", vec![Step::Transient; 10]);
    let config = BatchConfig::builder()
        .with_max_attempts(4)
        .with_pace(Duration::ZERO)
        .build();
    let runner = BatchRunner::new(captioner, config).unwrap();
    let mut store = CsvStore::open(dir.path().join("rp.csv")).unwrap();

    let summary = runner.run(&records, &mut store).await.unwrap();

    assert_eq!(runner.captioner().calls_for("a.png"), 4);
    assert_eq!(summary.failed, 1);
    // The batch carries on past the exhausted item.
    assert_eq!(summary.done, 1);
    assert_eq!(store.get("a.png").unwrap().attempts, 4);
}

#[tokio::test(start_paused = true)]
async fn test_permanent_error_is_not_retried() {
    let (dir, records) = image_dir(&["a.png"]);
    let captioner = ScriptedCaptioner::new().script("a.png", vec![Step::Permanent]);
    let runner = BatchRunner::new(captioner, fast_config()).unwrap();
    let mut store = CsvStore::open(dir.path().join("rp.csv")).unwrap();

    let started = tokio::time::Instant::now();
    let summary = runner.run(&records, &mut store).await.unwrap();

    assert_eq!(runner.captioner().calls_for("a.png"), 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_failed_item_is_retried_next_run() {
    let (dir, records) = image_dir(&["a.png"]);
    let store_path = dir.path().join("rp.csv");

    let first = BatchRunner::new(
        ScriptedCaptioner::new().script("a.png", vec![Step::Permanent]),
        fast_config(),
    )
    .unwrap();
    let mut store = CsvStore::open(&store_path).unwrap();
    assert_eq!(first.run(&records, &mut store).await.unwrap().failed, 1);

    let second = BatchRunner::new(ScriptedCaptioner::new(), fast_config()).unwrap();
    let mut store = CsvStore::open(&store_path).unwrap();
    let summary = second.run(&records, &mut store).await.unwrap();

    assert_eq!(summary.done, 1);
    assert_eq!(csv_rows(&store_path), 1);
    assert!(store.get("a.png").unwrap().is_done());
}

#[tokio::test(start_paused = true)]
async fn test_empty_input() {
    let (dir, records) = image_dir(&[]);
    let runner = BatchRunner::new(ScriptedCaptioner::new(), fast_config()).unwrap();
    let mut store = CsvStore::open(dir.path().join("rp.csv")).unwrap();

    let summary = runner.run(&records, &mut store).await.unwrap();

    assert_eq!(summary.discovered, 0);
    assert_eq!(summary.done, 0);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.skipped, 0);
    assert_eq!(runner.captioner().total_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_store_write_failure_aborts() {
    let (_dir, records) = image_dir(&["a.png", "b.png", "c.png"]);
    let runner = BatchRunner::new(ScriptedCaptioner::new(), fast_config()).unwrap();
    let mut store = FailingStore::new(1);

    let result = runner.run(&records, &mut store).await;

    assert!(matches!(result, Err(BatchError::Store(_))));
    assert_eq!(store.written.len(), 1);
    // Nothing is captioned past the failed write.
    assert_eq!(runner.captioner().total_calls(), 2);
    assert_eq!(runner.captioner().calls_for("c.png"), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sqlite_store_end_to_end() {
    let (dir, records) = image_dir(&["a.png", "b.png"]);
    let db_path = dir.path().join("progress.db");

    let captioner = ScriptedCaptioner::new().script("b.png", vec![Step::Permanent]);
    let runner = BatchRunner::new(captioner, fast_config()).unwrap();
    let mut store = open_store(&db_path).unwrap();
    let summary = runner.run(&records, store.as_mut()).await.unwrap();
    assert_eq!((summary.done, summary.failed), (1, 1));
    drop(store);

    let store = SqliteStore::open(&db_path).unwrap();
    let entries = store.load().unwrap();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].status, RecordStatus::Done);
    assert_eq!(entries[1].status, RecordStatus::Failed);

    let rerun = BatchRunner::new(ScriptedCaptioner::new(), fast_config()).unwrap();
    let mut store = store;
    let summary = rerun.run(&records, &mut store).await.unwrap();
    assert_eq!(summary.skipped, 1);
    assert_eq!(rerun.captioner().calls_for("b.png"), 1);
    assert!(store.get("b.png").unwrap().unwrap().is_done());
}

#[tokio::test(start_paused = true)]
async fn test_unreadable_image_recorded_without_call() {
    let (dir, mut records) = image_dir(&["a.png"]);
    records.push(ImageRecord::new("ghost.png", dir.path().join("ghost.png")));
    let runner = BatchRunner::new(ScriptedCaptioner::new(), fast_config()).unwrap();
    let mut store = CsvStore::open(dir.path().join("rp.csv")).unwrap();

    let summary = runner.run(&records, &mut store).await.unwrap();

    assert_eq!(summary.done, 1);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.api_calls, 1);
    assert_eq!(store.get("ghost.png").unwrap().attempts, 0);
}

const GEMINI_OK: &str =
    r#"{"candidates":[{"content":{"parts":[{"text":"A red kite over dunes."}]},"finishReason":"STOP"}]}"#;

fn gemini_at(url: &str) -> GeminiCaptioner {
    GeminiCaptioner::new(GeminiConfig::with_api_key("test-key").endpoint(url))
        .unwrap()
        .with_http_client(direct_client())
}

#[tokio::test]
async fn test_gemini_http_status_mapping() {
    let (url, served) = http_stub(vec![
        (429, r#"{"error":{"code":429,"message":"Resource exhausted"}}"#),
        (400, r#"{"error":{"code":400,"message":"Invalid image"}}"#),
        (200, GEMINI_OK),
    ])
    .await;
    let captioner = gemini_at(&url);
    let image = png_payload();

    match captioner.caption(&image).await {
        Err(e @ CaptionError::Http { status: 429, .. }) => {
            assert!(e.is_transient());
            assert!(e.to_string().contains("Resource exhausted"));
        }
        other => panic!("expected HTTP 429, got {:?}", other),
    }
    match captioner.caption(&image).await {
        Err(e @ CaptionError::Http { status: 400, .. }) => {
            assert_eq!(e.kind(), FailureKind::Permanent);
        }
        other => panic!("expected HTTP 400, got {:?}", other),
    }
    assert_eq!(
        captioner.caption(&image).await.unwrap(),
        "A red kite over dunes."
    );
    assert_eq!(served.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_ollama_http_status_mapping() {
    let (url, _served) = http_stub(vec![
        (503, r#"{"error":"model is loading"}"#),
        (404, r#"{"error":"model 'llava' not found"}"#),
        (200, r#"{"model":"llava","response":"Caption: a quiet harbor.","done":true}"#),
        (200, "not json"),
    ])
    .await;
    let captioner =
        OllamaCaptioner::new(OllamaConfig::with_model("llava").endpoint(&url))
            .with_http_client(direct_client());
    let image = png_payload();

    let err = captioner.caption(&image).await.unwrap_err();
    assert!(matches!(err, CaptionError::Http { status: 503, .. }));
    assert!(err.is_transient());

    let err = captioner.caption(&image).await.unwrap_err();
    assert!(matches!(err, CaptionError::Http { status: 404, ref body } if body.contains("not found")));
    assert!(!err.is_transient());

    assert_eq!(captioner.caption(&image).await.unwrap(), "a quiet harbor.");

    let err = captioner.caption(&image).await.unwrap_err();
    assert!(matches!(err, CaptionError::InvalidResponse(_)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_slow_endpoint_maps_to_timeout() {
    let url = silent_stub().await;
    let captioner = OllamaCaptioner::new(
        OllamaConfig::with_model("llava")
            .endpoint(&url)
            .timeout(Duration::from_millis(200)),
    )
    .with_http_client(direct_client());

    let err = captioner.caption(&png_payload()).await.unwrap_err();
    assert!(matches!(err, CaptionError::Timeout(t) if t == Duration::from_millis(200)));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_refused_connection_is_transient() {
    let addr = std::net::TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap();
    let captioner = gemini_at(&format!("http://{addr}"));

    let err = captioner.caption(&png_payload()).await.unwrap_err();
    assert!(matches!(err, CaptionError::Connection { .. }));
    assert!(err.is_transient());
}

#[tokio::test]
async fn test_rate_limit_then_success_through_runner() {
    let (dir, records) = image_dir(&["a.png", "b.png"]);
    let (url, served) = http_stub(vec![
        (429, r#"{"error":{"message":"Quota exceeded"}}"#),
        (200, GEMINI_OK),
        (400, r#"{"error":{"message":"Unsupported image"}}"#),
    ])
    .await;
    let config = BatchConfig::builder()
        .with_base_delay(Duration::from_millis(10))
        .with_pace(Duration::ZERO)
        .build();
    let runner = BatchRunner::new(gemini_at(&url), config).unwrap();
    let mut store = CsvStore::open(dir.path().join("rp.csv")).unwrap();

    let summary = runner.run(&records, &mut store).await.unwrap();

    assert_eq!(served.load(Ordering::SeqCst), 3);
    assert_eq!(summary.api_calls, 3);
    let a = store.get("a.png").unwrap();
    assert!(a.is_done());
    assert_eq!(a.attempts, 2);
    assert_eq!(a.description.as_deref(), Some("A red kite over dunes."));
    let b = store.get("b.png").unwrap();
    assert_eq!(b.status, RecordStatus::Failed);
    assert_eq!(b.attempts, 1);
    assert!(b.error.as_deref().unwrap().contains("Unsupported image"));
}
