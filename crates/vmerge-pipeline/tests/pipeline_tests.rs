//! End-to-end pipeline tests against a local HTTP server and a scripted
//! transcoder.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vmerge_media::testing::{FakeMedia, ScriptedInvoker};
use vmerge_media::{ExecutionFailure, FetchFailure, ValidationConstraint};
use vmerge_models::{ClipRequest, MergeOptions};
use vmerge_pipeline::{
    AbortReason, FailureKind, MergePipeline, PipelineConfig, PipelineError, RunState,
};
use vmerge_storage::{ArtifactUploader, StorageError, StorageResult, UploadRequest};

/// Records uploads and answers with a fixed-host URL.
#[derive(Default)]
struct RecordingUploader {
    uploads: Mutex<Vec<UploadRequest>>,
    fail: bool,
}

impl RecordingUploader {
    fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    fn uploads(&self) -> Vec<UploadRequest> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl ArtifactUploader for RecordingUploader {
    async fn upload(&self, request: &UploadRequest) -> StorageResult<String> {
        assert!(request.local_path.exists(), "artifact must exist at upload time");
        self.uploads.lock().unwrap().push(request.clone());
        if self.fail {
            return Err(StorageError::upload_failed("bucket unavailable"));
        }
        Ok(format!("https://storage.test/merges/{}", request.suggested_key))
    }
}

fn config(work_dir: &Path) -> PipelineConfig {
    PipelineConfig {
        work_dir: work_dir.to_path_buf(),
        fetch_timeout: Duration::from_secs(10),
        allow_private_urls: true,
        ..PipelineConfig::default()
    }
}

fn invoker(durations: &[f64]) -> ScriptedInvoker {
    durations
        .iter()
        .enumerate()
        .fold(ScriptedInvoker::new(), |inv, (i, d)| {
            inv.with_media(format!("clip_{:02}.mp4", i), FakeMedia::video(*d))
        })
}

fn video() -> ResponseTemplate {
    ResponseTemplate::new(200)
        .set_body_bytes(b"fake video bytes".to_vec())
        .insert_header("content-type", "video/mp4")
}

async fn serve_clips(server: &MockServer, count: usize) {
    for i in 0..count {
        Mock::given(method("GET"))
            .and(path(format!("/clip{}.mp4", i)))
            .respond_with(video())
            .mount(server)
            .await;
    }
}

fn requests(server: &MockServer, count: usize) -> Vec<ClipRequest> {
    ClipRequest::from_urls((0..count).map(|i| format!("{}/clip{}.mp4", server.uri(), i)))
}

fn options(transition: f64) -> MergeOptions {
    MergeOptions {
        transition_seconds: transition,
        ..MergeOptions::default()
    }
}

/// Directories left under the work dir.
fn leftovers(work_dir: &Path) -> Vec<PathBuf> {
    std::fs::read_dir(work_dir)
        .map(|entries| entries.filter_map(|e| e.ok()).map(|e| e.path()).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn test_successful_merge() {
    let server = MockServer::start().await;
    serve_clips(&server, 3).await;
    let work = tempfile::tempdir().unwrap();
    let uploader = Arc::new(RecordingUploader::default());

    let pipeline = MergePipeline::new(
        config(work.path()),
        Arc::new(invoker(&[10.0, 12.0, 8.0])),
        uploader.clone(),
    )
    .unwrap();

    let outcome = pipeline
        .merge(requests(&server, 3), options(1.0))
        .await
        .unwrap();

    assert_eq!(outcome.result.clips_merged, 3);
    assert!((outcome.result.total_duration_seconds - 28.0).abs() < 1e-6);
    assert!((outcome.plan.total_output_duration - 28.0).abs() < 1e-6);
    assert_eq!(outcome.plan.offsets(), vec![9.0, 20.0]);
    assert!(outcome.merged_url.starts_with("https://storage.test/merges/merged-"));
    assert!(outcome.merged_url.ends_with(&format!("-{}.mp4", outcome.run_id.short())));
    assert_eq!(
        outcome.states,
        vec![
            RunState::Idle,
            RunState::Fetching,
            RunState::Probing,
            RunState::Validating,
            RunState::Planning,
            RunState::Executing,
            RunState::Uploading,
            RunState::Done,
        ]
    );

    let uploads = uploader.uploads();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].content_type, "video/mp4");

    assert!(leftovers(work.path()).is_empty(), "scratch directory must be removed");
}

#[tokio::test]
async fn test_order_follows_request_not_arrival() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/clip0.mp4"))
        .respond_with(video().set_delay(Duration::from_millis(300)))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/clip1.mp4"))
        .respond_with(video())
        .mount(&server)
        .await;
    let work = tempfile::tempdir().unwrap();

    // Distinct durations identify each clip in the plan
    let pipeline = MergePipeline::new(
        config(work.path()),
        Arc::new(invoker(&[5.0, 9.0])),
        Arc::new(RecordingUploader::default()),
    )
    .unwrap();

    let outcome = pipeline
        .merge(requests(&server, 2), options(0.5))
        .await
        .unwrap();

    let segments = &outcome.plan.segments;
    assert_eq!(segments[0].position, 0);
    assert!((segments[0].duration_seconds - 5.0).abs() < 1e-6);
    assert!(segments[0].source_path.ends_with("clip_00.mp4"));
    assert_eq!(segments[1].position, 1);
    assert!((segments[1].duration_seconds - 9.0).abs() < 1e-6);
}

#[tokio::test]
async fn test_clip_count_rejected_before_any_fetch() {
    let server = MockServer::start().await;
    serve_clips(&server, 11).await;
    let work = tempfile::tempdir().unwrap();

    let pipeline = MergePipeline::new(
        config(work.path()),
        Arc::new(ScriptedInvoker::new()),
        Arc::new(RecordingUploader::default()),
    )
    .unwrap();

    for count in [1, 11] {
        let err = pipeline
            .merge(requests(&server, count), options(0.5))
            .await
            .unwrap_err();
        match err {
            PipelineError::Validation(e) => assert_eq!(e.constraint, ValidationConstraint::ClipCount),
            other => panic!("expected validation error, got {:?}", other),
        }
    }

    assert!(server.received_requests().await.unwrap().is_empty());
    assert!(leftovers(work.path()).is_empty());
}

#[tokio::test]
async fn test_out_of_range_transition_rejected() {
    let server = MockServer::start().await;
    serve_clips(&server, 2).await;
    let work = tempfile::tempdir().unwrap();

    let pipeline = MergePipeline::new(
        config(work.path()),
        Arc::new(ScriptedInvoker::new()),
        Arc::new(RecordingUploader::default()),
    )
    .unwrap();

    let err = pipeline
        .merge(requests(&server, 2), options(2.0))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Validation);
    assert!(server.received_requests().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_total_duration_ceiling() {
    let server = MockServer::start().await;
    serve_clips(&server, 2).await;
    let work = tempfile::tempdir().unwrap();
    let uploader = Arc::new(RecordingUploader::default());

    let pipeline = MergePipeline::new(
        config(work.path()),
        Arc::new(invoker(&[4000.0, 3500.0])),
        uploader.clone(),
    )
    .unwrap();

    let err = pipeline
        .merge(requests(&server, 2), options(0.5))
        .await
        .unwrap_err();
    match err {
        PipelineError::Validation(e) => {
            assert_eq!(e.constraint, ValidationConstraint::TotalDuration);
            assert_eq!(e.measured_total, Some(7500.0));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
    assert!(uploader.uploads().is_empty());
    assert!(leftovers(work.path()).is_empty());
}

#[tokio::test]
async fn test_fetch_failure_reports_position_and_cleans_up() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/clip0.mp4"))
        .respond_with(video())
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/clip1.mp4"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    let work = tempfile::tempdir().unwrap();

    let pipeline = MergePipeline::new(
        config(work.path()),
        Arc::new(invoker(&[5.0, 5.0])),
        Arc::new(RecordingUploader::default()),
    )
    .unwrap();

    let err = pipeline
        .merge(requests(&server, 2), options(0.5))
        .await
        .unwrap_err();

    assert_eq!(err.position(), Some(1));
    match err {
        PipelineError::Fetch(e) => assert_eq!(e.reason, FetchFailure::HttpStatus(404)),
        other => panic!("expected fetch error, got {:?}", other),
    }
    assert!(leftovers(work.path()).is_empty());
}

#[tokio::test]
async fn test_unreadable_clip_is_probe_failure() {
    let server = MockServer::start().await;
    serve_clips(&server, 2).await;
    let work = tempfile::tempdir().unwrap();

    // Only clip_00 has a probe answer
    let pipeline = MergePipeline::new(
        config(work.path()),
        Arc::new(invoker(&[5.0])),
        Arc::new(RecordingUploader::default()),
    )
    .unwrap();

    let err = pipeline
        .merge(requests(&server, 2), options(0.5))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Probe);
    assert_eq!(err.position(), Some(1));
}

#[tokio::test]
async fn test_output_mismatch_fails_and_cleans_up() {
    let server = MockServer::start().await;
    serve_clips(&server, 2).await;
    let work = tempfile::tempdir().unwrap();
    let uploader = Arc::new(RecordingUploader::default());

    let pipeline = MergePipeline::new(
        config(work.path()),
        Arc::new(invoker(&[10.0, 10.0]).with_output_duration(14.5)),
        uploader.clone(),
    )
    .unwrap();

    let err = pipeline
        .merge(requests(&server, 2), options(0.5))
        .await
        .unwrap_err();
    match err {
        PipelineError::Execution(e) => assert_eq!(e.reason, ExecutionFailure::OutputMismatch),
        other => panic!("expected execution error, got {:?}", other),
    }
    assert!(uploader.uploads().is_empty());
    assert!(leftovers(work.path()).is_empty());
}

#[tokio::test]
async fn test_transcoder_failure_carries_diagnostics() {
    let server = MockServer::start().await;
    serve_clips(&server, 2).await;
    let work = tempfile::tempdir().unwrap();

    let pipeline = MergePipeline::new(
        config(work.path()),
        Arc::new(invoker(&[10.0, 10.0]).with_transcode_failure(1, "Invalid argument")),
        Arc::new(RecordingUploader::default()),
    )
    .unwrap();

    let err = pipeline
        .merge(requests(&server, 2), options(0.5))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Execution);
    assert!(err.diagnostics().unwrap().contains("Invalid argument"));
}

#[tokio::test]
async fn test_upload_failure() {
    let server = MockServer::start().await;
    serve_clips(&server, 2).await;
    let work = tempfile::tempdir().unwrap();

    let pipeline = MergePipeline::new(
        config(work.path()),
        Arc::new(invoker(&[6.0, 6.0])),
        Arc::new(RecordingUploader::failing()),
    )
    .unwrap();

    let err = pipeline
        .merge(requests(&server, 2), options(0.5))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), FailureKind::Upload);
    assert!(err.to_string().starts_with("Failed to store merged video"));
    assert!(leftovers(work.path()).is_empty());
}

#[tokio::test]
async fn test_cancel_mid_fetch() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(video().set_delay(Duration::from_secs(5)))
        .mount(&server)
        .await;
    let work = tempfile::tempdir().unwrap();

    let pipeline = Arc::new(
        MergePipeline::new(
            config(work.path()),
            Arc::new(invoker(&[5.0, 5.0])),
            Arc::new(RecordingUploader::default()),
        )
        .unwrap(),
    );

    let mut ctx = pipeline.create_context().await.unwrap();
    let scratch = ctx.scratch_path().to_path_buf();
    let handle = ctx.cancel_handle();
    let reqs = requests(&server, 2);

    let runner = {
        let pipeline = pipeline.clone();
        tokio::spawn(async move { pipeline.run(&mut ctx, reqs, options(0.5)).await })
    };

    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.cancel();

    let err = tokio::time::timeout(Duration::from_secs(3), runner)
        .await
        .expect("run should stop promptly after cancel")
        .unwrap()
        .unwrap_err();

    assert!(matches!(err, PipelineError::Aborted(AbortReason::Cancelled)));
    assert_eq!(err.kind(), FailureKind::Cancelled);
    assert!(!scratch.exists());
}

#[tokio::test]
async fn test_deadline_exceeded() {
    let server = MockServer::start().await;
    serve_clips(&server, 2).await;
    let work = tempfile::tempdir().unwrap();

    let mut cfg = config(work.path());
    cfg.run_timeout = Duration::from_millis(300);

    let pipeline = MergePipeline::new(
        cfg,
        Arc::new(invoker(&[5.0, 5.0]).with_transcode_delay(Duration::from_secs(5))),
        Arc::new(RecordingUploader::default()),
    )
    .unwrap();

    let err = pipeline
        .merge(requests(&server, 2), options(0.5))
        .await
        .unwrap_err();
    assert!(matches!(err, PipelineError::Aborted(AbortReason::DeadlineExceeded)));
    assert!(leftovers(work.path()).is_empty());
}

#[tokio::test]
async fn test_concurrent_runs_are_isolated() {
    let server = MockServer::start().await;
    serve_clips(&server, 2).await;
    let work = tempfile::tempdir().unwrap();
    let uploader = Arc::new(RecordingUploader::default());

    let pipeline = MergePipeline::new(
        config(work.path()),
        Arc::new(invoker(&[5.0, 7.0])),
        uploader.clone(),
    )
    .unwrap();

    let (a, b) = tokio::join!(
        pipeline.merge(requests(&server, 2), options(0.5)),
        pipeline.merge(requests(&server, 2), options(0.5)),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_ne!(a.run_id, b.run_id);
    assert_ne!(a.merged_url, b.merged_url);
    assert_ne!(a.result.output_path, b.result.output_path);
    assert_eq!(uploader.uploads().len(), 2);
    assert!(leftovers(work.path()).is_empty());
}
