//! Merge run orchestration.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tracing::Instrument;

use vmerge_media::{
    wait_cancelled, ClipFetcher, CompositionPlanner, DurationValidator, FetchError, MediaProbe,
    ProbeError, ProcessInvoker, ToolInvoker, TranscodeExecutor,
};
use vmerge_models::{
    ClipMetadata, ClipRequest, FetchedClip, MergeOptions, MergePlan, MergeResult, ProbedClip,
    RunId,
};
use vmerge_storage::{merged_object_key, ArtifactUploader, UploadRequest};

use crate::config::PipelineConfig;
use crate::context::{RunBudget, RunContext};
use crate::error::{AbortReason, PipelineError, PipelineResult};
use crate::logging::RunLogger;
use crate::state::{RunState, StateMachine};

/// A finished merge.
#[derive(Debug, Clone)]
pub struct MergeOutcome {
    pub run_id: RunId,
    pub merged_url: String,
    pub result: MergeResult,
    pub plan: MergePlan,
    pub processing_time: Duration,
    /// States visited, `Idle` first
    pub states: Vec<RunState>,
}

/// Sequences fetch, probe, validation, planning, transcode and upload for
/// one request at a time per run context.
pub struct MergePipeline {
    config: PipelineConfig,
    fetcher: ClipFetcher,
    probe: MediaProbe,
    validator: DurationValidator,
    planner: CompositionPlanner,
    executor: TranscodeExecutor,
    uploader: Arc<dyn ArtifactUploader>,
    run_slots: Arc<Semaphore>,
}

impl MergePipeline {
    /// Build a pipeline around the given tool invoker and storage collaborator.
    pub fn new(
        config: PipelineConfig,
        invoker: Arc<dyn ToolInvoker>,
        uploader: Arc<dyn ArtifactUploader>,
    ) -> PipelineResult<Self> {
        let fetcher = ClipFetcher::new(
            config.fetch_timeout,
            config.max_clip_bytes,
            config.allow_private_urls,
        )
        .map_err(|e| PipelineError::internal(e.to_string()))?;
        let probe = MediaProbe::new(invoker.clone(), config.ffprobe_bin.clone());
        let executor = TranscodeExecutor::new(invoker, probe.clone(), config.ffmpeg_bin.clone())
            .with_encoding(config.encoding.clone())
            .with_timeout(config.transcode_timeout)
            .with_tolerance(config.output_tolerance_secs);
        let validator = DurationValidator::new().allow_private_hosts(config.allow_private_urls);
        let run_slots = Arc::new(Semaphore::new(config.max_concurrent_runs.max(1)));

        Ok(Self {
            config,
            fetcher,
            probe,
            validator,
            planner: CompositionPlanner::new(),
            executor,
            uploader,
            run_slots,
        })
    }

    /// Build a pipeline that runs the real FFmpeg binaries.
    pub fn with_process_invoker(
        config: PipelineConfig,
        uploader: Arc<dyn ArtifactUploader>,
    ) -> PipelineResult<Self> {
        let invoker = Arc::new(ProcessInvoker::new().with_diagnostics_limit(config.diagnostics_limit));
        Self::new(config, invoker, uploader)
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Runs that may start right now without waiting.
    pub fn available_run_slots(&self) -> usize {
        self.run_slots.available_permits()
    }

    /// Fresh context with this pipeline's budgets.
    pub async fn create_context(&self) -> PipelineResult<RunContext> {
        RunContext::create(
            &self.config.work_dir,
            RunBudget {
                max_total_bytes: self.config.max_total_bytes,
                max_wall_clock: self.config.run_timeout,
            },
        )
        .await
    }

    /// Merge `requests` end to end.
    ///
    /// Admission checks run before the run waits for a slot or touches the
    /// filesystem, so malformed requests never reach the network.
    pub async fn merge(
        &self,
        requests: Vec<ClipRequest>,
        options: MergeOptions,
    ) -> PipelineResult<MergeOutcome> {
        if let Err(e) = self.admit(&requests, &options) {
            record_failure(&e);
            return Err(e);
        }

        let _slot = self
            .run_slots
            .acquire()
            .await
            .map_err(|_| PipelineError::internal("run slots closed"))?;

        let mut ctx = self.create_context().await?;
        self.run(&mut ctx, requests, options).await
    }

    /// Clip count, then URL format in position order. No network access.
    pub fn check_requests(&self, requests: &[ClipRequest]) -> PipelineResult<()> {
        self.validator.check_requests(requests)?;
        Ok(())
    }

    fn admit(&self, requests: &[ClipRequest], options: &MergeOptions) -> PipelineResult<()> {
        self.check_requests(requests)?;
        self.validator.check_transition(options.transition_seconds)?;
        Ok(())
    }

    /// Execute one run inside `ctx`. The scratch directory is always torn
    /// down before this returns.
    pub async fn run(
        &self,
        ctx: &mut RunContext,
        requests: Vec<ClipRequest>,
        options: MergeOptions,
    ) -> PipelineResult<MergeOutcome> {
        let logger = RunLogger::new(ctx.run_id(), "merge");
        let span = logger.create_span();
        let mut machine = StateMachine::new(ctx.run_id().as_str());

        logger.log_start(&format!(
            "{} clips, {} {}, transition {}s",
            requests.len(),
            options.quality,
            options.aspect_ratio,
            options.transition_seconds
        ));
        metrics::counter!("vmerge_merges_started_total").increment(1);

        let deadline = ctx.remaining();
        let stages = self
            .run_stages(ctx, &mut machine, &logger, &requests, &options)
            .instrument(span);

        let timed_out = tokio::time::timeout(deadline, stages).await;
        let result = match timed_out {
            Ok(result) => result,
            Err(_) => {
                ctx.cancel(AbortReason::DeadlineExceeded);
                Err(PipelineError::Aborted(AbortReason::DeadlineExceeded))
            }
        };

        let outcome = match result {
            Ok((merged_url, result, plan)) => Ok(MergeOutcome {
                run_id: ctx.run_id().clone(),
                merged_url,
                result,
                plan,
                processing_time: ctx.elapsed(),
                states: Vec::new(),
            }),
            Err(e) => {
                let e = match ctx.abort_error() {
                    Some(abort) if !matches!(e, PipelineError::Aborted(_)) => abort,
                    _ => e,
                };
                machine.fail(e.kind());
                logger.log_error(&e.to_string());
                Err(e)
            }
        };

        ctx.teardown().await;

        match outcome {
            Ok(mut outcome) => {
                outcome.states = machine.history().to_vec();
                metrics::counter!("vmerge_merges_completed_total").increment(1);
                metrics::histogram!("vmerge_merge_duration_seconds")
                    .record(outcome.processing_time.as_secs_f64());
                logger.log_completion(&format!(
                    "{} clips, {:.2}s output in {:.1}s",
                    outcome.result.clips_merged,
                    outcome.result.total_duration_seconds,
                    outcome.processing_time.as_secs_f64()
                ));
                Ok(outcome)
            }
            Err(e) => {
                record_failure(&e);
                Err(e)
            }
        }
    }

    async fn run_stages(
        &self,
        ctx: &RunContext,
        machine: &mut StateMachine,
        logger: &RunLogger,
        requests: &[ClipRequest],
        options: &MergeOptions,
    ) -> PipelineResult<(String, MergeResult, MergePlan)> {
        self.admit(requests, options)?;

        machine.advance(RunState::Fetching)?;
        logger.log_stage(RunState::Fetching, "Fetching clips");
        let fetched = timed(RunState::Fetching, self.fetch_all(ctx, requests)).await?;
        logger.log_progress(&format!(
            "Fetched {} clips, {} bytes",
            fetched.len(),
            ctx.byte_budget().used()
        ));

        machine.advance(RunState::Probing)?;
        logger.log_stage(RunState::Probing, "Probing clips");
        let probed = timed(RunState::Probing, self.probe_all(ctx, fetched)).await?;

        machine.advance(RunState::Validating)?;
        let metadata: Vec<ClipMetadata> = probed.iter().map(|p| p.metadata).collect();
        let total = self.validator.validate(&metadata)?;
        logger.log_stage(
            RunState::Validating,
            &format!("Source duration {:.2}s across {} clips", total, metadata.len()),
        );

        machine.advance(RunState::Planning)?;
        let plan = self.planner.plan(&probed, options)?;
        if plan.clamped_junctions() > 0 {
            logger.log_warning(&format!(
                "{} transition(s) shortened to fit short clips",
                plan.clamped_junctions()
            ));
        }
        logger.log_stage(
            RunState::Planning,
            &format!(
                "Planned {} output, {:.2}s",
                plan.target, plan.total_output_duration
            ),
        );

        machine.advance(RunState::Executing)?;
        let result = timed(
            RunState::Executing,
            self.executor
                .execute(&plan, ctx.scratch_path(), Some(ctx.cancel_signal())),
        )
        .await?;

        machine.advance(RunState::Uploading)?;
        let request = UploadRequest::mp4(
            result.output_path.clone(),
            merged_object_key(ctx.run_id().short(), Utc::now()),
        );
        let mut cancel = ctx.cancel_signal();
        let merged_url = tokio::select! {
            res = timed(RunState::Uploading, self.uploader.upload(&request)) => res?,
            _ = wait_cancelled(&mut cancel) => {
                return Err(ctx.abort_error().unwrap_or(PipelineError::Aborted(AbortReason::Cancelled)));
            }
        };

        machine.advance(RunState::Done)?;
        Ok((merged_url, result, plan))
    }

    /// Download every clip, bounded by `max_parallel`.
    ///
    /// Waits for every started download before reporting, so partial files
    /// are not written after teardown. Once one download fails, queued ones
    /// are skipped. The lowest-position failure is reported.
    async fn fetch_all(
        &self,
        ctx: &RunContext,
        requests: &[ClipRequest],
    ) -> PipelineResult<Vec<FetchedClip>> {
        let permits = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));
        let failed = Arc::new(AtomicBool::new(false));

        let tasks = requests.iter().map(|request| {
            let permits = permits.clone();
            let failed = failed.clone();
            let cancel = ctx.cancel_signal();
            async move {
                let Ok(_permit) = permits.acquire().await else {
                    return (request.position, None);
                };
                let cancelled = *cancel.borrow();
                if cancelled || failed.load(Ordering::SeqCst) {
                    return (request.position, None);
                }
                let result = self
                    .fetcher
                    .fetch(request, ctx.scratch_path(), ctx.byte_budget(), Some(cancel))
                    .await;
                if result.is_err() {
                    failed.store(true, Ordering::SeqCst);
                }
                (request.position, Some(result))
            }
        });

        let mut slots: Vec<(usize, Option<Result<FetchedClip, FetchError>>)> =
            join_all(tasks).await;
        slots.sort_by_key(|(position, _)| *position);

        if let Some(abort) = ctx.abort_error() {
            return Err(abort);
        }

        let mut fetched = Vec::with_capacity(slots.len());
        let mut errors = Vec::new();
        for (_, slot) in slots {
            match slot {
                Some(Ok(clip)) => fetched.push(clip),
                Some(Err(e)) => errors.push(e),
                None => {}
            }
        }

        if let Some(first) = errors.into_iter().next() {
            return Err(first.into());
        }
        if fetched.len() != requests.len() {
            return Err(PipelineError::internal("clip downloads were skipped without a failure"));
        }

        Ok(fetched)
    }

    /// Probe every fetched clip, bounded by `max_parallel`. All probes finish
    /// before any error is reported.
    async fn probe_all(
        &self,
        ctx: &RunContext,
        fetched: Vec<FetchedClip>,
    ) -> PipelineResult<Vec<ProbedClip>> {
        let permits = Arc::new(Semaphore::new(self.config.max_parallel.max(1)));

        let tasks = fetched.into_iter().map(|clip| {
            let permits = permits.clone();
            let cancel = ctx.cancel_signal();
            async move {
                let _permit = permits.acquire().await;
                let result = self.probe.probe(&clip, Some(cancel)).await;
                (clip.position, result.map(|metadata| ProbedClip { clip, metadata }))
            }
        });

        let mut slots: Vec<(usize, Result<ProbedClip, ProbeError>)> = join_all(tasks).await;
        slots.sort_by_key(|(position, _)| *position);

        if let Some(abort) = ctx.abort_error() {
            return Err(abort);
        }

        let mut probed = Vec::with_capacity(slots.len());
        for (_, result) in slots {
            probed.push(result?);
        }
        Ok(probed)
    }
}

/// Await a stage and record its duration.
async fn timed<T, F>(stage: RunState, fut: F) -> T
where
    F: Future<Output = T>,
{
    let started = Instant::now();
    let out = fut.await;
    metrics::histogram!("vmerge_stage_duration_seconds", "stage" => stage.as_str())
        .record(started.elapsed().as_secs_f64());
    out
}

fn record_failure(err: &PipelineError) {
    metrics::counter!("vmerge_merges_failed_total", "kind" => err.kind().as_str()).increment(1);
}
