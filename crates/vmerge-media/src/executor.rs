//! Runs a merge plan through FFmpeg and verifies the result.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{info, warn};

use vmerge_models::{EncodingConfig, MergePlan, MergeResult};

use crate::command::{FfmpegCommand, ToolInvoker};
use crate::error::{ExecutionError, ExecutionFailure, MediaError, ProbeFailure};
use crate::filters::build_filter_graph;
use crate::fs_utils::remove_quietly;
use crate::probe::MediaProbe;

/// File name of the merged output inside the scratch directory.
pub const OUTPUT_FILE_NAME: &str = "merged.mp4";
/// Default transcode wall-clock limit (15 minutes).
pub const DEFAULT_TRANSCODE_TIMEOUT: Duration = Duration::from_secs(900);
/// Default allowed gap between planned and measured output duration.
pub const DEFAULT_OUTPUT_TOLERANCE_SECS: f64 = 0.5;

/// Serializes plans into one FFmpeg run.
#[derive(Clone)]
pub struct TranscodeExecutor {
    invoker: Arc<dyn ToolInvoker>,
    probe: MediaProbe,
    program: String,
    encoding: EncodingConfig,
    timeout: Duration,
    tolerance_secs: f64,
}

impl TranscodeExecutor {
    pub fn new(invoker: Arc<dyn ToolInvoker>, probe: MediaProbe, program: impl Into<String>) -> Self {
        Self {
            invoker,
            probe,
            program: program.into(),
            encoding: EncodingConfig::default(),
            timeout: DEFAULT_TRANSCODE_TIMEOUT,
            tolerance_secs: DEFAULT_OUTPUT_TOLERANCE_SECS,
        }
    }

    pub fn with_encoding(mut self, encoding: EncodingConfig) -> Self {
        self.encoding = encoding;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tolerance(mut self, tolerance_secs: f64) -> Self {
        self.tolerance_secs = tolerance_secs;
        self
    }

    pub fn encoding(&self) -> &EncodingConfig {
        &self.encoding
    }

    /// Build the FFmpeg command realizing `plan`.
    pub fn command(&self, plan: &MergePlan, output: &Path) -> FfmpegCommand {
        let graph = build_filter_graph(plan, &self.encoding);

        let mut cmd = FfmpegCommand::new(output);
        for input in &graph.inputs {
            cmd = cmd.input(input);
        }
        cmd = cmd.filter_complex(graph.graph).map_label(graph.video_label);
        if let Some(audio) = graph.audio_label {
            cmd = cmd.map_label(audio);
        }
        cmd.encoding(&self.encoding, graph.audio_label.is_some())
    }

    /// Run the transcode into `scratch_dir` and verify the output duration.
    pub async fn execute(
        &self,
        plan: &MergePlan,
        scratch_dir: &Path,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<MergeResult, ExecutionError> {
        let output = scratch_dir.join(OUTPUT_FILE_NAME);
        remove_quietly(&output).await;

        let invocation = self
            .command(plan, &output)
            .into_invocation(&self.program)
            .with_timeout(self.timeout)
            .with_expected_duration(plan.total_output_duration);

        info!(
            clips = plan.segments.len(),
            target = %plan.target,
            expected_duration = plan.total_output_duration,
            "Starting transcode"
        );
        let started = Instant::now();

        let result = match self.invoker.invoke(&invocation, cancel.clone()).await {
            Ok(result) => result,
            Err(e) => {
                remove_quietly(&output).await;
                return Err(match e {
                    MediaError::Timeout(secs) => ExecutionError::new(
                        ExecutionFailure::Timeout,
                        format!("transcode exceeded {}s and was terminated", secs),
                    ),
                    MediaError::Cancelled => {
                        ExecutionError::new(ExecutionFailure::Cancelled, "transcode cancelled")
                    }
                    other => ExecutionError::new(ExecutionFailure::ToolFailure, other.to_string()),
                });
            }
        };

        if !result.success() {
            remove_quietly(&output).await;
            let code = result
                .exit_code
                .map(|c| c.to_string())
                .unwrap_or_else(|| "signal".to_string());
            return Err(ExecutionError::new(
                ExecutionFailure::ToolFailure,
                format!("{} exited with {}", self.program, code),
            )
            .with_diagnostics(result.stderr));
        }

        let size = tokio::fs::metadata(&output).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            return Err(ExecutionError::new(
                ExecutionFailure::ToolFailure,
                "transcoder reported success but produced no output",
            )
            .with_diagnostics(result.stderr));
        }

        let measured = match self.probe.inspect(&output, cancel).await {
            Ok(info) => info.duration_seconds,
            Err((ProbeFailure::Cancelled, _)) => {
                return Err(ExecutionError::new(
                    ExecutionFailure::Cancelled,
                    "output verification cancelled",
                ));
            }
            Err((reason, message)) => {
                return Err(ExecutionError::new(
                    ExecutionFailure::OutputMismatch,
                    format!("output could not be verified ({}): {}", reason, message),
                ));
            }
        };

        let drift = (measured - plan.total_output_duration).abs();
        if drift > self.tolerance_secs {
            warn!(
                measured,
                planned = plan.total_output_duration,
                "Merged output duration does not match plan"
            );
            return Err(ExecutionError::new(
                ExecutionFailure::OutputMismatch,
                format!(
                    "output lasts {:.3}s, plan expects {:.3}s (tolerance {:.2}s)",
                    measured, plan.total_output_duration, self.tolerance_secs
                ),
            ));
        }

        info!(
            duration = measured,
            bytes = size,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Transcode complete"
        );

        Ok(MergeResult {
            output_path: output,
            total_duration_seconds: measured,
            clips_merged: plan.segments.len(),
        })
    }
}
