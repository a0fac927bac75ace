//! External tool invocation.
//!
//! Every FFmpeg/FFprobe call goes through the narrow [`ToolInvoker`] seam:
//! the caller builds the argument vector, the invoker runs it and reports the
//! exit code together with stdout and a bounded tail of stderr. Graph
//! construction stays on the caller side.

use std::collections::VecDeque;
use std::future::pending;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use vmerge_models::EncodingConfig;

use crate::error::{MediaError, MediaResult};
use crate::progress::{parse_progress_line, FfmpegProgress, ProgressLine};

/// Default cap on captured diagnostics (stderr tail).
pub const DEFAULT_DIAGNOSTICS_LIMIT: usize = 16 * 1024;

/// Cap on captured stdout; inspection output is small JSON.
const STDOUT_LIMIT: u64 = 4 * 1024 * 1024;

/// One invocation of an external tool.
#[derive(Debug, Clone)]
pub struct ToolInvocation {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Option<Duration>,
    /// Expected output duration, used only to log progress percentages
    pub expected_duration_secs: Option<f64>,
}

impl ToolInvocation {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            timeout: None,
            expected_duration_secs: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_expected_duration(mut self, secs: f64) -> Self {
        self.expected_duration_secs = Some(secs);
        self
    }

    /// Command line rendered for logging.
    pub fn display(&self) -> String {
        format!("{} {}", self.program, self.args.join(" "))
    }
}

/// What a finished tool run reported.
#[derive(Debug, Clone, Default)]
pub struct ToolOutput {
    /// `None` when the process was terminated by a signal
    pub exit_code: Option<i32>,
    pub stdout: Vec<u8>,
    /// Bounded tail of the diagnostic stream, progress lines removed
    pub stderr: String,
    /// Last progress block reported, if the tool emitted any
    pub progress: Option<FfmpegProgress>,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs external tools. Timeouts surface as [`MediaError::Timeout`] and
/// cancellation as [`MediaError::Cancelled`]; any exit status is returned as
/// a [`ToolOutput`].
#[async_trait]
pub trait ToolInvoker: Send + Sync {
    async fn invoke(
        &self,
        invocation: &ToolInvocation,
        cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<ToolOutput>;
}

/// Resolve once the cancel flag is raised. Never resolves if the sender is gone.
pub async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            pending::<()>().await;
        }
    }
}

async fn wait_optional_cancel(rx: Option<watch::Receiver<bool>>) {
    match rx {
        Some(mut rx) => wait_cancelled(&mut rx).await,
        None => pending::<()>().await,
    }
}

async fn wait_optional_timeout(timeout: Option<Duration>) {
    match timeout {
        Some(t) => tokio::time::sleep(t).await,
        None => pending::<()>().await,
    }
}

/// [`ToolInvoker`] backed by real subprocesses.
#[derive(Debug, Clone)]
pub struct ProcessInvoker {
    diagnostics_limit: usize,
}

impl Default for ProcessInvoker {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessInvoker {
    pub fn new() -> Self {
        Self {
            diagnostics_limit: DEFAULT_DIAGNOSTICS_LIMIT,
        }
    }

    pub fn with_diagnostics_limit(mut self, limit: usize) -> Self {
        self.diagnostics_limit = limit.max(256);
        self
    }
}

#[async_trait]
impl ToolInvoker for ProcessInvoker {
    async fn invoke(
        &self,
        invocation: &ToolInvocation,
        cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<ToolOutput> {
        let program = which::which(&invocation.program)
            .map_err(|_| MediaError::tool_not_found(&invocation.program))?;

        debug!("Running {}", invocation.display());

        let mut child = Command::new(&program)
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| MediaError::internal("stdout not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| MediaError::internal("stderr not captured"))?;

        let stdout_task = tokio::spawn(read_stdout(stdout));
        let stderr_task = tokio::spawn(read_stderr(
            stderr,
            self.diagnostics_limit,
            invocation.expected_duration_secs,
        ));

        let status = tokio::select! {
            status = child.wait() => status?,
            _ = wait_optional_timeout(invocation.timeout) => {
                let secs = invocation.timeout.map(|t| t.as_secs()).unwrap_or_default();
                warn!("{} timed out after {} seconds, killing process", invocation.program, secs);
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(MediaError::Timeout(secs));
            }
            _ = wait_optional_cancel(cancel) => {
                info!("{} cancelled, killing process", invocation.program);
                let _ = child.kill().await;
                stdout_task.abort();
                stderr_task.abort();
                return Err(MediaError::Cancelled);
            }
        };

        let stdout = stdout_task
            .await
            .map_err(|e| MediaError::internal(format!("stdout reader failed: {}", e)))??;
        let (stderr, progress) = stderr_task
            .await
            .map_err(|e| MediaError::internal(format!("stderr reader failed: {}", e)))?;

        Ok(ToolOutput {
            exit_code: status.code(),
            stdout,
            stderr,
            progress,
        })
    }
}

async fn read_stdout<R>(stdout: R) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::new();
    let mut limited = stdout.take(STDOUT_LIMIT);
    limited.read_to_end(&mut buf).await?;
    // Drain the rest so the child never blocks on a full pipe
    let mut rest = limited.into_inner();
    tokio::io::copy(&mut rest, &mut tokio::io::sink()).await?;
    Ok(buf)
}

async fn read_stderr<R>(
    stderr: R,
    limit: usize,
    expected_duration_secs: Option<f64>,
) -> (String, Option<FfmpegProgress>)
where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    let mut tail = DiagnosticsTail::new(limit);
    let mut current = FfmpegProgress::default();
    let mut last = None;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                // The child must never see a closed pipe while it is still writing
                debug!("stderr read failed, draining: {}", e);
                let _ = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await;
                break;
            }
        }

        let decoded = String::from_utf8_lossy(&buf);
        let line = decoded.trim_end_matches(['\n', '\r']);
        match parse_progress_line(line, &mut current) {
            ProgressLine::Block(block) => {
                if let Some(total) = expected_duration_secs {
                    debug!(
                        percent = format!("{:.1}", block.percentage(total)),
                        eta_secs = ?block.eta_seconds(total),
                        speed = block.speed,
                        "Transcode progress"
                    );
                }
                last = Some(block);
            }
            ProgressLine::Partial => {}
            ProgressLine::Other => tail.push(line.to_string()),
        }
    }

    (tail.into_string(), last)
}

/// Keeps the last `limit` bytes worth of lines.
#[derive(Debug)]
pub(crate) struct DiagnosticsTail {
    lines: VecDeque<String>,
    bytes: usize,
    limit: usize,
    dropped: bool,
}

impl DiagnosticsTail {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            lines: VecDeque::new(),
            bytes: 0,
            limit,
            dropped: false,
        }
    }

    pub(crate) fn push(&mut self, mut line: String) {
        if line.len() > self.limit {
            let mut cut = line.len() - self.limit;
            while !line.is_char_boundary(cut) {
                cut += 1;
            }
            line = line.split_off(cut);
            self.dropped = true;
        }
        self.bytes += line.len() + 1;
        self.lines.push_back(line);
        while self.bytes > self.limit {
            match self.lines.pop_front() {
                Some(old) => {
                    self.bytes -= old.len() + 1;
                    self.dropped = true;
                }
                None => break,
            }
        }
    }

    pub(crate) fn into_string(self) -> String {
        let body = Vec::from(self.lines).join("\n");
        if self.dropped {
            format!("[...truncated...]\n{}", body)
        } else {
            body
        }
    }
}

/// Builder for a multi-input FFmpeg command.
///
/// Progress blocks are always requested on stderr so the invoker can
/// separate them from diagnostics.
#[derive(Debug, Clone)]
pub struct FfmpegCommand {
    inputs: Vec<PathBuf>,
    output: PathBuf,
    /// Arguments after the last -i
    output_args: Vec<String>,
}

impl FfmpegCommand {
    pub fn new(output: impl AsRef<Path>) -> Self {
        Self {
            inputs: Vec::new(),
            output: output.as_ref().to_path_buf(),
            output_args: Vec::new(),
        }
    }

    pub fn input(mut self, path: impl AsRef<Path>) -> Self {
        self.inputs.push(path.as_ref().to_path_buf());
        self
    }

    pub fn output_arg(mut self, arg: impl Into<String>) -> Self {
        self.output_args.push(arg.into());
        self
    }

    pub fn output_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn filter_complex(self, graph: impl Into<String>) -> Self {
        self.output_arg("-filter_complex").output_arg(graph)
    }

    /// Map a filter graph output label (without brackets).
    pub fn map_label(self, label: &str) -> Self {
        self.output_arg("-map").output_arg(format!("[{}]", label))
    }

    pub fn encoding(self, encoding: &EncodingConfig, with_audio: bool) -> Self {
        self.output_args(encoding.to_ffmpeg_args(with_audio))
    }

    /// Build the command arguments.
    pub fn build_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-y",
            "-hide_banner",
            "-nostdin",
            "-v",
            "error",
            "-progress",
            "pipe:2",
            "-nostats",
        ]
        .iter()
        .map(|a| a.to_string())
        .collect();

        for input in &self.inputs {
            args.push("-i".to_string());
            args.push(input.to_string_lossy().to_string());
        }

        args.extend(self.output_args.clone());
        args.push(self.output.to_string_lossy().to_string());

        args
    }

    pub fn into_invocation(self, program: impl Into<String>) -> ToolInvocation {
        ToolInvocation::new(program, self.build_args())
    }
}

/// Check if FFmpeg is available.
pub fn check_ffmpeg(program: &str) -> MediaResult<PathBuf> {
    which::which(program).map_err(|_| MediaError::tool_not_found(program))
}

/// Check if FFprobe is available.
pub fn check_ffprobe(program: &str) -> MediaResult<PathBuf> {
    which::which(program).map_err(|_| MediaError::tool_not_found(program))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_builder() {
        let cmd = FfmpegCommand::new("/tmp/out.mp4")
            .input("/tmp/a.mp4")
            .input("/tmp/b.mp4")
            .filter_complex("[0:v][1:v]xfade=duration=1:offset=4[vout]")
            .map_label("vout")
            .encoding(&EncodingConfig::default(), false);

        let args = cmd.build_args();
        assert_eq!(args.first().map(String::as_str), Some("-y"));
        assert_eq!(args.iter().filter(|a| *a == "-i").count(), 2);
        assert!(args.contains(&"[vout]".to_string()));
        assert!(args.contains(&"-an".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("/tmp/out.mp4"));

        let first_input = args.iter().position(|a| a == "/tmp/a.mp4").unwrap();
        let second_input = args.iter().position(|a| a == "/tmp/b.mp4").unwrap();
        let graph = args.iter().position(|a| a == "-filter_complex").unwrap();
        assert!(first_input < second_input && second_input < graph);
    }

    #[tokio::test]
    async fn test_stderr_reader_survives_invalid_utf8() {
        let stderr: &[u8] = b"bad \xff byte\nframe=10\nprogress=continue\nError: real failure cause\n";
        let (diagnostics, progress) = read_stderr(stderr, 1024, Some(10.0)).await;

        assert!(diagnostics.contains("bad \u{FFFD} byte"));
        assert!(diagnostics.ends_with("Error: real failure cause"));
        assert_eq!(progress.map(|p| p.frame), Some(10));
    }

    #[tokio::test]
    async fn test_stderr_reader_keeps_unterminated_last_line() {
        let stderr: &[u8] = b"first\r\nlast without newline";
        let (diagnostics, _) = read_stderr(stderr, 1024, None).await;
        assert_eq!(diagnostics, "first\nlast without newline");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invalid_utf8_stderr_keeps_diagnostics() {
        let invocation = ToolInvocation::new(
            "sh",
            [
                "-c",
                "printf 'bad \\377 byte\\n' >&2; echo 'Error: real failure cause' >&2; exit 1",
            ],
        );
        let output = ProcessInvoker::new().invoke(&invocation, None).await.unwrap();

        assert_eq!(output.exit_code, Some(1));
        assert!(output.stderr.contains("Error: real failure cause"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_invalid_utf8_stderr_does_not_kill_tool() {
        let script = "printf '\\377\\n' >&2; i=0; while [ $i -lt 5000 ]; do echo \"line $i\" >&2; i=$((i+1)); done; exit 0";
        let invocation = ToolInvocation::new("sh", ["-c", script]);
        let output = ProcessInvoker::new().invoke(&invocation, None).await.unwrap();

        assert_eq!(output.exit_code, Some(0));
        assert!(output.stderr.contains("line 4999"));
    }

    #[test]
    fn test_diagnostics_tail_is_bounded() {
        let mut tail = DiagnosticsTail::new(32);
        for i in 0..20 {
            tail.push(format!("line number {}", i));
        }
        let out = tail.into_string();
        assert!(out.starts_with("[...truncated...]"));
        assert!(out.contains("line number 19"));
        assert!(!out.contains("line number 0\n"));
    }

    #[test]
    fn test_diagnostics_tail_untruncated() {
        let mut tail = DiagnosticsTail::new(1024);
        tail.push("a".to_string());
        tail.push("b".to_string());
        assert_eq!(tail.into_string(), "a\nb");
    }

    #[tokio::test]
    async fn test_wait_cancelled_resolves_on_signal() {
        let (tx, mut rx) = watch::channel(false);
        let waiter = tokio::spawn(async move { wait_cancelled(&mut rx).await });
        tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("cancel wait did not resolve")
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_tool_is_reported() {
        let invoker = ProcessInvoker::new();
        let invocation = ToolInvocation::new("definitely-not-a-real-tool-vmerge", ["-h"]);
        let err = invoker.invoke(&invocation, None).await.unwrap_err();
        assert!(matches!(err, MediaError::ToolNotFound(_)));
    }
}
