//! Scripted [`ToolInvoker`] for tests that must not depend on a real FFmpeg.
//!
//! Inspection calls answer from a table keyed by file name. Transcode calls
//! write a placeholder output file and register it with the planned duration
//! (or an override) so the follow-up re-probe sees it.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::watch;

use crate::command::{wait_cancelled, ToolInvocation, ToolInvoker, ToolOutput};
use crate::error::{MediaError, MediaResult};

/// Probe answer for one file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FakeMedia {
    pub duration: f64,
    pub width: u32,
    pub height: u32,
    pub has_video: bool,
    pub has_audio: bool,
}

impl FakeMedia {
    /// 1280x720 video with an audio track.
    pub fn video(duration: f64) -> Self {
        Self {
            duration,
            width: 1280,
            height: 720,
            has_video: true,
            has_audio: true,
        }
    }

    pub fn silent(mut self) -> Self {
        self.has_audio = false;
        self
    }

    pub fn audio_only(mut self) -> Self {
        self.has_video = false;
        self
    }

    pub fn sized(mut self, width: u32, height: u32) -> Self {
        self.width = width;
        self.height = height;
        self
    }

    fn to_json(self) -> Vec<u8> {
        let mut streams = Vec::new();
        if self.has_video {
            streams.push(json!({"codec_type": "video", "width": self.width, "height": self.height}));
        }
        if self.has_audio {
            streams.push(json!({"codec_type": "audio"}));
        }
        json!({
            "streams": streams,
            "format": {"duration": format!("{:.6}", self.duration)}
        })
        .to_string()
        .into_bytes()
    }
}

#[derive(Debug, Default)]
struct TranscodeScript {
    output_duration: Option<f64>,
    failure: Option<(i32, String)>,
    delay: Option<Duration>,
}

/// In-memory stand-in for `ffprobe` and `ffmpeg`.
#[derive(Debug, Default)]
pub struct ScriptedInvoker {
    media: Mutex<HashMap<String, FakeMedia>>,
    transcode: TranscodeScript,
    calls: Mutex<Vec<ToolInvocation>>,
}

fn file_name(arg: &str) -> String {
    Path::new(arg)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default()
}

fn failed(code: i32, stderr: impl Into<String>) -> ToolOutput {
    ToolOutput {
        exit_code: Some(code),
        stderr: stderr.into(),
        ..ToolOutput::default()
    }
}

impl ScriptedInvoker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the probe answer for a file name such as `clip_00.mp4`.
    pub fn with_media(self, name: impl Into<String>, media: FakeMedia) -> Self {
        if let Ok(mut table) = self.media.lock() {
            table.insert(name.into(), media);
        }
        self
    }

    /// Report this duration for transcoder outputs instead of the planned one.
    pub fn with_output_duration(mut self, seconds: f64) -> Self {
        self.transcode.output_duration = Some(seconds);
        self
    }

    pub fn with_transcode_failure(mut self, code: i32, stderr: impl Into<String>) -> Self {
        self.transcode.failure = Some((code, stderr.into()));
        self
    }

    pub fn with_transcode_delay(mut self, delay: Duration) -> Self {
        self.transcode.delay = Some(delay);
        self
    }

    /// Every invocation received so far.
    pub fn calls(&self) -> Vec<ToolInvocation> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    async fn probe(&self, invocation: &ToolInvocation) -> ToolOutput {
        let Some(path) = invocation.args.last() else {
            return failed(1, "no input");
        };
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return failed(1, format!("{}: No such file or directory", path));
        }

        let media = self
            .media
            .lock()
            .ok()
            .and_then(|t| t.get(&file_name(path)).copied());
        match media {
            Some(media) => ToolOutput {
                exit_code: Some(0),
                stdout: media.to_json(),
                ..ToolOutput::default()
            },
            None => failed(1, format!("{}: Invalid data found when processing input", path)),
        }
    }

    async fn transcode(
        &self,
        invocation: &ToolInvocation,
        cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<ToolOutput> {
        if let Some(delay) = self.transcode.delay {
            let limit = invocation.timeout.unwrap_or(Duration::MAX);
            let sleep = tokio::time::sleep(delay.min(limit));
            match cancel {
                Some(mut rx) => tokio::select! {
                    _ = sleep => {}
                    _ = wait_cancelled(&mut rx) => return Err(MediaError::Cancelled),
                },
                None => sleep.await,
            }
            if delay >= limit {
                return Err(MediaError::Timeout(limit.as_secs()));
            }
        }

        if let Some((code, stderr)) = &self.transcode.failure {
            return Ok(failed(*code, stderr.clone()));
        }

        let Some(output) = invocation.args.last() else {
            return Ok(failed(1, "no output"));
        };
        tokio::fs::write(output, b"merged").await?;

        let duration = self
            .transcode
            .output_duration
            .or(invocation.expected_duration_secs)
            .unwrap_or(1.0);
        let mut media = FakeMedia::video(duration);
        media.has_audio = invocation.args.iter().any(|a| a == "[aout]");
        if let Ok(mut table) = self.media.lock() {
            table.insert(file_name(output), media);
        }

        Ok(ToolOutput {
            exit_code: Some(0),
            ..ToolOutput::default()
        })
    }
}

#[async_trait]
impl ToolInvoker for ScriptedInvoker {
    async fn invoke(
        &self,
        invocation: &ToolInvocation,
        cancel: Option<watch::Receiver<bool>>,
    ) -> MediaResult<ToolOutput> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(invocation.clone());
        }

        if invocation.program.contains("ffprobe") {
            Ok(self.probe(invocation).await)
        } else {
            self.transcode(invocation, cancel).await
        }
    }
}
