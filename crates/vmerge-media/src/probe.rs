//! FFprobe clip inspection.

use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::debug;

use vmerge_models::{ClipMetadata, FetchedClip};

use crate::command::{ToolInvocation, ToolInvoker};
use crate::error::{MediaError, ProbeError, ProbeFailure};

/// Default wall-clock limit for one inspection call.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(60);

/// Stream and duration facts for a media file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MediaInfo {
    pub duration_seconds: f64,
    pub has_video: bool,
    pub has_audio: bool,
    /// Display width, after applying rotation metadata
    pub width: u32,
    /// Display height, after applying rotation metadata
    pub height: u32,
}

impl MediaInfo {
    pub fn into_metadata(self, position: usize) -> ClipMetadata {
        ClipMetadata {
            position,
            duration_seconds: self.duration_seconds,
            has_video: self.has_video,
            has_audio: self.has_audio,
            width: self.width,
            height: self.height,
        }
    }
}

/// FFprobe JSON output format.
#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    #[serde(default)]
    format: Option<FfprobeFormat>,
    #[serde(default)]
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    duration: Option<String>,
    #[serde(default)]
    disposition: HashMap<String, i64>,
    #[serde(default)]
    tags: HashMap<String, String>,
    #[serde(default)]
    side_data_list: Vec<FfprobeSideData>,
}

#[derive(Debug, Deserialize)]
struct FfprobeSideData {
    rotation: Option<f64>,
}

impl FfprobeStream {
    fn is(&self, kind: &str) -> bool {
        self.codec_type.as_deref() == Some(kind)
    }

    /// Embedded cover art shows up as a one-frame video stream.
    fn is_attached_picture(&self) -> bool {
        self.disposition.get("attached_pic").copied().unwrap_or(0) == 1
    }

    fn rotation(&self) -> i64 {
        let from_side_data = self.side_data_list.iter().find_map(|s| s.rotation);
        let from_tags = self.tags.get("rotate").and_then(|r| r.parse::<f64>().ok());
        from_side_data
            .or(from_tags)
            .map(|r| (r.round() as i64).rem_euclid(360))
            .unwrap_or(0)
    }
}

fn parse_seconds(value: Option<&String>) -> Option<f64> {
    value
        .and_then(|d| d.trim().parse::<f64>().ok())
        .filter(|d| d.is_finite() && *d > 0.0)
}

/// Parse `ffprobe -print_format json -show_format -show_streams` output.
pub fn parse_probe_output(stdout: &[u8]) -> Result<MediaInfo, (ProbeFailure, String)> {
    let probe: FfprobeOutput = serde_json::from_slice(stdout)
        .map_err(|e| (ProbeFailure::Corrupt, format!("unparsable probe output: {}", e)))?;

    let video = probe
        .streams
        .iter()
        .find(|s| s.is("video") && !s.is_attached_picture())
        .ok_or_else(|| (ProbeFailure::NotAVideo, "no video stream found".to_string()))?;
    let has_audio = probe.streams.iter().any(|s| s.is("audio"));

    let duration = probe
        .format
        .as_ref()
        .and_then(|f| parse_seconds(f.duration.as_ref()))
        .or_else(|| parse_seconds(video.duration.as_ref()))
        .ok_or_else(|| (ProbeFailure::Corrupt, "missing or non-positive duration".to_string()))?;

    let (mut width, mut height) = (video.width.unwrap_or(0), video.height.unwrap_or(0));
    if matches!(video.rotation(), 90 | 270) {
        std::mem::swap(&mut width, &mut height);
    }

    Ok(MediaInfo {
        duration_seconds: duration,
        has_video: true,
        has_audio,
        width,
        height,
    })
}

/// Runs the inspection tool against local media files.
#[derive(Clone)]
pub struct MediaProbe {
    invoker: Arc<dyn ToolInvoker>,
    program: String,
    timeout: Duration,
}

impl MediaProbe {
    pub fn new(invoker: Arc<dyn ToolInvoker>, program: impl Into<String>) -> Self {
        Self {
            invoker,
            program: program.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Inspect a file. Failures are reported as a reason plus detail.
    pub async fn inspect(
        &self,
        path: &Path,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<MediaInfo, (ProbeFailure, String)> {
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err((
                ProbeFailure::ToolFailure,
                format!("file not found: {}", path.display()),
            ));
        }

        let invocation = ToolInvocation::new(
            &self.program,
            [
                "-v".to_string(),
                "error".to_string(),
                "-print_format".to_string(),
                "json".to_string(),
                "-show_format".to_string(),
                "-show_streams".to_string(),
                path.to_string_lossy().to_string(),
            ],
        )
        .with_timeout(self.timeout);

        let output = self.invoker.invoke(&invocation, cancel).await.map_err(|e| match e {
            MediaError::Cancelled => (ProbeFailure::Cancelled, "probe cancelled".to_string()),
            other => (ProbeFailure::ToolFailure, other.to_string()),
        })?;

        if !output.success() {
            let detail = output.stderr.lines().last().unwrap_or("").trim().to_string();
            return Err((
                ProbeFailure::ToolFailure,
                format!("{} exited with {:?}: {}", self.program, output.exit_code, detail),
            ));
        }

        parse_probe_output(&output.stdout)
    }

    /// Probe one fetched clip.
    pub async fn probe(
        &self,
        clip: &FetchedClip,
        cancel: Option<watch::Receiver<bool>>,
    ) -> Result<ClipMetadata, ProbeError> {
        let info = self
            .inspect(&clip.local_path, cancel)
            .await
            .map_err(|(reason, message)| ProbeError::new(clip.position, reason, message))?;

        debug!(
            position = clip.position,
            duration = info.duration_seconds,
            width = info.width,
            height = info.height,
            has_audio = info.has_audio,
            "Probed clip"
        );

        Ok(info.into_metadata(clip.position))
    }
}
