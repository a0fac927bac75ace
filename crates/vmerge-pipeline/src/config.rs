//! Pipeline configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use vmerge_models::{EncodingConfig, MAX_TRANSITION_SECS, MIN_TRANSITION_SECS};

/// Shortest transcode timeout accepted from configuration.
const MIN_TRANSCODE_TIMEOUT_SECS: u64 = 600;
/// Longest transcode timeout accepted from configuration.
const MAX_TRANSCODE_TIMEOUT_SECS: u64 = 900;

/// Pipeline configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Parent directory for per-run scratch directories
    pub work_dir: PathBuf,
    /// Concurrent fetch/probe operations per run
    pub max_parallel: usize,
    /// Concurrent merge runs per process
    pub max_concurrent_runs: usize,
    /// Per-clip download timeout
    pub fetch_timeout: Duration,
    /// Per-clip byte ceiling
    pub max_clip_bytes: u64,
    /// Byte budget shared by all clips of one run
    pub max_total_bytes: u64,
    /// Wall-clock budget of one run
    pub run_timeout: Duration,
    /// Wall-clock limit of the transcode subprocess
    pub transcode_timeout: Duration,
    /// Crossfade length when the request does not specify one
    pub default_transition_seconds: f64,
    /// Allowed gap between planned and measured output duration
    pub output_tolerance_secs: f64,
    /// Bytes of transcoder diagnostics kept for error reports
    pub diagnostics_limit: usize,
    pub ffmpeg_bin: String,
    pub ffprobe_bin: String,
    pub encoding: EncodingConfig,
    /// Accept clip URLs on loopback/private hosts (local development)
    pub allow_private_urls: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            work_dir: std::env::temp_dir().join("vmerge"),
            max_parallel: 4,
            max_concurrent_runs: 2,
            fetch_timeout: Duration::from_secs(120),
            max_clip_bytes: 500 * 1024 * 1024, // 500 MiB
            max_total_bytes: 2 * 1024 * 1024 * 1024, // 2 GiB
            run_timeout: Duration::from_secs(1800),
            transcode_timeout: Duration::from_secs(MAX_TRANSCODE_TIMEOUT_SECS),
            default_transition_seconds: 0.5,
            output_tolerance_secs: 0.5,
            diagnostics_limit: 16 * 1024,
            ffmpeg_bin: "ffmpeg".to_string(),
            ffprobe_bin: "ffprobe".to_string(),
            encoding: EncodingConfig::default(),
            allow_private_urls: false,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|s| s.trim().parse().ok())
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|s| !s.trim().is_empty())
}

impl PipelineConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let mut encoding = EncodingConfig::default();
        if let Some(codec) = env_string("MERGE_VIDEO_CODEC") {
            encoding.codec = codec;
        }
        if let Some(preset) = env_string("MERGE_PRESET") {
            encoding.preset = preset;
        }
        if let Some(crf) = env_parse::<u8>("MERGE_CRF") {
            encoding.crf = crf.min(51);
        }
        if let Some(bitrate) = env_string("MERGE_AUDIO_BITRATE") {
            encoding.audio_bitrate = bitrate;
        }

        Self {
            work_dir: env_string("MERGE_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.work_dir),
            max_parallel: env_parse::<usize>("MERGE_MAX_PARALLEL")
                .unwrap_or(defaults.max_parallel)
                .max(1),
            max_concurrent_runs: env_parse::<usize>("MERGE_MAX_CONCURRENT_RUNS")
                .unwrap_or(defaults.max_concurrent_runs)
                .max(1),
            fetch_timeout: env_parse("MERGE_FETCH_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.fetch_timeout),
            max_clip_bytes: env_parse("MERGE_MAX_CLIP_BYTES").unwrap_or(defaults.max_clip_bytes),
            max_total_bytes: env_parse("MERGE_MAX_TOTAL_BYTES").unwrap_or(defaults.max_total_bytes),
            run_timeout: env_parse("MERGE_RUN_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.run_timeout),
            transcode_timeout: Duration::from_secs(
                env_parse::<u64>("MERGE_TRANSCODE_TIMEOUT_SECS")
                    .unwrap_or(MAX_TRANSCODE_TIMEOUT_SECS)
                    .clamp(MIN_TRANSCODE_TIMEOUT_SECS, MAX_TRANSCODE_TIMEOUT_SECS),
            ),
            default_transition_seconds: env_parse::<f64>("MERGE_TRANSITION_SECONDS")
                .filter(|t| t.is_finite())
                .unwrap_or(defaults.default_transition_seconds)
                .clamp(MIN_TRANSITION_SECS, MAX_TRANSITION_SECS),
            output_tolerance_secs: env_parse::<f64>("MERGE_OUTPUT_TOLERANCE_SECS")
                .filter(|t| t.is_finite() && *t > 0.0)
                .unwrap_or(defaults.output_tolerance_secs),
            diagnostics_limit: env_parse("MERGE_DIAGNOSTICS_LIMIT")
                .unwrap_or(defaults.diagnostics_limit),
            ffmpeg_bin: env_string("FFMPEG_BIN").unwrap_or(defaults.ffmpeg_bin),
            ffprobe_bin: env_string("FFPROBE_BIN").unwrap_or(defaults.ffprobe_bin),
            encoding,
            allow_private_urls: env_parse("MERGE_ALLOW_PRIVATE_URLS")
                .unwrap_or(defaults.allow_private_urls),
        }
    }
}
