//! Merge request/response schema and run result.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use validator::Validate;

use crate::format::{AspectRatio, FormatParseError, Quality};

/// Minimum number of clips in one merge.
pub const MIN_CLIPS: usize = 2;
/// Maximum number of clips in one merge.
pub const MAX_CLIPS: usize = 10;
/// Ceiling on the summed duration of all source clips (2 hours).
pub const MAX_TOTAL_DURATION_SECS: f64 = 7200.0;
/// Smallest crossfade a caller may request.
pub const MIN_TRANSITION_SECS: f64 = 0.3;
/// Largest crossfade a caller may request.
pub const MAX_TRANSITION_SECS: f64 = 1.5;

/// Body of `POST /api/v1/merge`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Validate)]
pub struct MergeRequest {
    #[validate(length(
        min = 2,
        max = 10,
        message = "video_urls must contain between 2 and 10 URLs"
    ))]
    pub video_urls: Vec<String>,

    /// "720" or "1080"
    #[serde(default)]
    pub quality: Option<String>,

    /// "16:9", "9:16" or "1:1"
    #[serde(default)]
    pub aspect_ratio: Option<String>,

    /// Crossfade length in seconds
    #[serde(default)]
    #[validate(range(
        min = 0.3,
        max = 1.5,
        message = "transition_duration must be between 0.3 and 1.5 seconds"
    ))]
    pub transition_duration: Option<f64>,
}

impl MergeRequest {
    /// Resolve optional fields into concrete merge options.
    pub fn options(&self, default_transition: f64) -> Result<MergeOptions, FormatParseError> {
        let quality = match self.quality.as_deref() {
            Some(q) => q.parse()?,
            None => Quality::default(),
        };
        let aspect_ratio = match self.aspect_ratio.as_deref() {
            Some(a) => a.parse()?,
            None => AspectRatio::default(),
        };
        Ok(MergeOptions {
            quality,
            aspect_ratio,
            transition_seconds: self.transition_duration.unwrap_or(default_transition),
        })
    }
}

/// Resolved output options for a merge.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MergeOptions {
    pub quality: Quality,
    pub aspect_ratio: AspectRatio,
    pub transition_seconds: f64,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            quality: Quality::default(),
            aspect_ratio: AspectRatio::default(),
            transition_seconds: 0.5,
        }
    }
}

/// Successful merge response.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MergeResponse {
    pub success: bool,
    pub merged_url: String,
    pub duration_seconds: f64,
    /// Wall-clock seconds spent on the request
    pub processing_time: f64,
    pub clips_merged: usize,
}

/// Error response body.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// The transcoded artifact handed to the storage collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeResult {
    pub output_path: PathBuf,
    pub total_duration_seconds: f64,
    pub clips_merged: usize,
}
