//! Clip lifecycle records: requested, fetched, probed.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// One requested source clip. `position` is the index in the request array
/// and fixes the clip's place in the merged timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ClipRequest {
    pub url: String,
    pub position: usize,
}

impl ClipRequest {
    pub fn new(url: impl Into<String>, position: usize) -> Self {
        Self {
            url: url.into(),
            position,
        }
    }

    /// Build requests from an ordered URL list.
    pub fn from_urls<I, S>(urls: I) -> Vec<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        urls.into_iter()
            .enumerate()
            .map(|(position, url)| Self::new(url, position))
            .collect()
    }
}

/// A clip downloaded into the run's scratch directory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchedClip {
    pub position: usize,
    pub local_path: PathBuf,
    pub byte_size: u64,
    pub retrieved_at: DateTime<Utc>,
}

/// Stream and duration facts extracted from a fetched clip.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ClipMetadata {
    pub position: usize,
    pub duration_seconds: f64,
    pub has_video: bool,
    pub has_audio: bool,
    pub width: u32,
    pub height: u32,
}

impl ClipMetadata {
    /// A clip is mergeable only with a positive duration and a video stream.
    pub fn is_mergeable(&self) -> bool {
        self.has_video && self.duration_seconds.is_finite() && self.duration_seconds > 0.0
    }
}

/// A fetched clip together with its probed metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProbedClip {
    pub clip: FetchedClip,
    pub metadata: ClipMetadata,
}

impl ProbedClip {
    pub fn position(&self) -> usize {
        self.clip.position
    }
}
