//! Merge plans produced by the composition planner.
//!
//! A plan is computed once from all probed clips and fully determines the
//! transcoder invocation. It is never partially applied.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::format::FrameSize;

/// Fit-inside scaling followed by centered letterbox padding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalePad {
    /// Size after aspect-preserving scaling (even dimensions)
    pub scaled: FrameSize,
    /// Output size after padding
    pub padded: FrameSize,
    pub pad_x: u32,
    pub pad_y: u32,
}

/// How the output audio track is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioMode {
    /// One continuous track; clips without audio contribute silence
    Mixed,
    /// No source clip has audio, the output is audio-less
    Silent,
}

/// Audio treatment at the junction between two clips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AudioJunction {
    /// Both neighbours carry audio: blend across the overlap
    Crossfade,
    /// At least one side is synthesized silence: hard cut at the offset
    Cut,
}

/// One clip's contribution to the merged timeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentPlan {
    pub position: usize,
    pub source_path: PathBuf,
    pub duration_seconds: f64,
    pub scale_pad: ScalePad,
    pub has_audio: bool,
    /// Absolute start of the crossfade into the next clip, in output time.
    /// `None` for the last segment.
    pub crossfade_offset_seconds: Option<f64>,
    /// Effective length of the crossfade into the next clip
    pub transition_seconds: Option<f64>,
    /// Whether the requested transition was shortened for this junction
    pub transition_clamped: bool,
    pub audio_junction: Option<AudioJunction>,
}

/// Complete, immutable composition plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergePlan {
    pub target: FrameSize,
    /// Requested transition length before any per-junction clamping
    pub transition_duration_seconds: f64,
    pub segments: Vec<SegmentPlan>,
    pub total_output_duration: f64,
    pub audio: AudioMode,
}

impl MergePlan {
    pub fn target_width(&self) -> u32 {
        self.target.width
    }

    pub fn target_height(&self) -> u32 {
        self.target.height
    }

    pub fn has_audio_output(&self) -> bool {
        self.audio == AudioMode::Mixed
    }

    /// Crossfade offsets in junction order.
    pub fn offsets(&self) -> Vec<f64> {
        self.segments
            .iter()
            .filter_map(|s| s.crossfade_offset_seconds)
            .collect()
    }

    /// Number of junctions whose transition was clamped.
    pub fn clamped_junctions(&self) -> usize {
        self.segments.iter().filter(|s| s.transition_clamped).count()
    }
}
