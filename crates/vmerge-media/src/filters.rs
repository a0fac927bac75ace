//! FFmpeg filter graph serialization for merge plans.
//!
//! Input `i` of the transcoder is segment `i` of the plan. Every video chain
//! is normalized to the same geometry, frame rate, pixel format and timebase
//! before the `xfade` chain, since `xfade` rejects mismatched inputs.

use std::path::PathBuf;

use vmerge_models::{AudioJunction, EncodingConfig, MergePlan, SegmentPlan};

/// Output label of the video chain.
pub const VIDEO_OUT: &str = "vout";
/// Output label of the audio chain.
pub const AUDIO_OUT: &str = "aout";

/// Crossfade curve used for both video and audio.
const XFADE_TRANSITION: &str = "fade";
const ACROSSFADE_CURVE: &str = "tri";

/// A serialized `-filter_complex` graph.
#[derive(Debug, Clone, PartialEq)]
pub struct FilterGraph {
    pub graph: String,
    pub inputs: Vec<PathBuf>,
    pub video_label: &'static str,
    /// `None` when the output carries no audio
    pub audio_label: Option<&'static str>,
}

/// Format seconds for filter arguments: fixed precision, trailing zeros dropped.
pub fn secs(value: f64) -> String {
    let formatted = format!("{:.6}", value);
    let trimmed = formatted.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-0" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}

fn video_chain(index: usize, segment: &SegmentPlan, encoding: &EncodingConfig, label: &str) -> String {
    let sp = &segment.scale_pad;
    let d = secs(segment.duration_seconds);
    format!(
        "[{i}:v:0]scale={sw}:{sh},pad={tw}:{th}:{px}:{py}:color=black,setsar=1,\
         fps={fps},format={pix},settb=AVTB,setpts=PTS-STARTPTS,\
         tpad=stop_mode=clone:stop_duration={d},trim=duration={d}[{label}]",
        i = index,
        sw = sp.scaled.width,
        sh = sp.scaled.height,
        tw = sp.padded.width,
        th = sp.padded.height,
        px = sp.pad_x,
        py = sp.pad_y,
        fps = encoding.frame_rate,
        pix = encoding.pixel_format,
        d = d,
        label = label,
    )
}

fn audio_chain(index: usize, segment: &SegmentPlan, encoding: &EncodingConfig, label: &str) -> String {
    let d = secs(segment.duration_seconds);
    let sr = encoding.audio_sample_rate;
    if segment.has_audio {
        format!(
            "[{i}:a:0]aresample={sr},aformat=sample_fmts=fltp:channel_layouts=stereo,\
             apad,atrim=duration={d},asetpts=PTS-STARTPTS[{label}]",
            i = index,
        )
    } else {
        // Silence of the clip's exact length keeps the audio timeline aligned
        format!(
            "anullsrc=r={sr}:cl=stereo,aformat=sample_fmts=fltp:channel_layouts=stereo,\
             atrim=duration={d},asetpts=PTS-STARTPTS[{label}]"
        )
    }
}

/// Serialize `plan` into a single filter graph.
pub fn build_filter_graph(plan: &MergePlan, encoding: &EncodingConfig) -> FilterGraph {
    let segments = &plan.segments;
    let last = segments.len().saturating_sub(1);
    let mut parts: Vec<String> = Vec::new();

    for (i, segment) in segments.iter().enumerate() {
        let label = if last == 0 {
            VIDEO_OUT.to_string()
        } else {
            format!("v{}", i)
        };
        parts.push(video_chain(i, segment, encoding, &label));
    }

    let mut acc = "v0".to_string();
    for (k, segment) in segments.iter().enumerate().take(last) {
        let (Some(offset), Some(t)) = (segment.crossfade_offset_seconds, segment.transition_seconds)
        else {
            continue;
        };
        let out = if k + 1 == last {
            VIDEO_OUT.to_string()
        } else {
            format!("vx{}", k + 1)
        };
        parts.push(format!(
            "[{acc}][v{next}]xfade=transition={XFADE_TRANSITION}:duration={t}:offset={o}[{out}]",
            next = k + 1,
            t = secs(t),
            o = secs(offset),
        ));
        acc = out;
    }

    let audio_label = if plan.has_audio_output() {
        for (i, segment) in segments.iter().enumerate() {
            let label = if last == 0 {
                AUDIO_OUT.to_string()
            } else {
                format!("a{}", i)
            };
            parts.push(audio_chain(i, segment, encoding, &label));
        }

        let mut acc = "a0".to_string();
        for (k, segment) in segments.iter().enumerate().take(last) {
            let (Some(offset), Some(t)) =
                (segment.crossfade_offset_seconds, segment.transition_seconds)
            else {
                continue;
            };
            let next = k + 1;
            let out = if next == last {
                AUDIO_OUT.to_string()
            } else {
                format!("ax{}", next)
            };

            match segment.audio_junction.unwrap_or(AudioJunction::Cut) {
                AudioJunction::Crossfade => parts.push(format!(
                    "[{acc}][a{next}]acrossfade=d={t}:c1={ACROSSFADE_CURVE}:c2={ACROSSFADE_CURVE}[{out}]",
                    t = secs(t),
                )),
                AudioJunction::Cut => {
                    // Cut the accumulated track where the video crossfade starts
                    parts.push(format!(
                        "[{acc}]atrim=end={o},asetpts=PTS-STARTPTS[at{k}]",
                        o = secs(offset),
                    ));
                    parts.push(format!("[at{k}][a{next}]concat=n=2:v=0:a=1[{out}]"));
                }
            }
            acc = out;
        }
        Some(AUDIO_OUT)
    } else {
        None
    };

    FilterGraph {
        graph: parts.join(";"),
        inputs: segments.iter().map(|s| s.source_path.clone()).collect(),
        video_label: VIDEO_OUT,
        audio_label,
    }
}
