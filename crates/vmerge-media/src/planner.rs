//! Composition planning.
//!
//! Turns validated clip metadata plus output options into a [`MergePlan`]:
//! per-clip fit-and-letterbox geometry, effective transition per junction,
//! absolute crossfade offsets and the audio policy. Planning is a pure
//! function; it either produces a complete plan or fails without side
//! effects.
//!
//! Offsets follow the chained-crossfade timeline. With durations
//! `d_0..d_{N-1}` and effective transitions `t_0..t_{N-2}`:
//!
//! ```text
//! offset_k = (d_0 + .. + d_k) - (t_0 + .. + t_k)
//! total    = (d_0 + .. + d_{N-1}) - (t_0 + .. + t_{N-2})
//! ```
//!
//! With no clamped junction every `t_k` equals the requested `t`, giving
//! `offset_k = sum(d_0..d_k) - t * (k + 1)` and `total = sum(d) - t * (N - 1)`.

use tracing::{debug, warn};

use vmerge_models::{
    AudioJunction, AudioMode, FrameSize, MergeOptions, MergePlan, ProbedClip, ScalePad,
    SegmentPlan,
};

use crate::error::PlanError;

/// A junction's transition is shortened to this fraction of the shorter
/// neighbouring clip when the requested length does not fit.
pub const CLAMP_FACTOR: f64 = 0.9;

/// Computes merge plans.
#[derive(Debug, Clone, Copy, Default)]
pub struct CompositionPlanner;

impl CompositionPlanner {
    pub fn new() -> Self {
        Self
    }

    /// Build the plan for `clips`, which may arrive in any order.
    pub fn plan(&self, clips: &[ProbedClip], options: &MergeOptions) -> Result<MergePlan, PlanError> {
        let ordered = order_by_position(clips)?;
        let target = FrameSize::target(options.quality, options.aspect_ratio);

        let requested = options.transition_seconds;
        if !requested.is_finite() || requested <= 0.0 {
            return Err(PlanError::transition(
                None,
                format!("transition must be a positive number of seconds (got {})", requested),
            ));
        }

        let mut geometry = Vec::with_capacity(ordered.len());
        for clip in &ordered {
            let meta = &clip.metadata;
            if !meta.has_video || meta.width == 0 || meta.height == 0 {
                return Err(PlanError::geometry(
                    Some(meta.position),
                    format!(
                        "clip {} has no usable video frame ({}x{})",
                        meta.position, meta.width, meta.height
                    ),
                ));
            }
            if !meta.duration_seconds.is_finite() || meta.duration_seconds <= 0.0 {
                return Err(PlanError::geometry(
                    Some(meta.position),
                    format!("clip {} has no usable duration", meta.position),
                ));
            }
            geometry.push(fit_inside(meta.width, meta.height, target));
        }

        let durations: Vec<f64> = ordered.iter().map(|c| c.metadata.duration_seconds).collect();
        let transitions = junction_transitions(&durations, requested);
        check_clip_windows(&ordered, &durations, &transitions)?;

        let audio = if ordered.iter().any(|c| c.metadata.has_audio) {
            AudioMode::Mixed
        } else {
            AudioMode::Silent
        };

        let mut segments = Vec::with_capacity(ordered.len());
        let mut elapsed = 0.0;
        let mut overlap = 0.0;

        for (k, clip) in ordered.iter().enumerate() {
            elapsed += durations[k];

            let junction = transitions.get(k).copied();
            let (offset, transition, clamped) = match junction {
                Some((t, clamped)) => {
                    overlap += t;
                    (Some(elapsed - overlap), Some(t), clamped)
                }
                None => (None, None, false),
            };

            let audio_junction = match (audio, junction) {
                (AudioMode::Mixed, Some(_)) => {
                    let next_has_audio = ordered[k + 1].metadata.has_audio;
                    if clip.metadata.has_audio && next_has_audio {
                        Some(AudioJunction::Crossfade)
                    } else {
                        Some(AudioJunction::Cut)
                    }
                }
                _ => None,
            };

            if clamped {
                warn!(
                    position = clip.metadata.position,
                    requested,
                    effective = transition.unwrap_or_default(),
                    "Transition clamped to fit short clip"
                );
            }

            segments.push(SegmentPlan {
                position: clip.metadata.position,
                source_path: clip.clip.local_path.clone(),
                duration_seconds: durations[k],
                scale_pad: geometry[k],
                has_audio: clip.metadata.has_audio,
                crossfade_offset_seconds: offset,
                transition_seconds: transition,
                transition_clamped: clamped,
                audio_junction,
            });
        }

        let total_output_duration = elapsed - overlap;

        debug!(
            clips = segments.len(),
            target = %target,
            total_output_duration,
            "Computed merge plan"
        );

        Ok(MergePlan {
            target,
            transition_duration_seconds: requested,
            segments,
            total_output_duration,
            audio,
        })
    }
}

/// Sort by position and require positions `0..N` with no gaps or repeats.
fn order_by_position(clips: &[ProbedClip]) -> Result<Vec<&ProbedClip>, PlanError> {
    if clips.is_empty() {
        return Err(PlanError::geometry(None, "no clips to merge"));
    }

    let mut ordered: Vec<&ProbedClip> = clips.iter().collect();
    ordered.sort_by_key(|c| c.position());

    for (expected, clip) in ordered.iter().enumerate() {
        let position = clip.position();
        if position != expected || clip.metadata.position != position {
            return Err(PlanError::geometry(
                Some(position),
                format!("clip positions must be 0..{} without gaps or duplicates", clips.len()),
            ));
        }
    }

    Ok(ordered)
}

/// Effective transition per junction, and whether it was clamped.
fn junction_transitions(durations: &[f64], requested: f64) -> Vec<(f64, bool)> {
    durations
        .windows(2)
        .map(|pair| {
            let shorter = pair[0].min(pair[1]);
            if requested >= shorter {
                (shorter * CLAMP_FACTOR, true)
            } else {
                (requested, false)
            }
        })
        .collect()
}

/// Each clip must be long enough to host both its entry and exit crossfade.
fn check_clip_windows(
    ordered: &[&ProbedClip],
    durations: &[f64],
    transitions: &[(f64, bool)],
) -> Result<(), PlanError> {
    for (k, clip) in ordered.iter().enumerate() {
        let entry = if k > 0 { transitions[k - 1].0 } else { 0.0 };
        let exit = transitions.get(k).map(|(t, _)| *t).unwrap_or(0.0);
        // The exit offset must fall strictly after the entry crossfade ends
        if entry + exit >= durations[k] {
            return Err(PlanError::transition(
                Some(clip.position()),
                format!(
                    "clip {} lasts {:.3}s but its transitions need {:.3}s",
                    clip.position(),
                    durations[k],
                    entry + exit
                ),
            ));
        }
    }
    Ok(())
}

fn floor_even(value: f64) -> u32 {
    let v = value.floor().max(2.0) as u32;
    v - v % 2
}

/// Scale a `width`x`height` frame to fit inside `target` preserving aspect
/// ratio, then center it with letterbox padding.
pub fn fit_inside(width: u32, height: u32, target: FrameSize) -> ScalePad {
    let scale = f64::min(
        target.width as f64 / width as f64,
        target.height as f64 / height as f64,
    );

    let scaled_w = floor_even((width as f64 * scale).round()).min(target.width);
    let scaled_h = floor_even((height as f64 * scale).round()).min(target.height);

    ScalePad {
        scaled: FrameSize::new(scaled_w, scaled_h),
        padded: target,
        pad_x: (target.width - scaled_w) / 2,
        pad_y: (target.height - scaled_h) / 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::path::PathBuf;
    use vmerge_models::{AspectRatio, ClipMetadata, FetchedClip, Quality};

    const EPS: f64 = 1e-9;

    fn clip(position: usize, duration: f64, has_audio: bool) -> ProbedClip {
        ProbedClip {
            clip: FetchedClip {
                position,
                local_path: PathBuf::from(format!("/scratch/clip_{:02}.mp4", position)),
                byte_size: 1,
                retrieved_at: Utc::now(),
            },
            metadata: ClipMetadata {
                position,
                duration_seconds: duration,
                has_video: true,
                has_audio,
                width: 1280,
                height: 720,
            },
        }
    }

    fn options(t: f64) -> MergeOptions {
        MergeOptions {
            quality: Quality::Hd1080,
            aspect_ratio: AspectRatio::Landscape,
            transition_seconds: t,
        }
    }

    #[test]
    fn test_two_clip_offsets() {
        let plan = CompositionPlanner::new()
            .plan(&[clip(0, 10.0, true), clip(1, 12.0, true)], &options(1.0))
            .unwrap();

        assert_eq!(plan.offsets().len(), 1);
        assert!((plan.offsets()[0] - 9.0).abs() < EPS);
        assert!((plan.total_output_duration - 21.0).abs() < EPS);
        assert_eq!((plan.target_width(), plan.target_height()), (1920, 1080));
        assert_eq!(plan.segments[1].crossfade_offset_seconds, None);
    }

    #[test]
    fn test_total_duration_formula_for_all_counts() {
        let planner = CompositionPlanner::new();
        for n in 2..=10 {
            for t in [0.3, 0.5, 1.0, 1.5] {
                let clips: Vec<ProbedClip> = (0..n)
                    .map(|i| clip(i, 3.0 + i as f64 * 1.7, i % 2 == 0))
                    .collect();
                let plan = planner.plan(&clips, &options(t)).unwrap();
                let sum: f64 = clips.iter().map(|c| c.metadata.duration_seconds).sum();
                let expected = sum - t * (n as f64 - 1.0);
                assert!((plan.total_output_duration - expected).abs() < 1e-6);

                let mut cumulative = 0.0;
                for (k, offset) in plan.offsets().iter().enumerate() {
                    cumulative += clips[k].metadata.duration_seconds;
                    let expected = cumulative - t * (k as f64 + 1.0);
                    assert!((offset - expected).abs() < 1e-6);
                }
                assert!(plan.offsets().windows(2).all(|w| w[0] <= w[1]));
            }
        }
    }

    #[test]
    fn test_transition_clamped_to_short_clip() {
        let plan = CompositionPlanner::new()
            .plan(&[clip(0, 10.0, true), clip(1, 0.8, true)], &options(1.0))
            .unwrap();

        let segment = &plan.segments[0];
        let t = segment.transition_seconds.unwrap();
        assert!(segment.transition_clamped);
        assert!((t - 0.72).abs() < EPS);
        assert!(t < 0.8);
        assert_eq!(plan.clamped_junctions(), 1);
        assert!((plan.total_output_duration - (10.8 - 0.72)).abs() < EPS);
        assert!((plan.offsets()[0] - (10.0 - 0.72)).abs() < EPS);
    }

    #[test]
    fn test_equal_transition_is_clamped() {
        let plan = CompositionPlanner::new()
            .plan(&[clip(0, 1.0, true), clip(1, 5.0, true)], &options(1.0))
            .unwrap();
        assert!(plan.segments[0].transition_clamped);
        assert!(plan.segments[0].transition_seconds.unwrap() < 1.0);
    }

    #[test]
    fn test_short_middle_clip_cannot_host_both_transitions() {
        let err = CompositionPlanner::new()
            .plan(
                &[clip(0, 2.0, true), clip(1, 0.8, true), clip(2, 5.0, true)],
                &options(1.0),
            )
            .unwrap_err();
        assert_eq!(err.reason, crate::error::PlanFailure::TransitionTooLong);
        assert_eq!(err.position, Some(1));
    }

    #[test]
    fn test_transitions_filling_whole_clip_are_rejected() {
        let err = CompositionPlanner::new()
            .plan(
                &[clip(0, 5.0, true), clip(1, 2.0, true), clip(2, 5.0, true)],
                &options(1.0),
            )
            .unwrap_err();
        assert_eq!(err.reason, crate::error::PlanFailure::TransitionTooLong);
        assert_eq!(err.position, Some(1));

        assert!(CompositionPlanner::new()
            .plan(
                &[clip(0, 5.0, true), clip(1, 2.01, true), clip(2, 5.0, true)],
                &options(1.0),
            )
            .is_ok());
    }

    #[test]
    fn test_order_follows_position_not_input_order() {
        let plan = CompositionPlanner::new()
            .plan(
                &[clip(2, 6.0, true), clip(0, 4.0, true), clip(1, 5.0, true)],
                &options(0.5),
            )
            .unwrap();
        let positions: Vec<usize> = plan.segments.iter().map(|s| s.position).collect();
        assert_eq!(positions, vec![0, 1, 2]);
        assert_eq!(
            plan.segments[0].source_path,
            PathBuf::from("/scratch/clip_00.mp4")
        );
        assert!((plan.offsets()[0] - 3.5).abs() < EPS);
    }

    #[test]
    fn test_position_gaps_rejected() {
        let err = CompositionPlanner::new()
            .plan(&[clip(0, 4.0, true), clip(2, 5.0, true)], &options(0.5))
            .unwrap_err();
        assert_eq!(err.reason, crate::error::PlanFailure::IncompatibleGeometry);
    }

    #[test]
    fn test_zero_geometry_rejected() {
        let mut bad = clip(1, 5.0, true);
        bad.metadata.width = 0;
        let err = CompositionPlanner::new()
            .plan(&[clip(0, 4.0, true), bad], &options(0.5))
            .unwrap_err();
        assert_eq!(err.reason, crate::error::PlanFailure::IncompatibleGeometry);
        assert_eq!(err.position, Some(1));
    }

    #[test]
    fn test_audio_policy() {
        let planner = CompositionPlanner::new();

        let mixed = planner
            .plan(
                &[clip(0, 4.0, true), clip(1, 4.0, true), clip(2, 4.0, false)],
                &options(0.5),
            )
            .unwrap();
        assert_eq!(mixed.audio, AudioMode::Mixed);
        assert_eq!(mixed.segments[0].audio_junction, Some(AudioJunction::Crossfade));
        assert_eq!(mixed.segments[1].audio_junction, Some(AudioJunction::Cut));
        assert_eq!(mixed.segments[2].audio_junction, None);

        let silent = planner
            .plan(&[clip(0, 4.0, false), clip(1, 4.0, false)], &options(0.5))
            .unwrap();
        assert_eq!(silent.audio, AudioMode::Silent);
        assert!(!silent.has_audio_output());
        assert_eq!(silent.segments[0].audio_junction, None);
    }

    #[test]
    fn test_fit_inside_letterboxes() {
        let target = FrameSize::new(1920, 1080);

        let portrait = fit_inside(1080, 1920, target);
        assert_eq!(portrait.scaled, FrameSize::new(608, 1080));
        assert_eq!(portrait.pad_x, (1920 - 608) / 2);
        assert_eq!(portrait.pad_y, 0);

        let same = fit_inside(1280, 720, target);
        assert_eq!(same.scaled, target);
        assert_eq!((same.pad_x, same.pad_y), (0, 0));

        let square = fit_inside(500, 500, FrameSize::new(720, 1280));
        assert_eq!(square.scaled, FrameSize::new(720, 720));
        assert_eq!(square.pad_y, 280);
    }

    #[test]
    fn test_planning_is_deterministic() {
        let clips = [clip(0, 7.25, true), clip(1, 3.5, false), clip(2, 9.0, true)];
        let planner = CompositionPlanner::new();
        assert_eq!(
            planner.plan(&clips, &options(0.8)).unwrap(),
            planner.plan(&clips, &options(0.8)).unwrap()
        );
    }
}
