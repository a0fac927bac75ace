//! Merge endpoint.

use std::time::Instant;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::Json;
use tracing::info;
use validator::{Validate, ValidationErrors};

use vmerge_models::{ClipRequest, MergeRequest, MergeResponse};

use crate::auth::ApiKey;
use crate::error::{ApiError, ApiResult};
use crate::metrics;
use crate::state::AppState;

/// Field checks are reported in this order; unlisted fields come last.
const FIELD_ORDER: &[&str] = &["video_urls", "transition_duration"];

/// First human-readable message, in [`FIELD_ORDER`].
fn validation_message(errors: &ValidationErrors) -> String {
    let rank = |field: &str| {
        FIELD_ORDER
            .iter()
            .position(|f| *f == field)
            .unwrap_or(FIELD_ORDER.len())
    };
    let mut fields: Vec<_> = errors.field_errors().into_iter().collect();
    fields.sort_by(|a, b| rank(a.0.as_ref()).cmp(&rank(b.0.as_ref())).then_with(|| a.0.cmp(&b.0)));
    fields
        .iter()
        .flat_map(|(_, errs)| errs.iter())
        .find_map(|e| e.message.as_ref().map(|m| m.to_string()))
        .unwrap_or_else(|| errors.to_string())
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Merge the clips at `video_urls` into one video with crossfades.
///
/// Runs the whole pipeline inside the request. Dropping the request (client
/// disconnect) drops the run, which kills the transcoder and removes the
/// scratch directory.
pub async fn merge_videos(
    State(state): State<AppState>,
    _key: ApiKey,
    body: Result<Json<MergeRequest>, JsonRejection>,
) -> ApiResult<Json<MergeResponse>> {
    let started = Instant::now();

    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;

    // Count and URL format first, then the remaining field rules, then formats
    let clips = ClipRequest::from_urls(request.video_urls.clone());
    state.pipeline.check_requests(&clips)?;
    request
        .validate()
        .map_err(|e| ApiError::validation(validation_message(&e)))?;

    let options = request
        .options(state.pipeline.config().default_transition_seconds)
        .map_err(|e| ApiError::validation(e.to_string()))?;

    info!(
        clips = request.video_urls.len(),
        quality = %options.quality,
        aspect_ratio = %options.aspect_ratio,
        "Merge requested"
    );

    let result = state
        .pipeline
        .merge(clips, options)
        .await;

    let outcome = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            metrics::record_merge_request(e.kind().as_str());
            return Err(e.into());
        }
    };
    metrics::record_merge_request("success");

    Ok(Json(MergeResponse {
        success: true,
        merged_url: outcome.merged_url,
        duration_seconds: round2(outcome.result.total_duration_seconds),
        processing_time: round2(started.elapsed().as_secs_f64()),
        clips_merged: outcome.result.clips_merged,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_message_uses_field_message() {
        let request = MergeRequest {
            video_urls: vec!["https://cdn.test/a.mp4".to_string()],
            quality: None,
            aspect_ratio: None,
            transition_duration: None,
        };
        let errors = request.validate().unwrap_err();
        assert_eq!(
            validation_message(&errors),
            "video_urls must contain between 2 and 10 URLs"
        );
    }

    #[test]
    fn test_validation_message_reports_url_count_first() {
        let request = MergeRequest {
            video_urls: (0..11).map(|i| format!("https://cdn.test/{i}.mp4")).collect(),
            quality: None,
            aspect_ratio: None,
            transition_duration: Some(2.0),
        };
        let errors = request.validate().unwrap_err();
        assert_eq!(
            validation_message(&errors),
            "video_urls must contain between 2 and 10 URLs"
        );
    }

    #[test]
    fn test_round2() {
        assert_eq!(round2(12.3456), 12.35);
        assert_eq!(round2(3.0), 3.0);
    }
}
