//! Application state.

use std::sync::Arc;

use vmerge_pipeline::{MergePipeline, PipelineConfig};
use vmerge_storage::R2Client;

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub pipeline: Arc<MergePipeline>,
}

impl AppState {
    pub fn new(config: ApiConfig, pipeline: Arc<MergePipeline>) -> Self {
        Self { config, pipeline }
    }

    /// Create state from the environment: object storage client plus a
    /// pipeline running the real FFmpeg binaries.
    pub async fn from_env(config: ApiConfig) -> anyhow::Result<Self> {
        let storage = R2Client::from_env().await?;
        let pipeline = MergePipeline::with_process_invoker(
            PipelineConfig::from_env(),
            Arc::new(storage),
        )?;

        Ok(Self::new(config, Arc::new(pipeline)))
    }
}
