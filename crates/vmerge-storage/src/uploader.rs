//! Hand-off of finished artifacts to storage.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;

use crate::client::R2Client;
use crate::error::{StorageError, StorageResult};

/// Content type of merged outputs.
pub const VIDEO_MP4: &str = "video/mp4";

/// Key prefix of merged outputs.
pub const MERGED_KEY_PREFIX: &str = "merged";

/// An artifact ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub local_path: PathBuf,
    pub suggested_key: String,
    pub content_type: String,
}

impl UploadRequest {
    pub fn mp4(local_path: impl Into<PathBuf>, suggested_key: impl Into<String>) -> Self {
        Self {
            local_path: local_path.into(),
            suggested_key: suggested_key.into(),
            content_type: VIDEO_MP4.to_string(),
        }
    }
}

/// Unique key for one merge: `merged-{YYYYmmddHHMMSS}-{run}.mp4`.
pub fn merged_object_key(run_short_id: &str, at: DateTime<Utc>) -> String {
    format!(
        "{}-{}-{}.mp4",
        MERGED_KEY_PREFIX,
        at.format("%Y%m%d%H%M%S"),
        run_short_id
    )
}

/// Storage collaborator: accepts a local file, returns a URL for it.
#[async_trait]
pub trait ArtifactUploader: Send + Sync {
    async fn upload(&self, request: &UploadRequest) -> StorageResult<String>;
}

#[async_trait]
impl ArtifactUploader for R2Client {
    async fn upload(&self, request: &UploadRequest) -> StorageResult<String> {
        if !tokio::fs::try_exists(&request.local_path).await? {
            return Err(StorageError::upload_failed(format!(
                "artifact missing: {}",
                request.local_path.display()
            )));
        }

        let key = self.config().object_key(&request.suggested_key)?;
        self.upload_file(&request.local_path, &key, &request.content_type)
            .await?;

        let url = self.download_url(&key).await;
        info!(key = %key, bucket = self.bucket(), "Artifact stored");
        Ok(url)
    }
}
