//! S3-compatible client implementation.

use std::path::Path;
use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info, warn};

use crate::error::{StorageError, StorageResult};

/// Default lifetime of returned download URLs (7 days, the SigV4 maximum).
pub const DEFAULT_URL_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Configuration for the storage client.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    /// S3 API endpoint URL
    pub endpoint_url: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    /// Region ("auto" for R2)
    pub region: String,
    /// Optional folder prepended to every object key
    pub key_prefix: Option<String>,
    /// Lifetime of presigned download URLs
    pub url_ttl: Duration,
    /// Base used for unsigned URLs when presigning fails; defaults to the endpoint
    pub public_base_url: Option<String>,
}

fn required(name: &str) -> StorageResult<String> {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| StorageError::config_error(format!("{} not set", name)))
}

fn optional(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

impl StorageConfig {
    /// Create config from environment variables.
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self {
            endpoint_url: required("ENDPOINT")?,
            access_key_id: required("ACCESS_KEY_ID")?,
            secret_access_key: required("SECRET_ACCESS_KEY")?,
            bucket_name: required("BUCKET")?,
            region: optional("REGION").unwrap_or_else(|| "auto".to_string()),
            key_prefix: optional("STORAGE_KEY_PREFIX"),
            url_ttl: optional("STORAGE_URL_TTL_SECS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_URL_TTL)
                .min(DEFAULT_URL_TTL),
            public_base_url: optional("STORAGE_PUBLIC_BASE_URL"),
        })
    }

    /// Full object key for a suggested key, with the folder prefix applied.
    pub fn object_key(&self, suggested_key: &str) -> StorageResult<String> {
        let key = suggested_key.trim_start_matches('/');
        if key.is_empty() || key.contains("..") {
            return Err(StorageError::InvalidKey(suggested_key.to_string()));
        }
        Ok(match self.key_prefix.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix, key),
            _ => key.to_string(),
        })
    }

    /// Unsigned URL `{base}/{bucket}/{key}`.
    pub fn public_url(&self, key: &str) -> String {
        let base = self
            .public_base_url
            .as_deref()
            .unwrap_or(&self.endpoint_url)
            .trim_end_matches('/');
        format!("{}/{}/{}", base, self.bucket_name, key)
    }
}

/// S3-compatible storage client.
#[derive(Clone)]
pub struct R2Client {
    client: Client,
    config: StorageConfig,
}

impl R2Client {
    /// Create a new client from configuration.
    pub async fn new(config: StorageConfig) -> StorageResult<Self> {
        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "vmerge",
        );

        let sdk_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(&config.endpoint_url)
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Ok(Self {
            client: Client::from_conf(sdk_config),
            config,
        })
    }

    /// Create from environment variables.
    pub async fn from_env() -> StorageResult<Self> {
        let config = StorageConfig::from_env()?;
        Self::new(config).await
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn bucket(&self) -> &str {
        &self.config.bucket_name
    }

    /// Upload a file.
    pub async fn upload_file(
        &self,
        path: impl AsRef<Path>,
        key: &str,
        content_type: &str,
    ) -> StorageResult<()> {
        let path = path.as_ref();
        debug!("Uploading {} to {}", path.display(), key);

        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        info!("Uploaded {} to {}", path.display(), key);
        Ok(())
    }

    /// Generate a presigned URL for GET.
    pub async fn presign_get(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        let presign_config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| StorageError::PresignFailed(e.to_string()))?;

        let presigned = self
            .client
            .get_object()
            .bucket(&self.config.bucket_name)
            .key(key)
            .presigned(presign_config)
            .await
            .map_err(|e| StorageError::PresignFailed(e.to_string()))?;

        Ok(presigned.uri().to_string())
    }

    /// Presigned download URL, or the unsigned public URL if signing fails.
    pub async fn download_url(&self, key: &str) -> String {
        match self.presign_get(key, self.config.url_ttl).await {
            Ok(url) => url,
            Err(e) => {
                warn!("Falling back to unsigned URL for {}: {}", key, e);
                self.config.public_url(key)
            }
        }
    }

    /// Check connectivity by issuing a HEAD on the bucket.
    pub async fn check_connectivity(&self) -> StorageResult<()> {
        self.client
            .head_bucket()
            .bucket(&self.config.bucket_name)
            .send()
            .await
            .map_err(|e| StorageError::AwsSdk(format!("storage connectivity check failed: {}", e)))?;
        Ok(())
    }
}
