//! S3-compatible storage for merged artifacts.
//!
//! This crate provides:
//! - File upload to an S3-compatible bucket (R2, MinIO, S3)
//! - Presigned download URLs with an unsigned fallback
//! - The [`ArtifactUploader`] seam used by the merge pipeline

pub mod client;
pub mod error;
pub mod uploader;

pub use client::{R2Client, StorageConfig};
pub use error::{StorageError, StorageResult};
pub use uploader::{merged_object_key, ArtifactUploader, UploadRequest, VIDEO_MP4};
