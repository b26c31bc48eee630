//! Image source fetching.
//!
//! An [`ImageFetcher`] downloads an image into a local OCI image layout that
//! the unpacker can read by path. [`RegistryFetcher`] is the default
//! implementation and speaks the OCI distribution API.

mod reference;
mod registry;

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::credentials::PullCredentials;

pub use reference::{ImageReference, DOCKER_HUB_REGISTRY};
pub use registry::{RegistryConfig, RegistryFetcher};

/// Errors from fetching an image.
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid image reference: {0}")]
    InvalidReference(String),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Image not found: {0}")]
    NotFound(String),

    #[error("Authentication failed for {0}")]
    Unauthorized(String),

    #[error("Registry returned {status} for {url}")]
    Registry { status: u16, url: String },

    #[error("Unsupported media type: {0}")]
    UnsupportedMediaType(String),

    #[error("No manifest for platform {os}/{arch}")]
    NoMatchingPlatform { os: String, arch: String },

    #[error("Image too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },
}

/// What to fetch and where to put it.
#[derive(Debug, Clone)]
pub struct FetchRequest {
    /// Image reference, e.g. `quay.io/jitesoft/alpine:latest`.
    pub reference: String,
    /// Directory that receives the OCI image layout.
    pub dest: PathBuf,
    /// Target operating system, e.g. `linux`.
    pub os: String,
    /// Target architecture, e.g. `amd64`.
    pub arch: String,
    pub credentials: PullCredentials,
}

/// Progress events emitted while fetching.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchProgress {
    Manifest { digest: String, media_type: String },
    BlobCached { digest: String },
    BlobStarted { digest: String, size: u64 },
    BlobFinished { digest: String, bytes: u64 },
}

/// Receiver of [`FetchProgress`] events.
pub trait ProgressSink: Send + Sync {
    fn report(&self, event: FetchProgress);
}

/// Sink that forwards progress to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn report(&self, event: FetchProgress) {
        match event {
            FetchProgress::Manifest { digest, media_type } => {
                debug!(digest = %digest, media_type = %media_type, "Fetched manifest")
            }
            FetchProgress::BlobCached { digest } => {
                debug!(digest = %digest, "Blob already present")
            }
            FetchProgress::BlobStarted { digest, size } => {
                debug!(digest = %digest, size, "Pulling blob")
            }
            FetchProgress::BlobFinished { digest, bytes } => {
                debug!(digest = %digest, bytes, "Blob downloaded")
            }
        }
    }
}

/// Downloads an image into a local OCI image layout.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    /// Fetch `request.reference` into `request.dest`.
    ///
    /// Empty credentials mean an anonymous pull.
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &dyn ProgressSink,
    ) -> Result<(), FetchError>;
}
