//! Error types for image builds.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::ext4::ConvertError;
use crate::fetch::FetchError;
use crate::unpack::UnpackError;

/// Errors returned by the build orchestrator and pipeline.
///
/// The type is `Clone` because one build outcome is handed to every caller
/// that joined the same in-flight build. Sources are held behind `Arc`.
#[derive(Debug, Clone, Error)]
pub enum BuildError {
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("failed to pull image, src: {reference}, dest: {}: {source}", .dest.display())]
    Fetch {
        reference: String,
        dest: PathBuf,
        #[source]
        source: Arc<FetchError>,
    },

    #[error("failed to unpack OCI image {} into {}: {source}", .src.display(), .dest.display())]
    Unpack {
        src: PathBuf,
        dest: PathBuf,
        #[source]
        source: Arc<UnpackError>,
    },

    #[error("failed to convert {} into filesystem image {}: {source}", .src.display(), .dest.display())]
    Convert {
        src: PathBuf,
        dest: PathBuf,
        #[source]
        source: Arc<ConvertError>,
    },

    #[error("image build timed out after {0:?}")]
    BuildTimeout(Duration),

    #[error("deadline elapsed while waiting for image build")]
    DeadlineExceeded,

    #[error("request cancelled")]
    Cancelled,

    #[error("image build ended without producing a result")]
    Interrupted,
}

impl BuildError {
    /// Wrap an I/O error with a description of the failed operation.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source: Arc::new(source),
        }
    }

    /// Wrap an I/O error that happened on `path`.
    pub fn io_at(what: &str, path: &Path, source: io::Error) -> Self {
        Self::io(format!("{what}: {}", path.display()), source)
    }

    /// Whether this is either the background build bound or a caller deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::BuildTimeout(_) | Self::DeadlineExceeded)
    }
}
