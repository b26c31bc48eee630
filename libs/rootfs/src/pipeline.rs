//! A single image build: fetch, unpack, convert, hash, publish.
//!
//! Intermediate state lives in a `container-unpack-*` staging directory
//! inside the workspace, removed on every exit path. The image itself is
//! written to a `containerfs-*.ext4` temp file directly in the workspace, on
//! the same filesystem as the cache, and published with one rename into its
//! content-digest directory.
//!
//! Removing a staging tree can take a while, so it runs on the blocking pool.
//! [`BuildPipeline::wait_for_cleanup`] waits for every pending removal.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tempfile::{NamedTempFile, TempDir};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache;
use crate::config::BuilderConfig;
use crate::credentials::PullCredentials;
use crate::disk;
use crate::error::BuildError;
use crate::ext4::{auto_image_size, ConvertError, ImageConverter};
use crate::fetch::{FetchRequest, ImageFetcher, LogProgress, ProgressSink};
use crate::hash;
use crate::privilege::Privilege;
use crate::unpack::{RootfsUnpacker, StopSignal, UnpackError};

const STAGING_PREFIX: &str = "container-unpack-";
const IMAGE_TEMP_PREFIX: &str = "containerfs-";
const IMAGE_TEMP_SUFFIX: &str = ".ext4";

/// Runs builds with a fixed set of collaborators.
#[derive(Clone)]
pub struct BuildPipeline {
    fetcher: Arc<dyn ImageFetcher>,
    unpacker: Arc<dyn RootfsUnpacker>,
    converter: Arc<dyn ImageConverter>,
    progress: Arc<dyn ProgressSink>,
    privilege: Privilege,
    config: BuilderConfig,
    cleanup: PendingCleanup,
}

impl BuildPipeline {
    pub fn new(
        fetcher: Arc<dyn ImageFetcher>,
        unpacker: Arc<dyn RootfsUnpacker>,
        converter: Arc<dyn ImageConverter>,
        privilege: Privilege,
        config: BuilderConfig,
    ) -> Self {
        Self {
            fetcher,
            unpacker,
            converter,
            progress: Arc::new(LogProgress),
            privilege,
            config,
            cleanup: PendingCleanup::default(),
        }
    }

    /// Send fetch progress to `progress` instead of the debug log.
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }

    pub fn config(&self) -> &BuilderConfig {
        &self.config
    }

    pub fn privilege(&self) -> Privilege {
        self.privilege
    }

    /// Staging directories created by this pipeline and not yet removed.
    pub fn pending_cleanups(&self) -> usize {
        self.cleanup.count()
    }

    /// Wait until every staging directory created by this pipeline, including
    /// those of abandoned builds, has been removed.
    pub async fn wait_for_cleanup(&self) {
        self.cleanup.wait_idle().await;
    }

    /// Build `image_ref` and publish it into the cache of `workspace`.
    ///
    /// Returns the published artifact path. Nothing is published on error.
    pub async fn build(
        &self,
        workspace: &Path,
        image_ref: &str,
        credentials: &PullCredentials,
    ) -> Result<PathBuf, BuildError> {
        disk::ensure_dir_exists(workspace)
            .map_err(|e| BuildError::io_at("failed to create workspace", workspace, e))?;

        let staging = Arc::new(StagingDir::create(workspace, &self.cleanup)?);
        debug!(path = %staging.path().display(), "Created staging directory");

        let converted = self
            .stage_image(&staging, workspace, image_ref, credentials)
            .await;

        // The unpacked tree is no longer needed; free it before hashing.
        if let Some(staging) = Arc::into_inner(staging) {
            staging.remove().await;
        }
        let image_file = converted?;

        let digest = digest_image(&image_file).await?;

        // Publish
        let content_dir = cache::entry_dir(workspace, image_ref).join(&digest);
        disk::ensure_dir_exists(&content_dir)
            .map_err(|e| BuildError::io_at("failed to create cache entry", &content_dir, e))?;
        let dest = content_dir.join(cache::DISK_IMAGE_FILE_NAME);
        image_file
            .persist(&dest)
            .map_err(|e| BuildError::io_at("failed to publish image", &dest, e.error))?;

        info!(
            image = %image_ref,
            digest = %digest,
            path = %dest.display(),
            "Disk image published"
        );
        Ok(dest)
    }

    /// Fetch, unpack and convert inside `staging`, returning the unpublished
    /// image file.
    async fn stage_image(
        &self,
        staging: &Arc<StagingDir>,
        workspace: &Path,
        image_ref: &str,
        credentials: &PullCredentials,
    ) -> Result<NamedTempFile, BuildError> {
        // Fetch
        let image_dir = staging.subdir("image")?;
        let request = FetchRequest {
            reference: image_ref.to_string(),
            dest: image_dir.clone(),
            os: self.config.os.clone(),
            arch: self.config.arch.clone(),
            credentials: credentials.clone(),
        };
        self.fetcher
            .fetch(&request, self.progress.as_ref())
            .await
            .map_err(|e| BuildError::Fetch {
                reference: image_ref.to_string(),
                dest: image_dir.clone(),
                source: Arc::new(e),
            })?;

        // Unpack
        let rootfs_dir = staging.subdir("rootfs")?;
        self.unpack(staging, &image_dir, &rootfs_dir)
            .await
            .map_err(|e| BuildError::Unpack {
                src: image_dir.clone(),
                dest: rootfs_dir.clone(),
                source: Arc::new(e),
            })?;

        // Convert
        let image_file = tempfile::Builder::new()
            .prefix(IMAGE_TEMP_PREFIX)
            .suffix(IMAGE_TEMP_SUFFIX)
            .tempfile_in(workspace)
            .map_err(|e| BuildError::io_at("failed to create image file in", workspace, e))?;
        let convert_error = |e: ConvertError| BuildError::Convert {
            src: rootfs_dir.clone(),
            dest: image_file.path().to_path_buf(),
            source: Arc::new(e),
        };
        let usage = self
            .converter
            .measure_usage(&rootfs_dir)
            .await
            .map_err(convert_error)?;
        let size_bytes = auto_image_size(usage, self.converter.size_granularity());
        info!(
            image = %image_ref,
            usage_bytes = usage,
            size_bytes,
            "Converting root filesystem"
        );
        self.converter
            .convert(&rootfs_dir, image_file.path(), size_bytes)
            .await
            .map_err(convert_error)?;

        Ok(image_file)
    }

    /// Run the unpacker on the blocking pool.
    ///
    /// The blocking task holds a reference to the staging directory, so the
    /// tree is removed only after extraction returns, even when this future
    /// is dropped mid-unpack. Dropping it raises the stop signal.
    async fn unpack(
        &self,
        staging: &Arc<StagingDir>,
        image_dir: &Path,
        rootfs_dir: &Path,
    ) -> Result<(), UnpackError> {
        let stop = StopSignal::new();
        let _stop_on_drop = stop.stop_on_drop();

        let unpacker = Arc::clone(&self.unpacker);
        let staging = Arc::clone(staging);
        let image_dir = image_dir.to_path_buf();
        let rootfs_dir = rootfs_dir.to_path_buf();
        let unprivileged = self.privilege.needs_rootless_unpack();
        tokio::task::spawn_blocking(move || {
            let result = unpacker.unpack(&image_dir, &rootfs_dir, unprivileged, &stop);
            drop(staging);
            result
        })
        .await
        .map_err(|e| UnpackError::Task(e.to_string()))?
    }
}

async fn digest_image(image_file: &NamedTempFile) -> Result<String, BuildError> {
    let path = image_file.path().to_path_buf();
    let result = tokio::task::spawn_blocking({
        let path = path.clone();
        move || hash::digest_file(&path)
    })
    .await
    .map_err(|e| BuildError::io("image digest task failed", io::Error::other(e)))?;
    result.map_err(|e| BuildError::io_at("failed to hash image", &path, e))
}

/// Count of staging directories created and not yet removed.
#[derive(Clone)]
struct PendingCleanup(Arc<watch::Sender<usize>>);

impl Default for PendingCleanup {
    fn default() -> Self {
        Self(Arc::new(watch::channel(0).0))
    }
}

impl PendingCleanup {
    fn acquire(&self) -> CleanupToken {
        self.0.send_modify(|pending| *pending += 1);
        CleanupToken(Arc::clone(&self.0))
    }

    fn count(&self) -> usize {
        *self.0.borrow()
    }

    async fn wait_idle(&self) {
        let mut pending = self.0.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = pending.wait_for(|count| *count == 0).await;
    }
}

struct CleanupToken(Arc<watch::Sender<usize>>);

impl Drop for CleanupToken {
    fn drop(&mut self) {
        self.0
            .send_modify(|pending| *pending = pending.saturating_sub(1));
    }
}

/// Staging directory removed with [`disk::force_remove`] when dropped.
///
/// Unpacked trees can hold read-only directories that a plain recursive
/// delete cannot remove.
struct StagingDir {
    path: PathBuf,
    staged: Option<Staged>,
}

struct Staged {
    dir: TempDir,
    // Released after `dir` is gone.
    _token: CleanupToken,
}

impl Staged {
    fn remove(self) {
        if let Err(e) = disk::force_remove(self.dir.path()) {
            warn!(
                path = %self.dir.path().display(),
                error = %e,
                "Failed to remove staging directory"
            );
        }
    }
}

impl StagingDir {
    fn create(workspace: &Path, cleanup: &PendingCleanup) -> Result<Self, BuildError> {
        let dir = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(workspace)
            .map_err(|e| BuildError::io_at("failed to create staging directory in", workspace, e))?;
        Ok(Self {
            path: dir.path().to_path_buf(),
            staged: Some(Staged {
                dir,
                _token: cleanup.acquire(),
            }),
        })
    }

    fn path(&self) -> &Path {
        &self.path
    }

    fn subdir(&self, name: &str) -> Result<PathBuf, BuildError> {
        let path = self.path.join(name);
        disk::ensure_dir_exists(&path)
            .map_err(|e| BuildError::io_at("failed to create directory", &path, e))?;
        Ok(path)
    }

    /// Remove the tree on the blocking pool and wait for it.
    async fn remove(mut self) {
        let Some(staged) = self.staged.take() else {
            return;
        };
        if let Err(e) = tokio::task::spawn_blocking(move || staged.remove()).await {
            warn!(path = %self.path.display(), error = %e, "Staging removal task failed");
        }
    }
}

impl Drop for StagingDir {
    fn drop(&mut self) {
        let Some(staged) = self.staged.take() else {
            return;
        };
        match Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || staged.remove());
            }
            Err(_) => staged.remove(),
        }
    }
}
