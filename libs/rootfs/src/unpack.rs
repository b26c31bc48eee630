//! Root filesystem unpacking from an OCI image layout.
//!
//! Applies the layers of the layout's `latest` manifest, base first, into a
//! flat directory tree, honouring whiteout markers.

use std::fs::{self, File};
use std::io::{self, BufReader, Read};
use std::path::{Component, Path};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use flate2::read::GzDecoder;
use tar::Archive;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::oci::{self, ImageLayout, Manifest, LAYOUT_REF_NAME};

const WHITEOUT_PREFIX: &str = ".wh.";
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// Errors from unpacking a root filesystem.
#[derive(Debug, Error)]
pub enum UnpackError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Reference {0:?} not found in image index")]
    RefNotFound(String),

    #[error("Reference {name:?} matches {count} manifests")]
    AmbiguousRef { name: String, count: usize },

    #[error("Unsupported manifest media type: {0}")]
    UnsupportedMediaType(String),

    #[error("Layer {digest} missing from image layout")]
    MissingLayer { digest: String },

    #[error("Unpack task failed: {0}")]
    Task(String),

    #[error("Unpack stopped before completion")]
    Stopped,
}

/// Asks a running unpack to stop at the next archive entry.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Guard that raises the signal when dropped.
    pub fn stop_on_drop(&self) -> StopOnDrop {
        StopOnDrop(self.clone())
    }

    fn check(&self) -> Result<(), UnpackError> {
        if self.is_stopped() {
            Err(UnpackError::Stopped)
        } else {
            Ok(())
        }
    }
}

/// Raises its [`StopSignal`] on drop.
#[derive(Debug)]
pub struct StopOnDrop(StopSignal);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.stop();
    }
}

/// Turns a fetched image into a flat root filesystem tree.
///
/// Unpacking is blocking filesystem work and runs on the blocking thread
/// pool. Implementations should poll `stop` regularly and return
/// [`UnpackError::Stopped`] once it is raised; the rootfs is removed only
/// after `unpack` returns.
pub trait RootfsUnpacker: Send + Sync {
    /// Unpack the image layout at `image` into `rootfs`.
    ///
    /// When `unprivileged` is set, ownership recorded in the layers is not
    /// applied: every entry belongs to the effective user, which is root
    /// inside the user namespace that later mounts the image.
    fn unpack(
        &self,
        image: &Path,
        rootfs: &Path,
        unprivileged: bool,
        stop: &StopSignal,
    ) -> Result<(), UnpackError>;
}

/// [`RootfsUnpacker`] reading an OCI image layout written by the fetcher.
#[derive(Debug, Default, Clone, Copy)]
pub struct LayoutUnpacker;

impl LayoutUnpacker {
    pub fn new() -> Self {
        Self
    }
}

impl RootfsUnpacker for LayoutUnpacker {
    fn unpack(
        &self,
        image: &Path,
        rootfs: &Path,
        unprivileged: bool,
        stop: &StopSignal,
    ) -> Result<(), UnpackError> {
        let result = unpack_layout(image, rootfs, unprivileged, stop);
        if matches!(result, Err(UnpackError::Stopped)) {
            info!(rootfs = %rootfs.display(), "Unpack stopped");
        }
        result
    }
}

fn unpack_layout(
    image: &Path,
    rootfs: &Path,
    unprivileged: bool,
    stop: &StopSignal,
) -> Result<(), UnpackError> {
    let layout = ImageLayout::open(image)?;
    let manifest = resolve_manifest(&layout, LAYOUT_REF_NAME)?;

    fs::create_dir_all(rootfs)?;

    info!(
        image = %image.display(),
        rootfs = %rootfs.display(),
        layer_count = manifest.layers.len(),
        unprivileged,
        "Unpacking OCI layers"
    );

    for (i, layer) in manifest.layers.iter().enumerate() {
        let path = layout.blob_path(&layer.digest);
        if !path.is_file() {
            return Err(UnpackError::MissingLayer {
                digest: layer.digest.clone(),
            });
        }
        stop.check()?;
        debug!(layer = i, digest = %layer.digest, "Unpacking layer");
        unpack_layer(&path, rootfs, !unprivileged, stop)?;
    }

    Ok(())
}

/// Load the image manifest recorded under `ref_name`.
fn resolve_manifest(layout: &ImageLayout, ref_name: &str) -> Result<Manifest, UnpackError> {
    let index = layout.read_index()?;
    let found = index.find_ref(ref_name);
    let descriptor = match found.as_slice() {
        [] => return Err(UnpackError::RefNotFound(ref_name.to_string())),
        [one] => *one,
        many => {
            return Err(UnpackError::AmbiguousRef {
                name: ref_name.to_string(),
                count: many.len(),
            })
        }
    };

    if !oci::is_manifest_media_type(&descriptor.media_type) {
        return Err(UnpackError::UnsupportedMediaType(
            descriptor.media_type.clone(),
        ));
    }

    Ok(layout.read_json_blob(&descriptor.digest)?)
}

/// Unpack a single layer, gzipped or plain tar.
fn unpack_layer(
    layer_path: &Path,
    dest: &Path,
    preserve_ownership: bool,
    stop: &StopSignal,
) -> Result<(), UnpackError> {
    let reader = BufReader::new(File::open(layer_path)?);

    if is_gzip(layer_path)? {
        let mut archive = Archive::new(GzDecoder::new(reader));
        extract_archive(&mut archive, dest, preserve_ownership, stop)
    } else {
        let mut archive = Archive::new(reader);
        extract_archive(&mut archive, dest, preserve_ownership, stop)
    }
}

/// Extract a tar archive handling whiteouts.
fn extract_archive<R: Read>(
    archive: &mut Archive<R>,
    dest: &Path,
    preserve_ownership: bool,
    stop: &StopSignal,
) -> Result<(), UnpackError> {
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(preserve_ownership);
    archive.set_unpack_xattrs(preserve_ownership);
    archive.set_overwrite(true);

    for entry in archive.entries()? {
        stop.check()?;
        let mut entry = entry?;
        let path = entry.path()?.into_owned();

        if path.components().any(|c| c == Component::ParentDir) {
            warn!(path = %path.display(), "Skipping path with parent directory");
            continue;
        }

        let file_name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

        if file_name == OPAQUE_WHITEOUT {
            // Opaque whiteout: hide everything lower layers put in the directory
            if let Some(parent) = path.parent() {
                clear_dir(&dest.join(parent))?;
            }
            continue;
        }

        if let Some(target_name) = file_name.strip_prefix(WHITEOUT_PREFIX) {
            if let Some(parent) = path.parent() {
                remove_path(&dest.join(parent).join(target_name))?;
            }
            continue;
        }

        // unpack_in refuses entries that would escape `dest`.
        if !entry.unpack_in(dest)? {
            warn!(path = %path.display(), "Skipping entry outside of rootfs");
        }
    }

    Ok(())
}

fn clear_dir(dir: &Path) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    for entry in entries {
        remove_path(&entry?.path())?;
    }
    Ok(())
}

fn remove_path(path: &Path) -> io::Result<()> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(err) => return Err(err),
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

/// Check if a file is gzip compressed.
fn is_gzip(path: &Path) -> io::Result<bool> {
    let mut file = File::open(path)?;
    let mut magic = [0u8; 2];
    if file.read_exact(&mut magic).is_ok() {
        Ok(magic == [0x1f, 0x8b])
    } else {
        Ok(false)
    }
}
