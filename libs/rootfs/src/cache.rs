//! On-disk cache of built filesystem images.
//!
//! Layout inside a workspace:
//!
//! ```text
//! <workspace>/containers/<sha256(image ref)>/<sha256(image bytes)>/containerfs.ext4
//! ```
//!
//! A content-digest directory either does not exist or holds a complete
//! image: the pipeline publishes with a single rename into it. Several
//! content directories can coexist for one image reference (the tag moved);
//! the most recently modified one is current.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use tracing::{debug, info};

use crate::disk;
use crate::error::BuildError;
use crate::hash;

/// Directory under the workspace holding all cache entries.
pub const CONTAINERS_DIR: &str = "containers";

/// Fixed filename of a published image inside its content directory.
pub const DISK_IMAGE_FILE_NAME: &str = "containerfs.ext4";

/// Directory holding every build of `image_ref` in `workspace`.
pub fn entry_dir(workspace: &Path, image_ref: &str) -> PathBuf {
    workspace
        .join(CONTAINERS_DIR)
        .join(hash::digest_str(image_ref))
}

/// Final artifact path for a build whose image file hashed to `content_digest`.
pub fn artifact_path(workspace: &Path, image_ref: &str, content_digest: &str) -> PathBuf {
    entry_dir(workspace, image_ref)
        .join(content_digest)
        .join(DISK_IMAGE_FILE_NAME)
}

/// Find the most recent completed build of `image_ref`.
///
/// Returns `Ok(None)` when the entry directory is missing or empty, or when
/// the newest content directory has no image in it (an interrupted build).
/// Only unexpected I/O failures are errors.
pub fn find_latest(workspace: &Path, image_ref: &str) -> Result<Option<PathBuf>, BuildError> {
    let entry_dir = entry_dir(workspace, image_ref);
    let read_dir = match fs::read_dir(&entry_dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(BuildError::io_at("failed to list cache entry", &entry_dir, e)),
    };

    let mut latest: Option<(SystemTime, String)> = None;
    for entry in read_dir {
        let entry =
            entry.map_err(|e| BuildError::io_at("failed to list cache entry", &entry_dir, e))?;
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_dir() {
            continue;
        }
        let Some(name) = entry.file_name().to_str().map(str::to_owned) else {
            continue;
        };
        let modified = entry
            .metadata()
            .and_then(|m| m.modified())
            .unwrap_or(SystemTime::UNIX_EPOCH);

        let candidate = (modified, name);
        if latest.as_ref().is_none_or(|current| candidate > *current) {
            latest = Some(candidate);
        }
    }

    let Some((_, name)) = latest else {
        debug!(image_dir = %entry_dir.display(), "No cached builds");
        return Ok(None);
    };

    let image_path = entry_dir.join(name).join(DISK_IMAGE_FILE_NAME);
    info!(path = %image_path.display(), "Check image cache");
    let exists = disk::file_exists(&image_path)
        .map_err(|e| BuildError::io_at("failed to stat cached image", &image_path, e))?;
    if !exists {
        debug!(path = %image_path.display(), "Latest cache entry has no image");
        return Ok(None);
    }
    Ok(Some(image_path))
}
