//! Small filesystem helpers shared by the cache and the build pipeline.

use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use tracing::debug;

/// Create `dir` and its parents if it does not exist yet.
pub fn ensure_dir_exists(dir: &Path) -> io::Result<()> {
    match fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a directory", dir.display()),
        )),
        Err(e) if e.kind() == io::ErrorKind::NotFound => fs::create_dir_all(dir),
        Err(e) => Err(e),
    }
}

/// Recursively delete `path`, ignoring "not found".
///
/// Unpacked image trees can contain directories without write or execute
/// permission. When the first attempt fails, every directory is made
/// `0770` and the removal is retried.
pub fn force_remove(path: &Path) -> io::Result<()> {
    match remove_all(path) {
        Ok(()) => return Ok(()),
        Err(e) => debug!(path = %path.display(), error = %e, "Retrying removal after chmod"),
    }
    make_dirs_writable(path)?;
    remove_all(path)
}

fn remove_all(path: &Path) -> io::Result<()> {
    let result = match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) => Err(e),
    };
    match result {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn make_dirs_writable(path: &Path) -> io::Result<()> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !meta.is_dir() {
        return Ok(());
    }
    fs::set_permissions(path, fs::Permissions::from_mode(0o770))?;
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            make_dirs_writable(&entry.path())?;
        }
    }
    Ok(())
}

/// Whether something exists at `path`. Errors other than "not found" are
/// returned.
pub fn file_exists(path: &Path) -> io::Result<bool> {
    match fs::metadata(path) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

/// Hard-link `original` to `link`.
pub fn hard_link(original: &Path, link: &Path) -> io::Result<()> {
    fs::hard_link(original, link).map_err(|e| {
        io::Error::new(
            e.kind(),
            format!(
                "failed to link {} to {}: {e}",
                original.display(),
                link.display()
            ),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_ensure_dir_exists_creates_parents() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a/b/c");
        ensure_dir_exists(&nested).unwrap();
        assert!(nested.is_dir());
        // Idempotent.
        ensure_dir_exists(&nested).unwrap();
    }

    #[test]
    fn test_ensure_dir_exists_rejects_file() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("f");
        fs::write(&file, b"x").unwrap();
        assert!(ensure_dir_exists(&file).is_err());
    }

    #[test]
    fn test_file_exists() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("f");
        assert!(!file_exists(&file).unwrap());
        fs::write(&file, b"x").unwrap();
        assert!(file_exists(&file).unwrap());
    }

    #[test]
    fn test_force_remove_read_only_tree() {
        let dir = tempdir().unwrap();
        let root = dir.path().join("rootfs");
        let locked = root.join("usr/locked");
        fs::create_dir_all(&locked).unwrap();
        fs::write(locked.join("file"), b"x").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o500)).unwrap();

        force_remove(&root).unwrap();
        assert!(!root.exists());

        // Missing paths are fine.
        force_remove(&root).unwrap();
    }

    #[test]
    fn test_hard_link() {
        let dir = tempdir().unwrap();
        let original = dir.path().join("containerfs.ext4");
        let link = dir.path().join("rootfs.ext4");
        fs::write(&original, b"image").unwrap();

        hard_link(&original, &link).unwrap();
        assert_eq!(fs::read(&link).unwrap(), b"image");

        let err = hard_link(&original, &link).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }
}
