//! ext4 filesystem image creation via `mke2fs`.
//!
//! `mke2fs -d` populates the filesystem from a directory tree directly, so no
//! loop mount (and no root) is needed to build the image.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Headroom factor applied to measured directory usage.
pub const SIZE_HEADROOM_FACTOR: f64 = 1.2;

/// Fixed slack added on top of the headroom, in bytes.
pub const SIZE_SLACK_BYTES: u64 = 1_000_000;

/// Errors from measuring or converting a directory tree.
#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} exited with {status}: {output}")]
    CommandFailed {
        program: String,
        status: String,
        output: String,
    },

    #[error("output path {} already exists and is not empty", .0.display())]
    DestinationNotEmpty(PathBuf),

    #[error("du output {0:?} did not match 'SIZE\\t/file/path'")]
    BadDuOutput(String),
}

/// Converts a directory tree into a mountable filesystem image.
#[async_trait]
pub trait ImageConverter: Send + Sync {
    /// On-disk usage of `dir` in bytes.
    async fn measure_usage(&self, dir: &Path) -> Result<u64, ConvertError>;

    /// Build an image of `size_bytes` at `dest` from the tree at `src`.
    ///
    /// Must refuse a `dest` that already exists and is non-empty.
    async fn convert(&self, src: &Path, dest: &Path, size_bytes: u64) -> Result<(), ConvertError>;

    /// Image sizes are rounded up to a multiple of this many bytes.
    fn size_granularity(&self) -> u64 {
        1
    }
}

/// Image size for a tree using `usage_bytes` on disk: 1.2x the usage plus a
/// fixed slack, rounded up to `granularity`.
pub fn auto_image_size(usage_bytes: u64, granularity: u64) -> u64 {
    let raw = (usage_bytes as f64 * SIZE_HEADROOM_FACTOR).round() as u64 + SIZE_SLACK_BYTES;
    if granularity <= 1 {
        raw
    } else {
        raw.div_ceil(granularity) * granularity
    }
}

/// Refuse to write over an existing non-empty file.
///
/// Overwriting an image that is in use corrupts it.
pub fn check_image_output_path(path: &Path) -> Result<(), ConvertError> {
    match std::fs::metadata(path) {
        Ok(metadata) if metadata.len() > 0 => {
            Err(ConvertError::DestinationNotEmpty(path.to_path_buf()))
        }
        Ok(_) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(ConvertError::Io(err)),
    }
}

/// Paths of the external tools used by [`Mke2fsConverter`].
#[derive(Debug, Clone)]
pub struct Mke2fsConfig {
    pub mke2fs: PathBuf,
    pub du: PathBuf,
}

impl Default for Mke2fsConfig {
    fn default() -> Self {
        Self {
            mke2fs: PathBuf::from("/sbin/mke2fs"),
            du: PathBuf::from("du"),
        }
    }
}

impl Mke2fsConfig {
    /// Load overrides from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(path) = std::env::var("BUILDFS_MKE2FS") {
            config.mke2fs = PathBuf::from(path);
        }
        if let Ok(path) = std::env::var("BUILDFS_DU") {
            config.du = PathBuf::from(path);
        }
        config
    }
}

/// [`ImageConverter`] producing ext4 images with `mke2fs`.
#[derive(Debug, Clone, Default)]
pub struct Mke2fsConverter {
    config: Mke2fsConfig,
}

impl Mke2fsConverter {
    pub fn new(config: Mke2fsConfig) -> Self {
        Self { config }
    }

    /// Create an empty ext4 image of `size_bytes` at `dest`.
    pub async fn make_empty_image(&self, dest: &Path, size_bytes: u64) -> Result<(), ConvertError> {
        check_image_output_path(dest)?;

        let mut cmd = Command::new(&self.config.mke2fs);
        cmd.args(["-t", "ext4", "-L", "", "-N", "0", "-O", "^64bit", "-m", "5", "-r", "1"])
            .arg(dest)
            .arg(size_arg(size_bytes));

        info!(path = %dest.display(), size_bytes, "Creating empty ext4 image");
        run(cmd, &self.config.mke2fs).await.map(drop)
    }
}

#[async_trait]
impl ImageConverter for Mke2fsConverter {
    async fn measure_usage(&self, dir: &Path) -> Result<u64, ConvertError> {
        let mut cmd = Command::new(&self.config.du);
        cmd.arg("-sk").arg(dir);

        let output = run(cmd, &self.config.du).await?;
        let kib = parse_du_output(&String::from_utf8_lossy(&output.stdout))?;
        let bytes = kib * 1024;

        debug!(path = %dir.display(), bytes, "Measured directory usage");
        Ok(bytes)
    }

    async fn convert(&self, src: &Path, dest: &Path, size_bytes: u64) -> Result<(), ConvertError> {
        check_image_output_path(dest)?;

        let mut cmd = Command::new(&self.config.mke2fs);
        cmd.args(["-t", "ext4", "-L", "", "-N", "0", "-d"])
            .arg(src)
            .args(["-m", "5", "-r", "1"])
            .arg(dest)
            .arg(size_arg(size_bytes));

        info!(
            src = %src.display(),
            dest = %dest.display(),
            size_bytes,
            "Creating ext4 image"
        );
        run(cmd, &self.config.mke2fs).await.map(drop)
    }

    fn size_granularity(&self) -> u64 {
        1024
    }
}

fn size_arg(size_bytes: u64) -> String {
    format!("{}K", size_bytes / 1024)
}

/// Parse `du -sk` output (`SIZE\tPATH`) into KiB.
fn parse_du_output(output: &str) -> Result<u64, ConvertError> {
    output
        .split_once('\t')
        .and_then(|(size, _)| size.trim().parse().ok())
        .ok_or_else(|| ConvertError::BadDuOutput(output.to_string()))
}

/// Run `cmd` to completion; the child is killed if this future is dropped.
async fn run(mut cmd: Command, program: &Path) -> Result<Output, ConvertError> {
    let program = program.display().to_string();
    let output = cmd
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|source| ConvertError::Spawn {
            program: program.clone(),
            source,
        })?;

    if !output.status.success() {
        let mut text = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if text.is_empty() {
            text = String::from_utf8_lossy(&output.stdout).trim().to_string();
        }
        return Err(ConvertError::CommandFailed {
            program,
            status: output.status.to_string(),
            output: text,
        });
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use tempfile::tempdir;

    #[rstest]
    #[case(0, 1, 1_000_000)]
    #[case(1_000_000, 1, 2_200_000)]
    #[case(5, 1, 1_000_006)]
    #[case(0, 1024, 1_000_448)]
    #[case(10 * 1024 * 1024, 1024, 13_583_360)]
    fn test_auto_image_size(#[case] usage: u64, #[case] granularity: u64, #[case] expected: u64) {
        let size = auto_image_size(usage, granularity);
        assert_eq!(size, expected);
        assert_eq!(size % granularity, 0);
    }

    #[rstest]
    #[case("4096\t/tmp/rootfs\n", 4096)]
    #[case("12\t/path with spaces\n", 12)]
    fn test_parse_du_output(#[case] output: &str, #[case] expected: u64) {
        assert_eq!(parse_du_output(output).unwrap(), expected);
    }

    #[rstest]
    #[case("")]
    #[case("4096 /tmp/rootfs")]
    #[case("abc\t/tmp")]
    fn test_parse_du_output_invalid(#[case] output: &str) {
        assert!(matches!(
            parse_du_output(output),
            Err(ConvertError::BadDuOutput(_))
        ));
    }

    #[test]
    fn test_check_image_output_path() {
        let dir = tempdir().unwrap();
        let missing = dir.path().join("missing.ext4");
        assert!(check_image_output_path(&missing).is_ok());

        let empty = dir.path().join("empty.ext4");
        std::fs::write(&empty, b"").unwrap();
        assert!(check_image_output_path(&empty).is_ok());

        let full = dir.path().join("full.ext4");
        std::fs::write(&full, b"data").unwrap();
        assert!(matches!(
            check_image_output_path(&full),
            Err(ConvertError::DestinationNotEmpty(p)) if p == full
        ));
    }

    #[tokio::test]
    async fn test_convert_refuses_non_empty_destination_before_running_tools() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("busy.ext4");
        std::fs::write(&dest, b"in use").unwrap();

        let converter = Mke2fsConverter::new(Mke2fsConfig {
            mke2fs: PathBuf::from("/nonexistent/mke2fs"),
            du: PathBuf::from("/nonexistent/du"),
        });
        let err = converter.convert(dir.path(), &dest, 1 << 20).await.unwrap_err();
        assert!(matches!(err, ConvertError::DestinationNotEmpty(_)));
        assert_eq!(std::fs::read(&dest).unwrap(), b"in use");
    }

    #[tokio::test]
    async fn test_missing_tool_is_spawn_error() {
        let dir = tempdir().unwrap();
        let converter = Mke2fsConverter::new(Mke2fsConfig {
            mke2fs: PathBuf::from("/nonexistent/mke2fs"),
            du: PathBuf::from("/nonexistent/du"),
        });
        let err = converter.measure_usage(dir.path()).await.unwrap_err();
        assert!(matches!(err, ConvertError::Spawn { .. }));
    }

    #[test]
    fn test_size_arg_is_kib() {
        assert_eq!(size_arg(1_000_448), "977K");
    }
}
