//! Configuration for image builds.

use std::time::Duration;

/// Bound on one background build, independent of any caller.
pub const IMAGE_CONVERSION_TIMEOUT: Duration = Duration::from_secs(15 * 60);

/// Build configuration.
#[derive(Debug, Clone)]
pub struct BuilderConfig {
    /// Target operating system for multi-platform images.
    pub os: String,

    /// Target architecture for multi-platform images (OCI naming).
    pub arch: String,

    /// How long a background build may run before it is aborted.
    pub conversion_timeout: Duration,
}

impl Default for BuilderConfig {
    fn default() -> Self {
        Self {
            os: "linux".to_string(),
            arch: default_arch().to_string(),
            conversion_timeout: IMAGE_CONVERSION_TIMEOUT,
        }
    }
}

impl BuilderConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let os = std::env::var("BUILDFS_TARGET_OS").unwrap_or(defaults.os);

        let arch = std::env::var("BUILDFS_TARGET_ARCH").unwrap_or(defaults.arch);

        let conversion_timeout = std::env::var("BUILDFS_CONVERSION_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(defaults.conversion_timeout);

        Self {
            os,
            arch,
            conversion_timeout,
        }
    }
}

/// Host architecture in OCI platform naming.
pub fn default_arch() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        "x86" => "386",
        "powerpc64" => "ppc64le",
        other => other,
    }
}
