//! Error handling and display for the CLI.

use std::path::PathBuf;

use buildfs_rootfs::{BuildError, ConvertError, FetchError};
use colored::Colorize;
use thiserror::Error;

/// CLI-specific errors.
#[derive(Debug, Error)]
pub enum CliError {
    #[error("No cached image for {image} in {}", .workspace.display())]
    NotCached { image: String, workspace: PathBuf },
}

/// Print an error in a user-friendly format.
pub fn print_error(err: &anyhow::Error) {
    eprintln!("{} {:#}", "Error:".red().bold(), err);

    if let Some(hint) = hint(err) {
        eprintln!("\n{}", format!("Hint: {hint}").yellow());
    }
}

fn hint(err: &anyhow::Error) -> Option<&'static str> {
    if let Some(CliError::NotCached { .. }) = err.downcast_ref::<CliError>() {
        return Some("Run `buildfs build` to build the image first.");
    }

    match err.downcast_ref::<BuildError>()? {
        BuildError::BuildTimeout(_) => Some(
            "The build exceeded its time limit. Raise it with BUILDFS_CONVERSION_TIMEOUT_SECS.",
        ),
        BuildError::DeadlineExceeded | BuildError::Cancelled => {
            Some("The build was stopped and its partial files removed. Rerun the command to build again.")
        }
        BuildError::Fetch { source, .. } => match source.as_ref() {
            FetchError::Unauthorized(_) => {
                Some("Pass --username and --password for private registries.")
            }
            FetchError::NoMatchingPlatform { .. } => {
                Some("Select another platform with --os and --arch.")
            }
            FetchError::Http(_) => Some("Check your network connection and the registry host."),
            _ => None,
        },
        BuildError::Convert { source, .. } => match source.as_ref() {
            ConvertError::Spawn { .. } => Some(
                "mke2fs from e2fsprogs 1.43 or later is required. Set BUILDFS_MKE2FS to its path.",
            ),
            _ => None,
        },
        _ => None,
    }
}
