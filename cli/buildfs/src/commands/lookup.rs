//! Lookup command.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;

use buildfs_rootfs::cache;

use crate::error::CliError;
use crate::output::print_path;

/// Lookup command - print the newest cached image without building.
#[derive(Debug, Args)]
pub struct LookupCommand {
    /// Container image reference.
    #[arg(long, short)]
    image: String,

    /// Workspace directory holding the image cache.
    #[arg(long, short, env = "BUILDFS_WORKSPACE")]
    workspace: PathBuf,
}

impl LookupCommand {
    pub fn run(self) -> Result<()> {
        match cache::find_latest(&self.workspace, &self.image)? {
            Some(path) => {
                print_path(&path);
                Ok(())
            }
            None => Err(CliError::NotCached {
                image: self.image,
                workspace: self.workspace,
            }
            .into()),
        }
    }
}
