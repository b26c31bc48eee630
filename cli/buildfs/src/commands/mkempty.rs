//! Mkempty command.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Args;

use buildfs_rootfs::{Mke2fsConfig, Mke2fsConverter};

use crate::output::print_path;

/// Mkempty command - create an empty ext4 image, e.g. for a scratch volume.
#[derive(Debug, Args)]
pub struct MkemptyCommand {
    /// Image file to create. Must not exist or be empty.
    #[arg(long, short)]
    output: PathBuf,

    /// Image size in bytes.
    #[arg(long, short)]
    size: u64,
}

impl MkemptyCommand {
    pub async fn run(self) -> Result<()> {
        Mke2fsConverter::new(Mke2fsConfig::from_env())
            .make_empty_image(&self.output, self.size)
            .await
            .with_context(|| format!("failed to create {}", self.output.display()))?;

        print_path(&self.output);
        Ok(())
    }
}
