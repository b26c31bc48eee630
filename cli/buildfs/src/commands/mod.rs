//! CLI commands.

mod build;
mod lookup;
mod mkempty;

use anyhow::Result;
use clap::{Parser, Subcommand};

use crate::logging::LogFormat;

/// buildfs - Build ext4 root filesystem images from container images.
#[derive(Debug, Parser)]
#[command(name = "buildfs")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Log output format.
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text, env = "BUILDFS_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Build (or reuse a cached) filesystem image for a container image.
    Build(build::BuildCommand),

    /// Print the cached filesystem image for a container image, if any.
    Lookup(lookup::LookupCommand),

    /// Create an empty ext4 image.
    Mkempty(mkempty::MkemptyCommand),
}

impl Cli {
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Run the CLI command.
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Build(cmd) => cmd.run().await,
            Commands::Lookup(cmd) => cmd.run(),
            Commands::Mkempty(cmd) => cmd.run().await,
        }
    }
}
