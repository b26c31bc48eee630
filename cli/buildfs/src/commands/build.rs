//! Build command.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Args;
use tracing::{info, warn};

use buildfs_rootfs::{
    disk, BuilderConfig, ImageBuilder, Mke2fsConfig, Privilege, PullCredentials, RegistryConfig,
    RequestContext,
};

use crate::output::{print_path, print_success};

/// Build command - produce a filesystem image for a container image.
#[derive(Debug, Args)]
pub struct BuildCommand {
    /// Container image reference (e.g., quay.io/jitesoft/alpine:latest).
    #[arg(long, short)]
    image: String,

    /// Workspace directory holding the image cache.
    #[arg(long, short, env = "BUILDFS_WORKSPACE")]
    workspace: PathBuf,

    /// Registry username.
    #[arg(long, env = "BUILDFS_USERNAME", default_value = "")]
    username: String,

    /// Registry password.
    #[arg(long, env = "BUILDFS_PASSWORD", default_value = "", hide_env_values = true)]
    password: String,

    /// Stop waiting after this many seconds.
    #[arg(long)]
    timeout: Option<u64>,

    /// Also hard-link the image to this path.
    #[arg(long)]
    link: Option<PathBuf>,

    /// Target operating system for multi-platform images.
    #[arg(long)]
    os: Option<String>,

    /// Target architecture for multi-platform images (e.g., amd64, arm64).
    #[arg(long)]
    arch: Option<String>,
}

impl BuildCommand {
    pub async fn run(self) -> Result<()> {
        let mut config = BuilderConfig::from_env();
        if let Some(os) = self.os {
            config.os = os;
        }
        if let Some(arch) = self.arch {
            config.arch = arch;
        }

        let builder = ImageBuilder::with_defaults(
            config,
            RegistryConfig::from_env(),
            Mke2fsConfig::from_env(),
            Privilege::detect(),
        )
        .context("failed to create registry client")?;

        let (mut ctx, cancel) = RequestContext::background().cancellable();
        if let Some(secs) = self.timeout {
            ctx = ctx.with_timeout(Duration::from_secs(secs));
        }
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, no longer waiting for the build");
                cancel.cancel();
            }
        });

        let credentials = PullCredentials::new(self.username, self.password);
        info!(
            image = %self.image,
            workspace = %self.workspace.display(),
            privileged = builder.pipeline().privilege().is_root(),
            "Producing disk image"
        );
        let produced = builder
            .produce_image(&ctx, &self.workspace, &self.image, &credentials)
            .await;

        // A build this process started cannot outlive it. Stop it and remove
        // its staging files before exiting.
        if builder.in_flight() > 0 {
            warn!("Stopping unfinished build");
        }
        builder.shutdown().await;

        let path =
            produced.with_context(|| format!("failed to produce disk image for {}", self.image))?;

        if let Some(link) = &self.link {
            disk::hard_link(&path, link)?;
            print_success(&format!("Linked {}", link.display()));
        }

        print_path(&path);
        Ok(())
    }
}
