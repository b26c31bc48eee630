//! Build orchestration: cache lookup, deduplication, detached builds.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cache;
use crate::config::BuilderConfig;
use crate::context::RequestContext;
use crate::credentials::PullCredentials;
use crate::dedup::Deduper;
use crate::error::BuildError;
use crate::ext4::{Mke2fsConfig, Mke2fsConverter};
use crate::fetch::{FetchError, RegistryConfig, RegistryFetcher};
use crate::hash;
use crate::pipeline::BuildPipeline;
use crate::privilege::Privilege;
use crate::unpack::LayoutUnpacker;

type BuildOutcome = Result<PathBuf, BuildError>;

/// Produces filesystem images for image references, reusing cached builds
/// and collapsing concurrent identical requests into one build.
///
/// Cheap to clone; clones share the in-flight registry.
#[derive(Clone)]
pub struct ImageBuilder {
    pipeline: Arc<BuildPipeline>,
    deduper: Arc<Deduper<BuildOutcome>>,
}

impl ImageBuilder {
    pub fn new(pipeline: BuildPipeline) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            deduper: Arc::new(Deduper::new()),
        }
    }

    /// Builder using the registry fetcher, the layout unpacker and `mke2fs`.
    pub fn with_defaults(
        config: BuilderConfig,
        registry: RegistryConfig,
        mke2fs: Mke2fsConfig,
        privilege: Privilege,
    ) -> Result<Self, FetchError> {
        let pipeline = BuildPipeline::new(
            Arc::new(RegistryFetcher::new(registry)?),
            Arc::new(LayoutUnpacker::new()),
            Arc::new(Mke2fsConverter::new(mke2fs)),
            privilege,
            config,
        );
        Ok(Self::new(pipeline))
    }

    pub fn pipeline(&self) -> &BuildPipeline {
        &self.pipeline
    }

    /// Number of builds currently running.
    pub fn in_flight(&self) -> usize {
        self.deduper.in_flight()
    }

    /// Abort every in-flight build and wait until their staging files are
    /// removed.
    ///
    /// For use before the process exits: a build abandoned by its callers
    /// would otherwise die with the process and leave its staging directory
    /// behind. Callers still waiting get [`BuildError::Interrupted`].
    pub async fn shutdown(&self) {
        let aborted = self.deduper.shutdown().await;
        if aborted > 0 {
            info!(aborted, "Aborted in-flight disk image builds");
        }
        self.pipeline.wait_for_cleanup().await;
    }

    /// Return a filesystem image for `image_ref` in `workspace`, building it
    /// if no cached build exists.
    ///
    /// `ctx` only bounds this caller's wait. A build started here keeps
    /// running after the caller gives up, under its own timeout, so its
    /// result still lands in the cache.
    pub async fn produce_image(
        &self,
        ctx: &RequestContext,
        workspace: &Path,
        image_ref: &str,
        credentials: &PullCredentials,
    ) -> Result<PathBuf, BuildError> {
        if let Some(path) = cache::find_latest(workspace, image_ref)? {
            debug!(image = %image_ref, path = %path.display(), "Using cached disk image");
            return Ok(path);
        }

        let key = request_key(workspace, image_ref, credentials);
        let mut handle = self.deduper.run(&key, || {
            let pipeline = Arc::clone(&self.pipeline);
            let workspace = workspace.to_path_buf();
            let image_ref = image_ref.to_string();
            let credentials = credentials.clone();
            async move {
                let timeout = pipeline.config().conversion_timeout;
                let build = pipeline.build(&workspace, &image_ref, &credentials);
                match tokio::time::timeout(timeout, build).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!(image = %image_ref, ?timeout, "Disk image build timed out");
                        Err(BuildError::BuildTimeout(timeout))
                    }
                }
            }
        });

        let outcome = tokio::select! {
            biased;
            err = ctx.done() => {
                debug!(image = %image_ref, error = %err, "Caller stopped waiting for build");
                return Err(err);
            }
            outcome = handle.wait() => outcome,
        };

        let deduped = outcome.map_err(|_| BuildError::Interrupted)?;
        if deduped.joined {
            info!(image = %image_ref, "Duplicated disk image conversion");
        }
        deduped.value
    }
}

/// Identity of a build request; equal keys share one in-flight build.
fn request_key(workspace: &Path, image_ref: &str, credentials: &PullCredentials) -> String {
    let workspace = workspace.to_string_lossy();
    hash::digest_of_fields([
        workspace.as_ref(),
        image_ref,
        credentials.username.as_str(),
        credentials.password.as_str(),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_key_covers_every_field() {
        let ws = Path::new("/ws");
        let anon = PullCredentials::default();
        let base = request_key(ws, "alpine", &anon);

        assert_eq!(base, request_key(ws, "alpine", &anon));
        assert_ne!(base, request_key(Path::new("/other"), "alpine", &anon));
        assert_ne!(base, request_key(ws, "busybox", &anon));
        assert_ne!(
            base,
            request_key(ws, "alpine", &PullCredentials::new("user", ""))
        );
        assert_ne!(
            request_key(ws, "alpine", &PullCredentials::new("user", "a")),
            request_key(ws, "alpine", &PullCredentials::new("user", "b"))
        );
    }

    #[test]
    fn test_request_key_is_not_a_plain_concatenation() {
        let ws = Path::new("/ws");
        assert_ne!(
            request_key(ws, "alpine", &PullCredentials::new("ab", "c")),
            request_key(ws, "alpine", &PullCredentials::new("a", "bc"))
        );
    }
}
