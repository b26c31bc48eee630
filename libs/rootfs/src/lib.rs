//! # buildfs-rootfs
//!
//! Builds mountable ext4 filesystem images from container image references
//! and caches them on local disk.
//!
//! ## Design Principles
//!
//! - A cache entry is either absent or complete: images are published with a
//!   single rename into a directory named by their content digest
//! - Concurrent requests for the same image share one build
//! - Builds run detached from the caller under their own timeout, so a
//!   caller giving up never wastes the work
//!
//! ## Cache Layout
//!
//! ```text
//! <workspace>/containers/<sha256(image ref)>/<sha256(image)>/containerfs.ext4
//! ```
//!
//! ## Collaborators
//!
//! The pipeline drives three pluggable stages:
//! - [`ImageFetcher`]: pulls an image into an OCI image layout
//!   ([`RegistryFetcher`])
//! - [`RootfsUnpacker`]: flattens the layers into a directory tree
//!   ([`LayoutUnpacker`])
//! - [`ImageConverter`]: turns the tree into an ext4 image
//!   ([`Mke2fsConverter`])

pub mod cache;
pub mod disk;
pub mod ext4;
pub mod fetch;
pub mod hash;
pub mod oci;
pub mod unpack;

mod builder;
mod config;
mod context;
mod credentials;
mod dedup;
mod error;
mod pipeline;
mod privilege;

pub use builder::ImageBuilder;
pub use config::{default_arch, BuilderConfig, IMAGE_CONVERSION_TIMEOUT};
pub use context::{CancelHandle, RequestContext};
pub use credentials::PullCredentials;
pub use dedup::{Abandoned, DedupHandle, Deduped, Deduper};
pub use error::BuildError;
pub use ext4::{ConvertError, ImageConverter, Mke2fsConfig, Mke2fsConverter};
pub use fetch::{
    FetchError, FetchProgress, FetchRequest, ImageFetcher, LogProgress, ProgressSink,
    RegistryConfig, RegistryFetcher,
};
pub use pipeline::BuildPipeline;
pub use privilege::Privilege;
pub use unpack::{LayoutUnpacker, RootfsUnpacker, StopOnDrop, StopSignal, UnpackError};
