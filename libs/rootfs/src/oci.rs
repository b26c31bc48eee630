//! OCI image manifest types and the on-disk OCI image layout.
//!
//! The fetcher writes an image layout (`oci-layout`, `index.json`,
//! `blobs/sha256/<hex>`) and the unpacker reads it back by path.
//!
//! Reference: https://github.com/opencontainers/image-spec/blob/main/image-layout.md

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::hash;

pub const MEDIA_TYPE_OCI_MANIFEST: &str = "application/vnd.oci.image.manifest.v1+json";
pub const MEDIA_TYPE_OCI_INDEX: &str = "application/vnd.oci.image.index.v1+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST: &str =
    "application/vnd.docker.distribution.manifest.v2+json";
pub const MEDIA_TYPE_DOCKER_MANIFEST_LIST: &str =
    "application/vnd.docker.distribution.manifest.list.v2+json";

/// Annotation naming a manifest inside `index.json`.
pub const ANNOTATION_REF_NAME: &str = "org.opencontainers.image.ref.name";

/// Ref name under which the fetched manifest is recorded.
pub const LAYOUT_REF_NAME: &str = "latest";

const LAYOUT_VERSION: &str = "1.0.0";

/// Whether `media_type` is a single-image manifest.
pub fn is_manifest_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_MANIFEST || media_type == MEDIA_TYPE_DOCKER_MANIFEST
}

/// Whether `media_type` is a multi-platform index.
pub fn is_index_media_type(media_type: &str) -> bool {
    media_type == MEDIA_TYPE_OCI_INDEX || media_type == MEDIA_TYPE_DOCKER_MANIFEST_LIST
}

/// OCI image manifest.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Schema version.
    pub schema_version: u32,
    /// Media type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors, base layer first.
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    /// Get total compressed size of all layers.
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// Image index (manifest list).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Index {
    pub schema_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,
    #[serde(default)]
    pub manifests: Vec<Descriptor>,
}

impl Index {
    /// Manifests annotated with ref name `name`.
    pub fn find_ref(&self, name: &str) -> Vec<&Descriptor> {
        self.manifests
            .iter()
            .filter(|d| d.annotation(ANNOTATION_REF_NAME) == Some(name))
            .collect()
    }

    /// First manifest built for `os`/`arch`.
    pub fn find_platform(&self, os: &str, arch: &str) -> Option<&Descriptor> {
        self.manifests
            .iter()
            .find(|d| d.platform.as_ref().is_some_and(|p| p.matches(os, arch)))
    }
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the content.
    pub digest: String,
    /// Size in bytes.
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<Platform>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

impl Descriptor {
    pub fn new(media_type: impl Into<String>, digest: impl Into<String>, size: u64) -> Self {
        Self {
            media_type: media_type.into(),
            digest: digest.into(),
            size,
            platform: None,
            annotations: BTreeMap::new(),
        }
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// Platform of a manifest inside an index.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Platform {
    pub architecture: String,
    pub os: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl Platform {
    pub fn matches(&self, os: &str, arch: &str) -> bool {
        self.os == os && self.architecture == arch
    }
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
struct LayoutMarker {
    image_layout_version: String,
}

/// An OCI image layout directory.
#[derive(Debug, Clone)]
pub struct ImageLayout {
    root: PathBuf,
}

impl ImageLayout {
    /// Initialise a layout at `root`, creating the directory if needed.
    pub fn create(root: &Path) -> io::Result<Self> {
        fs::create_dir_all(root.join("blobs").join("sha256"))?;
        let marker = LayoutMarker {
            image_layout_version: LAYOUT_VERSION.to_string(),
        };
        fs::write(root.join("oci-layout"), serde_json::to_vec(&marker)?)?;
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    /// Open an existing layout.
    pub fn open(root: &Path) -> io::Result<Self> {
        let marker: LayoutMarker = serde_json::from_slice(&fs::read(root.join("oci-layout"))?)?;
        if marker.image_layout_version != LAYOUT_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "unsupported image layout version {}",
                    marker.image_layout_version
                ),
            ));
        }
        Ok(Self {
            root: root.to_path_buf(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the local path for a blob.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        // digest format: "sha256:abc123..."
        match digest.split_once(':') {
            Some((algorithm, hex)) => self.root.join("blobs").join(algorithm).join(hex),
            None => self.root.join("blobs").join(digest),
        }
    }

    /// Check if a blob exists locally.
    pub fn blob_exists(&self, digest: &str) -> bool {
        self.blob_path(digest).is_file()
    }

    /// Store `bytes` as a blob and return its `sha256:` digest.
    pub fn write_blob(&self, bytes: &[u8]) -> io::Result<String> {
        let digest = format!("sha256:{}", hash::digest_bytes(bytes));
        let path = self.blob_path(&digest);
        if !path.is_file() {
            let tmp = path.with_extension("tmp");
            fs::write(&tmp, bytes)?;
            fs::rename(&tmp, &path)?;
        }
        Ok(digest)
    }

    /// Read and decode a JSON blob.
    pub fn read_json_blob<T: DeserializeOwned>(&self, digest: &str) -> io::Result<T> {
        Ok(serde_json::from_slice(&fs::read(self.blob_path(digest))?)?)
    }

    /// Record `manifest` in `index.json` under `ref_name`.
    pub fn write_index(&self, manifest: &Descriptor, ref_name: &str) -> io::Result<()> {
        let mut descriptor = manifest.clone();
        descriptor
            .annotations
            .insert(ANNOTATION_REF_NAME.to_string(), ref_name.to_string());
        let index = Index {
            schema_version: 2,
            media_type: Some(MEDIA_TYPE_OCI_INDEX.to_string()),
            manifests: vec![descriptor],
        };
        fs::write(
            self.root.join("index.json"),
            serde_json::to_vec_pretty(&index)?,
        )
    }

    pub fn read_index(&self) -> io::Result<Index> {
        Ok(serde_json::from_slice(&fs::read(
            self.root.join("index.json"),
        )?)?)
    }
}
