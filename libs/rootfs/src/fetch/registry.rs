//! OCI distribution registry client.
//!
//! Pulls a manifest (resolving multi-platform indexes to the target
//! platform) and its blobs into an OCI image layout.
//!
//! Reference: https://github.com/opencontainers/distribution-spec

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{FetchError, FetchProgress, FetchRequest, ImageFetcher, ImageReference, ProgressSink};
use crate::credentials::PullCredentials;
use crate::hash;
use crate::oci::{self, Descriptor, ImageLayout, Index, Manifest, LAYOUT_REF_NAME};

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
     application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.list.v2+json, \
     application/vnd.docker.distribution.manifest.v2+json";

/// Configuration for the registry client.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Timeout for a single HTTP request, body included.
    pub request_timeout: Duration,
    /// Registries reached over plain HTTP (`host[:port]`).
    pub insecure_registries: Vec<String>,
    /// Max compressed image size.
    pub max_compressed_size: u64,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(1800), // 30 minutes
            insecure_registries: Vec::new(),
            max_compressed_size: 10 * 1024 * 1024 * 1024, // 10 GiB
        }
    }
}

impl RegistryConfig {
    /// Load overrides from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(list) = std::env::var("BUILDFS_INSECURE_REGISTRIES") {
            config.insecure_registries = list
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }

        if let Some(secs) = std::env::var("BUILDFS_REGISTRY_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.request_timeout = Duration::from_secs(secs);
        }

        config
    }

    fn base_url(&self, registry: &str) -> String {
        let scheme = if self.insecure_registries.iter().any(|r| r == registry) {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{registry}")
    }
}

/// [`ImageFetcher`] backed by an OCI distribution registry.
pub struct RegistryFetcher {
    config: RegistryConfig,
    client: Client,
}

impl RegistryFetcher {
    pub fn new(config: RegistryConfig) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(config.request_timeout).build()?;

        Ok(Self { config, client })
    }
}

#[async_trait]
impl ImageFetcher for RegistryFetcher {
    async fn fetch(
        &self,
        request: &FetchRequest,
        progress: &dyn ProgressSink,
    ) -> Result<(), FetchError> {
        let image = ImageReference::parse(&request.reference)?;
        let layout = ImageLayout::create(&request.dest)?;

        info!(
            image = %image,
            dest = %request.dest.display(),
            os = %request.os,
            arch = %request.arch,
            "Pulling image"
        );

        let mut session = Session {
            client: &self.client,
            base_url: self.config.base_url(&image.registry),
            repository: image.repository.clone(),
            credentials: &request.credentials,
            auth: Auth::Anonymous,
        };

        let mut fetched = session.get_manifest(&image.reference).await?;
        progress.report(FetchProgress::Manifest {
            digest: fetched.digest.clone(),
            media_type: fetched.media_type.clone(),
        });

        let mut platform = None;
        if oci::is_index_media_type(&fetched.media_type) {
            let index: Index = serde_json::from_slice(&fetched.body)?;
            let chosen = index
                .find_platform(&request.os, &request.arch)
                .cloned()
                .ok_or_else(|| FetchError::NoMatchingPlatform {
                    os: request.os.clone(),
                    arch: request.arch.clone(),
                })?;
            debug!(digest = %chosen.digest, "Resolved platform manifest from index");

            fetched = session.get_manifest(&chosen.digest).await?;
            progress.report(FetchProgress::Manifest {
                digest: fetched.digest.clone(),
                media_type: fetched.media_type.clone(),
            });
            platform = chosen.platform;
        }

        if !oci::is_manifest_media_type(&fetched.media_type) {
            return Err(FetchError::UnsupportedMediaType(fetched.media_type));
        }
        let manifest: Manifest = serde_json::from_slice(&fetched.body)?;

        // Check total size before pulling
        let total_compressed = manifest.total_layer_size();
        if total_compressed > self.config.max_compressed_size {
            return Err(FetchError::TooLarge {
                size: total_compressed,
                limit: self.config.max_compressed_size,
            });
        }

        info!(
            image = %image,
            layer_count = manifest.layers.len(),
            total_compressed_bytes = total_compressed,
            "Manifest fetched, pulling layers"
        );

        for descriptor in std::iter::once(&manifest.config).chain(manifest.layers.iter()) {
            if layout.blob_exists(&descriptor.digest) {
                progress.report(FetchProgress::BlobCached {
                    digest: descriptor.digest.clone(),
                });
                continue;
            }
            progress.report(FetchProgress::BlobStarted {
                digest: descriptor.digest.clone(),
                size: descriptor.size,
            });
            let bytes = session
                .pull_blob(descriptor, &layout.blob_path(&descriptor.digest))
                .await?;
            progress.report(FetchProgress::BlobFinished {
                digest: descriptor.digest.clone(),
                bytes,
            });
        }

        let manifest_digest = layout.write_blob(&fetched.body)?;
        let mut descriptor = Descriptor::new(
            fetched.media_type,
            manifest_digest,
            fetched.body.len() as u64,
        );
        descriptor.platform = platform;
        layout.write_index(&descriptor, LAYOUT_REF_NAME)?;

        info!(
            image = %image,
            digest = %descriptor.digest,
            "Image pulled"
        );
        Ok(())
    }
}

enum Auth {
    Anonymous,
    Bearer(String),
    Basic,
}

struct FetchedManifest {
    body: Vec<u8>,
    media_type: String,
    digest: String,
}

/// Per-pull registry session; remembers the auth negotiated on first 401.
struct Session<'a> {
    client: &'a Client,
    base_url: String,
    repository: String,
    credentials: &'a PullCredentials,
    auth: Auth,
}

impl Session<'_> {
    async fn get_manifest(&mut self, reference: &str) -> Result<FetchedManifest, FetchError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.base_url, self.repository, reference
        );

        debug!(url = %url, "Pulling manifest");

        let response = check_status(self.get(&url, Some(MANIFEST_ACCEPT)).await?, reference)?;
        let header_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(';').next())
            .map(|v| v.trim().to_string());
        let body = response.bytes().await?.to_vec();

        // Verify digest
        let digest = format!("sha256:{}", hash::digest_bytes(&body));
        if reference.contains(':') && digest != reference {
            return Err(FetchError::DigestMismatch {
                expected: reference.to_string(),
                actual: digest,
            });
        }

        let media_type = match header_type {
            Some(mt) if oci::is_manifest_media_type(&mt) || oci::is_index_media_type(&mt) => mt,
            _ => sniff_media_type(&body)?,
        };

        Ok(FetchedManifest {
            body,
            media_type,
            digest,
        })
    }

    /// Pull a blob by digest to a file, verifying its digest while streaming.
    async fn pull_blob(&mut self, descriptor: &Descriptor, dest: &Path) -> Result<u64, FetchError> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.base_url, self.repository, descriptor.digest
        );

        debug!(url = %url, dest = %dest.display(), "Pulling blob");

        let response = check_status(self.get(&url, None).await?, &descriptor.digest)?;
        if let Some(length) = response.content_length() {
            if length > descriptor.size {
                return Err(FetchError::TooLarge {
                    size: length,
                    limit: descriptor.size,
                });
            }
        }

        // Download to temporary file, then rename
        let temp_path = dest.with_extension("tmp");
        let mut file = tokio::fs::File::create(&temp_path).await?;
        let mut hasher = Sha256::new();
        let mut total_bytes = 0u64;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            total_bytes += chunk.len() as u64;
            // The descriptor size is authoritative; stop before the disk fills.
            if total_bytes > descriptor.size {
                drop(file);
                tokio::fs::remove_file(&temp_path).await.ok();
                return Err(FetchError::TooLarge {
                    size: total_bytes,
                    limit: descriptor.size,
                });
            }
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.sync_all().await?;
        drop(file);

        let computed = format!("sha256:{}", hex::encode(hasher.finalize()));
        if computed != descriptor.digest {
            tokio::fs::remove_file(&temp_path).await.ok();
            return Err(FetchError::DigestMismatch {
                expected: descriptor.digest.clone(),
                actual: computed,
            });
        }

        tokio::fs::rename(&temp_path, dest).await?;
        Ok(total_bytes)
    }

    /// GET `url`, negotiating auth once if the registry answers 401.
    async fn get(&mut self, url: &str, accept: Option<&str>) -> Result<Response, FetchError> {
        let response = self.send(url, accept).await?;
        if response.status() != StatusCode::UNAUTHORIZED || !matches!(self.auth, Auth::Anonymous)
        {
            return Ok(response);
        }

        let challenge = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| FetchError::Unauthorized(url.to_string()))?;
        self.authenticate(&challenge).await?;
        self.send(url, accept).await
    }

    async fn send(&self, url: &str, accept: Option<&str>) -> Result<Response, FetchError> {
        let mut request = self.client.get(url);
        if let Some(accept) = accept {
            request = request.header(ACCEPT, accept);
        }
        request = match &self.auth {
            Auth::Anonymous => request,
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::Basic => request.basic_auth(
                &self.credentials.username,
                Some(&self.credentials.password),
            ),
        };
        Ok(request.send().await?)
    }

    async fn authenticate(&mut self, challenge: &str) -> Result<(), FetchError> {
        let (scheme, params) = parse_challenge(challenge);

        if scheme.eq_ignore_ascii_case("basic") {
            if self.credentials.is_empty() {
                return Err(FetchError::Unauthorized(self.repository.clone()));
            }
            self.auth = Auth::Basic;
            return Ok(());
        }
        if !scheme.eq_ignore_ascii_case("bearer") {
            return Err(FetchError::Unauthorized(self.repository.clone()));
        }

        let realm = params
            .get("realm")
            .ok_or_else(|| FetchError::Unauthorized(self.repository.clone()))?;
        let mut query: Vec<(&str, String)> = Vec::new();
        if let Some(service) = params.get("service") {
            query.push(("service", service.clone()));
        }
        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{}:pull", self.repository));
        query.push(("scope", scope));

        debug!(realm = %realm, "Requesting registry token");

        let mut request = self.client.get(realm).query(&query);
        if !self.credentials.is_empty() {
            request = request.basic_auth(
                &self.credentials.username,
                Some(&self.credentials.password),
            );
        }
        let response = request.send().await?;
        if !response.status().is_success() {
            return Err(FetchError::Unauthorized(realm.clone()));
        }

        let body: TokenResponse = response.json().await?;
        let token = body
            .token
            .or(body.access_token)
            .ok_or_else(|| FetchError::Unauthorized(realm.clone()))?;
        self.auth = Auth::Bearer(token);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MediaTypeSniff {
    #[serde(default)]
    media_type: Option<String>,
    #[serde(default)]
    manifests: Option<serde_json::Value>,
}

/// Determine a manifest's media type from its body when the registry did not
/// send a usable `Content-Type`.
fn sniff_media_type(body: &[u8]) -> Result<String, FetchError> {
    let sniffed: MediaTypeSniff = serde_json::from_slice(body)?;
    Ok(match sniffed.media_type {
        Some(mt) => mt,
        None if sniffed.manifests.is_some() => oci::MEDIA_TYPE_OCI_INDEX.to_string(),
        None => oci::MEDIA_TYPE_OCI_MANIFEST.to_string(),
    })
}

fn check_status(response: Response, what: &str) -> Result<Response, FetchError> {
    match response.status() {
        status if status.is_success() => Ok(response),
        StatusCode::NOT_FOUND => Err(FetchError::NotFound(what.to_string())),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            Err(FetchError::Unauthorized(what.to_string()))
        }
        status => Err(FetchError::Registry {
            status: status.as_u16(),
            url: response.url().to_string(),
        }),
    }
}

/// Split a `WWW-Authenticate` header into its scheme and parameters.
///
/// Quoted values may contain commas, e.g. `scope="repository:a/b:pull,push"`.
fn parse_challenge(header: &str) -> (String, HashMap<String, String>) {
    let header = header.trim();
    let (scheme, mut rest) = header.split_once(' ').unwrap_or((header, ""));
    let mut params = HashMap::new();

    loop {
        rest = rest.trim_start_matches([' ', ',']);
        let Some((key, after)) = rest.split_once('=') else {
            break;
        };
        let after = after.trim_start();
        let (value, remainder) = match after.strip_prefix('"') {
            Some(quoted) => quoted.split_once('"').unwrap_or((quoted, "")),
            None => after.split_once(',').unwrap_or((after, "")),
        };
        params.insert(key.trim().to_ascii_lowercase(), value.trim().to_string());
        rest = remainder;
    }

    (scheme.to_string(), params)
}
