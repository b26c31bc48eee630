//! Registry fetcher tests against a mock OCI distribution server.

use std::fs;
use std::io::Write;

use flate2::write::GzEncoder;
use flate2::Compression;
use tempfile::TempDir;
use wiremock::matchers::{basic_auth, bearer_token, method, path};
use wiremock::{Match, Mock, MockServer, Request, ResponseTemplate};

use buildfs_rootfs::hash::digest_bytes;
use buildfs_rootfs::oci::{
    ImageLayout, LAYOUT_REF_NAME, MEDIA_TYPE_OCI_INDEX, MEDIA_TYPE_OCI_MANIFEST,
};
use buildfs_rootfs::{
    FetchError, FetchProgress, FetchRequest, ImageFetcher, LayoutUnpacker, ProgressSink,
    PullCredentials, RegistryConfig, RegistryFetcher, RootfsUnpacker, StopSignal,
};

const REPO: &str = "org/app";

/// Matches requests without an `Authorization` header.
struct Anonymous;

impl Match for Anonymous {
    fn matches(&self, request: &Request) -> bool {
        !request.headers.contains_key("authorization")
    }
}

#[derive(Default)]
struct RecordingSink {
    events: std::sync::Mutex<Vec<FetchProgress>>,
}

impl ProgressSink for RecordingSink {
    fn report(&self, event: FetchProgress) {
        self.events.lock().unwrap().push(event);
    }
}

struct TestImage {
    config: Vec<u8>,
    layer: Vec<u8>,
    manifest: Vec<u8>,
}

impl TestImage {
    fn new() -> Self {
        let mut builder = tar::Builder::new(Vec::new());
        let data = b"hello from the image\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(data.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, "etc/greeting", &data[..])
            .unwrap();
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&builder.into_inner().unwrap()).unwrap();
        let layer = encoder.finish().unwrap();

        let config = br#"{"architecture":"arm64","os":"linux"}"#.to_vec();
        let manifest = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "config": {
                "mediaType": "application/vnd.oci.image.config.v1+json",
                "digest": digest(&config),
                "size": config.len(),
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar+gzip",
                "digest": digest(&layer),
                "size": layer.len(),
            }],
        }))
        .unwrap();

        Self {
            config,
            layer,
            manifest,
        }
    }

    fn manifest_digest(&self) -> String {
        digest(&self.manifest)
    }

    /// Multi-platform index whose arm64 entry is this image.
    fn index(&self) -> Vec<u8> {
        serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_INDEX,
            "manifests": [
                {
                    "mediaType": MEDIA_TYPE_OCI_MANIFEST,
                    "digest": format!("sha256:{}", "0".repeat(64)),
                    "size": 10,
                    "platform": {"architecture": "amd64", "os": "linux"},
                },
                {
                    "mediaType": MEDIA_TYPE_OCI_MANIFEST,
                    "digest": self.manifest_digest(),
                    "size": self.manifest.len(),
                    "platform": {"architecture": "arm64", "os": "linux", "variant": "v8"},
                },
            ],
        }))
        .unwrap()
    }
}

fn digest(bytes: &[u8]) -> String {
    format!("sha256:{}", digest_bytes(bytes))
}

fn fetcher_for(server: &MockServer) -> (RegistryFetcher, String) {
    let registry = server.address().to_string();
    let config = RegistryConfig {
        insecure_registries: vec![registry.clone()],
        ..RegistryConfig::default()
    };
    (RegistryFetcher::new(config).unwrap(), registry)
}

fn request(registry: &str, reference: &str, dest: &TempDir, arch: &str) -> FetchRequest {
    FetchRequest {
        reference: format!("{registry}/{REPO}{reference}"),
        dest: dest.path().join("image"),
        os: "linux".to_string(),
        arch: arch.to_string(),
        credentials: PullCredentials::default(),
    }
}

async fn mount_blobs(server: &MockServer, image: &TestImage) {
    for blob in [&image.config, &image.layer] {
        Mock::given(method("GET"))
            .and(path(format!("/v2/{REPO}/blobs/{}", digest(blob))))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(blob.clone()))
            .expect(1)
            .mount(server)
            .await;
    }
}

#[tokio::test]
async fn test_anonymous_pull_resolves_platform_from_index() {
    let server = MockServer::start().await;
    let image = TestImage::new();

    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/manifests/v1")))
        .respond_with(ResponseTemplate::new(200).set_body_raw(image.index(), MEDIA_TYPE_OCI_INDEX))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/manifests/{}", image.manifest_digest())))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(image.manifest.clone(), MEDIA_TYPE_OCI_MANIFEST),
        )
        .expect(1)
        .mount(&server)
        .await;
    mount_blobs(&server, &image).await;

    let (fetcher, registry) = fetcher_for(&server);
    let dir = TempDir::new().unwrap();
    let req = request(&registry, ":v1", &dir, "arm64");
    let sink = RecordingSink::default();
    fetcher.fetch(&req, &sink).await.unwrap();

    // The layout records the platform manifest under "latest".
    let layout = ImageLayout::open(&req.dest).unwrap();
    let index = layout.read_index().unwrap();
    let found = index.find_ref(LAYOUT_REF_NAME);
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].digest, image.manifest_digest());
    assert!(layout.blob_exists(&digest(&image.layer)));
    assert!(layout.blob_exists(&digest(&image.config)));

    let events = sink.events.lock().unwrap().clone();
    assert_eq!(
        events
            .iter()
            .filter(|e| matches!(e, FetchProgress::Manifest { .. }))
            .count(),
        2
    );
    assert!(events.contains(&FetchProgress::BlobFinished {
        digest: digest(&image.layer),
        bytes: image.layer.len() as u64,
    }));

    // And the unpacker can read what the fetcher wrote.
    let rootfs = dir.path().join("rootfs");
    LayoutUnpacker::new()
        .unpack(&req.dest, &rootfs, true, &StopSignal::new())
        .unwrap();
    assert_eq!(
        fs::read_to_string(rootfs.join("etc/greeting")).unwrap(),
        "hello from the image\n"
    );
}

#[tokio::test]
async fn test_bearer_token_flow_with_credentials() {
    let server = MockServer::start().await;
    let image = TestImage::new();
    let challenge = format!(
        r#"Bearer realm="{}/token",service="test-registry",scope="repository:{REPO}:pull""#,
        server.uri()
    );

    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/manifests/v1")))
        .and(Anonymous)
        .respond_with(ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge.as_str()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/token"))
        .and(basic_auth("user", "pass"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"token": "abc"})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/manifests/v1")))
        .and(bearer_token("abc"))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(image.manifest.clone(), MEDIA_TYPE_OCI_MANIFEST),
        )
        .expect(1)
        .mount(&server)
        .await;
    for blob in [&image.config, &image.layer] {
        Mock::given(method("GET"))
            .and(path(format!("/v2/{REPO}/blobs/{}", digest(blob))))
            .and(bearer_token("abc"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(blob.clone()))
            .expect(1)
            .mount(&server)
            .await;
    }

    let (fetcher, registry) = fetcher_for(&server);
    let dir = TempDir::new().unwrap();
    let mut req = request(&registry, ":v1", &dir, "arm64");
    req.credentials = PullCredentials::new("user", "pass");
    fetcher.fetch(&req, &buildfs_rootfs::LogProgress).await.unwrap();

    let layout = ImageLayout::open(&req.dest).unwrap();
    assert_eq!(
        layout.read_index().unwrap().find_ref(LAYOUT_REF_NAME)[0].digest,
        image.manifest_digest()
    );
}

#[tokio::test]
async fn test_blob_digest_mismatch_is_rejected() {
    let server = MockServer::start().await;
    let image = TestImage::new();

    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/manifests/v1")))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(image.manifest.clone(), MEDIA_TYPE_OCI_MANIFEST),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/blobs/{}", digest(&image.config))))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
        .mount(&server)
        .await;

    let (fetcher, registry) = fetcher_for(&server);
    let dir = TempDir::new().unwrap();
    let req = request(&registry, ":v1", &dir, "arm64");
    let err = fetcher
        .fetch(&req, &buildfs_rootfs::LogProgress)
        .await
        .unwrap_err();

    match err {
        FetchError::DigestMismatch { expected, actual } => {
            assert_eq!(expected, digest(&image.config));
            assert_eq!(actual, digest(b"tampered"));
        }
        other => panic!("unexpected error: {other}"),
    }
    let layout = ImageLayout::open(&req.dest).unwrap();
    assert!(!layout.blob_exists(&digest(&image.config)));
}

#[tokio::test]
async fn test_blob_larger_than_descriptor_is_rejected() {
    let server = MockServer::start().await;
    let image = TestImage::new();

    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/manifests/v1")))
        .respond_with(
            ResponseTemplate::new(200).set_body_raw(image.manifest.clone(), MEDIA_TYPE_OCI_MANIFEST),
        )
        .mount(&server)
        .await;
    let oversized = vec![b'x'; image.config.len() * 4];
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/blobs/{}", digest(&image.config))))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(oversized.clone()))
        .mount(&server)
        .await;

    let (fetcher, registry) = fetcher_for(&server);
    let dir = TempDir::new().unwrap();
    let req = request(&registry, ":v1", &dir, "arm64");
    let err = fetcher
        .fetch(&req, &buildfs_rootfs::LogProgress)
        .await
        .unwrap_err();

    match err {
        FetchError::TooLarge { size, limit } => {
            assert_eq!(limit, image.config.len() as u64);
            assert!(size > limit && size <= oversized.len() as u64);
        }
        other => panic!("unexpected error: {other}"),
    }
    let layout = ImageLayout::open(&req.dest).unwrap();
    assert!(!layout.blob_exists(&digest(&image.config)));
}

#[tokio::test]
async fn test_index_without_matching_platform() {
    let server = MockServer::start().await;
    let image = TestImage::new();

    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/manifests/v1")))
        .respond_with(ResponseTemplate::new(200).set_body_raw(image.index(), MEDIA_TYPE_OCI_INDEX))
        .mount(&server)
        .await;

    let (fetcher, registry) = fetcher_for(&server);
    let dir = TempDir::new().unwrap();
    let req = request(&registry, ":v1", &dir, "riscv64");
    let err = fetcher
        .fetch(&req, &buildfs_rootfs::LogProgress)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        FetchError::NoMatchingPlatform { ref arch, .. } if arch == "riscv64"
    ));
}

#[tokio::test]
async fn test_missing_manifest_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/{REPO}/manifests/v1")))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let (fetcher, registry) = fetcher_for(&server);
    let dir = TempDir::new().unwrap();
    let err = fetcher
        .fetch(&request(&registry, ":v1", &dir, "arm64"), &buildfs_rootfs::LogProgress)
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::NotFound(ref r) if r == "v1"));
}
