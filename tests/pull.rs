use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use flate2::write::GzEncoder;
use flate2::Compression;
use futures_util::{stream, StreamExt};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::net::TcpListener;

use imgpull::image::layer::legacy_id;
use imgpull::image::oci::{media_types, ImageReference, Platform};
use imgpull::image::pull::{pull, PullOptions};
use imgpull::storage::archive::{list_entries, ArchiveManifest};
use imgpull::PullError;

const REPO: &str = "library/hello-world";
const TOKEN: &str = "s3cret";

#[derive(Default)]
struct MockRegistry {
    base: String,
    token: Option<String>,
    manifests: HashMap<String, (String, Vec<u8>)>,
    blobs: HashMap<String, Vec<u8>>,
    foreign: HashMap<String, Vec<u8>>,
    token_queries: Mutex<Vec<HashMap<String, String>>>,
    requests: Mutex<Vec<String>>,
    /// Status `/v2/` answers with instead of 200/401
    root_status: Option<StatusCode>,
    /// Blobs answered with 503 this many times before being served
    failures: Mutex<HashMap<String, u32>>,
    /// Blobs whose body stops after a few bytes
    stalled: Vec<String>,
}

impl MockRegistry {
    fn authorized(&self, headers: &HeaderMap) -> bool {
        match &self.token {
            None => true,
            Some(token) => headers
                .get(header::AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .map(|v| v == format!("Bearer {}", token))
                .unwrap_or(false),
        }
    }

    fn challenge(&self) -> Response {
        let challenge = format!(
            r#"Bearer realm="{}/token",service="mock-registry""#,
            self.base
        );
        (StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, challenge)]).into_response()
    }

    fn log(&self, line: String) {
        self.requests.lock().unwrap().push(line);
    }
}

type Shared = Arc<MockRegistry>;

async fn api_root(State(reg): State<Shared>, headers: HeaderMap) -> Response {
    reg.log("GET /v2/".to_string());
    if let Some(status) = reg.root_status {
        return status.into_response();
    }
    if reg.token.is_some() && !reg.authorized(&headers) {
        return reg.challenge();
    }
    StatusCode::OK.into_response()
}

async fn token(
    State(reg): State<Shared>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    reg.token_queries.lock().unwrap().push(query);
    Json(json!({ "token": reg.token.clone().unwrap_or_default() })).into_response()
}

async fn manifest(
    State(reg): State<Shared>,
    UrlPath(reference): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    reg.log(format!("GET manifest {}", reference));
    if !reg.authorized(&headers) {
        return reg.challenge();
    }
    match reg.manifests.get(&reference) {
        Some((content_type, body)) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, content_type.clone())],
            body.clone(),
        )
            .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            r#"{"errors":[{"code":"MANIFEST_UNKNOWN"}]}"#,
        )
            .into_response(),
    }
}

async fn blob(
    State(reg): State<Shared>,
    UrlPath(digest): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    reg.log(format!("GET blob {}", digest));
    if !reg.authorized(&headers) {
        return reg.challenge();
    }
    if let Some(left) = reg.failures.lock().unwrap().get_mut(&digest) {
        if *left > 0 {
            *left -= 1;
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }
    if reg.stalled.contains(&digest) {
        let first = async { Ok::<_, std::io::Error>(Bytes::from_static(b"0123456789")) };
        let body = stream::once(first).chain(stream::pending());
        return (StatusCode::OK, Body::from_stream(body)).into_response();
    }
    match reg.blobs.get(&digest) {
        Some(body) => (StatusCode::OK, body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn foreign(
    State(reg): State<Shared>,
    UrlPath(name): UrlPath<String>,
    headers: HeaderMap,
) -> Response {
    reg.log(format!(
        "GET foreign {} auth={}",
        name,
        headers.contains_key(header::AUTHORIZATION)
    ));
    match reg.foreign.get(&name) {
        Some(body) => (StatusCode::OK, body.clone()).into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Start a mock registry; `build` fills it in once the base URL is known
async fn serve(build: impl FnOnce(&mut MockRegistry)) -> (SocketAddr, Shared) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let mut registry = MockRegistry {
        base: format!("http://{}", addr),
        ..MockRegistry::default()
    };
    build(&mut registry);
    let registry = Arc::new(registry);

    let app = Router::new()
        .route("/v2/", get(api_root))
        .route("/token", get(token))
        .route(&format!("/v2/{}/manifests/{{reference}}", REPO), get(manifest))
        .route(&format!("/v2/{}/blobs/{{digest}}", REPO), get(blob))
        .route("/foreign/{name}", get(foreign))
        .with_state(Arc::clone(&registry));

    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, registry)
}

fn sha256(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn layer_tar(name: &str, contents: &[u8]) -> Vec<u8> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut header = tar::Header::new_gnu();
    header.set_size(contents.len() as u64);
    header.set_mode(0o755);
    header.set_cksum();
    builder.append_data(&mut header, name, contents).unwrap();
    builder.into_inner().unwrap()
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

fn image_config(arch: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "architecture": arch,
        "os": "linux",
        "config": {"Cmd": ["/hello"]},
        "rootfs": {"type": "layers", "diff_ids": ["sha256:0000"]},
        "history": [{"created_by": "COPY hello /"}]
    }))
    .unwrap()
}

struct LayerFixture {
    tar: Vec<u8>,
    gz: Vec<u8>,
    digest: String,
}

fn layer_fixture(name: &str, contents: &[u8]) -> LayerFixture {
    let tar = layer_tar(name, contents);
    let gz = gzip(&tar);
    let digest = sha256(&gz);
    LayerFixture { tar, gz, digest }
}

fn manifest_json(config_digest: &str, layers: &[Value]) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": media_types::DOCKER_MANIFEST_V2,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "size": 0,
            "digest": config_digest
        },
        "layers": layers
    }))
    .unwrap()
}

fn layer_entry(digest: &str, urls: Option<Vec<String>>) -> Value {
    let mut entry = json!({
        "mediaType": "application/vnd.docker.image.rootfs.diff.tar.gzip",
        "size": 0,
        "digest": digest
    });
    if let Some(urls) = urls {
        entry["urls"] = json!(urls);
    }
    entry
}

/// Registers a one-layer image for amd64 and arm64 behind a manifest list under `latest`
fn hello_world(reg: &mut MockRegistry, layer: &LayerFixture) -> String {
    let mut list = Vec::new();
    let mut amd64_config = String::new();
    for arch in ["amd64", "arm64"] {
        let config = image_config(arch);
        let config_digest = sha256(&config);
        let manifest = manifest_json(&config_digest, &[layer_entry(&layer.digest, None)]);
        let manifest_digest = sha256(&manifest);

        list.push(json!({
            "mediaType": media_types::DOCKER_MANIFEST_V2,
            "size": manifest.len(),
            "digest": manifest_digest,
            "platform": {"architecture": arch, "os": "linux"}
        }));
        if arch == "amd64" {
            amd64_config = config_digest.clone();
        }

        reg.blobs.insert(config_digest, config);
        reg.manifests.insert(
            manifest_digest,
            (media_types::DOCKER_MANIFEST_V2.to_string(), manifest),
        );
    }

    let list = serde_json::to_vec(&json!({
        "schemaVersion": 2,
        "mediaType": media_types::DOCKER_MANIFEST_LIST,
        "manifests": list
    }))
    .unwrap();
    reg.manifests.insert(
        "latest".to_string(),
        (media_types::DOCKER_MANIFEST_LIST.to_string(), list),
    );
    reg.blobs.insert(layer.digest.clone(), layer.gz.clone());

    amd64_config
}

fn options(addr: SocketAddr, output: &Path) -> PullOptions {
    PullOptions {
        platform: Platform::new("linux", "amd64"),
        output_dir: output.to_path_buf(),
        registry_url: Some(format!("http://{}", addr)),
        no_proxy: true,
        timeout: Duration::from_secs(10),
        retries: 0,
        backoff: Duration::ZERO,
        ..PullOptions::default()
    }
}

fn unpack(archive: &Path) -> TempDir {
    let dir = TempDir::new().unwrap();
    let mut archive = tar::Archive::new(std::fs::File::open(archive).unwrap());
    archive.unpack(dir.path()).unwrap();
    dir
}

fn dir_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
        .collect();
    names.sort();
    names
}

#[tokio::test]
async fn test_pull_hello_world_from_manifest_list() {
    let layer = layer_fixture("hello", b"hello from the layer");
    let mut config_digest = String::new();
    let (addr, _reg) = serve(|reg| config_digest = hello_world(reg, &layer)).await;

    let out = TempDir::new().unwrap();
    let reference = ImageReference::parse("hello-world:latest").unwrap();
    let report = pull(&reference, &options(addr, out.path())).await.unwrap();

    assert_eq!(report.archive, out.path().join("library_hello-world.tar"));
    assert_eq!(report.config_digest, config_digest);
    assert_eq!(dir_names(out.path()), vec!["library_hello-world.tar"]);

    let id = legacy_id("", &layer.digest);
    assert_eq!(report.layer_ids, vec![id.clone()]);

    let config_hex = config_digest.trim_start_matches("sha256:");
    let tree = unpack(&report.archive);
    let mut expected_names = vec![
        format!("{}.json", config_hex),
        id.clone(),
        "manifest.json".to_string(),
        "repositories".to_string(),
    ];
    expected_names.sort();
    assert_eq!(dir_names(tree.path()), expected_names);

    let manifest: Vec<ArchiveManifest> =
        serde_json::from_slice(&std::fs::read(tree.path().join("manifest.json")).unwrap()).unwrap();
    assert_eq!(manifest.len(), 1);
    assert_eq!(manifest[0].config, format!("{}.json", config_hex));
    assert_eq!(manifest[0].repo_tags, vec!["hello-world:latest".to_string()]);
    assert_eq!(manifest[0].layers, vec![format!("{}/layer.tar", id)]);

    let repositories: BTreeMap<String, BTreeMap<String, String>> =
        serde_json::from_slice(&std::fs::read(tree.path().join("repositories")).unwrap()).unwrap();
    let mut expected = BTreeMap::new();
    expected.insert(
        "hello-world".to_string(),
        BTreeMap::from([("latest".to_string(), id.clone())]),
    );
    assert_eq!(repositories, expected);

    let layer_dir = tree.path().join(&id);
    assert_eq!(dir_names(&layer_dir), vec!["VERSION", "json", "layer.tar"]);
    assert_eq!(std::fs::read_to_string(layer_dir.join("VERSION")).unwrap(), "1.0");
    assert_eq!(std::fs::read(layer_dir.join("layer.tar")).unwrap(), layer.tar);

    let metadata: Value =
        serde_json::from_slice(&std::fs::read(layer_dir.join("json")).unwrap()).unwrap();
    assert_eq!(metadata["id"], id.as_str());
    assert_eq!(metadata["architecture"], "amd64");
    assert!(metadata.get("parent").is_none());
    assert!(metadata.get("history").is_none());
    assert!(metadata.get("rootfs").is_none());

    let config = std::fs::read(tree.path().join(format!("{}.json", config_hex))).unwrap();
    assert_eq!(config, image_config("amd64"));
}

#[tokio::test]
async fn test_pull_selects_requested_platform() {
    let layer = layer_fixture("hello", b"arm");
    let (addr, _reg) = serve(|reg| {
        hello_world(reg, &layer);
    })
    .await;

    let out = TempDir::new().unwrap();
    let mut opts = options(addr, out.path());
    opts.platform = Platform::new("linux", "arm64");

    let reference = ImageReference::parse("hello-world").unwrap();
    let report = pull(&reference, &opts).await.unwrap();
    assert_eq!(report.config_digest, sha256(&image_config("arm64")));
}

#[tokio::test]
async fn test_pull_with_bearer_token() {
    let layer = layer_fixture("hello", b"authenticated");
    let (addr, reg) = serve(|reg| {
        reg.token = Some(TOKEN.to_string());
        hello_world(reg, &layer);
    })
    .await;

    let out = TempDir::new().unwrap();
    let reference = ImageReference::parse("hello-world").unwrap();
    let report = pull(&reference, &options(addr, out.path())).await.unwrap();
    assert!(report.archive.exists());

    // manifest list, platform manifest, config, one layer
    let queries = reg.token_queries.lock().unwrap();
    assert_eq!(queries.len(), 4);
    for query in queries.iter() {
        assert_eq!(query.get("service").map(String::as_str), Some("mock-registry"));
        assert_eq!(
            query.get("scope").map(String::as_str),
            Some("repository:library/hello-world:pull")
        );
    }
}

#[tokio::test]
async fn test_pull_multi_layer_chain_with_concurrency() {
    let layers: Vec<LayerFixture> = (0..3)
        .map(|i| layer_fixture(&format!("file{}", i), format!("layer {}", i).as_bytes()))
        .collect();
    let config = image_config("amd64");
    let config_digest = sha256(&config);

    let (addr, _reg) = serve(|reg| {
        let entries: Vec<Value> = layers.iter().map(|l| layer_entry(&l.digest, None)).collect();
        reg.manifests.insert(
            "v1".to_string(),
            (
                media_types::DOCKER_MANIFEST_V2.to_string(),
                manifest_json(&config_digest, &entries),
            ),
        );
        reg.blobs.insert(config_digest.clone(), config.clone());
        for l in &layers {
            reg.blobs.insert(l.digest.clone(), l.gz.clone());
        }
    })
    .await;

    let out = TempDir::new().unwrap();
    let mut opts = options(addr, out.path());
    opts.concurrency = 3;

    let reference = ImageReference::parse("hello-world:v1").unwrap();
    let report = pull(&reference, &opts).await.unwrap();

    let id1 = legacy_id("", &layers[0].digest);
    let id2 = legacy_id(&id1, &layers[1].digest);
    let id3 = legacy_id(&id2, &layers[2].digest);
    assert_eq!(report.layer_ids, vec![id1.clone(), id2.clone(), id3.clone()]);

    let tree = unpack(&report.archive);
    let manifest: Vec<ArchiveManifest> =
        serde_json::from_slice(&std::fs::read(tree.path().join("manifest.json")).unwrap()).unwrap();
    assert_eq!(
        manifest[0].layers,
        vec![
            format!("{}/layer.tar", id1),
            format!("{}/layer.tar", id2),
            format!("{}/layer.tar", id3),
        ]
    );

    for (i, id) in [&id1, &id2, &id3].iter().enumerate() {
        let dir = tree.path().join(id);
        assert_eq!(std::fs::read(dir.join("layer.tar")).unwrap(), layers[i].tar);
        let metadata: Value =
            serde_json::from_slice(&std::fs::read(dir.join("json")).unwrap()).unwrap();
        if i > 0 {
            let parent = [&id1, &id2][i - 1];
            assert_eq!(metadata["parent"], parent.as_str());
        }
        if i < 2 {
            assert!(metadata.get("container_config").is_some());
            assert!(metadata.get("architecture").is_none());
        } else {
            assert_eq!(metadata["architecture"], "amd64");
        }
    }

    let repositories: Value =
        serde_json::from_slice(&std::fs::read(tree.path().join("repositories")).unwrap()).unwrap();
    assert_eq!(repositories["hello-world"]["v1"], id3.as_str());
}

#[tokio::test]
async fn test_pull_falls_back_to_foreign_urls() {
    let layer = layer_fixture("win", b"foreign layer");
    let config = image_config("amd64");
    let config_digest = sha256(&config);

    let (addr, reg) = serve(|reg| {
        let urls = vec![
            format!("{}/foreign/missing", reg.base),
            format!("{}/foreign/layer", reg.base),
        ];
        reg.manifests.insert(
            "latest".to_string(),
            (
                media_types::DOCKER_MANIFEST_V2.to_string(),
                manifest_json(&config_digest, &[layer_entry(&layer.digest, Some(urls))]),
            ),
        );
        reg.blobs.insert(config_digest.clone(), config.clone());
        reg.foreign.insert("layer".to_string(), layer.gz.clone());
    })
    .await;

    let out = TempDir::new().unwrap();
    let reference = ImageReference::parse("hello-world").unwrap();
    let report = pull(&reference, &options(addr, out.path())).await.unwrap();

    let tree = unpack(&report.archive);
    let id = legacy_id("", &layer.digest);
    assert_eq!(std::fs::read(tree.path().join(&id).join("layer.tar")).unwrap(), layer.tar);

    let requests = reg.requests.lock().unwrap();
    assert!(requests.contains(&"GET foreign missing auth=false".to_string()));
    assert!(requests.contains(&"GET foreign layer auth=false".to_string()));
}

#[tokio::test]
async fn test_missing_blob_fails_and_cleans_up() {
    let layers = [layer_fixture("a", b"a"), layer_fixture("b", b"b")];
    let config = image_config("amd64");
    let config_digest = sha256(&config);

    let (addr, _reg) = serve(|reg| {
        let entries: Vec<Value> = layers.iter().map(|l| layer_entry(&l.digest, None)).collect();
        reg.manifests.insert(
            "latest".to_string(),
            (
                media_types::DOCKER_MANIFEST_V2.to_string(),
                manifest_json(&config_digest, &entries),
            ),
        );
        reg.blobs.insert(config_digest.clone(), config.clone());
        // only the bottom layer is served
        reg.blobs.insert(layers[0].digest.clone(), layers[0].gz.clone());
    })
    .await;

    let out = TempDir::new().unwrap();
    let reference = ImageReference::parse("hello-world").unwrap();
    let err = pull(&reference, &options(addr, out.path())).await.unwrap_err();

    match err {
        PullError::Blob { digest, status } => {
            assert_eq!(digest, layers[1].digest);
            assert_eq!(status, 404);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(dir_names(out.path()).is_empty());
}

#[tokio::test]
async fn test_unknown_tag_is_a_manifest_error() {
    let layer = layer_fixture("hello", b"x");
    let (addr, _reg) = serve(|reg| {
        hello_world(reg, &layer);
    })
    .await;

    let out = TempDir::new().unwrap();
    let reference = ImageReference::parse("hello-world:nope").unwrap();
    let err = pull(&reference, &options(addr, out.path())).await.unwrap_err();

    assert!(matches!(err, PullError::Manifest(_)), "{}", err);
    assert!(err.to_string().contains("404"));
    assert!(dir_names(out.path()).is_empty());
}

#[tokio::test]
async fn test_manifest_without_layers_reports_keys() {
    let (addr, _reg) = serve(|reg| {
        reg.manifests.insert(
            "latest".to_string(),
            (
                media_types::DOCKER_MANIFEST_V2.to_string(),
                br#"{"schemaVersion":2,"config":{"digest":"sha256:c"}}"#.to_vec(),
            ),
        );
    })
    .await;

    let out = TempDir::new().unwrap();
    let reference = ImageReference::parse("hello-world").unwrap();
    let err = pull(&reference, &options(addr, out.path())).await.unwrap_err();

    let msg = err.to_string();
    assert!(msg.contains("No layers"), "{}", msg);
    assert!(msg.contains("schemaVersion, config"), "{}", msg);
}

#[tokio::test]
async fn test_unreachable_registry_is_a_connection_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let out = TempDir::new().unwrap();
    let reference = ImageReference::parse("hello-world").unwrap();
    let err = pull(&reference, &options(addr, out.path())).await.unwrap_err();
    assert!(err.is_connection(), "{}", err);
}

#[tokio::test]
async fn test_archive_entries_are_relative_to_root() {
    let layer = layer_fixture("hello", b"names");
    let (addr, _reg) = serve(|reg| {
        hello_world(reg, &layer);
    })
    .await;

    let out = TempDir::new().unwrap();
    let reference = ImageReference::parse("hello-world").unwrap();
    let report = pull(&reference, &options(addr, out.path())).await.unwrap();

    let id = legacy_id("", &layer.digest);
    let names = list_entries(&report.archive).unwrap();
    assert!(names.contains(&"manifest.json".to_string()));
    assert!(names.contains(&"repositories".to_string()));
    assert!(names.contains(&format!("{}/layer.tar", id)));
    assert!(names.iter().all(|n| !n.starts_with('/') && !n.starts_with(".imgpull")));
}

fn blob_requests(reg: &MockRegistry, digest: &str) -> usize {
    let line = format!("GET blob {}", digest);
    reg.requests.lock().unwrap().iter().filter(|l| **l == line).count()
}

#[tokio::test]
async fn test_transient_blob_errors_are_retried() {
    let layer = layer_fixture("hello", b"flaky");
    let mut config_digest = String::new();
    let (addr, reg) = serve(|reg| {
        config_digest = hello_world(reg, &layer);
        reg.failures.lock().unwrap().insert(layer.digest.clone(), 2);
    })
    .await;

    let out = TempDir::new().unwrap();
    let mut opts = options(addr, out.path());
    opts.retries = 2;

    let reference = ImageReference::parse("hello-world").unwrap();
    let report = pull(&reference, &opts).await.unwrap();

    assert_eq!(report.config_digest, config_digest);
    assert_eq!(blob_requests(&reg, &layer.digest), 3);
    let tree = unpack(&report.archive);
    let id = legacy_id("", &layer.digest);
    assert_eq!(std::fs::read(tree.path().join(&id).join("layer.tar")).unwrap(), layer.tar);
}

#[tokio::test]
async fn test_retries_exhausted_returns_last_status() {
    let layer = layer_fixture("hello", b"flaky");
    let (addr, reg) = serve(|reg| {
        hello_world(reg, &layer);
        reg.failures.lock().unwrap().insert(layer.digest.clone(), 5);
    })
    .await;

    let out = TempDir::new().unwrap();
    let mut opts = options(addr, out.path());
    opts.retries = 1;

    let reference = ImageReference::parse("hello-world").unwrap();
    let err = pull(&reference, &opts).await.unwrap_err();

    match err {
        PullError::Blob { digest, status } => {
            assert_eq!(digest, layer.digest);
            assert_eq!(status, 503);
        }
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(blob_requests(&reg, &layer.digest), 2);
    assert!(dir_names(out.path()).is_empty());
}

#[tokio::test]
async fn test_stalled_blob_times_out() {
    let layer = layer_fixture("hello", b"stalls");
    let (addr, _reg) = serve(|reg| {
        hello_world(reg, &layer);
        reg.stalled.push(layer.digest.clone());
    })
    .await;

    let out = TempDir::new().unwrap();
    let mut opts = options(addr, out.path());
    opts.timeout = Duration::from_secs(1);

    let reference = ImageReference::parse("hello-world").unwrap();
    let result = tokio::time::timeout(Duration::from_secs(20), pull(&reference, &opts))
        .await
        .expect("pull hung on a stalled blob");

    let err = result.unwrap_err();
    assert!(err.is_connection(), "{}", err);
    assert!(dir_names(out.path()).is_empty());
}

#[tokio::test]
async fn test_unexpected_probe_status_is_an_auth_error() {
    let layer = layer_fixture("hello", b"x");
    let (addr, _reg) = serve(|reg| {
        hello_world(reg, &layer);
        reg.root_status = Some(StatusCode::FORBIDDEN);
    })
    .await;

    let out = TempDir::new().unwrap();
    let reference = ImageReference::parse("hello-world").unwrap();
    let err = pull(&reference, &options(addr, out.path())).await.unwrap_err();

    assert!(matches!(err, PullError::Auth(_)), "{}", err);
    assert!(err.to_string().contains("403"), "{}", err);
}
