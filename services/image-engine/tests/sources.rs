//! Source backends and the source registry against a mock HTTP server.

use std::sync::Arc;

use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use uuid::Uuid;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use vmimg_engine::config::{ConfigStore, PersistedConfig, CONFIG_FILE};
use vmimg_engine::registry::SourceRegistry;
use vmimg_engine::source::{
    build_source, ImageSource, ImportDetail, ImportOptions, ListOutcome, SourceContext,
    SourceRecord, SourceType,
};
use vmimg_manifest::layer_chain_uuid;

const ACTIVE: ImportOptions = ImportOptions {
    ensure_active: true,
    err_on_404: false,
};

fn source(url: &str, source_type: SourceType) -> Arc<dyn ImageSource> {
    build_source(SourceRecord::new(url, source_type), &SourceContext::default()).unwrap()
}

fn image(uuid: Uuid, origin: Option<Uuid>, state: &str) -> Value {
    let mut m = json!({
        "v": 2,
        "uuid": uuid,
        "owner": "930896af-bf8c-48d4-885c-6573a94b1853",
        "name": "base-64",
        "version": "23.4.0",
        "state": state,
        "os": "smartos",
        "type": "zone-dataset",
        "files": [{ "size": 3, "compression": "none",
                    "sha1": "a9993e364706816aba3e25717850c26c9cd0d89d" }]
    });
    if let Some(origin) = origin {
        m["origin"] = json!(origin);
    }
    m
}

async fn mount_json(server: &MockServer, at: String, body: Value) {
    Mock::given(method("GET"))
        .and(path(at))
        .respond_with(ResponseTemplate::new(200).set_body_json(body))
        .mount(server)
        .await;
}

fn sha256(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

// --- imgapi ---

#[tokio::test]
async fn test_imgapi_ping() {
    let server = MockServer::start().await;
    mount_json(&server, "/ping".into(), json!({ "ping": "pong", "imgapi": true })).await;
    source(&server.uri(), SourceType::Imgapi).ping().await.unwrap();

    let other = MockServer::start().await;
    mount_json(&other, "/ping".into(), json!({ "ping": "pong" })).await;
    let err = source(&other.uri(), SourceType::Imgapi).ping().await.unwrap_err();
    assert_eq!(err.code(), "SourcePingError");
}

#[tokio::test]
async fn test_imgapi_import_info_modifiers() {
    let server = MockServer::start().await;
    let active = Uuid::new_v4();
    let disabled = Uuid::new_v4();
    mount_json(&server, format!("/images/{active}"), image(active, None, "active")).await;
    mount_json(&server, format!("/images/{disabled}"), image(disabled, None, "disabled")).await;
    let src = source(&server.uri(), SourceType::Imgapi);

    let info = src.get_import_info(&active.to_string(), ACTIVE).await.unwrap().unwrap();
    assert_eq!(info.uuid, active);

    assert!(src.get_import_info(&disabled.to_string(), ACTIVE).await.unwrap().is_none());
    let strict = ImportOptions {
        ensure_active: true,
        err_on_404: true,
    };
    let err = src.get_import_info(&disabled.to_string(), strict).await.unwrap_err();
    assert_eq!(err.code(), "ActiveImageNotFound");

    let missing = Uuid::new_v4().to_string();
    assert!(src.get_import_info(&missing, ACTIVE).await.unwrap().is_none());
    let err = src.get_import_info(&missing, strict).await.unwrap_err();
    assert_eq!(err.code(), "ImageNotFound");

    // Not a uuid: never sent to the server.
    assert!(src.get_import_info("busybox:latest", ACTIVE).await.unwrap().is_none());
}

#[tokio::test]
async fn test_imgapi_ancestry_walks_origins() {
    let server = MockServer::start().await;
    let base = Uuid::new_v4();
    let middle = Uuid::new_v4();
    let leaf = Uuid::new_v4();
    mount_json(&server, format!("/images/{base}"), image(base, None, "active")).await;
    mount_json(&server, format!("/images/{middle}"), image(middle, Some(base), "active")).await;
    mount_json(&server, format!("/images/{leaf}"), image(leaf, Some(middle), "active")).await;
    let src = source(&server.uri(), SourceType::Imgapi);

    let info = src.get_import_info(&leaf.to_string(), ACTIVE).await.unwrap().unwrap();
    let chain: Vec<Uuid> = src
        .get_img_ancestry(&info)
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.uuid)
        .collect();
    assert_eq!(chain, vec![base, middle, leaf]);
}

#[tokio::test]
async fn test_imgapi_missing_origin_is_fatal() {
    let server = MockServer::start().await;
    let leaf = Uuid::new_v4();
    mount_json(&server, format!("/images/{leaf}"), image(leaf, Some(Uuid::new_v4()), "active")).await;
    let src = source(&server.uri(), SourceType::Imgapi);

    let info = src.get_import_info(&leaf.to_string(), ACTIVE).await.unwrap().unwrap();
    let err = src.get_img_ancestry(&info).await.unwrap_err();
    assert_eq!(err.code(), "ImageNotFound");
}

#[tokio::test]
async fn test_imgapi_list_skips_bad_entries() {
    let server = MockServer::start().await;
    let a = Uuid::new_v4();
    mount_json(
        &server,
        "/images".into(),
        json!([image(a, None, "active"), "garbage", { "v": 99, "uuid": Uuid::new_v4() }]),
    )
    .await;

    let ListOutcome::Images(images) = source(&server.uri(), SourceType::Imgapi)
        .list_images()
        .await
        .unwrap()
    else {
        panic!("expected images");
    };
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].uuid, a);
}

// --- dsapi ---

#[tokio::test]
async fn test_dsapi_upgrades_legacy_records() {
    let server = MockServer::start().await;
    let uuid = Uuid::new_v4();
    let legacy = json!({
        "uuid": uuid,
        "urn": "sdc:sdc:base64:1.8.1",
        "name": "base64",
        "version": "1.8.1",
        "os": "smartos",
        "creator_uuid": "352971aa-31ba-496c-9ade-a379feaecd52",
        "restricted_to_uuid": "352971aa-31ba-496c-9ade-a379feaecd52",
        "created_at": "2012-05-22T17:51:16.000Z",
        "files": [{ "path": "base64-1.8.1.zfs.bz2", "size": 3,
                    "sha1": "a9993e364706816aba3e25717850c26c9cd0d89d" }]
    });
    mount_json(&server, "/ping".into(), json!({ "ping": "pong" })).await;
    mount_json(&server, "/datasets".into(), json!([legacy.clone()])).await;
    mount_json(&server, format!("/datasets/{uuid}"), legacy).await;
    Mock::given(method("GET"))
        .and(path(format!("/datasets/{uuid}/base64-1.8.1.zfs.bz2")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"abc".to_vec()))
        .mount(&server)
        .await;

    let src = source(&format!("{}/datasets", server.uri()), SourceType::Dsapi);
    src.ping().await.unwrap();

    let ListOutcome::Images(images) = src.list_images().await.unwrap() else {
        panic!("expected images");
    };
    assert_eq!(images[0].v, 2);
    assert!(!images[0].public);
    assert_eq!(images[0].published_at.as_deref(), Some("2012-05-22T17:51:16.000Z"));
    assert_eq!(images[0].files[0].compression, vmimg_manifest::Compression::Bzip2);

    let info = src.get_import_info(&uuid.to_string(), ACTIVE).await.unwrap().unwrap();
    let meta = src.get_img_meta(&info).await.unwrap();
    assert_eq!(meta.size, Some(3));
    let stream = src.get_img_file_stream(&info).await.unwrap();
    assert_eq!(stream.size, Some(3));
}

// --- docker ---

struct Registry {
    server: MockServer,
    layers: Vec<(String, Vec<u8>)>,
}

/// Serve `library/busybox:latest` with the given layer contents.
async fn registry(contents: &[&[u8]]) -> Registry {
    let server = MockServer::start().await;
    let config = json!({ "created": "2024-01-02T03:04:05Z", "os": "linux" });
    let config_bytes = serde_json::to_vec(&config).unwrap();
    let layers: Vec<(String, Vec<u8>)> = contents
        .iter()
        .map(|c| (sha256(c), c.to_vec()))
        .collect();

    let manifest = json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.docker.distribution.manifest.v2+json",
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": sha256(&config_bytes),
            "size": config_bytes.len(),
        },
        "layers": layers.iter().map(|(digest, data)| json!({
            "mediaType": "application/vnd.docker.image.rootfs.diff.tar",
            "digest": digest,
            "size": data.len(),
        })).collect::<Vec<_>>(),
    });

    Mock::given(method("GET"))
        .and(path("/v2/"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v2/library/busybox/manifests/latest"))
        .respond_with(ResponseTemplate::new(200).set_body_json(manifest))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/v2/library/busybox/blobs/{}", sha256(&config_bytes))))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(config_bytes.clone()))
        .mount(&server)
        .await;
    for (digest, data) in &layers {
        Mock::given(method("GET"))
            .and(path(format!("/v2/library/busybox/blobs/{digest}")))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(data.clone()))
            .mount(&server)
            .await;
    }

    Registry { server, layers }
}

impl Registry {
    fn reference(&self) -> String {
        let host = self.server.uri().trim_start_matches("http://").to_string();
        format!("{host}/library/busybox:latest")
    }
}

#[tokio::test]
async fn test_docker_ancestry_collapses_repeated_layers() {
    let reg = registry(&[b"layer a", b"layer a", b"layer b", b"layer c"]).await;
    let src = source(&reg.server.uri(), SourceType::Docker);
    src.ping().await.unwrap();

    let info = src.get_import_info(&reg.reference(), ACTIVE).await.unwrap().unwrap();
    let chain = src.get_img_ancestry(&info).await.unwrap();
    assert_eq!(chain.len(), 3);

    let a = reg.layers[0].0.as_str();
    let b = reg.layers[2].0.as_str();
    let c = reg.layers[3].0.as_str();
    assert_eq!(chain[0].uuid, layer_chain_uuid(&[a]));
    assert_eq!(chain[1].uuid, layer_chain_uuid(&[a, b]));
    assert_eq!(chain[2].uuid, layer_chain_uuid(&[a, b, c]));
    assert_eq!(chain[2].uuid, info.uuid);
    assert!(matches!(chain[0].detail, ImportDetail::Layer(_)));

    // Only the manifest was fetched; the chain needed no round trips.
    let requests = reg.server.received_requests().await.unwrap();
    assert_eq!(
        requests.iter().filter(|r| r.url.path() != "/v2/").count(),
        1
    );
}

#[tokio::test]
async fn test_docker_meta_is_synthesized() {
    let reg = registry(&[b"base layer", b"top layer"]).await;
    let src = source(&reg.server.uri(), SourceType::Docker);
    let info = src.get_import_info(&reg.reference(), ACTIVE).await.unwrap().unwrap();
    let chain = src.get_img_ancestry(&info).await.unwrap();

    let base = src.get_img_meta(&chain[0]).await.unwrap().manifest;
    assert_eq!(base.origin, None);
    assert_eq!(base.name, "library/busybox");
    assert_eq!(base.image_type, "docker");
    assert!(base.is_active());
    base.validate().unwrap();

    let leaf = src.get_img_meta(&chain[1]).await.unwrap();
    assert_eq!(leaf.manifest.origin, Some(chain[0].uuid));
    assert_eq!(leaf.manifest.version, "latest");
    assert_eq!(leaf.manifest.published_at.as_deref(), Some("2024-01-02T03:04:05Z"));
    assert_eq!(leaf.size, Some(b"top layer".len() as u64));
    assert_eq!(leaf.checksum.unwrap().to_string(), reg.layers[1].0);

    let tags = leaf.manifest.tags.unwrap();
    assert_eq!(tags["docker:repo"], "library/busybox");
    assert_eq!(tags["docker:tag"], "latest");
}

#[tokio::test]
async fn test_docker_skips_uuids_and_cannot_list() {
    let reg = registry(&[b"only"]).await;
    let src = source(&reg.server.uri(), SourceType::Docker);

    let uuid = Uuid::new_v4().to_string();
    assert!(src.get_import_info(&uuid, ACTIVE).await.unwrap().is_none());
    assert!(src
        .get_import_info("ghcr.io/org/app:v1", ACTIVE)
        .await
        .unwrap()
        .is_none());
    assert!(matches!(src.list_images().await.unwrap(), ListOutcome::Unsupported));
}

#[tokio::test]
async fn test_docker_answers_bearer_challenge() {
    let server = MockServer::start().await;
    let data = b"layer".to_vec();
    let manifest = json!({
        "schemaVersion": 2,
        "config": {
            "mediaType": "application/vnd.docker.container.image.v1+json",
            "digest": sha256(b"{}"),
            "size": 2,
        },
        "layers": [{
            "mediaType": "application/vnd.docker.image.rootfs.diff.tar",
            "digest": sha256(&data),
            "size": data.len(),
        }],
    });
    let challenge = format!(
        r#"Bearer realm="{}/token",service="mock-registry""#,
        server.uri()
    );

    Mock::given(method("GET"))
        .and(path("/token"))
        .and(query_param("service", "mock-registry"))
        .and(query_param("scope", "repository:library/busybox:pull"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "token": "anon" })))
        .expect(1)
        .mount(&server)
        .await;
    let authorized = [
        (
            "/v2/library/busybox/manifests/latest".to_string(),
            serde_json::to_vec(&manifest).unwrap(),
        ),
        (format!("/v2/library/busybox/blobs/{}", sha256(&data)), data.clone()),
    ];
    for (at, body) in authorized {
        Mock::given(method("GET"))
            .and(path(at))
            .and(header("authorization", "Bearer anon"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
            .mount(&server)
            .await;
    }
    Mock::given(method("GET"))
        .respond_with(
            ResponseTemplate::new(401).insert_header("WWW-Authenticate", challenge.as_str()),
        )
        .with_priority(10)
        .mount(&server)
        .await;

    let src = source(&server.uri(), SourceType::Docker);
    let host = server.uri().trim_start_matches("http://").to_string();
    let info = src
        .get_import_info(&format!("{host}/library/busybox:latest"), ACTIVE)
        .await
        .unwrap()
        .unwrap();
    let chain = src.get_img_ancestry(&info).await.unwrap();
    let stream = src.get_img_file_stream(&chain[0]).await.unwrap();
    assert_eq!(stream.size, Some(data.len() as u64));

    // The blob request reused the cached token.
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.iter().filter(|r| r.url.path() == "/token").count(), 1);
}

#[tokio::test]
async fn test_docker_unauthorized_without_challenge() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/v2/library/busybox/manifests/latest"))
        .respond_with(ResponseTemplate::new(401))
        .mount(&server)
        .await;

    let src = source(&server.uri(), SourceType::Docker);
    let host = server.uri().trim_start_matches("http://").to_string();
    let err = src
        .get_import_info(&format!("{host}/library/busybox:latest"), ACTIVE)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "DownloadError");
    assert!(err.to_string().contains("requires authentication"));
}

// --- registry ---

fn empty_registry(temp_dir: &TempDir) -> SourceRegistry {
    let config = PersistedConfig {
        sources: Some(vec![]),
        ..PersistedConfig::default()
    };
    SourceRegistry::new(
        ConfigStore::new(temp_dir.path().join(CONFIG_FILE)),
        config,
        SourceContext::default(),
    )
}

#[tokio::test]
async fn test_registry_add_pings_and_persists() {
    let server = MockServer::start().await;
    mount_json(&server, "/ping".into(), json!({ "imgapi": true })).await;
    let temp_dir = TempDir::new().unwrap();
    let mut registry = empty_registry(&temp_dir);

    assert!(registry.add(&server.uri(), None, false, false).await.unwrap());
    // Same source after normalization: no change.
    let again = format!("{}/", server.uri());
    assert!(!registry.add(&again, None, false, false).await.unwrap());
    assert_eq!(registry.sources().len(), 1);

    let saved = ConfigStore::new(temp_dir.path().join(CONFIG_FILE))
        .load()
        .await
        .unwrap();
    let sources = saved.sources.unwrap();
    assert_eq!(sources.len(), 1);
    assert_eq!(sources[0].url, server.uri());
    assert_eq!(sources[0].source_type, Some(SourceType::Imgapi));
}

#[tokio::test]
async fn test_registry_rejects_dead_source_unless_forced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/ping"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;
    let temp_dir = TempDir::new().unwrap();
    let mut registry = empty_registry(&temp_dir);

    let err = registry
        .add(&server.uri(), Some(SourceType::Imgapi), false, false)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "SourcePingError");
    assert!(registry.sources().is_empty());
    assert!(!temp_dir.path().join(CONFIG_FILE).exists());

    assert!(registry
        .add(&server.uri(), Some(SourceType::Imgapi), false, true)
        .await
        .unwrap());
}

#[tokio::test]
async fn test_update_urls_pings_only_new_sources() {
    let known = MockServer::start().await;
    let fresh = MockServer::start().await;
    mount_json(&fresh, "/ping".into(), json!({ "imgapi": true })).await;
    let temp_dir = TempDir::new().unwrap();
    let mut registry = empty_registry(&temp_dir);
    registry
        .add(&known.uri(), Some(SourceType::Imgapi), false, true)
        .await
        .unwrap();

    let changes = registry
        .update_urls(vec![(fresh.uri(), None), (known.uri(), None)], false)
        .await
        .unwrap();
    assert_eq!(changes.len(), 1);
    assert!(known.received_requests().await.unwrap().is_empty());

    let urls: Vec<String> = registry.records().into_iter().map(|r| r.url).collect();
    assert_eq!(urls, vec![fresh.uri(), known.uri()]);
}
