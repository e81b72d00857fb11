//! Layered-registry backend (Docker Registry HTTP API v2).
//!
//! A registry image is a list of layer blobs. Each layer becomes one local
//! image whose uuid is derived from the digests of itself and every layer
//! below it, and whose origin is the layer below.
//!
//! Reference: https://github.com/opencontainers/distribution-spec

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, trace};
use uuid::Uuid;
use vmimg_manifest::{
    is_canonical_uuid, layer_chain_uuid, upgrade_manifest, Checksum, Compression,
};

use super::{
    file_stream_from, http_client, status_error, AncestryEntry, FileStream, ImageSource, ImgMeta,
    ImportDetail, ImportInfo, ImportOptions, ListOutcome, SourceContext, SourceRecord,
};
use crate::error::ImgError;

const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

/// Hostnames that all mean the public default registry.
const DEFAULT_REGISTRY_ALIASES: &[&str] = &["docker.io", "index.docker.io", DEFAULT_REGISTRY];

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.manifest.v1+json, \
     application/vnd.docker.distribution.manifest.v2+json";

/// Registry image manifest.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryManifest {
    pub schema_version: u32,
    #[serde(default)]
    pub media_type: Option<String>,
    pub config: Descriptor,
    pub layers: Vec<Descriptor>,
}

/// Content descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    pub media_type: String,
    pub digest: String,
    pub size: u64,
}

/// One layer of a resolved registry image.
#[derive(Debug, Clone)]
pub struct DockerLayer {
    pub repo: String,
    /// Tag or digest the user asked for.
    pub reference: String,
    pub config: Descriptor,
    /// Deduplicated layers of the whole image, base first.
    pub chain: Arc<Vec<Descriptor>>,
    /// Position of this layer in `chain`.
    pub index: usize,
}

impl DockerLayer {
    pub fn descriptor(&self) -> &Descriptor {
        &self.chain[self.index]
    }

    pub fn is_leaf(&self) -> bool {
        self.index + 1 == self.chain.len()
    }

    fn digests(&self, upto: usize) -> Vec<&str> {
        self.chain[..=upto].iter().map(|d| d.digest.as_str()).collect()
    }

    pub fn uuid(&self) -> Uuid {
        layer_chain_uuid(&self.digests(self.index))
    }

    pub fn parent_uuid(&self) -> Option<Uuid> {
        self.index
            .checked_sub(1)
            .map(|parent| layer_chain_uuid(&self.digests(parent)))
    }

    fn at(&self, index: usize) -> ImportInfo {
        let layer = DockerLayer {
            index,
            ..self.clone()
        };
        ImportInfo {
            uuid: layer.uuid(),
            detail: ImportDetail::Layer(layer),
        }
    }
}

/// Drop any layer whose digest equals the one right before it.
///
/// Metadata-only build steps can repeat the previous layer verbatim.
pub fn dedupe_consecutive(layers: Vec<Descriptor>) -> Vec<Descriptor> {
    let mut out: Vec<Descriptor> = Vec::with_capacity(layers.len());
    for layer in layers {
        if out.last().map(|prev| prev.digest == layer.digest) != Some(true) {
            out.push(layer);
        }
    }
    out
}

/// Parse an image reference into registry, repo, and tag/digest components.
///
/// Examples:
/// - `alpine:latest` -> (registry-1.docker.io, library/alpine, latest)
/// - `ghcr.io/org/repo:v1` -> (ghcr.io, org/repo, v1)
/// - `registry.example.com/foo/bar@sha256:abc...` -> (registry.example.com, foo/bar, sha256:abc...)
pub fn parse_image_ref(image_ref: &str) -> Result<(String, String, String), ImgError> {
    let invalid = || ImgError::Usage(format!("invalid image reference \"{image_ref}\""));
    if image_ref.is_empty() || image_ref.chars().any(char::is_whitespace) {
        return Err(invalid());
    }

    let (name_part, reference) = if let Some((name, digest)) = image_ref.rsplit_once('@') {
        (name, digest.to_string())
    } else if let Some((name, tag)) = image_ref.rsplit_once(':') {
        // A colon inside the registry host is a port, not a tag.
        if tag.contains('/') {
            (image_ref, "latest".to_string())
        } else {
            (name, tag.to_string())
        }
    } else {
        (image_ref, "latest".to_string())
    };
    if name_part.is_empty() || reference.is_empty() {
        return Err(invalid());
    }

    let (registry, repo) = match name_part.split_once('/') {
        None => (DEFAULT_REGISTRY.to_string(), format!("library/{name_part}")),
        Some((first, rest))
            if first.contains('.') || first.contains(':') || first == "localhost" =>
        {
            (first.to_string(), rest.to_string())
        }
        Some(_) => (DEFAULT_REGISTRY.to_string(), name_part.to_string()),
    };
    if repo.is_empty() || repo.ends_with('/') {
        return Err(invalid());
    }

    Ok((registry, repo, reference))
}

fn compression_for(media_type: &str) -> Compression {
    if media_type.ends_with("gzip") {
        Compression::Gzip
    } else {
        Compression::None
    }
}

/// Bearer challenge from a registry's `WWW-Authenticate` header.
#[derive(Debug, Default, PartialEq, Eq)]
struct AuthChallenge {
    realm: String,
    service: Option<String>,
    scope: Option<String>,
}

/// Token service response. Registries answer with either field.
#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
fn parse_www_authenticate(header: &str) -> Option<AuthChallenge> {
    let (scheme, params) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    trace!(header = %header, "Parsing registry auth challenge");

    let mut challenge = AuthChallenge::default();
    for param in split_challenge_params(params) {
        let Some((key, value)) = param.split_once('=') else {
            continue;
        };
        let value = value.trim().trim_matches('"').to_string();
        match key.trim() {
            "realm" => challenge.realm = value,
            "service" => challenge.service = Some(value),
            "scope" => challenge.scope = Some(value),
            _ => {}
        }
    }
    (!challenge.realm.is_empty()).then_some(challenge)
}

/// Split challenge parameters on commas outside quoted values.
fn split_challenge_params(params: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut quoted = false;
    for (i, c) in params.char_indices() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => {
                parts.push(&params[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&params[start..]);
    parts
}

/// Leading hex digits of a digest, for display.
fn short_digest(digest: &str) -> &str {
    let hex = digest.split_once(':').map_or(digest, |(_, hex)| hex);
    hex.get(..12).unwrap_or(hex)
}

/// Client for a layered registry.
pub struct DockerSource {
    record: SourceRecord,
    client: Client,
    ctx: SourceContext,
    /// Registry API root.
    api_base: String,
    /// Registry host as it appears in image references.
    host: String,
    /// Bearer tokens from the registry's token service, per repository.
    tokens: RwLock<HashMap<String, String>>,
}

impl DockerSource {
    pub fn new(record: SourceRecord, ctx: &SourceContext) -> Result<Self, ImgError> {
        let url = Url::parse(&record.url)
            .map_err(|err| ImgError::config_with(format!("invalid registry URL \"{}\"", record.url), err))?;
        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ImgError::config(format!(
                    "registry URL \"{}\" has no host",
                    record.url
                )))
            }
        };
        let api_base = if DEFAULT_REGISTRY_ALIASES.contains(&host.as_str()) {
            format!("https://{DEFAULT_REGISTRY}")
        } else {
            record.url.trim_end_matches('/').to_string()
        };
        let client = http_client(&record, ctx)?;

        Ok(Self {
            record,
            client,
            ctx: ctx.clone(),
            api_base,
            host,
            tokens: RwLock::new(HashMap::new()),
        })
    }

    fn serves_registry(&self, registry: &str) -> bool {
        if registry == self.host {
            return true;
        }
        DEFAULT_REGISTRY_ALIASES.contains(&registry)
            && DEFAULT_REGISTRY_ALIASES.contains(&self.host.as_str())
    }

    /// Token for `repo`: one fetched from the token service, else the configured one.
    async fn token_for(&self, repo: &str) -> Option<String> {
        if let Some(token) = self.tokens.read().await.get(repo) {
            return Some(token.clone());
        }
        self.ctx.registry_token.clone()
    }

    fn auth_required(&self, repo: &str) -> ImgError {
        ImgError::download(format!(
            "{self} requires authentication for {repo} (set VMIMG_REGISTRY_TOKEN)"
        ))
    }

    /// GET `url` within `repo`, answering a bearer challenge once.
    ///
    /// `build` adds per-request headers and timeouts.
    async fn authorized_get(
        &self,
        repo: &str,
        url: &str,
        build: impl Fn(RequestBuilder) -> RequestBuilder,
    ) -> Result<Response, ImgError> {
        let request = |token: Option<&str>| {
            let request = build(self.client.get(url));
            match token {
                Some(token) => request.bearer_auth(token),
                None => request,
            }
        };

        let token = self.token_for(repo).await;
        let response = request(token.as_deref()).send().await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Ok(response);
        }

        let Some(challenge) = response
            .headers()
            .get(WWW_AUTHENTICATE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_www_authenticate)
        else {
            return Err(self.auth_required(repo));
        };
        let token = self.fetch_token(repo, &challenge).await?;
        self.tokens
            .write()
            .await
            .insert(repo.to_string(), token.clone());

        let response = request(Some(&token)).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            return Err(self.auth_required(repo));
        }
        Ok(response)
    }

    /// Request a pull token from the challenge's realm.
    async fn fetch_token(&self, repo: &str, challenge: &AuthChallenge) -> Result<String, ImgError> {
        let scope = challenge
            .scope
            .clone()
            .unwrap_or_else(|| format!("repository:{repo}:pull"));
        let mut query = vec![("scope", scope)];
        if let Some(service) = &challenge.service {
            query.push(("service", service.clone()));
        }
        debug!(realm = %challenge.realm, repo = %repo, "Requesting registry token");

        let response = self
            .client
            .get(&challenge.realm)
            .query(&query)
            .timeout(self.ctx.request_timeout)
            .send()
            .await
            .map_err(|err| {
                ImgError::download_with(format!("token request to {} failed", challenge.realm), err)
            })?;
        if response.status() != StatusCode::OK {
            return Err(status_error(&self.to_string(), "token request", response).await);
        }
        let body = response.bytes().await?;
        let parsed: TokenResponse = serde_json::from_slice(&body).map_err(|err| {
            ImgError::download_with(format!("invalid token response from {}", challenge.realm), err)
        })?;
        parsed
            .token
            .or(parsed.access_token)
            .filter(|token| !token.is_empty())
            .ok_or_else(|| {
                ImgError::download(format!("token response from {} has no token", challenge.realm))
            })
    }

    async fn pull_manifest(
        &self,
        repo: &str,
        reference: &str,
    ) -> Result<Option<RegistryManifest>, ImgError> {
        let url = format!("{}/v2/{}/manifests/{}", self.api_base, repo, reference);
        debug!(url = %url, "Pulling registry manifest");

        let timeout = self.ctx.request_timeout;
        let response = self
            .authorized_get(repo, &url, |request| {
                request.header(ACCEPT, MANIFEST_ACCEPT).timeout(timeout)
            })
            .await?;

        match response.status() {
            StatusCode::OK => {
                let body = response.bytes().await?;

                if reference.starts_with("sha256:") {
                    let computed = format!("sha256:{}", hex::encode(Sha256::digest(&body)));
                    if computed != reference {
                        return Err(ImgError::download(format!(
                            "registry manifest digest mismatch: expected {reference}, got {computed}"
                        )));
                    }
                }

                let manifest = serde_json::from_slice(&body).map_err(|err| {
                    ImgError::InvalidManifest {
                        message: format!("unsupported registry manifest for {repo}:{reference}"),
                        cause: Some(Box::new(err)),
                    }
                })?;
                Ok(Some(manifest))
            }
            StatusCode::NOT_FOUND => Ok(None),
            _ => Err(status_error(&self.to_string(), "manifest request", response).await),
        }
    }

    async fn pull_config(&self, layer: &DockerLayer) -> Result<Value, ImgError> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.api_base, layer.repo, layer.config.digest
        );
        let timeout = self.ctx.request_timeout;
        let response = self
            .authorized_get(&layer.repo, &url, |request| request.timeout(timeout))
            .await?;
        if response.status() != StatusCode::OK {
            return Err(status_error(&self.to_string(), "config blob request", response).await);
        }
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|err| {
            ImgError::download_with(format!("invalid image config for {}", layer.repo), err)
        })
    }
}

impl fmt::Display for DockerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.record, f)
    }
}

#[async_trait]
impl ImageSource for DockerSource {
    fn record(&self) -> &SourceRecord {
        &self.record
    }

    async fn ping(&self) -> Result<(), ImgError> {
        let response = self
            .client
            .get(format!("{}/v2/", self.api_base))
            .timeout(self.ctx.request_timeout)
            .send()
            .await
            .map_err(|err| ImgError::SourcePing {
                desc: self.to_string(),
                message: "request failed".to_string(),
                cause: Some(Box::new(err)),
            })?;
        match response.status() {
            StatusCode::OK | StatusCode::UNAUTHORIZED => Ok(()),
            status => Err(ImgError::SourcePing {
                desc: self.to_string(),
                message: format!("HTTP {status} from /v2/"),
                cause: None,
            }),
        }
    }

    async fn list_images(&self) -> Result<ListOutcome, ImgError> {
        Ok(ListOutcome::Unsupported)
    }

    async fn get_import_info(
        &self,
        arg: &str,
        _opts: ImportOptions,
    ) -> Result<Option<ImportInfo>, ImgError> {
        if self.ctx.docker_skip_uuids && is_canonical_uuid(arg) {
            return Ok(None);
        }
        let Ok((registry, repo, reference)) = parse_image_ref(arg) else {
            return Ok(None);
        };
        if !self.serves_registry(&registry) {
            debug!(registry = %registry, source = %self, "Reference names another registry");
            return Ok(None);
        }

        let Some(manifest) = self.pull_manifest(&repo, &reference).await? else {
            return Ok(None);
        };

        let chain = dedupe_consecutive(manifest.layers);
        if chain.is_empty() {
            return Err(ImgError::invalid_manifest(format!(
                "registry image {repo}:{reference} has no layers"
            )));
        }
        info!(
            repo = %repo,
            reference = %reference,
            layer_count = chain.len(),
            "Resolved registry image"
        );

        let leaf = DockerLayer {
            repo,
            reference,
            config: manifest.config,
            index: chain.len() - 1,
            chain: Arc::new(chain),
        };
        Ok(Some(leaf.at(leaf.index)))
    }

    async fn get_img_ancestry(&self, info: &ImportInfo) -> Result<Vec<AncestryEntry>, ImgError> {
        let ImportDetail::Layer(layer) = &info.detail else {
            return Err(ImgError::internal(format!(
                "{self} given a non-registry entry for {}",
                info.uuid
            )));
        };
        Ok((0..=layer.index).map(|i| layer.at(i)).collect())
    }

    async fn get_img_meta(&self, entry: &AncestryEntry) -> Result<ImgMeta, ImgError> {
        let ImportDetail::Layer(layer) = &entry.detail else {
            return Err(ImgError::internal(format!(
                "{self} given a non-registry entry for {}",
                entry.uuid
            )));
        };
        let descriptor = layer.descriptor();
        let short_digest = short_digest(&descriptor.digest);

        let mut tags = json!({
            "docker:repo": layer.repo,
            "docker:layer": descriptor.digest,
        });
        let mut published_at = None;
        if layer.is_leaf() {
            tags["docker:tag"] = json!(layer.reference);
            tags["docker:layers"] = json!(layer.digests(layer.index));
            let config = self.pull_config(layer).await?;
            published_at = config.get("created").cloned();
        }

        let version = if layer.is_leaf() && !layer.reference.starts_with("sha256:") {
            layer.reference.clone()
        } else {
            short_digest.to_string()
        };

        let mut raw = json!({
            "v": 2,
            "uuid": entry.uuid,
            "owner": Uuid::nil(),
            "name": layer.repo,
            "version": version,
            "state": "active",
            "disabled": false,
            "public": true,
            "type": "docker",
            "os": "linux",
            "files": [{
                "size": descriptor.size,
                "digest": descriptor.digest,
                "compression": compression_for(&descriptor.media_type).as_str(),
            }],
            "tags": tags,
        });
        if let Some(parent) = layer.parent_uuid() {
            raw["origin"] = json!(parent);
        }
        if let Some(published_at) = published_at {
            raw["published_at"] = published_at;
        }

        let manifest = upgrade_manifest(raw)?;
        Ok(ImgMeta {
            size: Some(descriptor.size),
            checksum: descriptor.digest.parse::<Checksum>().ok(),
            manifest,
        })
    }

    async fn get_img_file_stream(&self, entry: &AncestryEntry) -> Result<FileStream, ImgError> {
        let ImportDetail::Layer(layer) = &entry.detail else {
            return Err(ImgError::internal(format!(
                "{self} given a non-registry entry for {}",
                entry.uuid
            )));
        };
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.api_base,
            layer.repo,
            layer.descriptor().digest
        );
        debug!(url = %url, "Opening layer blob stream");
        let response = self
            .authorized_get(&layer.repo, &url, |request| request)
            .await
            .map_err(|err| match err {
                ImgError::Http(err) => {
                    ImgError::download_with(format!("error downloading {url}"), err)
                }
                err => err,
            })?;
        file_stream_from(&self.to_string(), response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layer(digest: &str) -> Descriptor {
        Descriptor {
            media_type: "application/vnd.docker.image.rootfs.diff.tar.gzip".to_string(),
            digest: digest.to_string(),
            size: 100,
        }
    }

    #[test]
    fn test_parse_image_ref_simple() {
        let (registry, repo, tag) = parse_image_ref("alpine:latest").unwrap();
        assert_eq!(registry, "registry-1.docker.io");
        assert_eq!(repo, "library/alpine");
        assert_eq!(tag, "latest");
    }

    #[test]
    fn test_parse_image_ref_no_tag() {
        let (_, repo, tag) = parse_image_ref("alpine").unwrap();
        assert_eq!(repo, "library/alpine");
        assert_eq!(tag, "latest");
    }

    #[test]
    fn test_parse_image_ref_custom_registry_and_digest() {
        let (registry, repo, digest) =
            parse_image_ref("ghcr.io/org/app@sha256:abcdef1234567890").unwrap();
        assert_eq!(registry, "ghcr.io");
        assert_eq!(repo, "org/app");
        assert_eq!(digest, "sha256:abcdef1234567890");
    }

    #[test]
    fn test_parse_image_ref_localhost_port() {
        let (registry, repo, tag) = parse_image_ref("localhost:5000/myapp").unwrap();
        assert_eq!(registry, "localhost:5000");
        assert_eq!(repo, "myapp");
        assert_eq!(tag, "latest");
    }

    #[test]
    fn test_parse_image_ref_rejects_garbage() {
        assert!(parse_image_ref("").is_err());
        assert!(parse_image_ref("has space").is_err());
        assert!(parse_image_ref("alpine:").is_err());
    }

    #[test]
    fn parses_bearer_challenge() {
        let challenge = parse_www_authenticate(
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:library/busybox:pull""#,
        )
        .unwrap();
        assert_eq!(challenge.realm, "https://auth.docker.io/token");
        assert_eq!(challenge.service.as_deref(), Some("registry.docker.io"));
        assert_eq!(
            challenge.scope.as_deref(),
            Some("repository:library/busybox:pull")
        );
    }

    #[test]
    fn challenge_scope_may_contain_commas() {
        let challenge =
            parse_www_authenticate(r#"Bearer realm="http://a/token",scope="repository:x:pull,push""#)
                .unwrap();
        assert_eq!(challenge.scope.as_deref(), Some("repository:x:pull,push"));
        assert_eq!(challenge.service, None);
    }

    #[test]
    fn rejects_non_bearer_challenges() {
        assert_eq!(parse_www_authenticate(r#"Basic realm="registry""#), None);
        assert_eq!(parse_www_authenticate(r#"Bearer service="x""#), None);
        assert_eq!(parse_www_authenticate(""), None);
    }

    #[test]
    fn short_digest_never_splits_characters() {
        assert_eq!(short_digest("sha256:0123456789abcdef"), "0123456789ab");
        assert_eq!(short_digest("sha256:abc"), "abc");
        // Byte 12 falls inside a two-byte character.
        assert_eq!(short_digest("sha256:aéééééééééé"), "aéééééééééé");
        assert_eq!(short_digest("nodigest"), "nodigest");
    }

    #[test]
    fn dedupes_only_consecutive_digests() {
        let layers = vec![layer("sha256:a"), layer("sha256:a"), layer("sha256:b"), layer("sha256:c")];
        let digests: Vec<_> = dedupe_consecutive(layers)
            .into_iter()
            .map(|d| d.digest)
            .collect();
        assert_eq!(digests, vec!["sha256:a", "sha256:b", "sha256:c"]);

        let layers = vec![layer("sha256:a"), layer("sha256:b"), layer("sha256:a")];
        assert_eq!(dedupe_consecutive(layers).len(), 3);
    }

    #[test]
    fn layer_uuids_chain_to_parents() {
        let chain = Arc::new(vec![layer("sha256:a"), layer("sha256:b"), layer("sha256:c")]);
        let leaf = DockerLayer {
            repo: "library/busybox".to_string(),
            reference: "latest".to_string(),
            config: layer("sha256:cfg"),
            chain,
            index: 2,
        };
        let entries: Vec<_> = (0..=2).map(|i| leaf.at(i)).collect();

        assert_eq!(entries[0].uuid, layer_chain_uuid(&["sha256:a"]));
        assert_eq!(entries[2].uuid, layer_chain_uuid(&["sha256:a", "sha256:b", "sha256:c"]));
        assert_eq!(leaf.parent_uuid(), Some(entries[1].uuid));

        let ImportDetail::Layer(base) = &entries[0].detail else {
            panic!("expected layer");
        };
        assert_eq!(base.parent_uuid(), None);
        assert!(!base.is_leaf());
        assert!(leaf.is_leaf());
    }
}
