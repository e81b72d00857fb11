//! Remote image sources.
//!
//! A source is one remote catalog or registry. Three backends share the
//! [`ImageSource`] contract:
//!
//! - [`ImgapiSource`]: modern image catalog (`/images`)
//! - [`DsapiSource`]: legacy dataset catalog (`/datasets`)
//! - [`DockerSource`]: layered registry (Docker Registry HTTP API v2)
//!
//! The backend is picked by explicit [`SourceType`] in [`build_source`].

mod docker;
mod dsapi;
mod imgapi;

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use reqwest::{Client, Response, StatusCode, Url};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use vmimg_manifest::{Checksum, Manifest};

use crate::error::ImgError;
use crate::storage::ByteStream;

pub use docker::{parse_image_ref, DockerLayer, DockerSource};
pub use dsapi::DsapiSource;
pub use imgapi::ImgapiSource;

/// Backend protocol of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceType {
    Imgapi,
    Dsapi,
    Docker,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::Imgapi => "imgapi",
            SourceType::Dsapi => "dsapi",
            SourceType::Docker => "docker",
        }
    }

    /// Guess a catalog type from the URL shape.
    ///
    /// A trailing `/datasets` path means the legacy catalog. Layered
    /// registries are never inferred.
    pub fn infer_from_url(url: &str) -> Self {
        if url.trim_end_matches('/').ends_with("/datasets") {
            SourceType::Dsapi
        } else {
            SourceType::Imgapi
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = ImgError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "imgapi" => Ok(SourceType::Imgapi),
            "dsapi" => Ok(SourceType::Dsapi),
            "docker" => Ok(SourceType::Docker),
            other => Err(ImgError::Usage(format!(
                "unknown source type \"{other}\" (expected imgapi, dsapi or docker)"
            ))),
        }
    }
}

/// Normalize a source URL so equal sources compare equal.
///
/// Adds `http://` when no scheme is given, drops default ports and any
/// trailing slash.
pub fn normalize_url(url: &str) -> Result<String, ImgError> {
    let trimmed = url.trim();
    let with_scheme = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    let parsed = Url::parse(&with_scheme)
        .map_err(|err| ImgError::Usage(format!("invalid source URL \"{url}\": {err}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(ImgError::Usage(format!(
            "invalid source URL \"{url}\": scheme must be http or https"
        )));
    }
    // `Url` already drops ports that match the scheme default.
    Ok(parsed.as_str().trim_end_matches('/').to_string())
}

/// A registered source. Equality is keyed on the normalized URL.
#[derive(Debug, Clone)]
pub struct SourceRecord {
    pub url: String,
    pub source_type: SourceType,
    pub insecure: bool,
    /// Host address resolved once at registration.
    pub address: Option<SocketAddr>,
}

impl SourceRecord {
    pub fn new(url: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            url: url.into(),
            source_type,
            insecure: false,
            address: None,
        }
    }
}

impl PartialEq for SourceRecord {
    fn eq(&self, other: &Self) -> bool {
        self.url == other.url
    }
}

impl Eq for SourceRecord {}

impl fmt::Display for SourceRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{}\" image source \"{}\"", self.source_type, self.url)?;
        if self.insecure {
            f.write_str(" (insecure)")?;
        }
        Ok(())
    }
}

/// Settings shared by every source client.
#[derive(Debug, Clone)]
pub struct SourceContext {
    pub user_agent: String,
    /// Global override: skip TLS verification for every source.
    pub insecure: bool,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub docker_skip_uuids: bool,
    pub registry_token: Option<String>,
}

impl Default for SourceContext {
    fn default() -> Self {
        Self {
            user_agent: format!("vmimg/{}", env!("CARGO_PKG_VERSION")),
            insecure: false,
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            docker_skip_uuids: true,
            registry_token: None,
        }
    }
}

/// Modifiers for [`ImageSource::get_import_info`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ImportOptions {
    /// Treat a non-active image as absent.
    pub ensure_active: bool,
    /// Treat absence as an error instead of `None`.
    pub err_on_404: bool,
}

/// Backend-specific part of an [`ImportInfo`].
#[derive(Debug, Clone)]
pub enum ImportDetail {
    /// Catalog backends already hold the upgraded manifest.
    Catalog(Box<Manifest>),
    /// One layer of a layered-registry image.
    Layer(DockerLayer),
}

/// Enough to fetch metadata and content for one image or layer.
#[derive(Debug, Clone)]
pub struct ImportInfo {
    pub uuid: Uuid,
    pub detail: ImportDetail,
}

/// One element of an ancestry chain.
pub type AncestryEntry = ImportInfo;

/// Result of [`ImageSource::list_images`].
#[derive(Debug, Clone)]
pub enum ListOutcome {
    Images(Vec<Manifest>),
    /// The backend cannot enumerate its images.
    Unsupported,
}

/// Canonical metadata for one entry.
#[derive(Debug, Clone)]
pub struct ImgMeta {
    pub manifest: Manifest,
    pub size: Option<u64>,
    pub checksum: Option<Checksum>,
}

/// Content stream for one entry, positioned at the first byte.
pub struct FileStream {
    pub stream: ByteStream,
    pub size: Option<u64>,
    /// Base64 `Content-MD5` sent by the server, if any.
    pub content_md5: Option<String>,
}

impl fmt::Debug for FileStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileStream")
            .field("size", &self.size)
            .field("content_md5", &self.content_md5)
            .finish_non_exhaustive()
    }
}

/// Uniform contract over every source backend.
#[async_trait]
pub trait ImageSource: Send + Sync + fmt::Display {
    fn record(&self) -> &SourceRecord;

    /// Liveness check. Failure is a `SourcePingError`.
    async fn ping(&self) -> Result<(), ImgError>;

    async fn list_images(&self) -> Result<ListOutcome, ImgError>;

    /// Resolve a user argument. `None` if the argument means nothing to this
    /// backend or names nothing it has.
    async fn get_import_info(
        &self,
        arg: &str,
        opts: ImportOptions,
    ) -> Result<Option<ImportInfo>, ImgError>;

    /// Full chain for `info`, base first, ending with `info` itself.
    async fn get_img_ancestry(&self, info: &ImportInfo) -> Result<Vec<AncestryEntry>, ImgError>;

    async fn get_img_meta(&self, entry: &AncestryEntry) -> Result<ImgMeta, ImgError>;

    async fn get_img_file_stream(&self, entry: &AncestryEntry) -> Result<FileStream, ImgError>;
}

/// Build the backend client for a record.
pub fn build_source(
    record: SourceRecord,
    ctx: &SourceContext,
) -> Result<Arc<dyn ImageSource>, ImgError> {
    Ok(match record.source_type {
        SourceType::Imgapi => Arc::new(ImgapiSource::new(record, ctx)?),
        SourceType::Dsapi => Arc::new(DsapiSource::new(record, ctx)?),
        SourceType::Docker => Arc::new(DockerSource::new(record, ctx)?),
    })
}

/// HTTP client for one source, pinned to its pre-resolved address.
fn http_client(record: &SourceRecord, ctx: &SourceContext) -> Result<Client, ImgError> {
    let mut builder = Client::builder()
        .user_agent(ctx.user_agent.clone())
        .connect_timeout(ctx.connect_timeout);

    if record.insecure || ctx.insecure {
        builder = builder.danger_accept_invalid_certs(true);
    }

    if let Some(address) = record.address {
        if let Some(host) = Url::parse(&record.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
        {
            builder = builder.resolve(&host, address);
        }
    }

    builder
        .build()
        .map_err(|err| ImgError::internal_with("could not build HTTP client", err))
}

/// Map a non-success response to an error, reading a bounded body excerpt.
async fn status_error(desc: &str, what: &str, response: Response) -> ImgError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    ImgError::download(format!(
        "{what} from {desc} failed with HTTP {status}: {}",
        truncate(&body, 1024)
    ))
}

/// Fetch JSON, mapping 404 to `None`.
async fn get_json_opt(
    client: &Client,
    desc: &str,
    url: &str,
    timeout: Duration,
) -> Result<Option<serde_json::Value>, ImgError> {
    let response = client.get(url).timeout(timeout).send().await?;
    match response.status() {
        StatusCode::OK => {
            let body = response.bytes().await?;
            let value = serde_json::from_slice(&body).map_err(|err| {
                ImgError::download_with(format!("invalid JSON from {desc} at {url}"), err)
            })?;
            Ok(Some(value))
        }
        StatusCode::NOT_FOUND => Ok(None),
        _ => Err(status_error(desc, "request", response).await),
    }
}

/// Start streaming a file download.
async fn open_file_stream(
    client: &Client,
    desc: &str,
    url: &str,
) -> Result<FileStream, ImgError> {
    let response = client
        .get(url)
        .send()
        .await
        .map_err(|err| ImgError::download_with(format!("error downloading {url}"), err))?;
    file_stream_from(desc, response).await
}

/// Wrap a file download response as a [`FileStream`].
async fn file_stream_from(desc: &str, response: Response) -> Result<FileStream, ImgError> {
    if response.status() != StatusCode::OK {
        return Err(status_error(desc, "file download", response).await);
    }

    let size = response.content_length();
    let content_md5 = response
        .headers()
        .get("content-md5")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let stream = response.bytes_stream().map_err(std::io::Error::other);

    Ok(FileStream {
        stream: Box::pin(stream),
        size,
        content_md5,
    })
}

/// Walk `origin` pointers one hop at a time, base first.
///
/// A missing origin mid-walk is fatal.
async fn walk_origin_chain<S: ImageSource + ?Sized>(
    source: &S,
    leaf: &ImportInfo,
) -> Result<Vec<AncestryEntry>, ImgError> {
    let mut chain = vec![leaf.clone()];
    let mut next = match &leaf.detail {
        ImportDetail::Catalog(manifest) => manifest.origin,
        ImportDetail::Layer(_) => None,
    };

    while let Some(origin) = next {
        if chain.iter().any(|entry| entry.uuid == origin) {
            return Err(ImgError::invalid_manifest(format!(
                "origin loop at image {origin}"
            )));
        }
        let opts = ImportOptions {
            ensure_active: true,
            err_on_404: true,
        };
        let info = source
            .get_import_info(&origin.to_string(), opts)
            .await?
            .ok_or_else(|| ImgError::ImageNotFound {
                arg: origin.to_string(),
            })?;
        next = match &info.detail {
            ImportDetail::Catalog(manifest) => manifest.origin,
            ImportDetail::Layer(_) => None,
        };
        chain.push(info);
    }

    chain.reverse();
    Ok(chain)
}

fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
