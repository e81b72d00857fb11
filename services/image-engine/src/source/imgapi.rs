//! Modern image catalog backend.

use std::fmt;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;
use vmimg_manifest::{is_canonical_uuid, upgrade_manifest, Manifest};

use super::{
    get_json_opt, http_client, open_file_stream, truncate, walk_origin_chain, AncestryEntry,
    FileStream, ImageSource, ImgMeta, ImportDetail, ImportInfo, ImportOptions, ListOutcome,
    SourceContext, SourceRecord,
};
use crate::error::ImgError;

/// Client for an image catalog serving `/ping`, `/images`, `/images/<uuid>`
/// and `/images/<uuid>/file`.
pub struct ImgapiSource {
    record: SourceRecord,
    client: Client,
    ctx: SourceContext,
}

impl ImgapiSource {
    pub fn new(record: SourceRecord, ctx: &SourceContext) -> Result<Self, ImgError> {
        let client = http_client(&record, ctx)?;
        Ok(Self {
            record,
            client,
            ctx: ctx.clone(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.record.url, path)
    }

    async fn get_manifest(&self, uuid: &str) -> Result<Option<Manifest>, ImgError> {
        let url = self.url(&format!("/images/{uuid}"));
        let desc = self.to_string();
        match get_json_opt(&self.client, &desc, &url, self.ctx.request_timeout).await? {
            Some(raw) => Ok(Some(upgrade_manifest(raw)?)),
            None => Ok(None),
        }
    }
}

impl fmt::Display for ImgapiSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.record, f)
    }
}

/// Shared `get_import_info` rules for catalog backends.
pub(super) fn catalog_import_info(
    arg: &str,
    manifest: Option<Manifest>,
    opts: ImportOptions,
) -> Result<Option<ImportInfo>, ImgError> {
    let Some(manifest) = manifest else {
        if opts.err_on_404 {
            return Err(ImgError::ImageNotFound {
                arg: arg.to_string(),
            });
        }
        return Ok(None);
    };

    if opts.ensure_active && !manifest.is_active() {
        if opts.err_on_404 {
            return Err(ImgError::ActiveImageNotFound {
                arg: arg.to_string(),
            });
        }
        return Ok(None);
    }

    Ok(Some(ImportInfo {
        uuid: manifest.uuid,
        detail: ImportDetail::Catalog(Box::new(manifest)),
    }))
}

/// Metadata for a catalog entry is the manifest it already carries.
pub(super) fn catalog_meta(entry: &AncestryEntry) -> Result<ImgMeta, ImgError> {
    let ImportDetail::Catalog(manifest) = &entry.detail else {
        return Err(ImgError::internal(format!(
            "catalog source given a non-catalog entry for {}",
            entry.uuid
        )));
    };
    let file = manifest.file();
    Ok(ImgMeta {
        size: file.map(|f| f.size),
        checksum: file.and_then(|f| f.checksum()),
        manifest: manifest.as_ref().clone(),
    })
}

/// Parse a list response into upgraded manifests, skipping bad entries.
pub(super) fn parse_manifest_list(desc: &str, raw: Value) -> Result<Vec<Manifest>, ImgError> {
    let Value::Array(items) = raw else {
        return Err(ImgError::download(format!(
            "image list from {desc} is not an array"
        )));
    };
    Ok(items
        .into_iter()
        .filter_map(|item| match upgrade_manifest(item) {
            Ok(manifest) => Some(manifest),
            Err(err) => {
                debug!(source = %desc, error = %err, "Skipping unparseable manifest");
                None
            }
        })
        .collect())
}

#[async_trait]
impl ImageSource for ImgapiSource {
    fn record(&self) -> &SourceRecord {
        &self.record
    }

    async fn ping(&self) -> Result<(), ImgError> {
        let ping_error = |message: String, cause: Option<crate::error::BoxError>| {
            ImgError::SourcePing {
                desc: self.to_string(),
                message,
                cause,
            }
        };

        let response = self
            .client
            .get(self.url("/ping"))
            .timeout(self.ctx.request_timeout)
            .send()
            .await
            .map_err(|err| ping_error("request failed".to_string(), Some(Box::new(err))))?;
        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| ping_error("could not read body".to_string(), Some(Box::new(err))))?;

        if status != StatusCode::OK {
            return Err(ping_error(format!("HTTP {status}: {}", truncate(&body, 1024)), None));
        }
        match serde_json::from_str::<Value>(&body) {
            Ok(value) if value.get("imgapi").and_then(Value::as_bool) == Some(true) => Ok(()),
            _ => Err(ping_error(
                format!("not an image catalog: {}", truncate(&body, 1024)),
                None,
            )),
        }
    }

    async fn list_images(&self) -> Result<ListOutcome, ImgError> {
        let desc = self.to_string();
        let raw = get_json_opt(&self.client, &desc, &self.url("/images"), self.ctx.request_timeout)
            .await?
            .unwrap_or(Value::Array(Vec::new()));
        Ok(ListOutcome::Images(parse_manifest_list(&desc, raw)?))
    }

    async fn get_import_info(
        &self,
        arg: &str,
        opts: ImportOptions,
    ) -> Result<Option<ImportInfo>, ImgError> {
        if !is_canonical_uuid(arg) {
            return Ok(None);
        }
        let manifest = self.get_manifest(arg).await?;
        catalog_import_info(arg, manifest, opts)
    }

    async fn get_img_ancestry(&self, info: &ImportInfo) -> Result<Vec<AncestryEntry>, ImgError> {
        walk_origin_chain(self, info).await
    }

    async fn get_img_meta(&self, entry: &AncestryEntry) -> Result<ImgMeta, ImgError> {
        catalog_meta(entry)
    }

    async fn get_img_file_stream(&self, entry: &AncestryEntry) -> Result<FileStream, ImgError> {
        let url = self.url(&format!("/images/{}/file", entry.uuid));
        debug!(url = %url, "Opening image file stream");
        open_file_stream(&self.client, &self.to_string(), &url).await
    }
}
