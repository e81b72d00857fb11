//! Legacy dataset catalog backend.
//!
//! Source URLs for this backend end in `/datasets`; the API root is the URL
//! without that suffix. Records are version 1 manifests and are upgraded
//! before they leave this module.

use std::fmt;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use tracing::debug;
use vmimg_manifest::is_canonical_uuid;

use super::imgapi::{catalog_import_info, catalog_meta, parse_manifest_list};
use super::{
    get_json_opt, http_client, open_file_stream, walk_origin_chain, AncestryEntry, FileStream,
    ImageSource, ImgMeta, ImportDetail, ImportInfo, ImportOptions, ListOutcome, SourceContext,
    SourceRecord,
};
use crate::error::ImgError;

const DATASETS_SUFFIX: &str = "/datasets";

/// Client for a legacy catalog serving `/ping` and `/datasets[/<uuid>]`.
pub struct DsapiSource {
    record: SourceRecord,
    base: String,
    client: Client,
    ctx: SourceContext,
}

impl DsapiSource {
    pub fn new(record: SourceRecord, ctx: &SourceContext) -> Result<Self, ImgError> {
        let base = record
            .url
            .trim_end_matches('/')
            .strip_suffix(DATASETS_SUFFIX)
            .ok_or_else(|| {
                ImgError::config(format!(
                    "dsapi source URL \"{}\" does not end in \"{DATASETS_SUFFIX}\"",
                    record.url
                ))
            })?
            .to_string();
        let client = http_client(&record, ctx)?;
        Ok(Self {
            record,
            base,
            client,
            ctx: ctx.clone(),
        })
    }

    /// API root with the `/datasets` suffix removed.
    pub fn base_url(&self) -> &str {
        &self.base
    }

    fn file_url(&self, entry: &AncestryEntry) -> Result<String, ImgError> {
        let ImportDetail::Catalog(manifest) = &entry.detail else {
            return Err(ImgError::internal(format!(
                "dsapi source given a non-catalog entry for {}",
                entry.uuid
            )));
        };
        let file = manifest.file().ok_or_else(|| {
            ImgError::invalid_manifest(format!("dataset {} has no files", entry.uuid))
        })?;
        if let Some(url) = file.extra_str("url") {
            return Ok(url.to_string());
        }
        let path = file.extra_str("path").ok_or_else(|| {
            ImgError::invalid_manifest(format!("dataset {} file has no path or url", entry.uuid))
        })?;
        Ok(format!("{}/datasets/{}/{}", self.base, entry.uuid, path))
    }
}

impl fmt::Display for DsapiSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.record, f)
    }
}

#[async_trait]
impl ImageSource for DsapiSource {
    fn record(&self) -> &SourceRecord {
        &self.record
    }

    async fn ping(&self) -> Result<(), ImgError> {
        let response = self
            .client
            .get(format!("{}/ping", self.base))
            .timeout(self.ctx.request_timeout)
            .send()
            .await
            .map_err(|err| ImgError::SourcePing {
                desc: self.to_string(),
                message: "request failed".to_string(),
                cause: Some(Box::new(err)),
            })?;
        if response.status() != StatusCode::OK {
            return Err(ImgError::SourcePing {
                desc: self.to_string(),
                message: format!("HTTP {}", response.status()),
                cause: None,
            });
        }
        Ok(())
    }

    async fn list_images(&self) -> Result<ListOutcome, ImgError> {
        let desc = self.to_string();
        let url = format!("{}{DATASETS_SUFFIX}", self.base);
        let raw = get_json_opt(&self.client, &desc, &url, self.ctx.request_timeout)
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
        let url = format!("{}{DATASETS_SUFFIX}/{arg}", self.base);
        let desc = self.to_string();
        let manifest = match get_json_opt(&self.client, &desc, &url, self.ctx.request_timeout).await? {
            Some(raw) => Some(vmimg_manifest::upgrade_manifest(raw)?),
            None => None,
        };
        catalog_import_info(arg, manifest, opts)
    }

    async fn get_img_ancestry(&self, info: &ImportInfo) -> Result<Vec<AncestryEntry>, ImgError> {
        walk_origin_chain(self, info).await
    }

    async fn get_img_meta(&self, entry: &AncestryEntry) -> Result<ImgMeta, ImgError> {
        catalog_meta(entry)
    }

    async fn get_img_file_stream(&self, entry: &AncestryEntry) -> Result<FileStream, ImgError> {
        let url = self.file_url(entry)?;
        debug!(url = %url, "Opening dataset file stream");
        open_file_stream(&self.client, &self.to_string(), &url).await
    }
}
