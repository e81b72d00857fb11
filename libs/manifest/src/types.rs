//! Manifest data model.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ManifestError;

/// Lifecycle state of an image in its catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageState {
    Creating,
    Unactivated,
    Active,
    Disabled,
    Failed,
}

impl ImageState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageState::Creating => "creating",
            ImageState::Unactivated => "unactivated",
            ImageState::Active => "active",
            ImageState::Disabled => "disabled",
            ImageState::Failed => "failed",
        }
    }
}

impl fmt::Display for ImageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compression applied to an image file as published.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    #[default]
    None,
    Gzip,
    Bzip2,
}

impl Compression {
    pub fn as_str(&self) -> &'static str {
        match self {
            Compression::None => "none",
            Compression::Gzip => "gzip",
            Compression::Bzip2 => "bzip2",
        }
    }

    /// Guess the compression from a file name extension.
    pub fn from_path(path: &str) -> Self {
        if path.ends_with(".bz2") {
            Compression::Bzip2
        } else if path.ends_with(".gz") || path.ends_with(".tgz") {
            Compression::Gzip
        } else {
            Compression::None
        }
    }
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Digest algorithms a file descriptor may name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumAlgorithm {
    Sha1,
    Sha256,
    Md5,
}

impl ChecksumAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChecksumAlgorithm::Sha1 => "sha1",
            ChecksumAlgorithm::Sha256 => "sha256",
            ChecksumAlgorithm::Md5 => "md5",
        }
    }

    /// Length of the hex-encoded digest.
    pub fn hex_len(&self) -> usize {
        match self {
            ChecksumAlgorithm::Sha1 => 40,
            ChecksumAlgorithm::Sha256 => 64,
            ChecksumAlgorithm::Md5 => 32,
        }
    }
}

/// A digest tagged with its algorithm, written `algo:hex`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Checksum {
    pub algorithm: ChecksumAlgorithm,
    pub hex: String,
}

impl Checksum {
    pub fn new(algorithm: ChecksumAlgorithm, hex: impl Into<String>) -> Self {
        Self {
            algorithm,
            hex: hex.into().to_ascii_lowercase(),
        }
    }
}

impl FromStr for Checksum {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (algo, hex) = s
            .split_once(':')
            .ok_or_else(|| format!("digest \"{s}\" is not of the form <algorithm>:<hex>"))?;
        let algorithm = match algo {
            "sha1" => ChecksumAlgorithm::Sha1,
            "sha256" => ChecksumAlgorithm::Sha256,
            "md5" => ChecksumAlgorithm::Md5,
            other => return Err(format!("unsupported digest algorithm \"{other}\"")),
        };
        if hex.len() != algorithm.hex_len() || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(format!(
                "{} digest must be {} hex characters",
                algorithm.as_str(),
                algorithm.hex_len()
            ));
        }
        Ok(Checksum::new(algorithm, hex))
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), self.hex)
    }
}

/// Content file descriptor. A manifest has at most one.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImageFile {
    #[serde(default)]
    pub size: u64,

    #[serde(default)]
    pub compression: Compression,

    /// Legacy hex SHA-1 of the file as published.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha1: Option<String>,

    /// Algorithm-tagged digest (`sha256:<hex>`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Backend-specific fields (`path`, `url`, `dataset_guid`, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ImageFile {
    /// The digest the content must match: `digest` when present, else `sha1`.
    pub fn checksum(&self) -> Option<Checksum> {
        if let Some(digest) = &self.digest {
            return digest.parse().ok();
        }
        self.sha1
            .as_ref()
            .map(|hex| Checksum::new(ChecksumAlgorithm::Sha1, hex.as_str()))
    }

    /// Look up a string-valued backend field such as `path` or `url`.
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }
}

fn default_image_type() -> String {
    "zone-dataset".to_string()
}

fn default_state() -> ImageState {
    ImageState::Active
}

/// Descriptive record for one image, at the current schema version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub v: u32,

    pub uuid: Uuid,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub homepage: Option<String>,

    #[serde(default = "default_state")]
    pub state: ImageState,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub public: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acl: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,

    #[serde(rename = "type", default = "default_image_type")]
    pub image_type: String,

    #[serde(default)]
    pub os: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<Uuid>,

    #[serde(default)]
    pub files: Vec<ImageFile>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tags: Option<Map<String, Value>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requirements: Option<Value>,

    /// Fields this model does not name are carried through untouched.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Manifest {
    /// Parse a manifest that is already at the current schema version.
    ///
    /// Prefer [`crate::upgrade_manifest`] for anything read from a catalog
    /// or from disk.
    pub fn from_value(value: Value) -> Result<Self, ManifestError> {
        Ok(serde_json::from_value(value)?)
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    /// The single content file, if any.
    pub fn file(&self) -> Option<&ImageFile> {
        self.files.first()
    }

    pub fn is_active(&self) -> bool {
        self.state == ImageState::Active
    }

    /// Short `name@version` label for logs and tables.
    pub fn label(&self) -> String {
        if self.version.is_empty() {
            self.name.clone()
        } else {
            format!("{}@{}", self.name, self.version)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("sha1:da39a3ee5e6b4b0d3255bfef95601890afd80709", ChecksumAlgorithm::Sha1)]
    #[case(
        "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855",
        ChecksumAlgorithm::Sha256
    )]
    #[case("md5:d41d8cd98f00b204e9800998ecf8427e", ChecksumAlgorithm::Md5)]
    fn checksum_parses(#[case] input: &str, #[case] algorithm: ChecksumAlgorithm) {
        let checksum: Checksum = input.parse().unwrap();
        assert_eq!(checksum.algorithm, algorithm);
        assert_eq!(checksum.to_string(), input);
    }

    #[rstest]
    #[case("deadbeef")]
    #[case("sha1:deadbeef")]
    #[case("crc32:deadbeef")]
    #[case("sha1:zz39a3ee5e6b4b0d3255bfef95601890afd80709")]
    fn checksum_rejects(#[case] input: &str) {
        assert!(input.parse::<Checksum>().is_err());
    }

    #[test]
    fn file_checksum_prefers_tagged_digest() {
        let file = ImageFile {
            sha1: Some("da39a3ee5e6b4b0d3255bfef95601890afd80709".to_string()),
            digest: Some(
                "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
                    .to_string(),
            ),
            ..Default::default()
        };
        assert_eq!(
            file.checksum().unwrap().algorithm,
            ChecksumAlgorithm::Sha256
        );

        let legacy = ImageFile {
            sha1: Some("DA39A3EE5E6B4B0D3255BFEF95601890AFD80709".to_string()),
            ..Default::default()
        };
        let checksum = legacy.checksum().unwrap();
        assert_eq!(checksum.algorithm, ChecksumAlgorithm::Sha1);
        assert_eq!(checksum.hex, "da39a3ee5e6b4b0d3255bfef95601890afd80709");
    }

    #[rstest]
    #[case("base-64-18.1.0.zfs.bz2", Compression::Bzip2)]
    #[case("base.zfs.gz", Compression::Gzip)]
    #[case("base.tgz", Compression::Gzip)]
    #[case("base.zfs", Compression::None)]
    fn compression_from_path(#[case] path: &str, #[case] expected: Compression) {
        assert_eq!(Compression::from_path(path), expected);
    }

    #[test]
    fn unknown_fields_survive_roundtrip() {
        let value = serde_json::json!({
            "v": 2,
            "uuid": "8d8b7b5e-9a3d-4e7c-bb1f-6c7a2b3e4f50",
            "name": "base",
            "version": "1.0.0",
            "state": "active",
            "type": "zone-dataset",
            "os": "smartos",
            "files": [{ "size": 10, "compression": "gzip", "path": "base.zfs.gz" }],
            "billing_tags": ["small"]
        });
        let manifest = Manifest::from_value(value).unwrap();
        assert_eq!(manifest.extra.get("billing_tags"), Some(&serde_json::json!(["small"])));
        assert_eq!(manifest.file().unwrap().extra_str("path"), Some("base.zfs.gz"));

        let back = manifest.to_value();
        assert_eq!(back["billing_tags"], serde_json::json!(["small"]));
        assert_eq!(back["files"][0]["path"], "base.zfs.gz");
    }
}
