//! Local image database.
//!
//! One JSON file per installed image at `<db_dir>/images/<pool>-<uuid>.json`
//! holding `{manifest, pool, source}`. Storage is authoritative; this is a
//! best-effort cache of where each image came from and what it describes.
//!
//! Writes to different images touch disjoint files, and a record is a
//! deterministic function of its manifest, so no locking is needed.

use std::io::ErrorKind;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::fs;
use tracing::{debug, warn};
use uuid::Uuid;
use vmimg_manifest::{upgrade_manifest, Manifest};

use crate::config::write_atomic;
use crate::error::ImgError;

/// Subdirectory of the db dir that holds records.
const IMAGES_DIR: &str = "images";

/// What the database knows about one (pool, uuid).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageRecord {
    pub uuid: Uuid,
    pub pool: String,
    /// `None` for a stub: the image may exist in storage with no record.
    pub manifest: Option<Manifest>,
    /// URL of the source the image was imported from.
    pub source: Option<String>,
}

impl ImageRecord {
    pub fn stub(pool: &str, uuid: Uuid) -> Self {
        Self {
            uuid,
            pool: pool.to_string(),
            manifest: None,
            source: None,
        }
    }

    pub fn is_stub(&self) -> bool {
        self.manifest.is_none()
    }
}

/// Wire shape of a record file.
#[derive(Debug, Serialize, Deserialize)]
struct RecordFile {
    manifest: Value,
    pool: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    source: Option<String>,
}

/// File-per-record image database.
#[derive(Debug, Clone)]
pub struct LocalDatabase {
    dir: PathBuf,
}

impl LocalDatabase {
    pub fn new(db_dir: PathBuf) -> Self {
        Self {
            dir: db_dir.join(IMAGES_DIR),
        }
    }

    pub fn record_path(&self, pool: &str, uuid: Uuid) -> PathBuf {
        self.dir.join(format!("{pool}-{uuid}.json"))
    }

    /// Load the record for `pool/uuid`.
    ///
    /// Never fails: a missing record is a stub, and an unreadable or
    /// inconsistent one is logged and degraded to a stub.
    pub async fn get(&self, pool: &str, uuid: Uuid) -> ImageRecord {
        let path = self.record_path(pool, uuid);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                return ImageRecord::stub(pool, uuid);
            }
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Could not read image record");
                return ImageRecord::stub(pool, uuid);
            }
        };

        let file: RecordFile = match serde_json::from_str(&content) {
            Ok(file) => file,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Corrupt image record");
                return ImageRecord::stub(pool, uuid);
            }
        };

        let manifest = match upgrade_manifest(file.manifest) {
            Ok(manifest) => manifest,
            Err(err) => {
                warn!(path = %path.display(), error = %err, "Invalid manifest in image record");
                return ImageRecord::stub(pool, uuid);
            }
        };

        if manifest.uuid != uuid {
            warn!(
                path = %path.display(),
                expected = %uuid,
                found = %manifest.uuid,
                "Image record uuid mismatch"
            );
            return ImageRecord::stub(pool, uuid);
        }

        ImageRecord {
            uuid,
            pool: pool.to_string(),
            manifest: Some(manifest),
            source: file.source,
        }
    }

    /// Write (or overwrite) the record for `pool/manifest.uuid`.
    pub async fn put(
        &self,
        pool: &str,
        manifest: &Manifest,
        source: Option<&str>,
    ) -> Result<(), ImgError> {
        let file = RecordFile {
            manifest: manifest.to_value(),
            pool: pool.to_string(),
            source: source.map(str::to_string),
        };
        let content = serde_json::to_vec_pretty(&file)
            .map_err(|err| ImgError::internal_with("could not serialize image record", err))?;
        let path = self.record_path(pool, manifest.uuid);
        write_atomic(&path, &content).await.map_err(|err| {
            ImgError::internal_with(
                format!("could not write image record \"{}\"", path.display()),
                err,
            )
        })?;
        debug!(pool = %pool, uuid = %manifest.uuid, "Image record written");
        Ok(())
    }

    /// Remove the record. Absence is success.
    pub async fn delete(&self, pool: &str, uuid: Uuid) -> Result<(), ImgError> {
        let path = self.record_path(pool, uuid);
        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(pool = %pool, uuid = %uuid, "Image record deleted");
                Ok(())
            }
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(ImgError::internal_with(
                format!("could not delete image record \"{}\"", path.display()),
                err,
            )),
        }
    }
}
