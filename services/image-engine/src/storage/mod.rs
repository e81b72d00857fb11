//! Storage-layer contract.
//!
//! Installed images are immutable snapshot/clone objects named
//! `<pool>/<uuid>`. New objects are created under a staging name, checked,
//! then promoted with an atomic no-replace rename:
//!
//! ```text
//! stage() ──► receive() ──► snapshots pruned ──► commit()
//!    │                                              │
//!    └──────────────── abort() ◄── any failure ─────┘ (before commit only)
//! ```
//!
//! Two backends are provided: [`ZfsStorage`] for production hosts and
//! [`DirStorage`], a plain-directory store for development and tests.

mod dir;
mod zfs;

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;
use vmimg_manifest::is_canonical_uuid;

pub use dir::DirStorage;
pub use zfs::ZfsStorage;

/// A not-yet-drained stream of image bytes.
pub type ByteStream = BoxStream<'static, io::Result<Bytes>>;

/// Name every imported object's single snapshot ends up with.
pub const FINAL_SNAPSHOT: &str = "final";

/// Errors from the storage layer.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The promotion target already exists (a racing import won).
    #[error("storage object already exists: {0}")]
    AlreadyExists(String),

    #[error("storage object not found: {0}")]
    NotFound(String),

    #[error("`{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },

    #[error("storage command timed out: {0}")]
    Timeout(String),

    #[error("storage I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Handle to an object being materialized under a staging name.
///
/// The staging name is unique per attempt, so concurrent imports of the same
/// uuid never write into each other's object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedObject {
    pool: String,
    uuid: Uuid,
    name: String,
}

impl StagedObject {
    pub fn new(pool: &str, uuid: Uuid) -> Self {
        let attempt = Uuid::new_v4().simple().to_string();
        Self {
            pool: pool.to_string(),
            uuid,
            name: format!("{uuid}-partial-{}", &attempt[..8]),
        }
    }

    pub fn pool(&self) -> &str {
        &self.pool
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Staging name within the pool.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Permanent name within the pool.
    pub fn final_name(&self) -> String {
        self.uuid.to_string()
    }
}

/// One object as seen by a storage listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StorageObject {
    pub pool: String,
    pub name: String,
    /// Origin snapshot (`pool/name@snap`) for clones.
    pub origin: Option<String>,
    /// Operator asked for this object to be left out of image listings.
    pub ignore: bool,
    /// Object is the root of a running instance, not an image.
    pub is_instance_root: bool,
}

impl StorageObject {
    /// The image uuid if this object is an installed image.
    ///
    /// Per-disk clones (`<uuid>-disk0`), staging objects, ignored objects and
    /// instance roots are not images.
    pub fn image_uuid(&self) -> Option<Uuid> {
        if self.ignore || self.is_instance_root || !is_canonical_uuid(&self.name) {
            return None;
        }
        self.name.parse().ok()
    }

    /// True if this object was cloned from a snapshot of `pool/uuid`.
    pub fn is_clone_of(&self, pool: &str, uuid: Uuid) -> bool {
        let prefix = format!("{pool}/{uuid}@");
        self.origin
            .as_deref()
            .is_some_and(|origin| origin.starts_with(&prefix))
    }

    pub fn full_name(&self) -> String {
        format!("{}/{}", self.pool, self.name)
    }
}

/// Live snapshots and dependent clones of one image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Children {
    pub snapshots: Vec<String>,
    pub clones: Vec<String>,
}

/// Minimal snapshot/clone store contract the engine depends on.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Reserve a staging name for a new object.
    async fn stage(&self, pool: &str, uuid: Uuid) -> Result<StagedObject, StorageError>;

    /// Create the staged object from a stream. Resolves once the stream is
    /// drained and the object (with its snapshot) exists.
    async fn receive(&self, staged: &StagedObject, stream: ByteStream) -> Result<(), StorageError>;

    /// Snapshot names on the staged object, oldest first.
    async fn staged_snapshots(&self, staged: &StagedObject) -> Result<Vec<String>, StorageError>;

    async fn rename_snapshot(
        &self,
        staged: &StagedObject,
        from: &str,
        to: &str,
    ) -> Result<(), StorageError>;

    async fn destroy_snapshot(&self, staged: &StagedObject, snapshot: &str)
        -> Result<(), StorageError>;

    /// Atomically rename the staged object to its permanent name. Never
    /// replaces: an existing destination yields [`StorageError::AlreadyExists`].
    async fn commit(&self, staged: &StagedObject) -> Result<(), StorageError>;

    /// Destroy the staged object. Absence is success.
    async fn abort(&self, staged: &StagedObject) -> Result<(), StorageError>;

    async fn exists(&self, pool: &str, uuid: Uuid) -> Result<bool, StorageError>;

    async fn children(&self, pool: &str, uuid: Uuid) -> Result<Children, StorageError>;

    async fn list_objects(&self) -> Result<Vec<StorageObject>, StorageError>;

    /// Clone `pool/uuid@final` into `pool/target`.
    async fn clone_image(&self, pool: &str, uuid: Uuid, target: &str)
        -> Result<(), StorageError>;

    /// Recursively destroy `pool/name`.
    async fn destroy(&self, pool: &str, name: &str) -> Result<(), StorageError>;
}

/// Which storage backend to open.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageBackend {
    Zfs,
    Dir(PathBuf),
}

impl StorageBackend {
    pub fn open(&self) -> Arc<dyn Storage> {
        match self {
            StorageBackend::Zfs => Arc::new(ZfsStorage::new()),
            StorageBackend::Dir(root) => Arc::new(DirStorage::new(root.clone())),
        }
    }
}

/// Decide which snapshots to keep after a receive.
///
/// The newest snapshot becomes [`FINAL_SNAPSHOT`]; every other one is
/// destroyed. Returns `(rename_from, destroy)`, where `rename_from` is `None`
/// when the newest is already named `final`.
pub fn plan_snapshot_prune(snapshots: &[String]) -> Option<(Option<String>, Vec<String>)> {
    let (newest, older) = snapshots.split_last()?;
    let rename = (newest != FINAL_SNAPSHOT).then(|| newest.clone());
    Some((rename, older.to_vec()))
}
