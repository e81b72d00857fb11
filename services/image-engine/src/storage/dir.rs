//! Directory-backed storage.
//!
//! Layout under the root:
//!
//! ```text
//! <root>/<pool>/<name>/data             object content
//! <root>/<pool>/<name>/snapshots/<snap> snapshot markers (creation nanos)
//! <root>/<pool>/<name>/origin           "pool/image@snap" for clones
//! <root>/<pool>/<name>/ignore           excluded from image listings
//! <root>/<pool>/<name>/instance-root    root of a running instance
//! ```
//!
//! Promotion relies on `rename(2)` refusing to replace a non-empty
//! directory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::debug;
use uuid::Uuid;

use super::{
    ByteStream, Children, StagedObject, Storage, StorageError, StorageObject, FINAL_SNAPSHOT,
};

const DATA_FILE: &str = "data";
const SNAPSHOT_DIR: &str = "snapshots";
const ORIGIN_FILE: &str = "origin";
const IGNORE_FILE: &str = "ignore";
const INSTANCE_ROOT_FILE: &str = "instance-root";

/// Snapshot name a fresh receive leaves behind.
const RECEIVED_SNAPSHOT: &str = "received";

/// Plain-directory snapshot/clone store.
#[derive(Debug, Clone)]
pub struct DirStorage {
    root: PathBuf,
}

impl DirStorage {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of `pool/name`.
    pub fn object_path(&self, pool: &str, name: &str) -> PathBuf {
        self.root.join(pool).join(name)
    }

    /// Content of a committed image.
    pub fn image_data_path(&self, pool: &str, uuid: Uuid) -> PathBuf {
        self.object_path(pool, &uuid.to_string()).join(DATA_FILE)
    }

    /// Record a snapshot on any object.
    pub async fn snapshot(&self, pool: &str, name: &str, snapshot: &str) -> Result<(), StorageError> {
        let dir = self.object_path(pool, name);
        if !is_dir(&dir).await {
            return Err(StorageError::NotFound(format!("{pool}/{name}")));
        }
        write_snapshot_marker(&dir, snapshot).await
    }

    /// Flag an object so it is left out of image listings.
    pub async fn set_ignore(&self, pool: &str, name: &str) -> Result<(), StorageError> {
        fs::write(self.object_path(pool, name).join(IGNORE_FILE), b"").await?;
        Ok(())
    }

    async fn list_snapshots(dir: &Path) -> Result<Vec<String>, StorageError> {
        let snap_dir = dir.join(SNAPSHOT_DIR);
        let mut entries = match fs::read_dir(&snap_dir).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut snapshots = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().into_owned();
            let created = fs::read_to_string(entry.path())
                .await
                .ok()
                .and_then(|s| s.trim().parse::<i64>().ok())
                .unwrap_or_default();
            snapshots.push((created, name));
        }
        snapshots.sort();
        Ok(snapshots.into_iter().map(|(_, name)| name).collect())
    }
}

async fn is_dir(path: &Path) -> bool {
    fs::metadata(path).await.map(|m| m.is_dir()).unwrap_or(false)
}

async fn write_snapshot_marker(dir: &Path, snapshot: &str) -> Result<(), StorageError> {
    let snap_dir = dir.join(SNAPSHOT_DIR);
    fs::create_dir_all(&snap_dir).await?;
    let created = chrono::Utc::now().timestamp_nanos_opt().unwrap_or_default();
    fs::write(snap_dir.join(snapshot), created.to_string()).await?;
    Ok(())
}

#[async_trait]
impl Storage for DirStorage {
    async fn stage(&self, pool: &str, uuid: Uuid) -> Result<StagedObject, StorageError> {
        let staged = StagedObject::new(pool, uuid);
        fs::create_dir_all(self.root.join(pool)).await?;
        fs::create_dir(self.object_path(pool, staged.name())).await?;
        debug!(pool = %pool, name = %staged.name(), "Staged object");
        Ok(staged)
    }

    async fn receive(&self, staged: &StagedObject, mut stream: ByteStream) -> Result<(), StorageError> {
        let dir = self.object_path(staged.pool(), staged.name());
        let mut file = fs::File::create(dir.join(DATA_FILE)).await?;
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk?).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        write_snapshot_marker(&dir, RECEIVED_SNAPSHOT).await
    }

    async fn staged_snapshots(&self, staged: &StagedObject) -> Result<Vec<String>, StorageError> {
        Self::list_snapshots(&self.object_path(staged.pool(), staged.name())).await
    }

    async fn rename_snapshot(
        &self,
        staged: &StagedObject,
        from: &str,
        to: &str,
    ) -> Result<(), StorageError> {
        let snap_dir = self
            .object_path(staged.pool(), staged.name())
            .join(SNAPSHOT_DIR);
        fs::rename(snap_dir.join(from), snap_dir.join(to)).await?;
        Ok(())
    }

    async fn destroy_snapshot(
        &self,
        staged: &StagedObject,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        let path = self
            .object_path(staged.pool(), staged.name())
            .join(SNAPSHOT_DIR)
            .join(snapshot);
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn commit(&self, staged: &StagedObject) -> Result<(), StorageError> {
        let from = self.object_path(staged.pool(), staged.name());
        let to = self.object_path(staged.pool(), &staged.final_name());
        match fs::rename(&from, &to).await {
            Ok(()) => Ok(()),
            Err(err)
                if matches!(
                    err.kind(),
                    ErrorKind::DirectoryNotEmpty | ErrorKind::AlreadyExists
                ) =>
            {
                Err(StorageError::AlreadyExists(format!(
                    "{}/{}",
                    staged.pool(),
                    staged.final_name()
                )))
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn abort(&self, staged: &StagedObject) -> Result<(), StorageError> {
        match fs::remove_dir_all(self.object_path(staged.pool(), staged.name())).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }

    async fn exists(&self, pool: &str, uuid: Uuid) -> Result<bool, StorageError> {
        Ok(is_dir(&self.object_path(pool, &uuid.to_string())).await)
    }

    async fn children(&self, pool: &str, uuid: Uuid) -> Result<Children, StorageError> {
        let dir = self.object_path(pool, &uuid.to_string());
        if !is_dir(&dir).await {
            return Err(StorageError::NotFound(format!("{pool}/{uuid}")));
        }
        let snapshots = Self::list_snapshots(&dir)
            .await?
            .into_iter()
            .map(|snap| format!("{pool}/{uuid}@{snap}"))
            .collect();
        let clones = self
            .list_objects()
            .await?
            .into_iter()
            .filter(|obj| obj.is_clone_of(pool, uuid))
            .map(|obj| obj.full_name())
            .collect();
        Ok(Children { snapshots, clones })
    }

    async fn list_objects(&self) -> Result<Vec<StorageObject>, StorageError> {
        let mut pools = match fs::read_dir(&self.root).await {
            Ok(pools) => pools,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut objects = Vec::new();
        while let Some(pool) = pools.next_entry().await? {
            if !pool.file_type().await?.is_dir() {
                continue;
            }
            let pool_name = pool.file_name().to_string_lossy().into_owned();
            let mut entries = fs::read_dir(pool.path()).await?;
            while let Some(entry) = entries.next_entry().await? {
                if !entry.file_type().await?.is_dir() {
                    continue;
                }
                let path = entry.path();
                let origin = fs::read_to_string(path.join(ORIGIN_FILE))
                    .await
                    .ok()
                    .map(|s| s.trim().to_string());
                objects.push(StorageObject {
                    pool: pool_name.clone(),
                    name: entry.file_name().to_string_lossy().into_owned(),
                    origin,
                    ignore: fs::try_exists(path.join(IGNORE_FILE)).await.unwrap_or(false),
                    is_instance_root: fs::try_exists(path.join(INSTANCE_ROOT_FILE))
                        .await
                        .unwrap_or(false),
                });
            }
        }
        objects.sort_by(|a, b| (&a.pool, &a.name).cmp(&(&b.pool, &b.name)));
        Ok(objects)
    }

    async fn clone_image(&self, pool: &str, uuid: Uuid, target: &str) -> Result<(), StorageError> {
        let source = self.object_path(pool, &uuid.to_string());
        let snapshots = Self::list_snapshots(&source).await?;
        if !snapshots.iter().any(|s| s == FINAL_SNAPSHOT) {
            return Err(StorageError::NotFound(format!(
                "{pool}/{uuid}@{FINAL_SNAPSHOT}"
            )));
        }

        let dest = self.object_path(pool, target);
        match fs::create_dir(&dest).await {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                return Err(StorageError::AlreadyExists(format!("{pool}/{target}")));
            }
            Err(err) => return Err(err.into()),
        }
        fs::copy(source.join(DATA_FILE), dest.join(DATA_FILE)).await?;
        fs::write(
            dest.join(ORIGIN_FILE),
            format!("{pool}/{uuid}@{FINAL_SNAPSHOT}"),
        )
        .await?;
        Ok(())
    }

    async fn destroy(&self, pool: &str, name: &str) -> Result<(), StorageError> {
        match fs::remove_dir_all(self.object_path(pool, name)).await {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == ErrorKind::NotFound => {
                Err(StorageError::NotFound(format!("{pool}/{name}")))
            }
            Err(err) => Err(err.into()),
        }
    }
}
