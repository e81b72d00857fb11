//! ZFS-backed storage.
//!
//! Shells out to `zfs(8)`. Instance roots are discovered from
//! `zoneadm list -pc` when that tool exists on the host.

use std::collections::HashSet;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{ByteStream, Children, StagedObject, Storage, StorageError, StorageObject, FINAL_SNAPSHOT};

/// User property that hides a dataset from image listings.
const IGNORE_PROPERTY: &str = "vmimg:ignore";

/// Bound on how long `zfs receive` may take to exit after its input closes.
const RECEIVE_EXIT_TIMEOUT: Duration = Duration::from_secs(300);

/// ZFS storage backend.
#[derive(Debug, Clone)]
pub struct ZfsStorage {
    zfs_bin: PathBuf,
    zoneadm_bin: PathBuf,
}

impl Default for ZfsStorage {
    fn default() -> Self {
        Self::new()
    }
}

impl ZfsStorage {
    pub fn new() -> Self {
        Self {
            zfs_bin: PathBuf::from("/usr/sbin/zfs"),
            zoneadm_bin: PathBuf::from("/usr/sbin/zoneadm"),
        }
    }

    /// Use a different `zfs` binary (e.g. `/sbin/zfs` on Linux hosts).
    pub fn with_zfs_bin(mut self, path: impl Into<PathBuf>) -> Self {
        self.zfs_bin = path.into();
        self
    }

    async fn zfs(&self, args: &[&str]) -> Result<String, StorageError> {
        debug!(args = ?args, "zfs");
        let output = Command::new(&self.zfs_bin)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await?;
        if !output.status.success() {
            return Err(StorageError::Command {
                command: format!("zfs {}", args.join(" ")),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn dataset_exists(&self, dataset: &str) -> Result<bool, StorageError> {
        let output = Command::new(&self.zfs_bin)
            .args(["list", "-H", "-o", "name", dataset])
            .stdin(Stdio::null())
            .output()
            .await?;
        match output.status.code() {
            Some(0) => Ok(true),
            // `zfs list` exits 1 for "dataset does not exist".
            Some(1) => Ok(false),
            _ => Err(StorageError::Command {
                command: format!("zfs list {dataset}"),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }),
        }
    }

    async fn snapshots_of(&self, dataset: &str) -> Result<Vec<String>, StorageError> {
        let out = self
            .zfs(&[
                "list", "-H", "-t", "snapshot", "-o", "name", "-s", "creation", "-d", "1", dataset,
            ])
            .await?;
        Ok(out
            .lines()
            .filter_map(|line| line.split_once('@').map(|(_, snap)| snap.to_string()))
            .collect())
    }

    /// Zone root dataset names (`pool/uuid`) on this host.
    async fn instance_roots(&self) -> HashSet<String> {
        let output = match Command::new(&self.zoneadm_bin)
            .args(["list", "-pc"])
            .stdin(Stdio::null())
            .output()
            .await
        {
            Ok(output) if output.status.success() => output,
            Ok(output) => {
                warn!(status = %output.status, "zoneadm list failed, assuming no instances");
                return HashSet::new();
            }
            Err(err) => {
                debug!(error = %err, "zoneadm unavailable, assuming no instances");
                return HashSet::new();
            }
        };

        // id:name:state:zonepath:uuid:brand:ip-type
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter_map(|line| line.split(':').nth(3))
            .filter(|path| *path != "/")
            .map(|path| path.trim_start_matches('/').to_string())
            .collect()
    }
}

#[async_trait]
impl Storage for ZfsStorage {
    async fn stage(&self, pool: &str, uuid: Uuid) -> Result<StagedObject, StorageError> {
        // `zfs receive` creates the dataset; staging only reserves the name.
        Ok(StagedObject::new(pool, uuid))
    }

    async fn receive(&self, staged: &StagedObject, mut stream: ByteStream) -> Result<(), StorageError> {
        let dataset = format!("{}/{}", staged.pool(), staged.name());
        let mut child = Command::new(&self.zfs_bin)
            .args(["receive", dataset.as_str()])
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("zfs receive stdin unavailable"))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("zfs receive stderr unavailable"))?;
        // Drained alongside the write so a full stderr pipe cannot stall zfs.
        let drain = tokio::spawn(async move {
            let mut out = Vec::new();
            stderr.read_to_end(&mut out).await.ok();
            out
        });

        let mut write_err = None;
        while let Some(chunk) = stream.next().await {
            let written = match chunk {
                Ok(chunk) => stdin.write_all(&chunk).await,
                Err(err) => Err(err),
            };
            if let Err(err) = written {
                write_err = Some(err);
                break;
            }
        }
        drop(stdin);

        let status = tokio::time::timeout(RECEIVE_EXIT_TIMEOUT, child.wait())
            .await
            .map_err(|_| StorageError::Timeout(format!("zfs receive {dataset}")))??;
        let stderr = drain.await.unwrap_or_default();

        if !status.success() {
            return Err(StorageError::Command {
                command: format!("zfs receive {dataset}"),
                status: status.to_string(),
                stderr: String::from_utf8_lossy(&stderr).trim().to_string(),
            });
        }
        if let Some(err) = write_err {
            return Err(err.into());
        }
        Ok(())
    }

    async fn staged_snapshots(&self, staged: &StagedObject) -> Result<Vec<String>, StorageError> {
        self.snapshots_of(&format!("{}/{}", staged.pool(), staged.name()))
            .await
    }

    async fn rename_snapshot(
        &self,
        staged: &StagedObject,
        from: &str,
        to: &str,
    ) -> Result<(), StorageError> {
        let dataset = format!("{}/{}", staged.pool(), staged.name());
        self.zfs(&["rename", &format!("{dataset}@{from}"), &format!("{dataset}@{to}")])
            .await?;
        Ok(())
    }

    async fn destroy_snapshot(
        &self,
        staged: &StagedObject,
        snapshot: &str,
    ) -> Result<(), StorageError> {
        self.zfs(&[
            "destroy",
            &format!("{}/{}@{snapshot}", staged.pool(), staged.name()),
        ])
        .await?;
        Ok(())
    }

    async fn commit(&self, staged: &StagedObject) -> Result<(), StorageError> {
        let from = format!("{}/{}", staged.pool(), staged.name());
        let to = format!("{}/{}", staged.pool(), staged.final_name());
        match self.zfs(&["rename", &from, &to]).await {
            Ok(_) => Ok(()),
            Err(StorageError::Command { stderr, .. }) if stderr.contains("already exists") => {
                Err(StorageError::AlreadyExists(to))
            }
            Err(err) => Err(err),
        }
    }

    async fn abort(&self, staged: &StagedObject) -> Result<(), StorageError> {
        let dataset = format!("{}/{}", staged.pool(), staged.name());
        if !self.dataset_exists(&dataset).await? {
            return Ok(());
        }
        self.zfs(&["destroy", "-r", &dataset]).await?;
        Ok(())
    }

    async fn exists(&self, pool: &str, uuid: Uuid) -> Result<bool, StorageError> {
        self.dataset_exists(&format!("{pool}/{uuid}")).await
    }

    async fn children(&self, pool: &str, uuid: Uuid) -> Result<Children, StorageError> {
        let dataset = format!("{pool}/{uuid}");
        if !self.dataset_exists(&dataset).await? {
            return Err(StorageError::NotFound(dataset));
        }
        let snapshots = self
            .snapshots_of(&dataset)
            .await?
            .into_iter()
            .map(|snap| format!("{dataset}@{snap}"))
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
        let roots = self.instance_roots().await;
        let property_list = format!("name,origin,{IGNORE_PROPERTY}");
        let out = self
            .zfs(&["list", "-H", "-t", "filesystem,volume", "-o", &property_list])
            .await?;

        let mut objects = Vec::new();
        for line in out.lines() {
            let mut fields = line.split('\t');
            let (Some(full), Some(origin), ignore) = (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            // Only direct children of a pool: `pool/name`.
            let Some((pool, name)) = full.split_once('/') else {
                continue;
            };
            if name.contains('/') {
                continue;
            }
            objects.push(StorageObject {
                pool: pool.to_string(),
                name: name.to_string(),
                origin: (origin != "-").then(|| origin.to_string()),
                ignore: ignore.is_some_and(|v| v == "true"),
                is_instance_root: roots.contains(full),
            });
        }
        Ok(objects)
    }

    async fn clone_image(&self, pool: &str, uuid: Uuid, target: &str) -> Result<(), StorageError> {
        self.zfs(&[
            "clone",
            &format!("{pool}/{uuid}@{FINAL_SNAPSHOT}"),
            &format!("{pool}/{target}"),
        ])
        .await?;
        Ok(())
    }

    async fn destroy(&self, pool: &str, name: &str) -> Result<(), StorageError> {
        let dataset = format!("{pool}/{name}");
        if !self.dataset_exists(&dataset).await? {
            return Err(StorageError::NotFound(dataset));
        }
        self.zfs(&["destroy", "-r", &dataset]).await?;
        Ok(())
    }
}
