//! Transactional import of one image into local storage.
//!
//! ```text
//! open stream ──► (decompress) ──► tee digests ──► receive into staged object
//!                                                        │
//!          verify size + digests ◄───────────────────────┘
//!                   │
//!          prune snapshots ──► commit (no-replace rename) ──► db record
//! ```
//!
//! Any failure before commit aborts the staged object, so nothing ever
//! appears under the permanent name unless it was fully verified. Nothing
//! is retried.

mod decompress;
mod digest;
mod progress;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::SecondsFormat;
use futures_util::StreamExt;
use indicatif::ProgressBar;
use serde::Serialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::ChildStdin;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vmimg_manifest::{upgrade_manifest, Checksum, Compression, ImageFile, Manifest};

use crate::config::{DbWritePolicy, EngineConfig};
use crate::database::LocalDatabase;
use crate::error::ImgError;
use crate::source::{AncestryEntry, ImageSource};
use crate::storage::{plan_snapshot_prune, ByteStream, StagedObject, Storage, StorageError, FINAL_SNAPSHOT};

pub use decompress::reader_stream;
pub use digest::RollingDigests;

use decompress::{read_stderr, wait_exit, Decompressor};
use progress::download_bar;

/// Chunks buffered between the download and the storage writer.
const CHANNEL_DEPTH: usize = 16;

/// Tunables for [`ImportPipeline`].
#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub stream_idle_timeout: Duration,
    pub decompress_timeout: Duration,
    pub db_write_policy: DbWritePolicy,
    pub gzip_program: PathBuf,
    pub bzip2_program: PathBuf,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for PipelineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            stream_idle_timeout: config.stream_idle_timeout,
            decompress_timeout: config.decompress_timeout,
            db_write_policy: config.db_write_policy,
            gzip_program: config.gzip_program.clone(),
            bzip2_program: config.bzip2_program.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ImportStatus {
    Imported,
    /// The image was already present, or a racing import promoted it first.
    AlreadyInstalled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImportOutcome {
    pub uuid: Uuid,
    pub pool: String,
    pub status: ImportStatus,
    /// Set when the image landed but its database record did not.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_warning: Option<String>,
}

impl ImportOutcome {
    fn new(pool: &str, uuid: Uuid, status: ImportStatus) -> Self {
        Self {
            uuid,
            pool: pool.to_string(),
            status,
            db_warning: None,
        }
    }
}

/// Where the image bytes come from.
enum Content<'a> {
    Local(&'a Path),
    Remote {
        source: &'a dyn ImageSource,
        entry: &'a AncestryEntry,
    },
}

/// Destination of the raw download.
enum Sink {
    Channel(mpsc::Sender<io::Result<Bytes>>),
    Pipe(ChildStdin),
}

impl Sink {
    /// Forward one chunk. `false` means the reader has gone away.
    async fn send(&mut self, chunk: Bytes) -> bool {
        match self {
            Sink::Channel(tx) => tx.send(Ok(chunk)).await.is_ok(),
            Sink::Pipe(stdin) => match stdin.write_all(&chunk).await {
                Ok(()) => true,
                Err(err) => {
                    debug!(error = %err, "Decompressor stopped reading");
                    false
                }
            },
        }
    }

    async fn close(self) {
        if let Sink::Pipe(mut stdin) = self {
            stdin.shutdown().await.ok();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PumpEnd {
    Completed,
    SinkClosed,
}

/// Copy `raw` into `sink`, updating digests and progress on the way.
async fn pump(
    mut raw: ByteStream,
    mut sink: Sink,
    digests: &mut RollingDigests,
    idle: Duration,
    progress: &ProgressBar,
) -> Result<PumpEnd, ImgError> {
    loop {
        let next = timeout(idle, raw.next()).await.map_err(|_| {
            ImgError::download(format!(
                "no image data received for {}s",
                idle.as_secs()
            ))
        })?;
        let Some(chunk) = next else {
            break;
        };
        let chunk = chunk.map_err(|err| ImgError::download_with("error reading image data", err))?;
        digests.update(&chunk);
        progress.inc(chunk.len() as u64);
        if !sink.send(chunk).await {
            return Ok(PumpEnd::SinkClosed);
        }
    }
    sink.close().await;
    Ok(PumpEnd::Completed)
}

/// Materializes images into storage and records them in the database.
#[derive(Clone)]
pub struct ImportPipeline {
    storage: Arc<dyn Storage>,
    db: LocalDatabase,
    settings: PipelineSettings,
}

impl ImportPipeline {
    pub fn new(storage: Arc<dyn Storage>, db: LocalDatabase, settings: PipelineSettings) -> Self {
        Self {
            storage,
            db,
            settings,
        }
    }

    /// Install from a manifest and a file on the local filesystem.
    ///
    /// Local installs accept any manifest state. A missing `published_at`
    /// is stamped with the current time.
    pub async fn install_local(
        &self,
        pool: &str,
        raw_manifest: Value,
        file: &Path,
        quiet: bool,
    ) -> Result<ImportOutcome, ImgError> {
        let mut manifest = upgrade_manifest(raw_manifest)?;
        if manifest.published_at.is_none() {
            manifest.published_at =
                Some(chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true));
        }
        self.run(pool, manifest, None, Content::Local(file), quiet)
            .await
    }

    /// Import one ancestry entry from a source. The entry's image must be
    /// active.
    pub async fn import_remote(
        &self,
        pool: &str,
        source: &dyn ImageSource,
        entry: &AncestryEntry,
        quiet: bool,
    ) -> Result<ImportOutcome, ImgError> {
        let meta = source.get_img_meta(entry).await?;
        let manifest = meta.manifest;
        if manifest.uuid != entry.uuid {
            return Err(ImgError::invalid_manifest(format!(
                "{source} returned manifest {} for image {}",
                manifest.uuid, entry.uuid
            )));
        }
        if !manifest.is_active() {
            return Err(ImgError::ImageNotActive {
                uuid: manifest.uuid,
                state: manifest.state,
            });
        }
        self.run(
            pool,
            manifest,
            meta.checksum,
            Content::Remote { source, entry },
            quiet,
        )
        .await
    }

    async fn run(
        &self,
        pool: &str,
        manifest: Manifest,
        fallback_checksum: Option<Checksum>,
        content: Content<'_>,
        quiet: bool,
    ) -> Result<ImportOutcome, ImgError> {
        manifest.validate()?;
        let uuid = manifest.uuid;
        let file = manifest
            .file()
            .ok_or_else(|| ImgError::invalid_manifest(format!("image {uuid} has no file")))?;
        let checksum = file.checksum().or(fallback_checksum).ok_or_else(|| {
            ImgError::invalid_manifest(format!("image {uuid} file has no digest"))
        })?;

        if let Some(origin) = manifest.origin {
            if !self.storage.exists(pool, origin).await? {
                return Err(ImgError::OriginNotInstalled {
                    pool: pool.to_string(),
                    origin,
                });
            }
        }
        if self.storage.exists(pool, uuid).await? {
            info!(pool = %pool, uuid = %uuid, "Image already installed");
            return Ok(ImportOutcome::new(pool, uuid, ImportStatus::AlreadyInstalled));
        }

        let (stream, content_md5, source_url) = match content {
            Content::Local(path) => {
                let handle = tokio::fs::File::open(path).await.map_err(|err| {
                    ImgError::Usage(format!("could not open \"{}\": {err}", path.display()))
                })?;
                (reader_stream(handle), None, None)
            }
            Content::Remote { source, entry } => {
                let file_stream = source.get_img_file_stream(entry).await?;
                (
                    file_stream.stream,
                    file_stream.content_md5,
                    Some(source.record().url.clone()),
                )
            }
        };

        info!(
            pool = %pool,
            uuid = %uuid,
            image = %manifest.label(),
            size = file.size,
            compression = %file.compression,
            "Importing image"
        );
        let staged = self.storage.stage(pool, uuid).await?;

        let digests = RollingDigests::new(checksum, content_md5);
        if let Err(err) = self
            .materialize(&staged, file, digests, stream, &manifest.label(), quiet)
            .await
        {
            self.abort(&staged).await;
            return Err(err);
        }

        match self.storage.commit(&staged).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists(name)) => {
                warn!(object = %name, "Lost promotion race, keeping the existing image");
                self.abort(&staged).await;
                return Ok(ImportOutcome::new(pool, uuid, ImportStatus::AlreadyInstalled));
            }
            Err(err) => {
                self.abort(&staged).await;
                return Err(err.into());
            }
        }
        info!(pool = %pool, uuid = %uuid, "Image promoted");

        let mut outcome = ImportOutcome::new(pool, uuid, ImportStatus::Imported);
        if let Err(err) = self.db.put(pool, &manifest, source_url.as_deref()).await {
            match self.settings.db_write_policy {
                DbWritePolicy::Warn => {
                    warn!(pool = %pool, uuid = %uuid, error = %err, "Image installed without a database record");
                    outcome.db_warning = Some(err.to_string());
                }
                DbWritePolicy::Fail => {
                    return Err(ImgError::internal_with(
                        format!("image {uuid} was installed but its database record was not written"),
                        err,
                    ));
                }
            }
        }
        Ok(outcome)
    }

    /// Stream, verify and tidy the staged object. Does not commit.
    async fn materialize(
        &self,
        staged: &StagedObject,
        file: &ImageFile,
        mut digests: RollingDigests,
        stream: ByteStream,
        label: &str,
        quiet: bool,
    ) -> Result<(), ImgError> {
        let idle = self.settings.stream_idle_timeout;
        let progress = download_bar(Some(file.size), label, quiet);

        let end = match file.compression {
            Compression::None => {
                let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
                let (pumped, received) = tokio::join!(
                    pump(stream, Sink::Channel(tx), &mut digests, idle, &progress),
                    self.storage
                        .receive(staged, Box::pin(ReceiverStream::new(rx))),
                );
                let end = pumped?;
                received?;
                end
            }
            Compression::Gzip | Compression::Bzip2 => {
                let program = if file.compression == Compression::Gzip {
                    &self.settings.gzip_program
                } else {
                    &self.settings.bzip2_program
                };
                let Decompressor {
                    program,
                    compression,
                    mut child,
                    stdin,
                    stdout,
                    stderr,
                } = Decompressor::spawn(program, file.compression)?;

                let (pumped, received, stderr) = tokio::join!(
                    pump(stream, Sink::Pipe(stdin), &mut digests, idle, &progress),
                    self.storage.receive(staged, reader_stream(stdout)),
                    read_stderr(stderr),
                );
                let end = match pumped {
                    Ok(end) => end,
                    Err(err) => {
                        child.start_kill().ok();
                        return Err(err);
                    }
                };
                wait_exit(
                    &mut child,
                    &program,
                    compression,
                    self.settings.decompress_timeout,
                    &stderr,
                )
                .await?;
                received?;
                end
            }
        };
        progress.finish_and_clear();

        if end == PumpEnd::SinkClosed {
            return Err(ImgError::download(format!(
                "storage stopped accepting data for {} before the download finished",
                staged.name()
            )));
        }
        if digests.bytes() != file.size {
            return Err(ImgError::download(format!(
                "size mismatch for image {}: expected {} bytes, got {}",
                staged.uuid(),
                file.size,
                digests.bytes()
            )));
        }
        digests.verify()?;
        debug!(name = %staged.name(), bytes = file.size, "Image data verified");

        let snapshots = self.storage.staged_snapshots(staged).await?;
        let (rename, destroy) =
            plan_snapshot_prune(&snapshots).ok_or_else(|| ImgError::UnexpectedNumberOfSnapshots {
                name: format!("{}/{}", staged.pool(), staged.name()),
                count: 0,
            })?;
        for snapshot in destroy {
            debug!(snapshot = %snapshot, "Destroying extra snapshot");
            self.storage.destroy_snapshot(staged, &snapshot).await?;
        }
        if let Some(from) = rename {
            self.storage
                .rename_snapshot(staged, &from, FINAL_SNAPSHOT)
                .await?;
        }
        Ok(())
    }

    async fn abort(&self, staged: &StagedObject) {
        if let Err(err) = self.storage.abort(staged).await {
            warn!(name = %staged.name(), error = %err, "Could not clean up staged object");
        }
    }
}
