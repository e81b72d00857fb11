//! Engine facade: every user-level operation, wired from an
//! [`EngineConfig`] and a [`Storage`] backend.

use std::path::Path;
use std::sync::Arc;

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vmimg_manifest::Manifest;

use crate::ancestry::AncestryResolver;
use crate::config::{ConfigStore, EngineConfig};
use crate::database::LocalDatabase;
use crate::error::ImgError;
use crate::pipeline::{ImportOutcome, ImportPipeline, ImportStatus, PipelineSettings};
use crate::registry::SourceRegistry;
use crate::source::{ImportDetail, ImportInfo, ImportOptions, ListOutcome, SourceContext};
use crate::storage::{Children, Storage};
use crate::upgrade::UpgradeManager;

/// An image offered by a source.
#[derive(Debug, Clone, Serialize)]
pub struct AvailableImage {
    pub manifest: Manifest,
    /// URL of the source offering it.
    pub source: String,
}

/// What is known locally about one installed image.
#[derive(Debug, Clone, Serialize)]
pub struct ImageInfo {
    pub uuid: Uuid,
    pub pool: String,
    /// `None` when the database has no record for the object.
    pub manifest: Option<Manifest>,
    pub source: Option<String>,
    /// Objects cloned from this image.
    pub clones: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub children: Option<Children>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateStatus {
    Updated,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateResult {
    pub uuid: Uuid,
    pub pool: String,
    pub status: UpdateStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

pub struct ImageEngine {
    config: EngineConfig,
    storage: Arc<dyn Storage>,
    db: LocalDatabase,
    registry: SourceRegistry,
    pipeline: ImportPipeline,
}

impl ImageEngine {
    /// Load the persisted config, run pending migrations and build the
    /// source registry. Sources are not pinged.
    pub async fn open(config: EngineConfig, storage: Arc<dyn Storage>) -> Result<Self, ImgError> {
        let store = ConfigStore::new(config.config_path());
        let mut persisted = store.load().await?;
        let db = LocalDatabase::new(config.db_dir.clone());

        let applied = UpgradeManager::new(store.clone(), db.clone(), config.legacy_db_dir.clone())
            .run(&mut persisted, storage.as_ref())
            .await?;
        if !applied.is_empty() {
            info!(versions = ?applied, "Schema migrations applied");
        }

        let user_agent = match persisted.user_agent_extra.as_deref() {
            Some(extra) => format!("{} {extra}", config.user_agent),
            None => config.user_agent.clone(),
        };
        let ctx = SourceContext {
            user_agent,
            insecure: config.insecure,
            request_timeout: config.request_timeout,
            connect_timeout: config.connect_timeout,
            docker_skip_uuids: persisted.docker_import_skip_uuids,
            registry_token: config.registry_token.clone(),
        };
        let registry = SourceRegistry::new(store, persisted, ctx);
        let pipeline = ImportPipeline::new(
            Arc::clone(&storage),
            db.clone(),
            PipelineSettings::from(&config),
        );

        Ok(Self {
            config,
            storage,
            db,
            registry,
            pipeline,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &SourceRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut SourceRegistry {
        &mut self.registry
    }

    pub fn database(&self) -> &LocalDatabase {
        &self.db
    }

    /// Every image every source offers, first source winning on duplicate
    /// uuids. Source failures do not fail the call; they come back
    /// alongside the partial list.
    pub async fn sources_list(&self) -> Result<(Vec<AvailableImage>, Option<ImgError>), ImgError> {
        let sources = self.registry.sources();
        if sources.is_empty() {
            return Err(ImgError::NoSources);
        }

        let results = join_all(sources.iter().map(|source| source.list_images())).await;

        let mut images: Vec<AvailableImage> = Vec::new();
        let mut errors = Vec::new();
        for (source, result) in sources.iter().zip(results) {
            match result {
                Ok(ListOutcome::Images(manifests)) => {
                    debug!(source = %source, count = manifests.len(), "Listed source images");
                    for manifest in manifests {
                        if images.iter().any(|i| i.manifest.uuid == manifest.uuid) {
                            continue;
                        }
                        images.push(AvailableImage {
                            manifest,
                            source: source.record().url.clone(),
                        });
                    }
                }
                Ok(ListOutcome::Unsupported) => {
                    debug!(source = %source, "Source cannot list images");
                }
                Err(err) => {
                    warn!(source = %source, error = %err, "Could not list source images");
                    errors.push(err);
                }
            }
        }
        Ok((images, ImgError::from_many(errors)))
    }

    /// First source manifest for `uuid`, with any source errors met on the
    /// way.
    pub async fn sources_get(
        &self,
        uuid: Uuid,
        ensure_active: bool,
    ) -> (Option<AvailableImage>, Option<ImgError>) {
        let opts = ImportOptions {
            ensure_active,
            err_on_404: false,
        };
        let mut errors = Vec::new();
        for source in self.registry.sources() {
            match source.get_import_info(&uuid.to_string(), opts).await {
                Ok(Some(ImportInfo {
                    detail: ImportDetail::Catalog(manifest),
                    ..
                })) => {
                    let found = AvailableImage {
                        manifest: *manifest,
                        source: source.record().url.clone(),
                    };
                    return (Some(found), ImgError::from_many(errors));
                }
                Ok(_) => {}
                Err(err) => errors.push(err),
            }
        }
        (None, ImgError::from_many(errors))
    }

    /// Source manifest for `uuid`, in any state.
    pub async fn show(&self, uuid: Uuid) -> Result<Manifest, ImgError> {
        if self.registry.sources().is_empty() {
            return Err(ImgError::NoSources);
        }
        match self.sources_get(uuid, false).await {
            (Some(found), _) => Ok(found.manifest),
            (None, Some(err)) => Err(err),
            (None, None) => Err(ImgError::ImageNotFound {
                arg: uuid.to_string(),
            }),
        }
    }

    /// Installed images on every pool, merged with their database records.
    pub async fn list_installed(&self) -> Result<Vec<ImageInfo>, ImgError> {
        let objects = self.storage.list_objects().await?;
        let mut images = Vec::new();
        for object in &objects {
            let Some(uuid) = object.image_uuid() else {
                continue;
            };
            let record = self.db.get(&object.pool, uuid).await;
            let clones = objects
                .iter()
                .filter(|o| o.is_clone_of(&object.pool, uuid))
                .count();
            images.push(ImageInfo {
                uuid,
                pool: object.pool.clone(),
                manifest: record.manifest,
                source: record.source,
                clones,
                children: None,
            });
        }
        Ok(images)
    }

    /// One installed image. Storage decides whether it exists; a database
    /// record alone is not enough.
    pub async fn get_installed(
        &self,
        pool: &str,
        uuid: Uuid,
        with_children: bool,
    ) -> Result<Option<ImageInfo>, ImgError> {
        if !self.storage.exists(pool, uuid).await? {
            return Ok(None);
        }
        let record = self.db.get(pool, uuid).await;
        let children = self.storage.children(pool, uuid).await?;
        Ok(Some(ImageInfo {
            uuid,
            pool: pool.to_string(),
            manifest: record.manifest,
            source: record.source,
            clones: children.clones.len(),
            children: with_children.then_some(children),
        }))
    }

    /// Destroy an installed image and forget it. Refused while anything is
    /// cloned from it.
    pub async fn delete(&self, pool: &str, uuid: Uuid) -> Result<(), ImgError> {
        if !self.storage.exists(pool, uuid).await? {
            return Err(ImgError::ImageNotInstalled {
                pool: pool.to_string(),
                uuid,
            });
        }
        let children = self.storage.children(pool, uuid).await?;
        if !children.clones.is_empty() {
            return Err(ImgError::ImageHasDependentClones {
                uuid,
                clones: children.clones,
            });
        }

        self.storage.destroy(pool, &uuid.to_string()).await?;
        self.db.delete(pool, uuid).await?;
        info!(pool = %pool, uuid = %uuid, "Image deleted");
        Ok(())
    }

    /// Import `arg` and every missing ancestor, base first.
    pub async fn import(
        &self,
        arg: &str,
        pool: &str,
        quiet: bool,
    ) -> Result<Vec<ImportOutcome>, ImgError> {
        let resolver = AncestryResolver::new(self.storage.as_ref());
        let resolved = resolver.find(self.registry.sources(), arg).await?;
        let plan = resolver.plan(resolved, pool).await?;

        if plan.missing.is_empty() {
            info!(pool = %pool, uuid = %plan.leaf.uuid, "Image already installed");
            return Ok(vec![ImportOutcome {
                uuid: plan.leaf.uuid,
                pool: pool.to_string(),
                status: ImportStatus::AlreadyInstalled,
                db_warning: None,
            }]);
        }

        let mut outcomes = Vec::with_capacity(plan.missing.len());
        for entry in &plan.missing {
            let outcome = self
                .pipeline
                .import_remote(pool, plan.source.as_ref(), entry, quiet)
                .await?;
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Install from a manifest file and an image file on local disk.
    pub async fn install(
        &self,
        manifest_path: &Path,
        file_path: &Path,
        pool: &str,
        quiet: bool,
    ) -> Result<ImportOutcome, ImgError> {
        let content = tokio::fs::read_to_string(manifest_path)
            .await
            .map_err(|err| {
                ImgError::Usage(format!(
                    "could not read manifest \"{}\": {err}",
                    manifest_path.display()
                ))
            })?;
        let raw: serde_json::Value = serde_json::from_str(&content).map_err(|err| {
            ImgError::InvalidManifest {
                message: format!("\"{}\" is not valid JSON", manifest_path.display()),
                cause: Some(Box::new(err)),
            }
        })?;
        self.pipeline.install_local(pool, raw, file_path, quiet).await
    }

    /// Fill in database records for installed images that have none.
    pub async fn update_installed(&self) -> Result<Vec<UpdateResult>, ImgError> {
        let mut results = Vec::new();
        for image in self.list_installed().await? {
            if image.manifest.is_some() {
                continue;
            }
            let (found, err) = self.sources_get(image.uuid, true).await;
            if let Some(err) = err {
                debug!(uuid = %image.uuid, error = %err, "Source errors during update");
            }
            let result = match found {
                Some(found) => {
                    self.db
                        .put(&image.pool, &found.manifest, Some(&found.source))
                        .await?;
                    info!(pool = %image.pool, uuid = %image.uuid, source = %found.source, "Image record updated");
                    UpdateResult {
                        uuid: image.uuid,
                        pool: image.pool,
                        status: UpdateStatus::Updated,
                        source: Some(found.source),
                    }
                }
                None => UpdateResult {
                    uuid: image.uuid,
                    pool: image.pool,
                    status: UpdateStatus::NotFound,
                    source: None,
                },
            };
            results.push(result);
        }
        Ok(results)
    }
}
