//! Versioned on-disk schema migrations.
//!
//! The persisted config carries `schemaVersion`. At startup every migration
//! whose version is above the stored one runs, in ascending order, and the
//! stored version is saved after each. Every migration checks the target
//! state before mutating, so re-running one after a crash is harmless.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;
use tracing::{debug, info, warn};
use vmimg_manifest::{upgrade_manifest, ManifestError};

use crate::config::{ConfigStore, PersistedConfig, SourceEntry};
use crate::database::LocalDatabase;
use crate::error::ImgError;
use crate::source::SourceType;
use crate::storage::Storage;

/// Schema version of a config that predates versioning.
const UNVERSIONED: u32 = 1;

/// Default catalog of the legacy layout. A `sources.list` naming only this
/// URL was never customized.
const LEGACY_DEFAULT_SOURCE: &str = "https://datasets.joyent.com/datasets";

/// Everything a migration may touch.
pub struct MigrationContext<'a> {
    pub config: &'a mut PersistedConfig,
    pub db: &'a LocalDatabase,
    pub storage: &'a dyn Storage,
    pub legacy_db_dir: &'a Path,
}

#[async_trait]
pub trait Migration: Send + Sync {
    /// Schema version this migration brings the state to.
    fn version(&self) -> u32;

    fn name(&self) -> &'static str;

    async fn apply(&self, ctx: &mut MigrationContext<'_>) -> Result<(), ImgError>;
}

/// Runs pending migrations against the persisted state.
pub struct UpgradeManager {
    store: ConfigStore,
    db: LocalDatabase,
    legacy_db_dir: PathBuf,
    migrations: Vec<Box<dyn Migration>>,
}

impl UpgradeManager {
    pub fn new(store: ConfigStore, db: LocalDatabase, legacy_db_dir: PathBuf) -> Self {
        Self::with_migrations(
            store,
            db,
            legacy_db_dir,
            vec![Box::new(LegacyImport), Box::new(SourceTypes)],
        )
    }

    pub fn with_migrations(
        store: ConfigStore,
        db: LocalDatabase,
        legacy_db_dir: PathBuf,
        mut migrations: Vec<Box<dyn Migration>>,
    ) -> Self {
        migrations.sort_by_key(|m| m.version());
        Self {
            store,
            db,
            legacy_db_dir,
            migrations,
        }
    }

    /// Newest schema version known to this build.
    pub fn latest_version(&self) -> u32 {
        self.migrations
            .last()
            .map(|m| m.version())
            .unwrap_or(UNVERSIONED)
    }

    /// Apply pending migrations. Returns the versions applied, in order.
    pub async fn run(
        &self,
        config: &mut PersistedConfig,
        storage: &dyn Storage,
    ) -> Result<Vec<u32>, ImgError> {
        let stored = match config.schema_version {
            None => UNVERSIONED,
            Some(0) => {
                return Err(ImgError::Upgrade {
                    message: format!(
                        "config \"{}\" has invalid schemaVersion 0",
                        self.store.path().display()
                    ),
                    cause: None,
                })
            }
            Some(version) => version,
        };

        if stored > self.latest_version() {
            warn!(
                stored = stored,
                latest = self.latest_version(),
                "Stored schema is newer than this build, leaving it alone"
            );
            return Ok(Vec::new());
        }

        let mut applied = Vec::new();
        for migration in self.migrations.iter().filter(|m| m.version() > stored) {
            info!(
                version = migration.version(),
                migration = migration.name(),
                "Applying schema migration"
            );
            let mut ctx = MigrationContext {
                config: &mut *config,
                db: &self.db,
                storage,
                legacy_db_dir: &self.legacy_db_dir,
            };
            migration.apply(&mut ctx).await.map_err(|err| ImgError::Upgrade {
                message: format!(
                    "migration to schema version {} ({}) failed: {err}",
                    migration.version(),
                    migration.name()
                ),
                cause: Some(Box::new(err)),
            })?;

            config.schema_version = Some(migration.version());
            self.store.save(config).await?;
            applied.push(migration.version());
        }

        if applied.is_empty() {
            debug!(version = stored, "Schema is current");
        }
        Ok(applied)
    }
}

/// Version 2: bring records and sources over from the legacy layout.
pub struct LegacyImport;

#[async_trait]
impl Migration for LegacyImport {
    fn version(&self) -> u32 {
        2
    }

    fn name(&self) -> &'static str {
        "legacy import"
    }

    async fn apply(&self, ctx: &mut MigrationContext<'_>) -> Result<(), ImgError> {
        let objects = ctx.storage.list_objects().await?;
        let mut imported = 0usize;

        for object in &objects {
            let Some(uuid) = object.image_uuid() else {
                continue;
            };
            if !ctx.db.get(&object.pool, uuid).await.is_stub() {
                continue;
            }
            let path = ctx.legacy_db_dir.join(format!("{uuid}.json"));
            let Some(content) = read_optional(&path).await? else {
                continue;
            };
            let parsed = serde_json::from_str::<serde_json::Value>(&content)
                .map_err(ManifestError::from)
                .and_then(upgrade_manifest);
            let manifest = match parsed {
                Ok(manifest) if manifest.uuid == uuid => manifest,
                Ok(manifest) => {
                    warn!(path = %path.display(), found = %manifest.uuid, "Legacy record uuid mismatch");
                    continue;
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "Skipping unreadable legacy record");
                    continue;
                }
            };
            ctx.db.put(&object.pool, &manifest, None).await?;
            imported += 1;
        }

        if ctx.config.sources.is_none() {
            let path = ctx.legacy_db_dir.join("sources.list");
            if let Some(content) = read_optional(&path).await? {
                let urls: Vec<&str> = content
                    .lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty() && !line.starts_with('#'))
                    .collect();
                if urls.len() == 1 && urls[0].trim_end_matches('/') == LEGACY_DEFAULT_SOURCE {
                    debug!("Legacy sources.list holds only the old default");
                } else if !urls.is_empty() {
                    let entries = urls
                        .into_iter()
                        .map(|url| SourceEntry::new(url, SourceType::infer_from_url(url)))
                        .collect::<Vec<_>>();
                    info!(count = entries.len(), "Imported legacy image sources");
                    ctx.config.sources = Some(entries);
                }
            }
        }

        info!(records = imported, "Legacy import finished");
        Ok(())
    }
}

/// Version 3: give every persisted source an explicit type.
pub struct SourceTypes;

#[async_trait]
impl Migration for SourceTypes {
    fn version(&self) -> u32 {
        3
    }

    fn name(&self) -> &'static str {
        "source types"
    }

    async fn apply(&self, ctx: &mut MigrationContext<'_>) -> Result<(), ImgError> {
        let Some(sources) = ctx.config.sources.as_mut() else {
            return Ok(());
        };
        for entry in sources.iter_mut().filter(|e| e.source_type.is_none()) {
            let source_type = SourceType::infer_from_url(&entry.url);
            debug!(url = %entry.url, source_type = %source_type, "Typed image source");
            entry.source_type = Some(source_type);
        }
        Ok(())
    }
}

async fn read_optional(path: &Path) -> Result<Option<String>, ImgError> {
    match fs::read_to_string(path).await {
        Ok(content) => Ok(Some(content)),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(ImgError::internal_with(
            format!("could not read \"{}\"", path.display()),
            err,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONFIG_FILE;
    use crate::storage::DirStorage;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tempfile::TempDir;

    struct Counting {
        version: u32,
        runs: Arc<AtomicUsize>,
        fail: bool,
    }

    #[async_trait]
    impl Migration for Counting {
        fn version(&self) -> u32 {
            self.version
        }

        fn name(&self) -> &'static str {
            "counting"
        }

        async fn apply(&self, _ctx: &mut MigrationContext<'_>) -> Result<(), ImgError> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(ImgError::internal("boom"));
            }
            Ok(())
        }
    }

    fn manager(temp_dir: &TempDir, migrations: Vec<Box<dyn Migration>>) -> UpgradeManager {
        UpgradeManager::with_migrations(
            ConfigStore::new(temp_dir.path().join(CONFIG_FILE)),
            LocalDatabase::new(temp_dir.path().to_path_buf()),
            temp_dir.path().join("legacy"),
            migrations,
        )
    }

    #[tokio::test]
    async fn runs_only_pending_migrations_in_order() {
        let temp_dir = TempDir::new().unwrap();
        let storage = DirStorage::new(temp_dir.path().join("storage"));
        let runs = Arc::new(AtomicUsize::new(0));
        let migrations: Vec<Box<dyn Migration>> = vec![
            Box::new(Counting { version: 4, runs: runs.clone(), fail: false }),
            Box::new(Counting { version: 2, runs: runs.clone(), fail: false }),
            Box::new(Counting { version: 3, runs: runs.clone(), fail: false }),
        ];
        let manager = manager(&temp_dir, migrations);

        let mut config = PersistedConfig {
            schema_version: Some(2),
            ..PersistedConfig::default()
        };
        let applied = manager.run(&mut config, &storage).await.unwrap();
        assert_eq!(applied, vec![3, 4]);
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(config.schema_version, Some(4));

        let saved = ConfigStore::new(temp_dir.path().join(CONFIG_FILE))
            .load()
            .await
            .unwrap();
        assert_eq!(saved.schema_version, Some(4));

        assert!(manager.run(&mut config, &storage).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn failure_keeps_last_good_version() {
        let temp_dir = TempDir::new().unwrap();
        let storage = DirStorage::new(temp_dir.path().join("storage"));
        let runs = Arc::new(AtomicUsize::new(0));
        let migrations: Vec<Box<dyn Migration>> = vec![
            Box::new(Counting { version: 2, runs: runs.clone(), fail: false }),
            Box::new(Counting { version: 3, runs: runs.clone(), fail: true }),
        ];
        let manager = manager(&temp_dir, migrations);

        let mut config = PersistedConfig::default();
        let err = manager.run(&mut config, &storage).await.unwrap_err();
        assert_eq!(err.code(), "UpgradeError");
        assert_eq!(config.schema_version, Some(2));
    }

    #[tokio::test]
    async fn zero_version_is_upgrade_error() {
        let temp_dir = TempDir::new().unwrap();
        let storage = DirStorage::new(temp_dir.path().join("storage"));
        let manager = manager(&temp_dir, vec![]);
        let mut config = PersistedConfig {
            schema_version: Some(0),
            ..PersistedConfig::default()
        };
        let err = manager.run(&mut config, &storage).await.unwrap_err();
        assert_eq!(err.code(), "UpgradeError");
    }

    #[tokio::test]
    async fn newer_stored_version_is_left_alone() {
        let temp_dir = TempDir::new().unwrap();
        let storage = DirStorage::new(temp_dir.path().join("storage"));
        let manager = UpgradeManager::new(
            ConfigStore::new(temp_dir.path().join(CONFIG_FILE)),
            LocalDatabase::new(temp_dir.path().to_path_buf()),
            temp_dir.path().join("legacy"),
        );
        let mut config = PersistedConfig {
            schema_version: Some(99),
            ..PersistedConfig::default()
        };
        assert!(manager.run(&mut config, &storage).await.unwrap().is_empty());
        assert_eq!(config.schema_version, Some(99));
    }

    #[tokio::test]
    async fn source_types_are_inferred() {
        let temp_dir = TempDir::new().unwrap();
        let storage = DirStorage::new(temp_dir.path().join("storage"));
        let manager = UpgradeManager::new(
            ConfigStore::new(temp_dir.path().join(CONFIG_FILE)),
            LocalDatabase::new(temp_dir.path().to_path_buf()),
            temp_dir.path().join("legacy"),
        );
        let untyped = |url: &str| SourceEntry {
            url: url.to_string(),
            source_type: None,
            insecure: false,
        };
        let mut config = PersistedConfig {
            sources: Some(vec![
                untyped("https://datasets.example.com/datasets/"),
                untyped("https://images.example.com"),
                SourceEntry::new("https://registry.example.com", SourceType::Docker),
            ]),
            schema_version: Some(2),
            ..PersistedConfig::default()
        };

        assert_eq!(manager.run(&mut config, &storage).await.unwrap(), vec![3]);
        let types: Vec<_> = config
            .sources
            .unwrap()
            .into_iter()
            .map(|e| e.source_type)
            .collect();
        assert_eq!(
            types,
            vec![
                Some(SourceType::Dsapi),
                Some(SourceType::Imgapi),
                Some(SourceType::Docker)
            ]
        );
    }

    #[tokio::test]
    async fn legacy_records_and_sources_are_imported() {
        let temp_dir = TempDir::new().unwrap();
        let storage = DirStorage::new(temp_dir.path().join("storage"));
        let legacy = temp_dir.path().join("legacy");
        std::fs::create_dir_all(&legacy).unwrap();

        let uuid = uuid::Uuid::new_v4();
        std::fs::create_dir_all(storage.object_path("zones", &uuid.to_string())).unwrap();
        std::fs::write(
            legacy.join(format!("{uuid}.json")),
            serde_json::json!({
                "uuid": uuid,
                "name": "base",
                "version": "1.0.0",
                "os": "smartos",
                "creator_uuid": "930896af-bf8c-48d4-885c-6573a94b1853",
                "files": [{ "path": "base.zfs.bz2", "size": 10,
                            "sha1": "da39a3ee5e6b4b0d3255bfef95601890afd80709" }]
            })
            .to_string(),
        )
        .unwrap();
        std::fs::write(
            legacy.join("sources.list"),
            "# sources\nhttps://datasets.example.com/datasets\n\nhttps://images.example.com\n",
        )
        .unwrap();

        let db = LocalDatabase::new(temp_dir.path().to_path_buf());
        let manager = UpgradeManager::new(
            ConfigStore::new(temp_dir.path().join(CONFIG_FILE)),
            db.clone(),
            legacy,
        );
        let mut config = PersistedConfig::default();
        assert_eq!(manager.run(&mut config, &storage).await.unwrap(), vec![2, 3]);

        let record = db.get("zones", uuid).await;
        let manifest = record.manifest.unwrap();
        assert_eq!(manifest.name, "base");
        assert_eq!(
            manifest.owner.as_deref(),
            Some("930896af-bf8c-48d4-885c-6573a94b1853")
        );

        let sources = config.sources.unwrap();
        assert_eq!(sources.len(), 2);
        assert_eq!(sources[0].source_type, Some(SourceType::Dsapi));
        assert_eq!(sources[1].source_type, Some(SourceType::Imgapi));
    }

    #[tokio::test]
    async fn lone_legacy_default_source_is_not_imported() {
        let temp_dir = TempDir::new().unwrap();
        let storage = DirStorage::new(temp_dir.path().join("storage"));
        let legacy = temp_dir.path().join("legacy");
        std::fs::create_dir_all(&legacy).unwrap();
        std::fs::write(legacy.join("sources.list"), format!("{LEGACY_DEFAULT_SOURCE}\n")).unwrap();

        let manager = UpgradeManager::new(
            ConfigStore::new(temp_dir.path().join(CONFIG_FILE)),
            LocalDatabase::new(temp_dir.path().to_path_buf()),
            legacy,
        );
        let mut config = PersistedConfig::default();
        manager.run(&mut config, &storage).await.unwrap();
        assert_eq!(config.sources, None);
    }
}
