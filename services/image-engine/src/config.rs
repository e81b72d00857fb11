//! Engine configuration.
//!
//! [`EngineConfig`] holds process-level settings and is passed into every
//! constructor; only the binary entry point reads the environment.
//! [`PersistedConfig`] is the on-disk record in `<db_dir>/vmimg.conf`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::fs;
use tracing::debug;

use crate::error::ImgError;
use crate::source::SourceType;
use crate::storage::StorageBackend;

/// Config file name under the database directory.
pub const CONFIG_FILE: &str = "vmimg.conf";

/// Catalog used when the config names no sources.
pub const DEFAULT_SOURCE_URL: &str = "https://images.smartos.org";

/// What to do when the database write after a successful promotion fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DbWritePolicy {
    /// Report the failure in the import outcome; the import still succeeds.
    #[default]
    Warn,
    /// Fail the import. The promoted object is kept.
    Fail,
}

/// Process-level engine settings.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Root of the config file and the image database.
    pub db_dir: PathBuf,
    /// Where records from the previous on-disk layout live.
    pub legacy_db_dir: PathBuf,
    /// Pool used when a command names none.
    pub default_pool: String,
    /// Skip TLS certificate verification for every source.
    pub insecure: bool,
    pub user_agent: String,
    pub storage: StorageBackend,
    pub db_write_policy: DbWritePolicy,
    /// Longest wait for the next chunk of image data.
    pub stream_idle_timeout: Duration,
    /// Longest wait for a decompressor to exit after its input closes.
    pub decompress_timeout: Duration,
    /// Timeout for metadata requests (not file downloads).
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub gzip_program: PathBuf,
    pub bzip2_program: PathBuf,
    /// Bearer token for layered registries.
    pub registry_token: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            db_dir: PathBuf::from("/var/lib/vmimg"),
            legacy_db_dir: PathBuf::from("/var/db/vmimg"),
            default_pool: "zones".to_string(),
            insecure: false,
            user_agent: format!("vmimg/{}", env!("CARGO_PKG_VERSION")),
            storage: StorageBackend::Zfs,
            db_write_policy: DbWritePolicy::Warn,
            stream_idle_timeout: Duration::from_secs(60),
            decompress_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            gzip_program: PathBuf::from("gzip"),
            bzip2_program: PathBuf::from("bzip2"),
            registry_token: None,
        }
    }
}

impl EngineConfig {
    /// Load overrides from environment variables.
    pub fn from_env() -> Result<Self, ImgError> {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("VMIMG_DB_DIR") {
            config.db_dir = PathBuf::from(dir);
        }
        if let Ok(dir) = std::env::var("VMIMG_LEGACY_DB_DIR") {
            config.legacy_db_dir = PathBuf::from(dir);
        }
        if let Ok(pool) = std::env::var("VMIMG_POOL") {
            config.default_pool = pool;
        }

        config.insecure = std::env::var("VMIMG_INSECURE")
            .map(|v| matches!(v.as_str(), "1" | "true" | "yes"))
            .unwrap_or(false);

        match std::env::var("VMIMG_STORAGE").ok().as_deref() {
            None | Some("zfs") => {}
            Some("dir") => {
                let root = std::env::var("VMIMG_STORAGE_ROOT").map_err(|_| {
                    ImgError::config("VMIMG_STORAGE=dir requires VMIMG_STORAGE_ROOT")
                })?;
                config.storage = StorageBackend::Dir(PathBuf::from(root));
            }
            Some(other) => {
                return Err(ImgError::config(format!(
                    "unknown VMIMG_STORAGE \"{other}\" (expected \"zfs\" or \"dir\")"
                )))
            }
        }

        match std::env::var("VMIMG_DB_WRITE_POLICY").ok().as_deref() {
            None | Some("warn") => {}
            Some("fail") => config.db_write_policy = DbWritePolicy::Fail,
            Some(other) => {
                return Err(ImgError::config(format!(
                    "unknown VMIMG_DB_WRITE_POLICY \"{other}\" (expected \"warn\" or \"fail\")"
                )))
            }
        }

        if let Some(secs) = std::env::var("VMIMG_STREAM_TIMEOUT")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.stream_idle_timeout = Duration::from_secs(secs);
        }

        config.registry_token = std::env::var("VMIMG_REGISTRY_TOKEN").ok();

        Ok(config)
    }

    pub fn config_path(&self) -> PathBuf {
        self.db_dir.join(CONFIG_FILE)
    }
}

fn default_true() -> bool {
    true
}

fn is_false(b: &bool) -> bool {
    !*b
}

/// One configured source as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub url: String,

    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub source_type: Option<SourceType>,

    #[serde(default, skip_serializing_if = "is_false")]
    pub insecure: bool,
}

impl SourceEntry {
    pub fn new(url: impl Into<String>, source_type: SourceType) -> Self {
        Self {
            url: url.into(),
            source_type: Some(source_type),
            insecure: false,
        }
    }
}

/// On-disk configuration record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedConfig {
    /// Absent means "use the default source".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceEntry>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<u32>,

    /// Layered registries ignore bare uuid arguments.
    #[serde(default = "default_true")]
    pub docker_import_skip_uuids: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent_extra: Option<String>,

    /// Keys written by other tools are preserved on save.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Default for PersistedConfig {
    fn default() -> Self {
        Self {
            sources: None,
            schema_version: None,
            docker_import_skip_uuids: true,
            user_agent_extra: None,
            extra: Map::new(),
        }
    }
}

impl PersistedConfig {
    /// Sources in effect: the configured list, or the default catalog.
    pub fn effective_sources(&self) -> Vec<SourceEntry> {
        self.sources
            .clone()
            .unwrap_or_else(|| vec![SourceEntry::new(DEFAULT_SOURCE_URL, SourceType::Imgapi)])
    }
}

/// Reads and replaces the persisted config file.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the config.
    ///
    /// Returns defaults if the file doesn't exist; a file that exists but
    /// cannot be read or parsed is a config error.
    pub async fn load(&self) -> Result<PersistedConfig, ImgError> {
        let content = match fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No config file, using defaults");
                return Ok(PersistedConfig::default());
            }
            Err(err) => {
                return Err(ImgError::config_with(
                    format!("could not read config file \"{}\"", self.path.display()),
                    err,
                ))
            }
        };

        serde_json::from_str(&content).map_err(|err| {
            ImgError::config_with(
                format!("config file \"{}\" is not valid JSON", self.path.display()),
                err,
            )
        })
    }

    /// Replace the config file with `config`.
    pub async fn save(&self, config: &PersistedConfig) -> Result<(), ImgError> {
        let content = serde_json::to_string_pretty(config)
            .map_err(|err| ImgError::internal_with("could not serialize config", err))?;
        write_atomic(&self.path, content.as_bytes()).await?;
        debug!(path = %self.path.display(), "Config saved");
        Ok(())
    }
}

/// Write to a temp file next to `path`, then rename over it.
pub(crate) async fn write_atomic(path: &Path, content: &[u8]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp_path = path.with_file_name(format!(
        ".{file_name}.{}.tmp",
        uuid::Uuid::new_v4().simple()
    ));
    if let Err(err) = fs::write(&temp_path, content).await {
        fs::remove_file(&temp_path).await.ok();
        return Err(err);
    }
    if let Err(err) = fs::rename(&temp_path, path).await {
        fs::remove_file(&temp_path).await.ok();
        return Err(err);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn missing_file_loads_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let store = ConfigStore::new(temp_dir.path().join(CONFIG_FILE));

        let config = store.load().await.unwrap();
        assert_eq!(config, PersistedConfig::default());
        assert!(config.docker_import_skip_uuids);
        assert_eq!(
            config.effective_sources(),
            vec![SourceEntry::new(DEFAULT_SOURCE_URL, SourceType::Imgapi)]
        );
    }

    #[tokio::test]
    async fn corrupt_file_is_config_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(CONFIG_FILE);
        std::fs::write(&path, "{ not json").unwrap();

        let err = ConfigStore::new(path).load().await.unwrap_err();
        assert_eq!(err.code(), "ConfigError");
    }

    #[tokio::test]
    async fn save_replaces_and_keeps_unknown_keys() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join(CONFIG_FILE);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(
            &path,
            r#"{"sources":[{"url":"https://images.example.com"}],"schemaVersion":2,"operator":"ops"}"#,
        )
        .unwrap();

        let store = ConfigStore::new(path.clone());
        let mut config = store.load().await.unwrap();
        assert_eq!(config.schema_version, Some(2));
        assert_eq!(config.sources.as_ref().unwrap()[0].source_type, None);

        config.schema_version = Some(3);
        store.save(&config).await.unwrap();

        let raw: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["schemaVersion"], 3);
        assert_eq!(raw["operator"], "ops");
        assert_eq!(raw["dockerImportSkipUuids"], true);

        let leftovers: Vec<_> = std::fs::read_dir(path.parent().unwrap())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}
