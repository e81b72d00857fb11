//! Ordered, persisted list of configured image sources.
//!
//! The registry owns the [`PersistedConfig`] and writes the complete source
//! list back through [`ConfigStore`] after every mutation. Entries that
//! cannot be opened are left out of the live list but are written back
//! unchanged, next to the entry they followed.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use reqwest::Url;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{ConfigStore, PersistedConfig, SourceEntry};
use crate::error::ImgError;
use crate::source::{build_source, normalize_url, ImageSource, SourceContext, SourceRecord, SourceType};

/// One effect of [`SourceRegistry::update_urls`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SourceChange {
    Add { url: String, source_type: SourceType },
    Del { url: String },
    Reorder,
}

impl fmt::Display for SourceChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceChange::Add { url, source_type } => {
                write!(f, "Added \"{source_type}\" image source \"{url}\"")
            }
            SourceChange::Del { url } => write!(f, "Deleted image source \"{url}\""),
            SourceChange::Reorder => f.write_str("Reordered image sources"),
        }
    }
}

/// A configured entry no client could be built for.
#[derive(Debug, Clone)]
struct UnusableEntry {
    /// URL of the usable entry this one followed, `None` if it led the list.
    after: Option<String>,
    entry: SourceEntry,
}

impl UnusableEntry {
    fn matches(&self, url: &str) -> bool {
        match normalize_url(&self.entry.url) {
            Ok(normalized) => normalized == url,
            Err(_) => self.entry.url == url,
        }
    }
}

/// Configured sources, in priority order.
pub struct SourceRegistry {
    store: ConfigStore,
    ctx: SourceContext,
    config: PersistedConfig,
    entries: Vec<SourceEntry>,
    sources: Vec<Arc<dyn ImageSource>>,
    unusable: Vec<UnusableEntry>,
}

impl SourceRegistry {
    /// Build clients for every source in `config`.
    ///
    /// No DNS or ping happens here. An entry that cannot be turned into a
    /// client is logged and skipped.
    pub fn new(store: ConfigStore, config: PersistedConfig, ctx: SourceContext) -> Self {
        let mut entries: Vec<SourceEntry> = Vec::new();
        let mut sources = Vec::new();
        let mut unusable = Vec::new();

        for entry in config.effective_sources() {
            match open_entry(&entry, None, &ctx) {
                Ok((entry, source)) => {
                    entries.push(entry);
                    sources.push(source);
                }
                Err(err) => {
                    warn!(url = %entry.url, error = %err, "Skipping unusable image source");
                    unusable.push(UnusableEntry {
                        after: entries.last().map(|e| e.url.clone()),
                        entry,
                    });
                }
            }
        }

        debug!(
            count = sources.len(),
            unusable = unusable.len(),
            "Image sources loaded"
        );
        Self {
            store,
            ctx,
            config,
            entries,
            sources,
            unusable,
        }
    }

    pub fn sources(&self) -> &[Arc<dyn ImageSource>] {
        &self.sources
    }

    pub fn records(&self) -> Vec<SourceRecord> {
        self.sources.iter().map(|s| s.record().clone()).collect()
    }

    pub fn config(&self) -> &PersistedConfig {
        &self.config
    }

    pub fn context(&self) -> &SourceContext {
        &self.ctx
    }

    fn position(&self, url: &str) -> Option<usize> {
        self.entries.iter().position(|e| e.url == url)
    }

    /// Register a source. Returns `false` if its URL is already registered.
    pub async fn add(
        &mut self,
        url: &str,
        source_type: Option<SourceType>,
        insecure: bool,
        skip_ping: bool,
    ) -> Result<bool, ImgError> {
        let url = normalize_url(url)?;
        if self.position(&url).is_some() {
            debug!(url = %url, "Image source already registered");
            return Ok(false);
        }

        let entry = SourceEntry {
            source_type: Some(source_type.unwrap_or_else(|| SourceType::infer_from_url(&url))),
            insecure,
            url,
        };
        let (entry, source) = self.validate_new(entry, skip_ping).await?;

        let mut entries = self.entries.clone();
        let mut sources = self.sources.clone();
        entries.push(entry);
        sources.push(source);
        self.commit(entries, sources, self.unusable.clone()).await?;
        Ok(true)
    }

    /// Remove the source with this URL. Returns `false` if none matched.
    ///
    /// Unusable entries can be removed too.
    pub async fn del(&mut self, url: &str) -> Result<bool, ImgError> {
        let url = normalize_url(url)?;
        let mut entries = self.entries.clone();
        let mut sources = self.sources.clone();
        let mut unusable = self.unusable.clone();

        if let Some(index) = self.position(&url) {
            entries.remove(index);
            sources.remove(index);
        } else if let Some(index) = unusable.iter().position(|u| u.matches(&url)) {
            unusable.remove(index);
        } else {
            return Ok(false);
        }
        self.commit(entries, sources, unusable).await?;
        info!(url = %url, "Image source deleted");
        Ok(true)
    }

    /// Replace the source list with `desired`, in that order.
    ///
    /// Only URLs not already registered are pinged. Nothing is changed if
    /// any new source fails validation.
    pub async fn update_urls(
        &mut self,
        desired: Vec<(String, Option<SourceType>)>,
        skip_ping: bool,
    ) -> Result<Vec<SourceChange>, ImgError> {
        let mut wanted: Vec<(String, Option<SourceType>)> = Vec::with_capacity(desired.len());
        for (url, source_type) in desired {
            let url = normalize_url(&url)?;
            if !wanted.iter().any(|(u, _)| *u == url) {
                wanted.push((url, source_type));
            }
        }

        let mut changes: Vec<SourceChange> = self
            .entries
            .iter()
            .filter(|e| !wanted.iter().any(|(u, _)| *u == e.url))
            .map(|e| SourceChange::Del { url: e.url.clone() })
            .collect();

        let mut entries = Vec::with_capacity(wanted.len());
        let mut sources = Vec::with_capacity(wanted.len());
        for (url, source_type) in wanted {
            if let Some(index) = self.position(&url) {
                entries.push(self.entries[index].clone());
                sources.push(Arc::clone(&self.sources[index]));
                continue;
            }
            let source_type = source_type.unwrap_or_else(|| SourceType::infer_from_url(&url));
            let entry = SourceEntry::new(url.clone(), source_type);
            let (entry, source) = self.validate_new(entry, skip_ping).await?;
            changes.push(SourceChange::Add { url, source_type });
            entries.push(entry);
            sources.push(source);
        }

        let kept_before: Vec<&str> = self
            .entries
            .iter()
            .map(|e| e.url.as_str())
            .filter(|u| entries.iter().any(|e: &SourceEntry| e.url == *u))
            .collect();
        let kept_after: Vec<&str> = entries
            .iter()
            .map(|e| e.url.as_str())
            .filter(|u| self.position(u).is_some())
            .collect();
        if kept_before != kept_after {
            changes.push(SourceChange::Reorder);
        }

        if changes.is_empty() {
            return Ok(changes);
        }

        self.commit(entries, sources, self.unusable.clone()).await?;
        info!(changes = changes.len(), "Image sources updated");
        Ok(changes)
    }

    async fn validate_new(
        &self,
        entry: SourceEntry,
        skip_ping: bool,
    ) -> Result<(SourceEntry, Arc<dyn ImageSource>), ImgError> {
        let address = resolve_address(&entry.url).await?;
        let (entry, source) = open_entry(&entry, address, &self.ctx)?;
        if skip_ping {
            debug!(source = %source, "Skipping ping check");
        } else {
            source.ping().await?;
        }
        info!(source = %source, "Image source validated");
        Ok((entry, source))
    }

    /// Save the new list, then swap it in. A failed save changes nothing.
    async fn commit(
        &mut self,
        entries: Vec<SourceEntry>,
        sources: Vec<Arc<dyn ImageSource>>,
        unusable: Vec<UnusableEntry>,
    ) -> Result<(), ImgError> {
        let mut config = self.config.clone();
        config.sources = Some(with_unusable(&entries, &unusable));
        self.store.save(&config).await?;

        self.config = config;
        self.entries = entries;
        self.sources = sources;
        self.unusable = unusable;
        Ok(())
    }
}

/// Interleave unusable entries back after the entries they followed.
///
/// One whose anchor is gone goes last. One whose URL is now registered as a
/// usable source is dropped.
fn with_unusable(entries: &[SourceEntry], unusable: &[UnusableEntry]) -> Vec<SourceEntry> {
    let kept: Vec<&UnusableEntry> = unusable
        .iter()
        .filter(|u| !entries.iter().any(|e| u.matches(&e.url)))
        .collect();
    let push_anchored = |after: Option<&str>, merged: &mut Vec<SourceEntry>| {
        for u in &kept {
            if u.after.as_deref() == after {
                merged.push(u.entry.clone());
            }
        }
    };

    let mut merged = Vec::with_capacity(entries.len() + kept.len());
    push_anchored(None, &mut merged);
    for entry in entries {
        merged.push(entry.clone());
        push_anchored(Some(&entry.url), &mut merged);
    }
    merged.extend(
        kept.iter()
            .filter(|u| {
                u.after
                    .as_deref()
                    .is_some_and(|after| !entries.iter().any(|e| e.url == after))
            })
            .map(|u| u.entry.clone()),
    );
    merged
}

/// Normalize an entry and build its client.
fn open_entry(
    entry: &SourceEntry,
    address: Option<SocketAddr>,
    ctx: &SourceContext,
) -> Result<(SourceEntry, Arc<dyn ImageSource>), ImgError> {
    let url = normalize_url(&entry.url)?;
    let source_type = entry
        .source_type
        .unwrap_or_else(|| SourceType::infer_from_url(&url));
    let record = SourceRecord {
        url: url.clone(),
        source_type,
        insecure: entry.insecure,
        address,
    };
    let source = build_source(record, ctx)?;
    let entry = SourceEntry {
        url,
        source_type: Some(source_type),
        insecure: entry.insecure,
    };
    Ok((entry, source))
}

/// Resolve the URL host once. Literal addresses need no lookup.
async fn resolve_address(url: &str) -> Result<Option<SocketAddr>, ImgError> {
    let parsed = Url::parse(url)
        .map_err(|err| ImgError::Usage(format!("invalid source URL \"{url}\": {err}")))?;
    let host = parsed
        .host_str()
        .ok_or_else(|| ImgError::Usage(format!("source URL \"{url}\" has no host")))?;
    if host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .is_ok()
    {
        return Ok(None);
    }
    let port = parsed.port_or_known_default().unwrap_or(80);

    let mut addresses = tokio::net::lookup_host((host, port)).await.map_err(|err| {
        ImgError::internal_with(format!("could not resolve host \"{host}\""), err)
    })?;
    let address = addresses.next().ok_or_else(|| {
        ImgError::internal(format!("host \"{host}\" resolved to no addresses"))
    })?;
    debug!(host = %host, address = %address, "Resolved source host");
    Ok(Some(address))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CONFIG_FILE;
    use tempfile::TempDir;

    fn registry(temp_dir: &TempDir, sources: Option<Vec<SourceEntry>>) -> SourceRegistry {
        let config = PersistedConfig {
            sources,
            ..PersistedConfig::default()
        };
        SourceRegistry::new(
            ConfigStore::new(temp_dir.path().join(CONFIG_FILE)),
            config,
            SourceContext::default(),
        )
    }

    async fn saved_urls(temp_dir: &TempDir) -> Vec<String> {
        ConfigStore::new(temp_dir.path().join(CONFIG_FILE))
            .load()
            .await
            .unwrap()
            .sources
            .unwrap()
            .into_iter()
            .map(|e| e.url)
            .collect()
    }

    #[test]
    fn default_source_when_unconfigured() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry(&temp_dir, None);
        let records = registry.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].url, crate::config::DEFAULT_SOURCE_URL);
        assert_eq!(records[0].source_type, SourceType::Imgapi);
    }

    #[test]
    fn unusable_entries_are_skipped() {
        let temp_dir = TempDir::new().unwrap();
        let registry = registry(
            &temp_dir,
            Some(vec![
                SourceEntry::new("https://datasets.example.com", SourceType::Dsapi),
                SourceEntry::new("https://images.example.com", SourceType::Imgapi),
            ]),
        );
        assert_eq!(registry.sources().len(), 1);
        assert_eq!(registry.records()[0].url, "https://images.example.com");
    }

    #[tokio::test]
    async fn del_materializes_default_and_persists() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = registry(&temp_dir, None);

        assert!(!registry.del("https://nowhere.example.com").await.unwrap());
        assert!(registry.del("https://images.smartos.org/").await.unwrap());
        assert!(registry.sources().is_empty());

        let saved = ConfigStore::new(temp_dir.path().join(CONFIG_FILE))
            .load()
            .await
            .unwrap();
        assert_eq!(saved.sources, Some(vec![]));
    }

    #[tokio::test]
    async fn update_urls_with_same_list_is_no_change() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = registry(
            &temp_dir,
            Some(vec![
                SourceEntry::new("https://a.example.com", SourceType::Imgapi),
                SourceEntry::new("https://b.example.com", SourceType::Imgapi),
            ]),
        );

        let changes = registry
            .update_urls(
                vec![
                    ("https://a.example.com/".to_string(), None),
                    ("https://b.example.com:443".to_string(), None),
                ],
                false,
            )
            .await
            .unwrap();
        assert!(changes.is_empty());
        assert!(!temp_dir.path().join(CONFIG_FILE).exists());
    }

    #[tokio::test]
    async fn pure_reorder_yields_single_change() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = registry(
            &temp_dir,
            Some(vec![
                SourceEntry::new("https://a.example.com", SourceType::Imgapi),
                SourceEntry::new("https://b.example.com", SourceType::Imgapi),
            ]),
        );

        let changes = registry
            .update_urls(
                vec![
                    ("https://b.example.com".to_string(), None),
                    ("https://a.example.com".to_string(), None),
                ],
                false,
            )
            .await
            .unwrap();
        assert_eq!(changes, vec![SourceChange::Reorder]);
        assert_eq!(registry.records()[0].url, "https://b.example.com");
    }

    #[tokio::test]
    async fn unusable_entries_survive_add() {
        let temp_dir = TempDir::new().unwrap();
        let broken = SourceEntry::new("https://datasets.example.com", SourceType::Dsapi);
        let mut registry = registry(
            &temp_dir,
            Some(vec![
                SourceEntry::new("https://a.example.com", SourceType::Imgapi),
                broken.clone(),
            ]),
        );

        assert!(registry
            .add("http://127.0.0.1:9", Some(SourceType::Imgapi), false, true)
            .await
            .unwrap());
        assert_eq!(
            saved_urls(&temp_dir).await,
            vec![
                "https://a.example.com",
                "https://datasets.example.com",
                "http://127.0.0.1:9"
            ]
        );
        let saved = registry.config().sources.clone().unwrap();
        assert_eq!(saved[1], broken);
        assert_eq!(registry.records().len(), 2);
    }

    #[tokio::test]
    async fn unusable_entry_moves_last_when_its_anchor_goes() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = registry(
            &temp_dir,
            Some(vec![
                SourceEntry::new("https://datasets.example.com", SourceType::Dsapi),
                SourceEntry::new("https://a.example.com", SourceType::Imgapi),
                SourceEntry::new("https://datasets.example.net", SourceType::Dsapi),
                SourceEntry::new("https://b.example.com", SourceType::Imgapi),
            ]),
        );

        let changes = registry
            .update_urls(vec![("https://b.example.com".to_string(), None)], false)
            .await
            .unwrap();
        assert_eq!(
            changes,
            vec![SourceChange::Del {
                url: "https://a.example.com".to_string()
            }]
        );
        assert_eq!(
            saved_urls(&temp_dir).await,
            vec![
                "https://datasets.example.com",
                "https://b.example.com",
                "https://datasets.example.net"
            ]
        );
    }

    #[tokio::test]
    async fn del_removes_unusable_entry() {
        let temp_dir = TempDir::new().unwrap();
        let mut registry = registry(
            &temp_dir,
            Some(vec![
                SourceEntry::new("https://a.example.com", SourceType::Imgapi),
                SourceEntry::new("https://datasets.example.com", SourceType::Dsapi),
            ]),
        );

        assert!(registry.del("https://datasets.example.com/").await.unwrap());
        assert_eq!(saved_urls(&temp_dir).await, vec!["https://a.example.com"]);
        assert!(!registry.del("https://datasets.example.com").await.unwrap());
    }

    #[tokio::test]
    async fn failed_save_leaves_sources_unchanged() {
        let temp_dir = TempDir::new().unwrap();
        // A regular file where the config directory should be.
        let blocker = temp_dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();
        let config = PersistedConfig {
            sources: Some(vec![SourceEntry::new(
                "https://a.example.com",
                SourceType::Imgapi,
            )]),
            ..PersistedConfig::default()
        };
        let mut registry = SourceRegistry::new(
            ConfigStore::new(blocker.join(CONFIG_FILE)),
            config.clone(),
            SourceContext::default(),
        );

        assert!(registry
            .add("http://127.0.0.1:9", Some(SourceType::Imgapi), false, true)
            .await
            .is_err());
        assert_eq!(registry.records().len(), 1);

        assert!(registry.del("https://a.example.com").await.is_err());
        assert_eq!(registry.records()[0].url, "https://a.example.com");
        assert_eq!(registry.config(), &config);
    }
}
