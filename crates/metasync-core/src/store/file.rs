// # File Config Store
//
// File-based implementation of ConfigStore.
//
// ## Records
//
// Source, target and sync-spec records live in one JSON document that is
// read fresh on every lookup, so edits on disk take effect on the next
// cycle. `reload()` compares the document with the last one it saw and
// broadcasts a ChangeEvent for every record that changed.
//
// Source and target generations are stamped from each record's content when
// the document is read. Any edit to a record, with or without a hand-edited
// `generation`, yields a new generation and rebuilds its cached instance.
//
// ```json
// {
//   "sources": [{"name": "github", "settings": {"kind": "metadata"}}],
//   "targets": [{"name": "edge", "settings": {"kind": "cloudflare", "zoneId": "...", "ruleName": "github"}}],
//   "syncSpecs": [{"name": "github-edge", "sources": [{"name": "github"}], "targets": [{"name": "edge"}]}]
// }
// ```
//
// ## Statuses
//
// Statuses are written to a separate file with the same crash-recovery
// discipline as a state file:
// - Atomic writes: write to `.tmp`, then rename
// - Backup: the previous file is copied to `.backup` before each rename
// - Recovery: a corrupted status file falls back to the backup

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeMap, HashMap};
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock, broadcast};

use crate::Error;
use crate::config::{SourceConfig, SyncSpec, TargetConfig};
use crate::status::AggregateStatus;
use crate::store::CHANGE_CHANNEL_CAPACITY;
use crate::traits::{ChangeEvent, ConfigStore};

/// Status file format version
const STATUS_FILE_VERSION: &str = "1.0";

/// On-disk record document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub targets: Vec<TargetConfig>,
    #[serde(default)]
    pub sync_specs: Vec<SyncSpec>,
}

impl ConfigDocument {
    /// Replace source and target generations with content stamps
    fn stamp_generations(&mut self) {
        for source in &mut self.sources {
            source.generation = content_generation(source);
        }
        for target in &mut self.targets {
            target.generation = content_generation(target);
        }
    }

    /// Events describing how `self` differs from `previous`
    fn changes_since(&self, previous: &ConfigDocument) -> Vec<ChangeEvent> {
        let mut events = Vec::new();

        diff_named(&previous.sources, &self.sources, |s| &s.name)
            .into_iter()
            .for_each(|name| events.push(ChangeEvent::Source(name)));
        diff_named(&previous.targets, &self.targets, |t| &t.name)
            .into_iter()
            .for_each(|name| events.push(ChangeEvent::Target(name)));
        diff_named(&previous.sync_specs, &self.sync_specs, |s| &s.name)
            .into_iter()
            .for_each(|name| events.push(ChangeEvent::SyncSpec(name)));

        events
    }
}

/// Stable stamp of a record's serialized content
fn content_generation<T: Serialize>(record: &T) -> u64 {
    let mut hasher = DefaultHasher::new();
    serde_json::to_string(record).unwrap_or_default().hash(&mut hasher);
    hasher.finish()
}

/// Names of records added, removed or modified between two lists
fn diff_named<T: PartialEq>(before: &[T], after: &[T], name: impl Fn(&T) -> &String) -> Vec<String> {
    let old: HashMap<&String, &T> = before.iter().map(|r| (name(r), r)).collect();
    let new: HashMap<&String, &T> = after.iter().map(|r| (name(r), r)).collect();

    let mut changed: Vec<String> = new
        .iter()
        .filter(|(n, r)| old.get(*n) != Some(*r))
        .map(|(n, _)| (*n).clone())
        .chain(old.keys().filter(|n| !new.contains_key(*n)).map(|n| (*n).clone()))
        .collect();
    changed.sort();
    changed
}

/// Serializable status file format
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StatusFileFormat {
    version: String,
    statuses: BTreeMap<String, AggregateStatus>,
}

/// File-backed config store
#[derive(Debug)]
pub struct FileConfigStore {
    config_path: PathBuf,
    status_path: PathBuf,
    statuses: Arc<RwLock<BTreeMap<String, AggregateStatus>>>,
    /// Serializes status file writes
    write_lock: Mutex<()>,
    last_seen: Mutex<Option<ConfigDocument>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl FileConfigStore {
    /// Open a store over a record document and a status file
    ///
    /// The record document must exist and parse. The status file is created
    /// on first write; if it is corrupted the backup is used instead.
    pub async fn open<P: AsRef<Path>, Q: AsRef<Path>>(config_path: P, status_path: Q) -> Result<Self, Error> {
        let config_path = config_path.as_ref().to_path_buf();
        let status_path = status_path.as_ref().to_path_buf();

        let document = Self::load_document(&config_path).await?;

        if let Some(parent) = status_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent).await.map_err(|e| {
                    Error::Io(format!(
                        "Failed to create status directory {}: {}",
                        parent.display(),
                        e
                    ))
                })?;
            }
        }

        let statuses = Self::load_statuses_with_recovery(&status_path).await?;
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        tracing::debug!(
            sources = document.sources.len(),
            targets = document.targets.len(),
            sync_specs = document.sync_specs.len(),
            "Loaded config document from {}",
            config_path.display()
        );

        Ok(Self {
            config_path,
            status_path,
            statuses: Arc::new(RwLock::new(statuses)),
            write_lock: Mutex::new(()),
            last_seen: Mutex::new(Some(document)),
            changes,
        })
    }

    /// Re-read the record document and broadcast what changed
    ///
    /// Returns the number of change events sent.
    pub async fn reload(&self) -> Result<usize, Error> {
        let document = Self::load_document(&self.config_path).await?;
        let mut last_seen = self.last_seen.lock().await;
        let previous = last_seen.take().unwrap_or_default();

        let events = document.changes_since(&previous);
        *last_seen = Some(document);
        drop(last_seen);

        for event in &events {
            tracing::debug!(?event, "Config record changed");
            let _ = self.changes.send(event.clone());
        }
        Ok(events.len())
    }

    async fn document(&self) -> Result<ConfigDocument, Error> {
        Self::load_document(&self.config_path).await
    }

    async fn load_document(path: &Path) -> Result<ConfigDocument, Error> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::Io(format!("Failed to read config file {}: {}", path.display(), e))
        })?;
        let mut document: ConfigDocument = serde_json::from_str(&content).map_err(|e| {
            Error::Json(format!("Failed to parse config file {}: {}", path.display(), e))
        })?;
        document.stamp_generations();
        Ok(document)
    }

    /// Load statuses, falling back to the backup when the main file is corrupted
    async fn load_statuses_with_recovery(path: &Path) -> Result<BTreeMap<String, AggregateStatus>, Error> {
        match Self::load_statuses(path).await {
            Ok(statuses) => Ok(statuses),
            Err(Error::Json(e)) => {
                tracing::warn!("Status file appears corrupted: {}. Attempting recovery from backup.", e);
                let backup = Self::backup_path(path);
                if !backup.exists() {
                    tracing::warn!("No backup file found. Starting with empty statuses.");
                    return Ok(BTreeMap::new());
                }
                match Self::load_statuses(&backup).await {
                    Ok(statuses) => {
                        tracing::info!("Recovered {} statuses from backup", statuses.len());
                        if let Err(e) = fs::copy(&backup, path).await {
                            tracing::error!("Failed to restore status file from backup: {}", e);
                        }
                        Ok(statuses)
                    }
                    Err(e) => {
                        tracing::error!("Backup also corrupted: {}. Starting with empty statuses.", e);
                        Ok(BTreeMap::new())
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn load_statuses(path: &Path) -> Result<BTreeMap<String, AggregateStatus>, Error> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }
        let content = fs::read_to_string(path).await.map_err(|e| {
            Error::Io(format!("Failed to read status file {}: {}", path.display(), e))
        })?;
        let file: StatusFileFormat = serde_json::from_str(&content).map_err(|e| {
            Error::Json(format!("Failed to parse status file {}: {}", path.display(), e))
        })?;
        if file.version != STATUS_FILE_VERSION {
            tracing::warn!(
                "Status file version mismatch: expected {}, got {}. Attempting to load anyway.",
                STATUS_FILE_VERSION,
                file.version
            );
        }
        Ok(file.statuses)
    }

    /// Write all statuses atomically
    async fn write_statuses(&self) -> Result<(), Error> {
        let _writing = self.write_lock.lock().await;

        let file = StatusFileFormat {
            version: STATUS_FILE_VERSION.to_string(),
            statuses: self.statuses.read().await.clone(),
        };
        let json = serde_json::to_string_pretty(&file)?;

        let temp_path = self.temp_path();
        {
            let mut out = fs::File::create(&temp_path).await.map_err(|e| {
                Error::Io(format!("Failed to create temp file {}: {}", temp_path.display(), e))
            })?;
            out.write_all(json.as_bytes()).await?;
            out.flush().await?;
        }

        if self.status_path.exists() {
            if let Err(e) = fs::copy(&self.status_path, Self::backup_path(&self.status_path)).await {
                tracing::warn!("Failed to create backup: {}", e);
            }
        }

        fs::rename(&temp_path, &self.status_path).await.map_err(|e| {
            Error::Io(format!(
                "Failed to rename {} to {}: {}",
                temp_path.display(),
                self.status_path.display(),
                e
            ))
        })?;

        tracing::trace!("Statuses written to {}", self.status_path.display());
        Ok(())
    }

    fn temp_path(&self) -> PathBuf {
        let mut temp = self.status_path.clone();
        temp.set_extension("tmp");
        temp
    }

    fn backup_path(path: &Path) -> PathBuf {
        let mut backup = path.to_path_buf();
        backup.set_extension("backup");
        backup
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn source_config(&self, name: &str) -> Result<SourceConfig, Error> {
        self.document()
            .await?
            .sources
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::not_found(format!("source '{name}'")))
    }

    async fn target_config(&self, name: &str) -> Result<TargetConfig, Error> {
        self.document()
            .await?
            .targets
            .into_iter()
            .find(|t| t.name == name)
            .ok_or_else(|| Error::not_found(format!("target '{name}'")))
    }

    async fn sync_spec(&self, name: &str) -> Result<SyncSpec, Error> {
        self.document()
            .await?
            .sync_specs
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| Error::not_found(format!("sync spec '{name}'")))
    }

    async fn list_sync_specs(&self) -> Result<Vec<String>, Error> {
        Ok(self
            .document()
            .await?
            .sync_specs
            .into_iter()
            .map(|s| s.name)
            .collect())
    }

    async fn write_status(&self, spec: &str, status: &AggregateStatus) -> Result<(), Error> {
        self.statuses
            .write()
            .await
            .insert(spec.to_string(), status.clone());
        self.write_statuses().await
    }

    async fn read_status(&self, spec: &str) -> Result<Option<AggregateStatus>, Error> {
        Ok(self.statuses.read().await.get(spec).cloned())
    }

    fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::{ConditionState, CyclePhase, ReadyCondition};
    use chrono::Utc;
    use tempfile::tempdir;

    const DOCUMENT: &str = r#"{
        "sources": [{"name": "github", "generation": 1, "settings": {"kind": "metadata"}}],
        "targets": [{"name": "edge", "settings": {"kind": "cloudflare", "zoneId": "z", "ruleName": "github"}}],
        "syncSpecs": [{"name": "github-edge", "sources": [{"name": "github"}], "targets": [{"name": "edge"}]}]
    }"#;

    fn status(reason: &str) -> AggregateStatus {
        let now = Utc::now();
        AggregateStatus {
            last_attempt: now,
            last_success: Some(now),
            phase: CyclePhase::Completed,
            desired_count: 0,
            source_statuses: Vec::new(),
            target_statuses: Vec::new(),
            ready_condition: ReadyCondition {
                state: ConditionState::True,
                reason: reason.to_string(),
                message: String::new(),
                observed_at: now,
                observed_generation: 0,
            },
        }
    }

    #[tokio::test]
    async fn records_are_read_fresh() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("config.json");
        fs::write(&config, DOCUMENT).await.unwrap();

        let store = FileConfigStore::open(&config, dir.path().join("status.json"))
            .await
            .unwrap();
        let first = store.source_config("github").await.unwrap().generation;
        assert_eq!(store.source_config("github").await.unwrap().generation, first);
        assert_eq!(store.list_sync_specs().await.unwrap(), vec!["github-edge"]);

        fs::write(&config, DOCUMENT.replace("\"generation\": 1", "\"generation\": 2"))
            .await
            .unwrap();
        assert_ne!(store.source_config("github").await.unwrap().generation, first);
        assert!(matches!(store.target_config("nope").await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn reload_broadcasts_changed_records() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("config.json");
        fs::write(&config, DOCUMENT).await.unwrap();

        let store = FileConfigStore::open(&config, dir.path().join("status.json"))
            .await
            .unwrap();
        let mut changes = store.watch();

        assert_eq!(store.reload().await.unwrap(), 0);

        fs::write(&config, DOCUMENT.replace("\"generation\": 1", "\"generation\": 2"))
            .await
            .unwrap();
        assert_eq!(store.reload().await.unwrap(), 1);
        assert_eq!(changes.recv().await.unwrap(), ChangeEvent::Source("github".into()));
    }

    #[tokio::test]
    async fn settings_edit_changes_generation() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("config.json");
        fs::write(&config, DOCUMENT).await.unwrap();

        let store = FileConfigStore::open(&config, dir.path().join("status.json"))
            .await
            .unwrap();
        let before = store.target_config("edge").await.unwrap().generation;
        let source_before = store.source_config("github").await.unwrap().generation;

        fs::write(&config, DOCUMENT.replace("\"zoneId\": \"z\"", "\"zoneId\": \"z2\""))
            .await
            .unwrap();
        let after = store.target_config("edge").await.unwrap();

        assert_eq!(after.settings.kind(), "cloudflare");
        assert_ne!(after.generation, before);
        assert_eq!(store.source_config("github").await.unwrap().generation, source_before);
    }

    #[tokio::test]
    async fn status_survives_corruption_via_backup() {
        let dir = tempdir().unwrap();
        let config = dir.path().join("config.json");
        let status_path = dir.path().join("status.json");
        fs::write(&config, DOCUMENT).await.unwrap();

        let store = FileConfigStore::open(&config, &status_path).await.unwrap();
        store.write_status("github-edge", &status("First")).await.unwrap();
        store.write_status("github-edge", &status("Second")).await.unwrap();
        assert!(FileConfigStore::backup_path(&status_path).exists());

        fs::write(&status_path, b"corrupted json data").await.unwrap();

        let reopened = FileConfigStore::open(&config, &status_path).await.unwrap();
        let recovered = reopened.read_status("github-edge").await.unwrap().unwrap();
        assert_eq!(recovered.ready_condition.reason, "First");
    }
}
