// # Memory Config Store
//
// In-memory implementation of ConfigStore.
//
// ## Purpose
//
// Holds records and statuses in process memory. Used by tests and by
// embedders that feed records from their own source of truth. Every upsert
// or removal is broadcast as a ChangeEvent.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, broadcast};

use crate::Error;
use crate::config::{SourceConfig, SyncSpec, TargetConfig};
use crate::status::AggregateStatus;
use crate::store::CHANGE_CHANNEL_CAPACITY;
use crate::traits::{ChangeEvent, ConfigStore};

#[derive(Debug, Default)]
struct Records {
    sources: HashMap<String, SourceConfig>,
    targets: HashMap<String, TargetConfig>,
    specs: HashMap<String, SyncSpec>,
    statuses: HashMap<String, AggregateStatus>,
}

/// In-memory config store
#[derive(Debug, Clone)]
pub struct MemoryConfigStore {
    inner: Arc<RwLock<Records>>,
    changes: broadcast::Sender<ChangeEvent>,
}

impl Default for MemoryConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryConfigStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(RwLock::new(Records::default())),
            changes,
        }
    }

    /// Insert or replace a source record
    pub async fn upsert_source(&self, config: SourceConfig) {
        let name = config.name.clone();
        self.inner.write().await.sources.insert(name.clone(), config);
        self.notify(ChangeEvent::Source(name));
    }

    /// Insert or replace a target record
    pub async fn upsert_target(&self, config: TargetConfig) {
        let name = config.name.clone();
        self.inner.write().await.targets.insert(name.clone(), config);
        self.notify(ChangeEvent::Target(name));
    }

    /// Insert or replace a sync spec
    pub async fn upsert_sync_spec(&self, spec: SyncSpec) {
        let name = spec.name.clone();
        self.inner.write().await.specs.insert(name.clone(), spec);
        self.notify(ChangeEvent::SyncSpec(name));
    }

    /// Remove a sync spec; its loop stops on the next lookup
    pub async fn remove_sync_spec(&self, name: &str) {
        self.inner.write().await.specs.remove(name);
        self.notify(ChangeEvent::SyncSpec(name.to_string()));
    }

    fn notify(&self, event: ChangeEvent) {
        // No subscribers is fine
        let _ = self.changes.send(event);
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn source_config(&self, name: &str) -> Result<SourceConfig, Error> {
        self.inner
            .read()
            .await
            .sources
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("source '{name}'")))
    }

    async fn target_config(&self, name: &str) -> Result<TargetConfig, Error> {
        self.inner
            .read()
            .await
            .targets
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("target '{name}'")))
    }

    async fn sync_spec(&self, name: &str) -> Result<SyncSpec, Error> {
        self.inner
            .read()
            .await
            .specs
            .get(name)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("sync spec '{name}'")))
    }

    async fn list_sync_specs(&self) -> Result<Vec<String>, Error> {
        let mut names: Vec<String> = self.inner.read().await.specs.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn write_status(&self, spec: &str, status: &AggregateStatus) -> Result<(), Error> {
        self.inner
            .write()
            .await
            .statuses
            .insert(spec.to_string(), status.clone());
        Ok(())
    }

    async fn read_status(&self, spec: &str) -> Result<Option<AggregateStatus>, Error> {
        Ok(self.inner.read().await.statuses.get(spec).cloned())
    }

    fn watch(&self) -> broadcast::Receiver<ChangeEvent> {
        self.changes.subscribe()
    }
}
