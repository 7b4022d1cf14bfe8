// # Config Store Trait
//
// Defines the interface to the declarative-record store: source, target and
// sync-spec records in, aggregate statuses out.
//
// ## Implementations
//
// - In-memory: `MemoryConfigStore` (tests, embedding)
// - File-based: `FileConfigStore` (JSON document on disk)
//
// ## Change Notifications
//
// `watch` hands out a broadcast receiver of [`ChangeEvent`]s. The controller
// maps each event onto the sync specs it affects and triggers them early.

use crate::config::{SourceConfig, SyncSpec, TargetConfig};
use crate::status::AggregateStatus;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// A record in the store changed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    Source(String),
    Target(String),
    SyncSpec(String),
}

/// Trait for declarative-record store implementations
///
/// Lookups must reflect the store's current contents; callers read records
/// fresh every cycle and never cache them.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Look up a source record
    ///
    /// # Returns
    ///
    /// - `Ok(SourceConfig)`: The current record
    /// - `Err(Error::NotFound)`: No such source
    async fn source_config(&self, name: &str) -> Result<SourceConfig, crate::Error>;

    async fn target_config(&self, name: &str) -> Result<TargetConfig, crate::Error>;

    async fn sync_spec(&self, name: &str) -> Result<SyncSpec, crate::Error>;

    /// Names of every sync spec in the store
    async fn list_sync_specs(&self) -> Result<Vec<String>, crate::Error>;

    /// Persist the status produced by a cycle
    async fn write_status(&self, spec: &str, status: &AggregateStatus) -> Result<(), crate::Error>;

    /// Last persisted status for a sync spec, if any
    async fn read_status(&self, spec: &str) -> Result<Option<AggregateStatus>, crate::Error>;

    /// Subscribe to change notifications
    fn watch(&self) -> broadcast::Receiver<ChangeEvent>;
}
