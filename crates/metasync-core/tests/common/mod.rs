//! Test doubles and common utilities for engine contract tests
//!
//! The doubles count every call so tests can assert on what the engine did
//! (fetches, reads, writes, builds) rather than on log output.

#![allow(dead_code)]

use metasync_core::config::{CloudflareTargetSettings, MetadataSourceSettings};
use metasync_core::error::{Error, Result};
use metasync_core::traits::{ApplyOutcome, ComponentFactory, RangeSource, RangeTarget};
use metasync_core::{
    AddressRangeSet, CredentialRef, EngineConfig, InstanceRegistry, MemoryConfigStore,
    MemorySecretReader, SourceConfig, SourceSettings, SyncContext, SyncEngine, TargetConfig,
    TargetSettings,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Build a set from `(cidr, label)` pairs
pub fn ranges(entries: &[(&str, &str)]) -> AddressRangeSet {
    let mut set = AddressRangeSet::new();
    for &(cidr, label) in entries {
        set.add(cidr, [label]).unwrap();
    }
    set
}

pub fn source_config(name: &str) -> SourceConfig {
    SourceConfig::new(name, SourceSettings::Metadata(MetadataSourceSettings::default()))
}

pub fn target_config(name: &str) -> TargetConfig {
    TargetConfig::new(
        name,
        TargetSettings::Cloudflare(CloudflareTargetSettings::new("zone", name)),
    )
}

/// A source that returns canned ranges or a canned error
pub struct MockSource {
    name: String,
    result: Arc<Mutex<std::result::Result<AddressRangeSet, Error>>>,
    fetch_count: Arc<AtomicUsize>,
    init_count: Arc<AtomicUsize>,
    credential: Arc<Mutex<Option<String>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
    delay: Duration,
}

impl MockSource {
    pub fn new(name: &str, ranges: AddressRangeSet) -> Self {
        Self {
            name: name.to_string(),
            result: Arc::new(Mutex::new(Ok(ranges))),
            fetch_count: Arc::new(AtomicUsize::new(0)),
            init_count: Arc::new(AtomicUsize::new(0)),
            credential: Arc::new(Mutex::new(None)),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
            delay: Duration::ZERO,
        }
    }

    pub fn failing(name: &str, error: Error) -> Self {
        let source = Self::new(name, AddressRangeSet::new());
        *source.result.lock().unwrap() = Err(error);
        source
    }

    /// Make each fetch take `delay`
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Create a new MockSource that shares counters and results with an existing one
    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            name: other.name.clone(),
            result: Arc::clone(&other.result),
            fetch_count: Arc::clone(&other.fetch_count),
            init_count: Arc::clone(&other.init_count),
            credential: Arc::clone(&other.credential),
            in_flight: Arc::clone(&other.in_flight),
            max_in_flight: Arc::clone(&other.max_in_flight),
            delay: other.delay,
        }
    }

    pub fn set_ranges(&self, ranges: AddressRangeSet) {
        *self.result.lock().unwrap() = Ok(ranges);
    }

    pub fn fetch_count(&self) -> usize {
        self.fetch_count.load(Ordering::SeqCst)
    }

    pub fn init_count(&self) -> usize {
        self.init_count.load(Ordering::SeqCst)
    }

    pub fn credential(&self) -> Option<String> {
        self.credential.lock().unwrap().clone()
    }

    /// Highest number of fetches observed running at once
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RangeSource for MockSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, _config: &SourceConfig, credential: Option<String>) -> Result<()> {
        self.init_count.fetch_add(1, Ordering::SeqCst);
        *self.credential.lock().unwrap() = credential;
        Ok(())
    }

    async fn fetch(&self, ctx: &SyncContext) -> Result<AddressRangeSet> {
        self.fetch_count.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let delay = self.delay;
        let waited = ctx
            .run(async move {
                tokio::time::sleep(delay).await;
                Ok(())
            })
            .await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        waited?;

        self.result.lock().unwrap().clone()
    }
}

/// A target that keeps its applied set in memory and counts writes
pub struct MockTarget {
    name: String,
    applied: Arc<Mutex<AddressRangeSet>>,
    write_count: Arc<AtomicUsize>,
    apply_count: Arc<AtomicUsize>,
    fail_with: Arc<Mutex<Option<Error>>>,
}

impl MockTarget {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            applied: Arc::new(Mutex::new(AddressRangeSet::new())),
            write_count: Arc::new(AtomicUsize::new(0)),
            apply_count: Arc::new(AtomicUsize::new(0)),
            fail_with: Arc::new(Mutex::new(None)),
        }
    }

    pub fn holding(name: &str, applied: AddressRangeSet) -> Self {
        let target = Self::new(name);
        *target.applied.lock().unwrap() = applied;
        target
    }

    /// Create a new MockTarget that shares counters and state with an existing one
    pub fn sharing_counters_with(other: &Self) -> Self {
        Self {
            name: other.name.clone(),
            applied: Arc::clone(&other.applied),
            write_count: Arc::clone(&other.write_count),
            apply_count: Arc::clone(&other.apply_count),
            fail_with: Arc::clone(&other.fail_with),
        }
    }

    pub fn fail_with(&self, error: Error) {
        *self.fail_with.lock().unwrap() = Some(error);
    }

    pub fn applied_cidrs(&self) -> Vec<String> {
        self.applied.lock().unwrap().cidrs()
    }

    /// Number of external writes performed
    pub fn write_count(&self) -> usize {
        self.write_count.load(Ordering::SeqCst)
    }

    /// Number of times the engine called `apply`
    pub fn apply_count(&self) -> usize {
        self.apply_count.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl RangeTarget for MockTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, _config: &TargetConfig, _credential: Option<String>) -> Result<()> {
        Ok(())
    }

    async fn read_applied(&self, _ctx: &SyncContext) -> Result<AddressRangeSet> {
        Ok(self.applied.lock().unwrap().clone())
    }

    async fn apply(&self, ctx: &SyncContext, desired: &AddressRangeSet) -> Result<ApplyOutcome> {
        self.apply_count.fetch_add(1, Ordering::SeqCst);
        let failure = self.fail_with.lock().unwrap().clone();
        if let Some(error) = failure {
            return Err(error);
        }

        let current = self.read_applied(ctx).await?;
        let diff = current.diff(desired);
        if diff.is_empty() {
            return Ok(ApplyOutcome::Unchanged);
        }

        self.write_count.fetch_add(1, Ordering::SeqCst);
        *self.applied.lock().unwrap() = AddressRangeSet::from_cidrs(desired.unique_cidrs())?;
        Ok(ApplyOutcome::Applied {
            added: diff.added.len(),
            removed: diff.removed.len(),
        })
    }
}

/// Factory handing out doubles that share counters with registered templates
#[derive(Default)]
pub struct MockFactory {
    sources: Mutex<HashMap<String, MockSource>>,
    targets: Mutex<HashMap<String, MockTarget>>,
    build_count: Arc<AtomicUsize>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&self, source: &MockSource) {
        self.sources
            .lock()
            .unwrap()
            .insert(source.name.clone(), MockSource::sharing_counters_with(source));
    }

    pub fn add_target(&self, target: &MockTarget) {
        self.targets
            .lock()
            .unwrap()
            .insert(target.name.clone(), MockTarget::sharing_counters_with(target));
    }

    /// Number of instances built so far
    pub fn build_count(&self) -> usize {
        self.build_count.load(Ordering::SeqCst)
    }
}

impl ComponentFactory for MockFactory {
    fn build_source(&self, config: &SourceConfig) -> Result<Box<dyn RangeSource>> {
        let sources = self.sources.lock().unwrap();
        let template = sources
            .get(&config.name)
            .ok_or_else(|| Error::init(format!("no mock source '{}'", config.name)))?;
        self.build_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockSource::sharing_counters_with(template)))
    }

    fn build_target(&self, config: &TargetConfig) -> Result<Box<dyn RangeTarget>> {
        let targets = self.targets.lock().unwrap();
        let template = targets
            .get(&config.name)
            .ok_or_else(|| Error::init(format!("no mock target '{}'", config.name)))?;
        self.build_count.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MockTarget::sharing_counters_with(template)))
    }
}

/// Store, secrets, factory, registry and engine wired together
pub struct Harness {
    pub store: MemoryConfigStore,
    pub secrets: MemorySecretReader,
    pub factory: Arc<MockFactory>,
    pub registry: Arc<InstanceRegistry>,
    pub engine: Arc<SyncEngine>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_registry(|registry| registry)
    }

    /// Build a harness, letting the caller adjust the registry first
    pub fn with_registry(configure: impl FnOnce(InstanceRegistry) -> InstanceRegistry) -> Self {
        let store = MemoryConfigStore::new();
        let secrets = MemorySecretReader::new();
        let factory = Arc::new(MockFactory::new());
        let registry = Arc::new(configure(InstanceRegistry::new(
            factory.clone(),
            Arc::new(secrets.clone()),
        )));
        let engine = Arc::new(SyncEngine::new(Arc::new(store.clone()), Arc::clone(&registry)));
        Self {
            store,
            secrets,
            factory,
            registry,
            engine,
        }
    }

    /// Register a source double and its config record
    pub async fn source(&self, source: &MockSource) {
        self.factory.add_source(source);
        self.store.upsert_source(source_config(&source.name)).await;
    }

    /// Register a source double whose config needs a credential
    pub async fn source_with_credential(&self, source: &MockSource, credential: CredentialRef) {
        self.factory.add_source(source);
        self.store
            .upsert_source(source_config(&source.name).with_credential(credential))
            .await;
    }

    /// Register a target double and its config record
    pub async fn target(&self, target: &MockTarget) {
        self.factory.add_target(target);
        self.store.upsert_target(target_config(&target.name)).await;
    }
}

/// Engine settings with short delays for controller tests
pub fn fast_engine_config() -> EngineConfig {
    EngineConfig {
        success_requeue_secs: 3600,
        failure_requeue_secs: 3600,
        workers: 4,
        cycle_timeout_secs: 5,
    }
}
