//! Process-wide source and target instance registry
//!
//! Source and target instances are long-lived: they hold their fetch memo and
//! last-applied memo across cycles. The registry creates one instance per
//! distinct name on first use and hands out the same `Arc` afterwards.
//!
//! ## Eviction
//!
//! Each instance is tagged with the `generation` of the configuration record
//! it was built from. When a cycle presents a record with a different
//! generation the instance is rebuilt, and the eviction hook fires once the
//! replacement is ready. The generation check is repeated under the name's
//! build lock, so cycles racing on the same change rebuild once. A failed
//! rebuild keeps the previous instance cached and is retried next cycle.
//!
//! ## Concurrency
//!
//! Builds are single-flight per name through [`KeyedMemo`]. Two names never
//! wait on each other.
//!
//! ## Usage
//!
//! ```rust,ignore
//! let registry = InstanceRegistry::new(factory, secrets);
//! let source = registry.source(&ctx, &source_config).await?;
//! let ranges = source.fetch(&ctx).await?;
//! ```

use crate::cache::KeyedMemo;
use crate::config::{CredentialRef, SourceConfig, TargetConfig};
use crate::context::SyncContext;
use crate::error::{Error, Result};
use crate::traits::{ComponentFactory, RangeSource, RangeTarget, SecretReader};
use std::sync::Arc;

/// Called with `(name, old_generation, new_generation)` when an instance is replaced
pub type EvictionHook = Arc<dyn Fn(&str, u64, u64) + Send + Sync>;

struct Entry<T: ?Sized> {
    generation: u64,
    instance: Arc<T>,
}

impl<T: ?Sized> Clone for Entry<T> {
    fn clone(&self) -> Self {
        Self {
            generation: self.generation,
            instance: Arc::clone(&self.instance),
        }
    }
}

/// Cache of initialized sources and targets keyed by name
pub struct InstanceRegistry {
    factory: Arc<dyn ComponentFactory>,
    secrets: Arc<dyn SecretReader>,
    sources: KeyedMemo<String, Entry<dyn RangeSource>>,
    targets: KeyedMemo<String, Entry<dyn RangeTarget>>,
    on_evict: EvictionHook,
}

impl InstanceRegistry {
    pub fn new(factory: Arc<dyn ComponentFactory>, secrets: Arc<dyn SecretReader>) -> Self {
        Self {
            factory,
            secrets,
            sources: KeyedMemo::new(),
            targets: KeyedMemo::new(),
            on_evict: Arc::new(|name, old, new| {
                tracing::info!(
                    instance = %name,
                    old_generation = old,
                    new_generation = new,
                    "Configuration generation changed, evicting cached instance"
                );
            }),
        }
    }

    /// Replace the eviction hook
    pub fn with_eviction_hook(mut self, hook: EvictionHook) -> Self {
        self.on_evict = hook;
        self
    }

    /// Cached source for `config`, built and initialized on first use
    pub async fn source(&self, ctx: &SyncContext, config: &SourceConfig) -> Result<Arc<dyn RangeSource>> {
        let entry = self
            .sources
            .get_or_replace(
                &config.name,
                |entry| entry.generation == config.generation,
                |previous| async move {
                    let entry = self.build_source(ctx, config).await?;
                    self.evicted(&config.name, previous.map(|p| p.generation), config.generation);
                    Ok::<_, Error>(entry)
                },
            )
            .await?;
        Ok(entry.instance)
    }

    /// Cached target for `config`, built and initialized on first use
    pub async fn target(&self, ctx: &SyncContext, config: &TargetConfig) -> Result<Arc<dyn RangeTarget>> {
        let entry = self
            .targets
            .get_or_replace(
                &config.name,
                |entry| entry.generation == config.generation,
                |previous| async move {
                    let entry = self.build_target(ctx, config).await?;
                    self.evicted(&config.name, previous.map(|p| p.generation), config.generation);
                    Ok::<_, Error>(entry)
                },
            )
            .await?;
        Ok(entry.instance)
    }

    fn evicted(&self, name: &str, previous: Option<u64>, generation: u64) {
        if let Some(previous) = previous {
            (self.on_evict)(name, previous, generation);
        }
    }

    async fn build_source(&self, ctx: &SyncContext, config: &SourceConfig) -> Result<Entry<dyn RangeSource>> {
        let credential = self.credential(ctx, config.credential_ref.as_ref()).await?;
        let mut source = self.factory.build_source(config)?;
        source.initialize(config, credential).await?;

        tracing::debug!(
            source = %config.name,
            kind = config.settings.kind(),
            generation = config.generation,
            "Initialized source"
        );

        Ok(Entry {
            generation: config.generation,
            instance: Arc::from(source),
        })
    }

    async fn build_target(&self, ctx: &SyncContext, config: &TargetConfig) -> Result<Entry<dyn RangeTarget>> {
        let credential = self.credential(ctx, config.credential_ref.as_ref()).await?;
        let mut target = self.factory.build_target(config)?;
        target.initialize(config, credential).await?;

        tracing::debug!(
            target = %config.name,
            kind = config.settings.kind(),
            generation = config.generation,
            "Initialized target"
        );

        Ok(Entry {
            generation: config.generation,
            instance: Arc::from(target),
        })
    }

    async fn credential(&self, ctx: &SyncContext, reference: Option<&CredentialRef>) -> Result<Option<String>> {
        match reference {
            Some(r) => self
                .secrets
                .get_secret(ctx, &r.namespace, &r.name, r.key.as_deref())
                .await
                .map(Some),
            None => Ok(None),
        }
    }
}

impl std::fmt::Debug for InstanceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstanceRegistry").finish_non_exhaustive()
    }
}
