// # Service-Mesh Target
//
// Publishes the desired range set to a service mesh:
//
// - a ConfigMap `<target>-<resourceName>` whose `ip_ranges` key holds the
//   CIDRs as a JSON array (the applied state read back on refresh)
// - when forwarded-for handling is enabled, an EnvoyFilter
//   `<target>-<resourceName>-xff` that trusts the forwarded-for header only
//   from peers inside those CIDRs
//
// The filter is written before the document, so a document holding a set
// means every object for that set was written. An empty set rewrites an
// existing filter with no trusted prefixes and creates none.
//
// ## Idempotency
//
// The last applied set is memoized for the configured cache TTL and compared
// on CIDR membership. Equal sets issue no writes.
//
// ## Dry-Run Mode
//
// Reads are performed, writes are logged and skipped.

pub mod api;
pub mod lua;
pub mod resources;

use api::{DocumentApi, KubeDocumentApi, ResourceKind};
use async_trait::async_trait;
use metasync_core::traits::{ApplyOutcome, RangeTarget};
use metasync_core::{
    AddressRangeSet, Error, MeshTargetSettings, Memo, Result, SyncContext, TargetConfig,
    TargetSettings, UpdateStrategy,
};
use std::sync::Arc;

/// Document + forwarded-for filter target
pub struct MeshTarget {
    name: String,
    settings: Option<MeshTargetSettings>,
    api: Option<Arc<dyn DocumentApi>>,
    last_applied: Memo<AddressRangeSet>,
    dry_run: bool,
}

impl std::fmt::Debug for MeshTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshTarget")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("initialized", &self.api.is_some())
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl MeshTarget {
    pub fn new(name: impl Into<String>, dry_run: bool) -> Self {
        Self {
            name: name.into(),
            settings: None,
            api: None,
            last_applied: Memo::new(),
            dry_run,
        }
    }

    /// Use a prepared API client instead of building one in `initialize`
    pub fn with_api(mut self, api: Arc<dyn DocumentApi>) -> Self {
        self.api = Some(api);
        self
    }

    fn parts(&self) -> Result<(&MeshTargetSettings, &dyn DocumentApi)> {
        match (&self.settings, &self.api) {
            (Some(settings), Some(api)) => Ok((settings, api.as_ref())),
            _ => Err(Error::init(format!(
                "Mesh target '{}' used before initialization",
                self.name
            ))),
        }
    }

    fn document_name(&self, settings: &MeshTargetSettings) -> String {
        format!("{}-{}", self.name, settings.resource_name)
    }

    fn filter_name(&self, settings: &MeshTargetSettings) -> String {
        format!("{}-{}-xff", self.name, settings.resource_name)
    }

    async fn read_remote(&self, ctx: &SyncContext) -> Result<AddressRangeSet> {
        let (settings, api) = self.parts()?;
        let name = self.document_name(settings);

        let document = ctx
            .run(api.get(ResourceKind::ConfigMap, &settings.namespace, &name))
            .await
            .map_err(read_error)?;

        match document {
            Some(document) => {
                let ranges = resources::decode_ranges(&document)?;
                tracing::info!(target_name = %self.name, count = ranges.count(), "Read applied ranges");
                Ok(ranges)
            }
            None => {
                tracing::info!(target_name = %self.name, document = %name, "Document doesn't exist yet");
                Ok(AddressRangeSet::new())
            }
        }
    }

    async fn write_document(&self, ctx: &SyncContext, cidrs: &[String]) -> Result<()> {
        let (settings, api) = self.parts()?;
        let name = self.document_name(settings);
        let encoded = resources::encode_ranges(cidrs)?;
        let namespace = settings.namespace.as_str();

        let existing = ctx
            .run(api.get(ResourceKind::ConfigMap, namespace, &name))
            .await
            .map_err(apply_error)?;

        match existing {
            Some(existing) => {
                let object = resources::with_ranges(existing, &encoded);
                ctx.run(api.replace(ResourceKind::ConfigMap, namespace, &name, &object))
                    .await
                    .map_err(apply_error)?;
                tracing::info!(target_name = %self.name, document = %name, "Updated document with ranges");
            }
            None => {
                let object = resources::config_map(&name, namespace, &self.name, &encoded);
                ctx.run(api.create(ResourceKind::ConfigMap, namespace, &object))
                    .await
                    .map_err(apply_error)?;
                tracing::info!(target_name = %self.name, document = %name, "Created document with ranges");
            }
        }
        Ok(())
    }

    async fn write_filter(&self, ctx: &SyncContext, cidrs: &[String]) -> Result<()> {
        let (settings, api) = self.parts()?;
        let name = self.filter_name(settings);
        let namespace = settings.namespace.as_str();

        let existing = ctx
            .run(api.get(ResourceKind::EnvoyFilter, namespace, &name))
            .await
            .map_err(apply_error)?;
        if existing.is_none() && cidrs.is_empty() {
            tracing::info!(target_name = %self.name, "No ranges to apply, skipping filter");
            return Ok(());
        }

        let spec = resources::envoy_filter_spec(
            &settings.gateway_selector,
            &settings.forwarded_for.header_name,
            cidrs,
        );
        match existing {
            Some(existing) => {
                let object = resources::with_spec(existing, spec);
                ctx.run(api.replace(ResourceKind::EnvoyFilter, namespace, &name, &object))
                    .await
                    .map_err(apply_error)?;
                tracing::info!(target_name = %self.name, filter = %name, "Updated forwarded-for filter");
            }
            None => {
                let object = resources::envoy_filter(&name, namespace, &self.name, spec);
                ctx.run(api.create(ResourceKind::EnvoyFilter, namespace, &object))
                    .await
                    .map_err(apply_error)?;
                tracing::info!(target_name = %self.name, filter = %name, "Created forwarded-for filter");
            }
        }
        Ok(())
    }

    async fn write(&self, ctx: &SyncContext, cidrs: &[String]) -> Result<()> {
        let (settings, _) = self.parts()?;
        if settings.forwarded_for.enabled {
            self.write_filter(ctx, cidrs).await?;
        }
        self.write_document(ctx, cidrs).await
    }
}

fn read_error(err: Error) -> Error {
    match err {
        e if e.is_cancellation() => e,
        e @ Error::Read(_) => e,
        e => Error::read(e.to_string()),
    }
}

fn apply_error(err: Error) -> Error {
    match err {
        e if e.is_cancellation() => e,
        e @ Error::Apply(_) => e,
        e => Error::apply(e.to_string()),
    }
}

#[async_trait]
impl RangeTarget for MeshTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, config: &TargetConfig, credential: Option<String>) -> Result<()> {
        let TargetSettings::Mesh(settings) = &config.settings else {
            return Err(Error::init("Invalid config for mesh target"));
        };
        if settings.namespace.trim().is_empty() {
            return Err(Error::init("Mesh target namespace is required"));
        }
        if settings.resource_name.trim().is_empty() {
            return Err(Error::init("Mesh target resource name is required"));
        }
        if settings.forwarded_for.enabled
            && !lua::is_valid_header_name(&settings.forwarded_for.header_name)
        {
            return Err(Error::init(format!(
                "Invalid forwarded-for header name: {:?}",
                settings.forwarded_for.header_name
            )));
        }

        if self.api.is_none() {
            let api = KubeDocumentApi::from_environment(&settings.api_server, credential).await?;
            self.api = Some(Arc::new(api));
        }

        if config.update_strategy == UpdateStrategy::Incremental {
            tracing::debug!(
                target_name = %config.name,
                "Incremental updates requested; the document is replaced whole"
            );
        }
        if self.dry_run {
            tracing::warn!(
                "Mesh target '{}' running in DRY-RUN mode - no changes will be made",
                config.name
            );
        }

        self.name = config.name.clone();
        self.settings = Some(settings.clone());
        tracing::info!(
            target_name = %self.name,
            namespace = %settings.namespace,
            forwarded_for = settings.forwarded_for.enabled,
            gateway = %settings.gateway_selector.name,
            "Initialized mesh target"
        );
        Ok(())
    }

    async fn read_applied(&self, ctx: &SyncContext) -> Result<AddressRangeSet> {
        let (settings, _) = self.parts()?;
        self.last_applied
            .get_or_refresh(Some(settings.cache_ttl()), || self.read_remote(ctx))
            .await
    }

    async fn apply(&self, ctx: &SyncContext, desired: &AddressRangeSet) -> Result<ApplyOutcome> {
        let (settings, _) = self.parts()?;
        let applied = self.read_applied(ctx).await?;

        let diff = applied.diff(desired);
        tracing::info!(
            target_name = %self.name,
            added = diff.added.len(),
            removed = diff.removed.len(),
            "Range diff"
        );
        if diff.is_empty() {
            return Ok(ApplyOutcome::Unchanged);
        }

        let outcome = ApplyOutcome::Applied {
            added: diff.added.len(),
            removed: diff.removed.len(),
        };
        let cidrs = desired.unique_cidrs();

        if self.dry_run {
            tracing::info!(
                "[DRY-RUN] Would write {} ranges to {}/{}",
                cidrs.len(),
                settings.namespace,
                self.document_name(settings)
            );
            return Ok(outcome);
        }

        if let Err(e) = self.write(ctx, &cidrs).await {
            self.last_applied.invalidate().await;
            return Err(e);
        }
        self.last_applied.set(desired.clone()).await;

        Ok(outcome)
    }
}
