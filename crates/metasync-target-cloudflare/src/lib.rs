// # Cloudflare Firewall Target
//
// Keeps one Cloudflare firewall rule's filter expression equal to the
// desired range set.
//
// ## Managed Objects
//
// - A filter whose description is the configured rule name, holding
//   `(ip.src in {...})`
// - A firewall rule bound to that filter with the configured description,
//   action and optional priority
//
// The filter is found by description on every remote read. When it does not
// exist the first apply creates the filter and then the rule; afterwards
// the filter expression is replaced and the rule is created again if no rule
// references the filter. A filter without a rule enforces nothing and reads
// back as an empty set.
//
// ## Idempotency
//
// The last applied set is memoized for the configured cache TTL. An apply
// whose CIDRs match the memo (or, when it has expired, the remote
// expression) issues no writes.
//
// ## Dry-Run Mode
//
// Reads are performed, writes are logged and skipped. The memo is left
// untouched, so every dry-run cycle reports the same pending change.
//
// ## Security
//
// The API token never appears in logs or Debug output.

pub mod api;
pub mod expression;

use api::{CloudflareFirewallApi, Filter, FilterRef, FirewallApi, FirewallRule};
use async_trait::async_trait;
use metasync_core::traits::{ApplyOutcome, RangeTarget};
use metasync_core::{
    AddressRangeSet, CloudflareTargetSettings, Error, Memo, Result, SyncContext, TargetConfig,
    TargetSettings, UpdateStrategy,
};
use std::sync::Arc;

pub use expression::{EMPTY_SET_EXPRESSION, build_expression, parse_expression};

/// Firewall-rule enforcement target
pub struct CloudflareTarget {
    name: String,
    settings: Option<CloudflareTargetSettings>,
    api: Option<Arc<dyn FirewallApi>>,
    last_applied: Memo<AddressRangeSet>,
    dry_run: bool,
}

impl std::fmt::Debug for CloudflareTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareTarget")
            .field("name", &self.name)
            .field("settings", &self.settings)
            .field("initialized", &self.api.is_some())
            .field("dry_run", &self.dry_run)
            .finish()
    }
}

impl CloudflareTarget {
    /// Create an uninitialized target
    ///
    /// The HTTP client is built in `initialize` once the token is known.
    pub fn new(name: impl Into<String>, dry_run: bool) -> Self {
        Self {
            name: name.into(),
            settings: None,
            api: None,
            last_applied: Memo::new(),
            dry_run,
        }
    }

    /// Use a prepared API client instead of building one from the credential
    pub fn with_api(mut self, api: Arc<dyn FirewallApi>) -> Self {
        self.api = Some(api);
        self
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    fn parts(&self) -> Result<(&CloudflareTargetSettings, &dyn FirewallApi)> {
        match (&self.settings, &self.api) {
            (Some(settings), Some(api)) => Ok((settings, api.as_ref())),
            _ => Err(Error::init(format!(
                "Cloudflare target '{}' used before initialization",
                self.name
            ))),
        }
    }

    /// Locate the managed filter by description and load its full record
    async fn find_filter(&self) -> Result<Option<Filter>> {
        let (settings, api) = self.parts()?;
        let filters = api.list_filters(&settings.zone_id).await?;

        let Some(id) = filters
            .into_iter()
            .find(|f| f.description == settings.rule_name)
            .and_then(|f| f.id)
        else {
            tracing::debug!(
                "No filter named '{}' in zone {}",
                settings.rule_name,
                settings.zone_id
            );
            return Ok(None);
        };

        api.get_filter(&settings.zone_id, &id).await.map(Some)
    }

    /// Whether some firewall rule is bound to `filter_id`
    async fn has_rule(&self, filter_id: &str) -> Result<bool> {
        let (settings, api) = self.parts()?;
        let rules = api.list_rules(&settings.zone_id).await?;
        Ok(rules.iter().any(|r| r.filter.id == filter_id))
    }

    async fn read_remote(&self, ctx: &SyncContext) -> Result<AddressRangeSet> {
        let Some(filter) = ctx.run(self.find_filter()).await.map_err(read_error)? else {
            return Ok(AddressRangeSet::new());
        };
        let filter_id = filter.id.clone().unwrap_or_default();
        if !ctx.run(self.has_rule(&filter_id)).await.map_err(read_error)? {
            tracing::warn!(
                "Filter {} of target '{}' has no firewall rule attached",
                filter_id,
                self.name
            );
            return Ok(AddressRangeSet::new());
        }
        parse_expression(&filter.expression)
    }

    async fn create_rule(&self, ctx: &SyncContext, filter_id: &str) -> Result<()> {
        let (settings, api) = self.parts()?;
        let rule = FirewallRule {
            id: None,
            paused: false,
            description: settings.description.clone(),
            action: settings.action.clone(),
            priority: settings.priority.filter(|p| *p != 0),
            filter: FilterRef { id: filter_id.to_string() },
        };
        ctx.run(api.create_rule(&settings.zone_id, &rule))
            .await
            .map_err(apply_error)?;
        tracing::info!(
            "Created firewall rule '{}' ({}) for filter {}",
            settings.rule_name,
            settings.action,
            filter_id
        );
        Ok(())
    }

    async fn write(&self, ctx: &SyncContext, expression: String) -> Result<()> {
        let (settings, api) = self.parts()?;

        let existing = ctx.run(self.find_filter()).await.map_err(apply_error)?;
        match existing.and_then(|f| f.id) {
            Some(filter_id) => {
                let filter = Filter {
                    id: Some(filter_id.clone()),
                    expression,
                    paused: false,
                    description: settings.rule_name.clone(),
                };
                ctx.run(api.update_filter(&settings.zone_id, &filter_id, &filter))
                    .await
                    .map_err(apply_error)?;
                tracing::info!("Updated filter {} for rule '{}'", filter_id, settings.rule_name);

                if !ctx.run(self.has_rule(&filter_id)).await.map_err(apply_error)? {
                    self.create_rule(ctx, &filter_id).await?;
                }
            }
            None => {
                let filter = Filter {
                    id: None,
                    expression,
                    paused: false,
                    description: settings.rule_name.clone(),
                };
                let created = ctx
                    .run(api.create_filter(&settings.zone_id, &filter))
                    .await
                    .map_err(apply_error)?;
                let filter_id = created
                    .id
                    .ok_or_else(|| Error::apply("created filter has no id"))?;
                tracing::info!("Created filter {} for rule '{}'", filter_id, settings.rule_name);

                self.create_rule(ctx, &filter_id).await?;
            }
        }
        Ok(())
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
impl RangeTarget for CloudflareTarget {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, config: &TargetConfig, credential: Option<String>) -> Result<()> {
        let TargetSettings::Cloudflare(settings) = &config.settings else {
            return Err(Error::init("Invalid config for Cloudflare target"));
        };
        if settings.zone_id.trim().is_empty() {
            return Err(Error::init("Cloudflare zone ID is required"));
        }
        if settings.rule_name.trim().is_empty() {
            return Err(Error::init("Cloudflare rule name is required"));
        }

        if self.api.is_none() {
            let token = credential
                .filter(|t| !t.trim().is_empty())
                .ok_or_else(|| Error::init("Cloudflare API token is required"))?;
            let api = CloudflareFirewallApi::new(token.trim(), settings.api_base.clone())?;
            self.api = Some(Arc::new(api));
        }

        if config.update_strategy == UpdateStrategy::Incremental {
            tracing::debug!(
                "Target '{}' requested incremental updates; the filter expression is replaced whole",
                self.name
            );
        }
        if self.dry_run {
            tracing::warn!(
                "Cloudflare target '{}' running in DRY-RUN mode - no changes will be made",
                self.name
            );
        }

        self.name = config.name.clone();
        self.settings = Some(settings.clone());
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
        if diff.is_empty() {
            tracing::debug!(
                "Rule '{}' already holds {} ranges",
                settings.rule_name,
                desired.unique_cidrs().len()
            );
            return Ok(ApplyOutcome::Unchanged);
        }

        let added = diff.added.len();
        let removed = diff.removed.len();
        let expression = build_expression(&desired.unique_cidrs());

        tracing::info!(
            "{} rule '{}' in zone {}: +{} -{} ranges [mode: {}]",
            if self.dry_run { "Would update" } else { "Updating" },
            settings.rule_name,
            settings.zone_id,
            added,
            removed,
            if self.dry_run { "DRY-RUN" } else { "LIVE" }
        );

        if self.dry_run {
            tracing::info!("[DRY-RUN] Would write filter expression: {}", expression);
            return Ok(ApplyOutcome::Applied { added, removed });
        }

        if let Err(e) = self.write(ctx, expression).await {
            self.last_applied.invalidate().await;
            return Err(e);
        }
        self.last_applied.set(desired.clone()).await;

        Ok(ApplyOutcome::Applied { added, removed })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MockFirewallApi {
        filters: Mutex<Vec<Filter>>,
        rules: Mutex<Vec<FirewallRule>>,
        reads: AtomicUsize,
        writes: AtomicUsize,
        fail_writes: Mutex<Option<Error>>,
        fail_next_rule: Mutex<Option<Error>>,
    }

    impl MockFirewallApi {
        /// A filter with a rule bound to it
        fn with_filter(id: &str, description: &str, expression: &str) -> Self {
            let api = Self::default();
            api.filters.lock().unwrap().push(Filter {
                id: Some(id.to_string()),
                expression: expression.to_string(),
                paused: false,
                description: description.to_string(),
            });
            api.rules.lock().unwrap().push(FirewallRule {
                id: Some(format!("rule-for-{}", id)),
                paused: false,
                description: "existing".to_string(),
                action: "allow".to_string(),
                priority: None,
                filter: FilterRef { id: id.to_string() },
            });
            api
        }

        fn rule_count(&self) -> usize {
            self.rules.lock().unwrap().len()
        }

        fn expression(&self, description: &str) -> Option<String> {
            self.filters
                .lock()
                .unwrap()
                .iter()
                .find(|f| f.description == description)
                .map(|f| f.expression.clone())
        }

        fn check_write(&self) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            match self.fail_writes.lock().unwrap().clone() {
                Some(err) => Err(err),
                None => Ok(()),
            }
        }
    }

    #[async_trait]
    impl FirewallApi for MockFirewallApi {
        async fn list_filters(&self, _zone_id: &str) -> Result<Vec<Filter>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.filters.lock().unwrap().clone())
        }

        async fn get_filter(&self, _zone_id: &str, filter_id: &str) -> Result<Filter> {
            self.filters
                .lock()
                .unwrap()
                .iter()
                .find(|f| f.id.as_deref() == Some(filter_id))
                .cloned()
                .ok_or_else(|| Error::not_found(filter_id.to_string()))
        }

        async fn create_filter(&self, _zone_id: &str, filter: &Filter) -> Result<Filter> {
            self.check_write()?;
            let mut filters = self.filters.lock().unwrap();
            let mut created = filter.clone();
            created.id = Some(format!("filter-{}", filters.len() + 1));
            filters.push(created.clone());
            Ok(created)
        }

        async fn update_filter(&self, _zone_id: &str, filter_id: &str, filter: &Filter) -> Result<Filter> {
            self.check_write()?;
            let mut filters = self.filters.lock().unwrap();
            let existing = filters
                .iter_mut()
                .find(|f| f.id.as_deref() == Some(filter_id))
                .ok_or_else(|| Error::not_found(filter_id.to_string()))?;
            *existing = filter.clone();
            Ok(existing.clone())
        }

        async fn list_rules(&self, _zone_id: &str) -> Result<Vec<FirewallRule>> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            Ok(self.rules.lock().unwrap().clone())
        }

        async fn create_rule(&self, _zone_id: &str, rule: &FirewallRule) -> Result<FirewallRule> {
            self.check_write()?;
            if let Some(err) = self.fail_next_rule.lock().unwrap().take() {
                return Err(err);
            }
            let mut rules = self.rules.lock().unwrap();
            let mut created = rule.clone();
            created.id = Some(format!("rule-{}", rules.len() + 1));
            rules.push(created.clone());
            Ok(created)
        }
    }

    fn config() -> TargetConfig {
        let mut settings = CloudflareTargetSettings::new("zone-1", "github-ranges");
        settings.priority = Some(10);
        TargetConfig::new("edge", TargetSettings::Cloudflare(settings))
    }

    fn set(cidrs: &[&str]) -> AddressRangeSet {
        AddressRangeSet::from_cidrs(cidrs.iter().copied()).unwrap()
    }

    async fn target(api: &Arc<MockFirewallApi>, dry_run: bool) -> CloudflareTarget {
        let mut target = CloudflareTarget::new("edge", dry_run)
            .with_api(Arc::clone(api) as Arc<dyn FirewallApi>);
        target.initialize(&config(), None).await.unwrap();
        target
    }

    #[tokio::test]
    async fn test_first_apply_creates_filter_and_rule() {
        let api = Arc::new(MockFirewallApi::default());
        let target = target(&api, false).await;
        let ctx = SyncContext::background();

        let outcome = target
            .apply(&ctx, &set(&["10.0.0.0/8", "10.1.0.0/16"]))
            .await
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::Applied { added: 2, removed: 0 });
        assert_eq!(
            api.expression("github-ranges").as_deref(),
            Some("(ip.src in {10.0.0.0/8 10.1.0.0/16})")
        );
        let rules = api.rules.lock().unwrap().clone();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].action, "allow");
        assert_eq!(rules[0].priority, Some(10));
        assert_eq!(rules[0].filter.id, "filter-1");
        assert_eq!(rules[0].description, "Auto-managed IP ranges by metasync");
    }

    #[tokio::test]
    async fn test_matching_expression_is_not_written() {
        let api = Arc::new(MockFirewallApi::with_filter(
            "f1",
            "github-ranges",
            "(ip.src in {10.0.0.0/8 10.1.0.0/16})",
        ));
        let target = target(&api, false).await;
        let ctx = SyncContext::background();

        let outcome = target
            .apply(&ctx, &set(&["10.1.0.0/16", "10.0.0.0/8"]))
            .await
            .unwrap();

        assert!(outcome.is_unchanged());
        assert_eq!(api.writes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_changed_set_updates_existing_filter() {
        let api = Arc::new(MockFirewallApi::with_filter(
            "f1",
            "github-ranges",
            "(ip.src in {10.0.0.0/8})",
        ));
        let target = target(&api, false).await;
        let ctx = SyncContext::background();

        let outcome = target
            .apply(&ctx, &set(&["10.0.0.0/8", "172.16.0.0/12"]))
            .await
            .unwrap();

        assert_eq!(outcome, ApplyOutcome::Applied { added: 1, removed: 0 });
        assert_eq!(
            api.expression("github-ranges").as_deref(),
            Some("(ip.src in {10.0.0.0/8 172.16.0.0/12})")
        );
        assert_eq!(api.rule_count(), 1, "no new rule for an existing filter");
    }

    #[tokio::test]
    async fn test_repeated_apply_uses_memo() {
        let api = Arc::new(MockFirewallApi::default());
        let target = target(&api, false).await;
        let ctx = SyncContext::background();
        let desired = set(&["192.30.252.0/22"]);

        target.apply(&ctx, &desired).await.unwrap();
        let reads = api.reads.load(Ordering::SeqCst);
        let outcome = target.apply(&ctx, &desired).await.unwrap();

        assert!(outcome.is_unchanged());
        assert_eq!(api.reads.load(Ordering::SeqCst), reads, "memo answered the read");
        assert_eq!(api.writes.load(Ordering::SeqCst), 2, "filter and rule only");
    }

    #[tokio::test]
    async fn test_failed_rule_create_is_completed_on_retry() {
        let api = Arc::new(MockFirewallApi::default());
        *api.fail_next_rule.lock().unwrap() = Some(Error::http("Rate limit exceeded"));
        let target = target(&api, false).await;
        let ctx = SyncContext::background();
        let desired = set(&["10.0.0.0/8"]);

        let err = target.apply(&ctx, &desired).await.unwrap_err();
        assert!(matches!(err, Error::Apply(_)));
        assert_eq!(api.rule_count(), 0);

        let outcome = target.apply(&ctx, &desired).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Applied { added: 1, removed: 0 });
        let rules = api.rules.lock().unwrap().clone();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].filter.id, "filter-1");
        assert_eq!(api.filters.lock().unwrap().len(), 1, "filter is reused");
    }

    #[tokio::test]
    async fn test_filter_without_rule_reads_empty_after_restart() {
        let api = Arc::new(MockFirewallApi::default());
        api.filters.lock().unwrap().push(Filter {
            id: Some("f1".to_string()),
            expression: "(ip.src in {10.0.0.0/8})".to_string(),
            paused: false,
            description: "github-ranges".to_string(),
        });
        let target = target(&api, false).await;
        let ctx = SyncContext::background();

        assert!(target.read_applied(&ctx).await.unwrap().is_empty());
        let outcome = target.apply(&ctx, &set(&["10.0.0.0/8"])).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Applied { added: 1, removed: 0 });
        let rules = api.rules.lock().unwrap().clone();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].filter.id, "f1");
        assert_eq!(rules[0].priority, Some(10));
    }

    #[tokio::test]
    async fn test_empty_set_writes_sentinel() {
        let api = Arc::new(MockFirewallApi::with_filter(
            "f1",
            "github-ranges",
            "(ip.src in {10.0.0.0/8})",
        ));
        let target = target(&api, false).await;
        let ctx = SyncContext::background();

        let outcome = target.apply(&ctx, &AddressRangeSet::new()).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Applied { added: 0, removed: 1 });
        assert_eq!(
            api.expression("github-ranges").as_deref(),
            Some(EMPTY_SET_EXPRESSION)
        );
        assert!(target.read_applied(&ctx).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_dry_run_skips_writes() {
        let api = Arc::new(MockFirewallApi::default());
        let target = target(&api, true).await;
        let ctx = SyncContext::background();
        let desired = set(&["10.0.0.0/8"]);

        for _ in 0..2 {
            let outcome = target.apply(&ctx, &desired).await.unwrap();
            assert_eq!(outcome, ApplyOutcome::Applied { added: 1, removed: 0 });
        }
        assert_eq!(api.writes.load(Ordering::SeqCst), 0);
        assert!(api.expression("github-ranges").is_none());
    }

    #[tokio::test]
    async fn test_write_failure_is_apply_error() {
        let api = Arc::new(MockFirewallApi::default());
        *api.fail_writes.lock().unwrap() = Some(Error::http("Rate limit exceeded"));
        let target = target(&api, false).await;

        let err = target
            .apply(&SyncContext::background(), &set(&["10.0.0.0/8"]))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Apply(_)));
        assert!(err.to_string().contains("Rate limit"));
    }

    #[tokio::test]
    async fn test_unparsable_remote_is_read_error() {
        let api = Arc::new(MockFirewallApi::with_filter(
            "f1",
            "github-ranges",
            "(http.host eq \"example.com\")",
        ));
        let target = target(&api, false).await;

        let err = target
            .read_applied(&SyncContext::background())
            .await
            .unwrap_err();
        assert_eq!(err.reason(), "ReadFailed");
    }

    #[tokio::test]
    async fn test_initialize_rejects_other_kinds() {
        let mut target = CloudflareTarget::new("edge", false);
        let config = TargetConfig::new(
            "edge",
            TargetSettings::Mesh(metasync_core::MeshTargetSettings::default()),
        );

        let result = target.initialize(&config, Some("token".to_string())).await;
        tokio_test::assert_err!(result);
    }

    #[tokio::test]
    async fn test_initialize_requires_token() {
        let mut target = CloudflareTarget::new("edge", false);
        let err = target.initialize(&config(), None).await.unwrap_err();
        assert!(matches!(err, Error::Init(_)));

        let mut target = CloudflareTarget::new("edge", false);
        let err = target
            .initialize(&config(), Some("  ".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Init(_)));

        let mut target = CloudflareTarget::new("edge", false);
        tokio_test::assert_ok!(target.initialize(&config(), Some("token".to_string())).await);
    }

    #[tokio::test]
    async fn test_uninitialized_target_errors() {
        let target = CloudflareTarget::new("edge", false);
        let err = target
            .read_applied(&SyncContext::background())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Init(_)));
    }

    #[tokio::test]
    async fn test_debug_hides_token() {
        let mut target = CloudflareTarget::new("edge", false);
        target
            .initialize(&config(), Some("secret_token_12345".to_string()))
            .await
            .unwrap();
        let debug_str = format!("{:?}", target);
        assert!(!debug_str.contains("secret_token"));
        assert!(debug_str.contains("CloudflareTarget"));
    }
}
