//! Configuration types for the metasync system
//!
//! Declarative records the engine reads fresh every cycle. All records
//! serialize as camelCase JSON. Source and target kinds are closed enums with
//! typed settings; adding a kind means adding a variant and handling it
//! everywhere the compiler asks.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Location of a credential in the secret store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialRef {
    /// Namespace holding the secret
    pub namespace: String,
    /// Secret name
    pub name: String,
    /// Entry within the secret; when absent the secret must have exactly one entry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

impl CredentialRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
            key: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }
}

/// Address-range source configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceConfig {
    /// Unique source name, referenced from sync specs
    pub name: String,

    /// Bumped whenever the record changes; a new value evicts cached instances
    #[serde(default)]
    pub generation: u64,

    /// Kind and kind-specific settings
    pub settings: SourceSettings,

    /// Optional credential for the upstream endpoint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<CredentialRef>,

    /// How long a successful fetch is reused (in seconds)
    #[serde(default = "default_polling_interval_secs")]
    pub polling_interval_secs: u64,
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, settings: SourceSettings) -> Self {
        Self {
            name: name.into(),
            generation: 0,
            settings,
            credential_ref: None,
            polling_interval_secs: default_polling_interval_secs(),
        }
    }

    pub fn with_credential(mut self, credential: CredentialRef) -> Self {
        self.credential_ref = Some(credential);
        self
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    pub fn polling_interval(&self) -> Duration {
        Duration::from_secs(self.polling_interval_secs)
    }

    /// Validate the source configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.name.is_empty() {
            return Err(crate::Error::config_resolution("Source name cannot be empty"));
        }
        match &self.settings {
            SourceSettings::Metadata(settings) => {
                if settings.url.is_empty() {
                    return Err(crate::Error::config_resolution(format!(
                        "Source '{}': metadata URL cannot be empty",
                        self.name
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Source kinds
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum SourceSettings {
    /// JSON metadata endpoint mapping category names to CIDR lists
    Metadata(MetadataSourceSettings),
}

impl SourceSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            SourceSettings::Metadata(_) => "metadata",
        }
    }
}

/// Settings for the metadata-endpoint source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataSourceSettings {
    /// Endpoint returning the category document
    #[serde(default = "default_metadata_url")]
    pub url: String,

    /// Whether the endpoint is a self-hosted enterprise instance
    #[serde(default)]
    pub enterprise: bool,

    /// Only these categories are read; empty means every list-valued key
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub categories: Vec<String>,
}

impl Default for MetadataSourceSettings {
    fn default() -> Self {
        Self {
            url: default_metadata_url(),
            enterprise: false,
            categories: Vec::new(),
        }
    }
}

/// How a target turns a desired set into writes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UpdateStrategy {
    /// Replace the whole applied set
    #[default]
    Direct,
    /// Accepted for compatibility; performs a full replace
    Incremental,
}

/// Enforcement target configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetConfig {
    /// Unique target name, referenced from sync specs
    pub name: String,

    /// Bumped whenever the record changes; a new value evicts cached instances
    #[serde(default)]
    pub generation: u64,

    /// Kind and kind-specific settings
    pub settings: TargetSettings,

    /// Credential for the target's API
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_ref: Option<CredentialRef>,

    #[serde(default)]
    pub update_strategy: UpdateStrategy,
}

impl TargetConfig {
    pub fn new(name: impl Into<String>, settings: TargetSettings) -> Self {
        Self {
            name: name.into(),
            generation: 0,
            settings,
            credential_ref: None,
            update_strategy: UpdateStrategy::default(),
        }
    }

    pub fn with_credential(mut self, credential: CredentialRef) -> Self {
        self.credential_ref = Some(credential);
        self
    }

    pub fn with_generation(mut self, generation: u64) -> Self {
        self.generation = generation;
        self
    }

    /// Validate the target configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.name.is_empty() {
            return Err(crate::Error::config_resolution("Target name cannot be empty"));
        }
        let problem = match &self.settings {
            TargetSettings::Cloudflare(s) if s.zone_id.is_empty() => Some("zoneId cannot be empty"),
            TargetSettings::Cloudflare(s) if s.rule_name.is_empty() => {
                Some("ruleName cannot be empty")
            }
            TargetSettings::Mesh(s) if s.namespace.is_empty() => Some("namespace cannot be empty"),
            TargetSettings::Mesh(s) if s.resource_name.is_empty() => {
                Some("resourceName cannot be empty")
            }
            TargetSettings::Mesh(s) if s.forwarded_for.enabled && s.forwarded_for.header_name.is_empty() => {
                Some("forwardedFor.headerName cannot be empty")
            }
            TargetSettings::Cloudflare(_) | TargetSettings::Mesh(_) => None,
        };
        match problem {
            Some(problem) => Err(crate::Error::config_resolution(format!(
                "Target '{}': {}",
                self.name, problem
            ))),
            None => Ok(()),
        }
    }
}

/// Target kinds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TargetSettings {
    /// One firewall rule whose filter expression lists the trusted CIDRs
    Cloudflare(CloudflareTargetSettings),
    /// Key-value document plus a forwarded-for header filter
    Mesh(MeshTargetSettings),
}

impl TargetSettings {
    pub fn kind(&self) -> &'static str {
        match self {
            TargetSettings::Cloudflare(_) => "cloudflare",
            TargetSettings::Mesh(_) => "mesh",
        }
    }
}

/// Settings for the firewall-rule target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudflareTargetSettings {
    pub zone_id: String,

    /// Name of the managed rule; matched against the filter description
    pub rule_name: String,

    /// Description placed on the firewall rule
    #[serde(default = "default_rule_description")]
    pub description: String,

    /// Rule action (allow, block, challenge, ...)
    #[serde(default = "default_rule_action")]
    pub action: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,

    /// How long the last applied set is trusted without reading it back (seconds)
    #[serde(default = "default_target_cache_ttl_secs")]
    pub cache_ttl_secs: u64,

    #[serde(default = "default_cloudflare_api_base")]
    pub api_base: String,
}

impl CloudflareTargetSettings {
    pub fn new(zone_id: impl Into<String>, rule_name: impl Into<String>) -> Self {
        Self {
            zone_id: zone_id.into(),
            rule_name: rule_name.into(),
            description: default_rule_description(),
            action: default_rule_action(),
            priority: None,
            cache_ttl_secs: default_target_cache_ttl_secs(),
            api_base: default_cloudflare_api_base(),
        }
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Settings for the document + header-filter target
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MeshTargetSettings {
    /// Kubernetes API server base URL
    #[serde(default = "default_api_server")]
    pub api_server: String,

    #[serde(default = "default_mesh_namespace")]
    pub namespace: String,

    /// Suffix used to name the generated document and filter
    #[serde(default = "default_resource_name")]
    pub resource_name: String,

    #[serde(default)]
    pub forwarded_for: ForwardedForSettings,

    #[serde(default)]
    pub gateway_selector: GatewaySelector,

    /// How long the last applied set is trusted without reading it back (seconds)
    #[serde(default = "default_target_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

impl Default for MeshTargetSettings {
    fn default() -> Self {
        Self {
            api_server: default_api_server(),
            namespace: default_mesh_namespace(),
            resource_name: default_resource_name(),
            forwarded_for: ForwardedForSettings::default(),
            gateway_selector: GatewaySelector::default(),
            cache_ttl_secs: default_target_cache_ttl_secs(),
        }
    }
}

impl MeshTargetSettings {
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Forwarded-for header trust settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForwardedForSettings {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_forwarded_header")]
    pub header_name: String,
}

impl Default for ForwardedForSettings {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            header_name: default_forwarded_header(),
        }
    }
}

/// Which gateway workloads the header filter attaches to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySelector {
    /// Value of the `istio` workload label
    #[serde(default = "default_gateway_name")]
    pub name: String,

    /// Extra workload labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Default for GatewaySelector {
    fn default() -> Self {
        Self {
            name: default_gateway_name(),
            labels: BTreeMap::new(),
        }
    }
}

/// Reference from a sync spec to a source, with label filters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceReference {
    pub name: String,

    /// Keep only ranges carrying one of these labels (empty keeps all)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_labels: Vec<String>,

    /// Drop ranges carrying any of these labels
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_labels: Vec<String>,
}

impl SourceReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            include_labels: Vec::new(),
            exclude_labels: Vec::new(),
        }
    }

    pub fn include<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.include_labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn exclude<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.exclude_labels = labels.into_iter().map(Into::into).collect();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetReference {
    pub name: String,
}

impl TargetReference {
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

/// What the engine does when one item fails
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FailureMode {
    /// Record the error and keep going
    #[default]
    Continue,
    /// Abort the cycle at the first error
    Fail,
}

/// Retry settings
///
/// Parsed and carried on the sync spec; the engine reschedules on fixed
/// delays and does not consume these values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_multiplier: default_backoff_multiplier(),
            initial_delay_secs: default_initial_delay_secs(),
        }
    }
}

/// Declared mapping of sources onto targets
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    pub name: String,

    #[serde(default)]
    pub generation: u64,

    /// Sources in merge order
    pub sources: Vec<SourceReference>,

    /// Targets in apply order
    pub targets: Vec<TargetReference>,

    #[serde(default)]
    pub failure_mode: FailureMode,

    #[serde(default)]
    pub retry: RetryConfig,
}

impl SyncSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            generation: 0,
            sources: Vec::new(),
            targets: Vec::new(),
            failure_mode: FailureMode::default(),
            retry: RetryConfig::default(),
        }
    }

    pub fn with_source(mut self, source: SourceReference) -> Self {
        self.sources.push(source);
        self
    }

    pub fn with_target(mut self, target: TargetReference) -> Self {
        self.targets.push(target);
        self
    }

    pub fn with_failure_mode(mut self, mode: FailureMode) -> Self {
        self.failure_mode = mode;
        self
    }

    /// Validate the sync spec
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.name.is_empty() {
            return Err(crate::Error::config_resolution("Sync spec name cannot be empty"));
        }
        if self.sources.is_empty() {
            return Err(crate::Error::config_resolution(format!(
                "Sync spec '{}' has no sources",
                self.name
            )));
        }
        if self.targets.is_empty() {
            return Err(crate::Error::config_resolution(format!(
                "Sync spec '{}' has no targets",
                self.name
            )));
        }
        if self.sources.iter().any(|s| s.name.is_empty())
            || self.targets.iter().any(|t| t.name.is_empty())
        {
            return Err(crate::Error::config_resolution(format!(
                "Sync spec '{}' has an empty reference name",
                self.name
            )));
        }
        Ok(())
    }

    pub fn references_source(&self, name: &str) -> bool {
        self.sources.iter().any(|s| s.name == name)
    }

    pub fn references_target(&self, name: &str) -> bool {
        self.targets.iter().any(|t| t.name == name)
    }
}

/// Engine and controller settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineConfig {
    /// Delay before the next cycle after a completed cycle (in seconds)
    #[serde(default = "default_success_requeue_secs")]
    pub success_requeue_secs: u64,

    /// Delay before the next cycle after an aborted cycle (in seconds)
    #[serde(default = "default_failure_requeue_secs")]
    pub failure_requeue_secs: u64,

    /// Maximum number of cycles running at once
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Deadline for one cycle's external calls (in seconds)
    #[serde(default = "default_cycle_timeout_secs")]
    pub cycle_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            success_requeue_secs: default_success_requeue_secs(),
            failure_requeue_secs: default_failure_requeue_secs(),
            workers: default_workers(),
            cycle_timeout_secs: default_cycle_timeout_secs(),
        }
    }
}

impl EngineConfig {
    pub fn success_requeue(&self) -> Duration {
        Duration::from_secs(self.success_requeue_secs)
    }

    pub fn failure_requeue(&self) -> Duration {
        Duration::from_secs(self.failure_requeue_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.workers == 0 {
            return Err(crate::Error::config_resolution("Worker limit must be > 0"));
        }
        if self.cycle_timeout_secs == 0 {
            return Err(crate::Error::config_resolution("Cycle timeout must be > 0"));
        }
        Ok(())
    }
}

fn default_polling_interval_secs() -> u64 {
    15 * 60
}

fn default_metadata_url() -> String {
    "https://api.github.com/meta".to_string()
}

fn default_rule_description() -> String {
    "Auto-managed IP ranges by metasync".to_string()
}

fn default_rule_action() -> String {
    "allow".to_string()
}

fn default_target_cache_ttl_secs() -> u64 {
    60 * 60
}

fn default_cloudflare_api_base() -> String {
    "https://api.cloudflare.com/client/v4".to_string()
}

fn default_api_server() -> String {
    "https://kubernetes.default.svc".to_string()
}

fn default_mesh_namespace() -> String {
    "istio-system".to_string()
}

fn default_resource_name() -> String {
    "ip-ranges".to_string()
}

fn default_enabled() -> bool {
    true
}

fn default_forwarded_header() -> String {
    "X-Forwarded-For".to_string()
}

fn default_gateway_name() -> String {
    "ingressgateway".to_string()
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_initial_delay_secs() -> u64 {
    5
}

fn default_success_requeue_secs() -> u64 {
    60
}

fn default_failure_requeue_secs() -> u64 {
    300
}

fn default_workers() -> usize {
    4
}

fn default_cycle_timeout_secs() -> u64 {
    120
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_spec_defaults_from_json() {
        let spec: SyncSpec = serde_json::from_str(
            r#"{
                "name": "github-to-edge",
                "sources": [{"name": "github", "includeLabels": ["hooks"]}],
                "targets": [{"name": "edge"}]
            }"#,
        )
        .unwrap();

        assert_eq!(spec.failure_mode, FailureMode::Continue);
        assert_eq!(spec.retry, RetryConfig::default());
        assert_eq!(spec.sources[0].include_labels, vec!["hooks"]);
        assert!(spec.validate().is_ok());
        assert!(spec.references_source("github"));
        assert!(!spec.references_target("github"));
    }

    #[test]
    fn sync_spec_without_targets_is_invalid() {
        let spec = SyncSpec::new("x").with_source(SourceReference::new("a"));
        assert!(matches!(spec.validate(), Err(crate::Error::ConfigResolution(_))));
    }

    #[test]
    fn target_settings_are_tagged_by_kind() {
        let target: TargetConfig = serde_json::from_str(
            r#"{
                "name": "mesh",
                "generation": 3,
                "settings": {"kind": "mesh", "forwardedFor": {"enabled": false}}
            }"#,
        )
        .unwrap();

        let TargetSettings::Mesh(mesh) = &target.settings else {
            panic!("expected mesh settings");
        };
        assert_eq!(mesh.namespace, "istio-system");
        assert_eq!(mesh.resource_name, "ip-ranges");
        assert!(!mesh.forwarded_for.enabled);
        assert_eq!(mesh.forwarded_for.header_name, "X-Forwarded-For");
        assert_eq!(target.generation, 3);
        assert_eq!(target.update_strategy, UpdateStrategy::Direct);
    }

    #[test]
    fn cloudflare_target_requires_rule_name() {
        let target = TargetConfig::new(
            "edge",
            TargetSettings::Cloudflare(CloudflareTargetSettings::new("zone", "")),
        );
        assert!(target.validate().is_err());
    }

    #[test]
    fn source_defaults() {
        let source: SourceConfig =
            serde_json::from_str(r#"{"name": "github", "settings": {"kind": "metadata"}}"#).unwrap();
        assert_eq!(source.polling_interval(), Duration::from_secs(900));
        let SourceSettings::Metadata(settings) = &source.settings;
        assert_eq!(settings.url, "https://api.github.com/meta");
    }

    #[test]
    fn engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.success_requeue(), Duration::from_secs(60));
        assert_eq!(config.failure_requeue(), Duration::from_secs(300));
        assert_eq!(config.workers, 4);
        assert!(config.validate().is_ok());
    }
}
