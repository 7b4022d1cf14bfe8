// # Metadata Endpoint Source
//
// Fetches address ranges from a published metadata document such as
// `https://api.github.com/meta`.
//
// ## Document Shape
//
// A JSON object mapping category names to lists of CIDRs:
//
// ```json
// {
//   "verifiable_password_authentication": true,
//   "hooks": ["192.30.252.0/22", "185.199.108.0/22"],
//   "web": ["140.82.112.0/20"]
// }
// ```
//
// Every CIDR becomes one range labelled with its category. Keys whose value
// is not a list are ignored, as are list entries that are not strings or
// not valid prefixes (the latter with a warning).
//
// ## Caching
//
// The last successful fetch is memoized for the polling interval.
// Concurrent cycles sharing this source issue at most one request per
// interval. A failed fetch leaves the previous ranges cached but is still
// reported to the cycle that ran it.

use async_trait::async_trait;
use metasync_core::traits::RangeSource;
use metasync_core::{
    AddressRangeSet, Error, Memo, MetadataSourceSettings, Result, SourceConfig, SourceSettings,
    SyncContext,
};
use serde_json::Value;
use std::time::Duration;

/// HTTP timeout for metadata requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Range source backed by a metadata endpoint
pub struct MetadataSource {
    name: String,
    settings: MetadataSourceSettings,
    ttl: Duration,

    /// ⚠️ NEVER log this value
    token: Option<String>,

    client: reqwest::Client,
    cache: Memo<AddressRangeSet>,
}

impl std::fmt::Debug for MetadataSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataSource")
            .field("name", &self.name)
            .field("url", &self.settings.url)
            .field("enterprise", &self.settings.enterprise)
            .field("token", &self.token.as_ref().map(|_| "<REDACTED>"))
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl MetadataSource {
    /// Create an uninitialized source
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: MetadataSourceSettings::default(),
            ttl: Duration::ZERO,
            token: None,
            client: reqwest::Client::new(),
            cache: Memo::new(),
        }
    }

    async fn fetch_remote(&self) -> Result<AddressRangeSet> {
        tracing::info!(source = %self.name, url = %self.settings.url, "Fetching published ranges");

        let mut request = self
            .client
            .get(&self.settings.url)
            .header("Accept", "application/json");
        if let Some(token) = &self.token {
            request = request.header("Authorization", format!("token {}", token));
        }

        let response = request
            .send()
            .await
            .map_err(|e| Error::fetch(format!("Request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(Error::fetch(format!(
                "Metadata endpoint returned non-OK status: {}, body: {}",
                status.as_u16(),
                body
            )));
        }

        let document: Value = response
            .json()
            .await
            .map_err(|e| Error::fetch(format!("Error decoding metadata document: {}", e)))?;

        let ranges = parse_document(&document, &self.settings.categories)?;
        tracing::info!(
            source = %self.name,
            count = ranges.count(),
            "Fetched published ranges"
        );
        Ok(ranges)
    }
}

/// Convert a metadata document into labelled ranges
///
/// When `categories` is non-empty only those keys are read.
pub fn parse_document(document: &Value, categories: &[String]) -> Result<AddressRangeSet> {
    let object = document
        .as_object()
        .ok_or_else(|| Error::fetch("Metadata document is not a JSON object"))?;

    let mut set = AddressRangeSet::new();
    for (category, value) in object {
        if !categories.is_empty() && !categories.iter().any(|c| c == category) {
            continue;
        }
        let Some(entries) = value.as_array() else {
            continue;
        };
        for cidr in entries.iter().filter_map(Value::as_str) {
            if let Err(e) = set.add(cidr, [category.as_str()]) {
                tracing::warn!(category = %category, "Skipping range: {}", e);
            }
        }
    }
    Ok(set)
}

#[async_trait]
impl RangeSource for MetadataSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self, config: &SourceConfig, credential: Option<String>) -> Result<()> {
        let SourceSettings::Metadata(settings) = &config.settings else {
            return Err(Error::init("Invalid config for metadata source"));
        };
        if settings.url.trim().is_empty() {
            return Err(Error::init("Metadata source URL is required"));
        }

        self.client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::init(format!("Failed to build HTTP client: {}", e)))?;

        self.name = config.name.clone();
        self.settings = settings.clone();
        self.ttl = config.polling_interval();
        self.token = credential
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty());

        if self.settings.enterprise {
            tracing::info!(source = %self.name, "Using enterprise published ranges");
        } else {
            tracing::info!(source = %self.name, "Using public published ranges");
        }
        tracing::info!(
            source = %self.name,
            url = %self.settings.url,
            ttl_secs = self.ttl.as_secs(),
            authenticated = self.token.is_some(),
            "Initialized metadata source"
        );
        Ok(())
    }

    async fn fetch(&self, ctx: &SyncContext) -> Result<AddressRangeSet> {
        if let Some(cached) = self.cache.get(Some(self.ttl)).await {
            tracing::debug!(source = %self.name, "Using cached ranges");
            return Ok(cached);
        }
        self.cache
            .get_or_refresh(Some(self.ttl), || ctx.run(self.fetch_remote()))
            .await
    }
}
