// # Cloudflare Firewall API
//
// Thin client for the filter and firewall-rule endpoints of API v4.
//
// ## Endpoints
//
// - List filters: GET `/zones/:zone_id/filters`
// - Get filter: GET `/zones/:zone_id/filters/:filter_id`
// - Create filters: POST `/zones/:zone_id/filters` (JSON array body)
// - Update filter: PUT `/zones/:zone_id/filters/:filter_id`
// - List rules: GET `/zones/:zone_id/firewall/rules`
// - Create rules: POST `/zones/:zone_id/firewall/rules` (JSON array body)
//
// Every response is wrapped in the `{success, errors, messages, result}`
// envelope. A 2xx status with `success: false` is still an error.
//
// ## Security
//
// The API token is sent as a bearer token and never logged.

use async_trait::async_trait;
use metasync_core::{Error, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Filter object holding the membership expression
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub expression: String,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub description: String,
}

/// Reference from a rule to its filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilterRef {
    pub id: String,
}

/// Firewall rule bound to a filter
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub description: String,
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    pub filter: FilterRef,
}

#[derive(Debug, Deserialize)]
struct ApiMessage {
    #[serde(default)]
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    #[serde(default)]
    errors: Vec<ApiMessage>,
    result: Option<T>,
}

/// Operations the target needs from the firewall API
///
/// Implemented over HTTP by [`CloudflareFirewallApi`]; tests substitute an
/// in-memory double.
#[async_trait]
pub trait FirewallApi: Send + Sync {
    async fn list_filters(&self, zone_id: &str) -> Result<Vec<Filter>>;

    async fn get_filter(&self, zone_id: &str, filter_id: &str) -> Result<Filter>;

    /// Create one filter and return it with its assigned id
    async fn create_filter(&self, zone_id: &str, filter: &Filter) -> Result<Filter>;

    async fn update_filter(&self, zone_id: &str, filter_id: &str, filter: &Filter) -> Result<Filter>;

    async fn list_rules(&self, zone_id: &str) -> Result<Vec<FirewallRule>>;

    /// Create one rule and return it with its assigned id
    async fn create_rule(&self, zone_id: &str, rule: &FirewallRule) -> Result<FirewallRule>;
}

/// reqwest-backed client for API v4
pub struct CloudflareFirewallApi {
    /// ⚠️ NEVER log this value
    api_token: String,
    api_base: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for CloudflareFirewallApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudflareFirewallApi")
            .field("api_token", &"<REDACTED>")
            .field("api_base", &self.api_base)
            .finish()
    }
}

impl CloudflareFirewallApi {
    /// Build a client with the default timeout
    ///
    /// Fails with [`Error::Init`] when the token is empty or the HTTP client
    /// cannot be constructed.
    pub fn new(api_token: impl Into<String>, api_base: impl Into<String>) -> Result<Self> {
        let api_token = api_token.into();
        if api_token.is_empty() {
            return Err(Error::init("Cloudflare API token cannot be empty"));
        }

        let client = reqwest::Client::builder()
            .timeout(DEFAULT_HTTP_TIMEOUT)
            .build()
            .map_err(|e| Error::init(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_token,
            api_base: api_base.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
        what: &str,
    ) -> Result<T> {
        let response = request
            .bearer_auth(&self.api_token)
            .header("Content-Type", "application/json")
            .send()
            .await
            .map_err(|e| Error::http(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(status_error(status.as_u16(), what, &error_text));
        }

        let envelope: Envelope<T> = response
            .json()
            .await
            .map_err(|e| Error::http(format!("Failed to parse response: {}", e)))?;
        unwrap_envelope(envelope, what)
    }
}

#[async_trait]
impl FirewallApi for CloudflareFirewallApi {
    async fn list_filters(&self, zone_id: &str) -> Result<Vec<Filter>> {
        let url = self.url(&format!("/zones/{}/filters", zone_id));
        tracing::debug!("Listing filters for zone {}", zone_id);
        self.send(self.client.get(&url), "list filters").await
    }

    async fn get_filter(&self, zone_id: &str, filter_id: &str) -> Result<Filter> {
        let url = self.url(&format!("/zones/{}/filters/{}", zone_id, filter_id));
        self.send(self.client.get(&url), "get filter").await
    }

    async fn create_filter(&self, zone_id: &str, filter: &Filter) -> Result<Filter> {
        let url = self.url(&format!("/zones/{}/filters", zone_id));
        let created: Vec<Filter> = self
            .send(self.client.post(&url).json(&[filter]), "create filter")
            .await?;
        created
            .into_iter()
            .next()
            .ok_or_else(|| Error::http("Invalid response format: no filter created"))
    }

    async fn update_filter(&self, zone_id: &str, filter_id: &str, filter: &Filter) -> Result<Filter> {
        let url = self.url(&format!("/zones/{}/filters/{}", zone_id, filter_id));
        self.send(self.client.put(&url).json(filter), "update filter")
            .await
    }

    async fn list_rules(&self, zone_id: &str) -> Result<Vec<FirewallRule>> {
        let url = self.url(&format!("/zones/{}/firewall/rules", zone_id));
        tracing::debug!("Listing firewall rules for zone {}", zone_id);
        self.send(self.client.get(&url), "list firewall rules").await
    }

    async fn create_rule(&self, zone_id: &str, rule: &FirewallRule) -> Result<FirewallRule> {
        let url = self.url(&format!("/zones/{}/firewall/rules", zone_id));
        let created: Vec<FirewallRule> = self
            .send(self.client.post(&url).json(&[rule]), "create firewall rule")
            .await?;
        created
            .into_iter()
            .next()
            .ok_or_else(|| Error::http("Invalid response format: no rule created"))
    }
}

/// Map a non-success HTTP status to an error
pub(crate) fn status_error(status: u16, what: &str, body: &str) -> Error {
    match status {
        401 | 403 => Error::http(format!(
            "Authentication failed: Invalid API token or insufficient permissions. Status: {}",
            status
        )),
        404 => Error::not_found(format!("{}: resource not found", what)),
        409 => Error::http(format!(
            "Conflict: resource is being updated by another process. Status: {}",
            status
        )),
        429 => Error::http(format!(
            "Rate limit exceeded. Please retry later. Status: {}",
            status
        )),
        500..=599 => Error::http(format!(
            "Cloudflare server error (transient): {} - {}",
            status, body
        )),
        _ => Error::http(format!("Failed to {}: {} - {}", what, status, body)),
    }
}

fn unwrap_envelope<T>(envelope: Envelope<T>, what: &str) -> Result<T> {
    if !envelope.success {
        let detail = envelope
            .errors
            .iter()
            .map(|e| format!("{} ({})", e.message, e.code))
            .collect::<Vec<_>>()
            .join("; ");
        return Err(Error::http(format!("Failed to {}: {}", what, detail)));
    }
    envelope
        .result
        .ok_or_else(|| Error::http(format!("Failed to {}: response has no result", what)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_token_rejected() {
        let err = CloudflareFirewallApi::new("", "https://api.cloudflare.com/client/v4").unwrap_err();
        assert!(matches!(err, Error::Init(_)));
    }

    #[test]
    fn test_api_token_not_exposed_in_debug() {
        let api = CloudflareFirewallApi::new("secret_token_12345", "https://example.test/").unwrap();
        let debug_str = format!("{:?}", api);
        assert!(!debug_str.contains("secret_token"));
        assert!(debug_str.contains("https://example.test"));
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(status_error(404, "get filter", ""), Error::NotFound(_)));
        assert!(status_error(401, "x", "").to_string().contains("Authentication failed"));
        assert!(status_error(403, "x", "").to_string().contains("Authentication failed"));
        assert!(status_error(409, "x", "").to_string().contains("Conflict"));
        assert!(status_error(429, "x", "").to_string().contains("Rate limit"));
        assert!(status_error(503, "x", "busy").to_string().contains("transient"));
        assert!(status_error(418, "update filter", "teapot")
            .to_string()
            .contains("update filter"));
    }

    #[test]
    fn test_envelope_failure_surfaces_errors() {
        let envelope: Envelope<Vec<Filter>> = serde_json::from_str(
            r#"{"success":false,"errors":[{"code":10000,"message":"Authentication error"}],"messages":[],"result":null}"#,
        )
        .unwrap();
        let err = unwrap_envelope(envelope, "list filters").unwrap_err();
        assert!(err.to_string().contains("Authentication error (10000)"));
    }

    #[test]
    fn test_rule_serialization_omits_unset_priority() {
        let rule = FirewallRule {
            id: None,
            paused: false,
            description: "managed".to_string(),
            action: "allow".to_string(),
            priority: None,
            filter: FilterRef { id: "f1".to_string() },
        };
        let json = serde_json::to_value(&rule).unwrap();
        assert!(json.get("priority").is_none());
        assert!(json.get("id").is_none());
        assert_eq!(json["filter"]["id"], "f1");
    }
}
