// # Kubernetes Document API
//
// Minimal REST client for the two object kinds the mesh target manages.
//
// ## Endpoints
//
// - ConfigMap: `/api/v1/namespaces/:ns/configmaps[/:name]`
// - EnvoyFilter: `/apis/networking.istio.io/v1alpha3/namespaces/:ns/envoyfilters[/:name]`
//
// Objects travel as untyped JSON. `replace` expects the caller to carry the
// `metadata.resourceVersion` of the object it read.
//
// ## Credentials
//
// The bearer token comes from the target's credential or, failing that,
// from the mounted service-account token. The mounted cluster CA is trusted
// when present.

use async_trait::async_trait;
use metasync_core::{Error, Result};
use serde_json::Value;
use std::path::Path;
use std::time::Duration;

/// HTTP timeout for API requests (30 seconds)
const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Mounted service-account directory
pub const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Object kinds managed by the mesh target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    ConfigMap,
    EnvoyFilter,
}

impl ResourceKind {
    pub fn api_version(&self) -> &'static str {
        match self {
            ResourceKind::ConfigMap => "v1",
            ResourceKind::EnvoyFilter => "networking.istio.io/v1alpha3",
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ResourceKind::ConfigMap => "ConfigMap",
            ResourceKind::EnvoyFilter => "EnvoyFilter",
        }
    }

    fn collection_path(&self, namespace: &str) -> String {
        match self {
            ResourceKind::ConfigMap => format!("/api/v1/namespaces/{}/configmaps", namespace),
            ResourceKind::EnvoyFilter => format!(
                "/apis/networking.istio.io/v1alpha3/namespaces/{}/envoyfilters",
                namespace
            ),
        }
    }
}

/// Object store operations used by the mesh target
#[async_trait]
pub trait DocumentApi: Send + Sync {
    /// Fetch an object; `Ok(None)` when it does not exist
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<Value>>;

    async fn create(&self, kind: ResourceKind, namespace: &str, object: &Value) -> Result<Value>;

    async fn replace(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        object: &Value,
    ) -> Result<Value>;
}

/// reqwest-backed Kubernetes REST client
pub struct KubeDocumentApi {
    api_server: String,

    /// ⚠️ NEVER log this value
    token: String,

    client: reqwest::Client,
}

impl std::fmt::Debug for KubeDocumentApi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KubeDocumentApi")
            .field("api_server", &self.api_server)
            .field("token", &"<REDACTED>")
            .finish()
    }
}

impl KubeDocumentApi {
    /// Build a client for `api_server`
    ///
    /// `ca_pem` adds a trusted root, typically the mounted cluster CA.
    pub fn new(
        api_server: impl Into<String>,
        token: impl Into<String>,
        ca_pem: Option<&[u8]>,
    ) -> Result<Self> {
        let token = token.into();
        if token.is_empty() {
            return Err(Error::init("Kubernetes API token cannot be empty"));
        }

        let mut builder = reqwest::Client::builder().timeout(DEFAULT_HTTP_TIMEOUT);
        if let Some(pem) = ca_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| Error::init(format!("Invalid cluster CA certificate: {}", e)))?;
            builder = builder.add_root_certificate(cert);
        }
        let client = builder
            .build()
            .map_err(|e| Error::init(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            api_server: api_server.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    /// Build a client from the target credential or the mounted service account
    pub async fn from_environment(api_server: &str, credential: Option<String>) -> Result<Self> {
        let dir = Path::new(SERVICE_ACCOUNT_DIR);

        let token = match credential.map(|t| t.trim().to_string()).filter(|t| !t.is_empty()) {
            Some(token) => token,
            None => tokio::fs::read_to_string(dir.join("token"))
                .await
                .map(|t| t.trim().to_string())
                .map_err(|_| {
                    Error::init("Kubernetes API token is required (no credential and no service account token)")
                })?,
        };

        let ca = tokio::fs::read(dir.join("ca.crt")).await.ok();
        if ca.is_some() {
            tracing::debug!("Trusting mounted cluster CA");
        }

        Self::new(api_server, token, ca.as_deref())
    }

    fn url(&self, kind: ResourceKind, namespace: &str, name: Option<&str>) -> String {
        let collection = kind.collection_path(namespace);
        match name {
            Some(name) => format!("{}{}/{}", self.api_server, collection, name),
            None => format!("{}{}", self.api_server, collection),
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder, what: &str) -> Result<Option<Value>> {
        let response = request
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| Error::http(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unable to read error response".to_string());
            return Err(status_error(status.as_u16(), what, &body));
        }

        response
            .json()
            .await
            .map(Some)
            .map_err(|e| Error::http(format!("Failed to parse response: {}", e)))
    }
}

#[async_trait]
impl DocumentApi for KubeDocumentApi {
    async fn get(&self, kind: ResourceKind, namespace: &str, name: &str) -> Result<Option<Value>> {
        let url = self.url(kind, namespace, Some(name));
        self.send(self.client.get(&url), &format!("get {} {}", kind.kind(), name))
            .await
    }

    async fn create(&self, kind: ResourceKind, namespace: &str, object: &Value) -> Result<Value> {
        let url = self.url(kind, namespace, None);
        self.send(self.client.post(&url).json(object), &format!("create {}", kind.kind()))
            .await?
            .ok_or_else(|| Error::not_found(format!("{} namespace {}", kind.kind(), namespace)))
    }

    async fn replace(
        &self,
        kind: ResourceKind,
        namespace: &str,
        name: &str,
        object: &Value,
    ) -> Result<Value> {
        let url = self.url(kind, namespace, Some(name));
        self.send(
            self.client.put(&url).json(object),
            &format!("replace {} {}", kind.kind(), name),
        )
        .await?
        .ok_or_else(|| Error::not_found(format!("{} {}/{}", kind.kind(), namespace, name)))
    }
}

/// Map a non-success HTTP status to an error
fn status_error(status: u16, what: &str, body: &str) -> Error {
    match status {
        401 | 403 => Error::http(format!(
            "Authentication failed: token rejected or missing RBAC permission to {}. Status: {}",
            what, status
        )),
        409 => Error::http(format!(
            "Conflict: object changed since it was read ({}). Status: {}",
            what, status
        )),
        429 => Error::http(format!(
            "Rate limit exceeded. Please retry later. Status: {}",
            status
        )),
        500..=599 => Error::http(format!(
            "API server error (transient): {} - {}",
            status, body
        )),
        _ => Error::http(format!("Failed to {}: {} - {}", what, status, body)),
    }
}
