//! Remote backend client
//!
//! The remote is an authenticated multi-tenant store with one logical table
//! per synced collection. The sync engine only needs four capabilities from
//! it: idempotent upsert-by-id, delete-by-id, select-all scoped to a tenant
//! and a change channel (see [`crate::realtime`]). The first three live on
//! the [`RemoteBackend`] trait; [`RestBackend`] implements them over HTTPS.

use async_trait::async_trait;
use reqwest::{Client as ReqwestClient, RequestBuilder, Response as ReqwestResponse};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use storage::Record;

// =============================================================================
// Error Types
// =============================================================================

/// Error returned by the remote backend
///
/// Covers transport failures (status 0) as well as backend rejections.
///
/// # Examples
/// ```
/// use networking::remote::RemoteError;
///
/// let error = RemoteError::new(503, "ServiceUnavailable", "Backend is down");
/// assert_eq!(error.status(), 503);
/// assert!(error.is_network_error());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteError {
    /// HTTP status code, 0 for transport failures
    status: u16,
    /// Error code (e.g., "NetworkError", "23505")
    code: String,
    /// Human-readable error message
    message: String,
}

impl RemoteError {
    /// Create a new remote error
    pub fn new(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Transport-level failure (no HTTP response)
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(0, "NetworkError", message)
    }

    /// Get the HTTP status code
    pub fn status(&self) -> u16 {
        self.status
    }

    /// Get the error code
    pub fn code(&self) -> &str {
        &self.code
    }

    /// Get the error message
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Whether the failure looks like a connectivity problem rather than a rejection
    ///
    /// Network failure statuses: 0, 408, 425, 429, 500, 502, 503, 504, 522, 524
    pub fn is_network_error(&self) -> bool {
        matches!(self.status, 0 | 408 | 425 | 429 | 500 | 502 | 503 | 504 | 522 | 524)
    }
}

impl std::fmt::Display for RemoteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "remote error {}: {} - {}", self.status, self.code, self.message)
    }
}

impl std::error::Error for RemoteError {}

/// Result type for remote operations
pub type Result<T> = std::result::Result<T, RemoteError>;

/// Error body returned by the backend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteErrorResponse {
    /// Error code
    #[serde(default)]
    pub code: Option<String>,
    /// Error message
    #[serde(default)]
    pub message: Option<String>,
}

// =============================================================================
// Backend Trait
// =============================================================================

/// Operations the sync engine needs from the remote store
#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Insert or replace a record by id
    async fn upsert(&self, table: &str, record: &Record) -> Result<()>;

    /// Delete a record by id; deleting a missing record succeeds
    async fn delete(&self, table: &str, owner_id: &str, id: &str) -> Result<()>;

    /// Every record of a table visible to an owner, tombstones included
    async fn select_all(&self, table: &str, owner_id: &str) -> Result<Vec<Record>>;
}

// =============================================================================
// Client Configuration
// =============================================================================

/// Configuration for the remote backend
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Base service URL (e.g., "https://pos.example.com")
    pub service_url: String,
    /// Realtime endpoint; derived from `service_url` when unset
    pub realtime_url: Option<String>,
    /// Project API key sent with every request
    pub api_key: String,
    /// Session access token; falls back to the API key
    pub access_token: Option<String>,
    /// Request timeout
    pub timeout: Duration,
    /// User agent string
    pub user_agent: String,
    /// Custom headers to include in all requests
    pub default_headers: HashMap<String, String>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            service_url: "http://localhost:54321".to_string(),
            realtime_url: None,
            api_key: String::new(),
            access_token: None,
            timeout: Duration::from_secs(30),
            user_agent: format!("TillSync/{}", env!("CARGO_PKG_VERSION")),
            default_headers: HashMap::new(),
        }
    }
}

impl RemoteConfig {
    /// Create a new config with a service URL
    pub fn new(service_url: impl Into<String>) -> Self {
        Self {
            service_url: service_url.into(),
            ..Default::default()
        }
    }

    /// Set the API key
    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = api_key.into();
        self
    }

    /// Set the session access token
    pub fn with_access_token(mut self, token: impl Into<String>) -> Self {
        self.access_token = Some(token.into());
        self
    }

    /// Set an explicit realtime endpoint
    pub fn with_realtime_url(mut self, url: impl Into<String>) -> Self {
        self.realtime_url = Some(url.into());
        self
    }

    /// Set the timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the user agent
    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    /// Add a default header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.default_headers.insert(key.into(), value.into());
        self
    }

    /// Bearer token for requests
    pub fn bearer(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.api_key)
    }

    fn base(&self) -> &str {
        self.service_url.trim_end_matches('/')
    }
}

// =============================================================================
// REST Backend
// =============================================================================

/// HTTPS implementation of [`RemoteBackend`]
///
/// Tables are exposed as `{service_url}/rest/v1/{table}` and filtered with
/// `column=eq.value` query parameters.
pub struct RestBackend {
    client: ReqwestClient,
    config: RemoteConfig,
}

impl RestBackend {
    /// Create a new REST backend
    pub fn new(config: RemoteConfig) -> Result<Self> {
        let client = ReqwestClient::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| RemoteError::new(0, "ClientError", e.to_string()))?;

        Ok(Self { client, config })
    }

    /// Get the client configuration
    pub fn config(&self) -> &RemoteConfig {
        &self.config
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.config.base(), table)
    }

    fn authorize(&self, mut req: RequestBuilder) -> RequestBuilder {
        req = req
            .header("apikey", &self.config.api_key)
            .header("Authorization", format!("Bearer {}", self.config.bearer()));

        for (key, value) in &self.config.default_headers {
            req = req.header(key, value);
        }
        req
    }

    async fn send(&self, req: RequestBuilder) -> Result<ReqwestResponse> {
        let response = self
            .authorize(req)
            .send()
            .await
            .map_err(|e| RemoteError::network(format!("Request failed: {}", e)))?;

        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        match serde_json::from_str::<RemoteErrorResponse>(&body) {
            Ok(parsed) => Err(RemoteError::new(
                status,
                parsed.code.unwrap_or_else(|| "Unknown".to_string()),
                parsed.message.unwrap_or(body),
            )),
            Err(_) => Err(RemoteError::new(
                status,
                "Unknown",
                format!("HTTP {}: {}", status, body),
            )),
        }
    }
}

#[async_trait]
impl RemoteBackend for RestBackend {
    async fn upsert(&self, table: &str, record: &Record) -> Result<()> {
        let req = self
            .client
            .post(self.table_url(table))
            .query(&[("on_conflict", "id")])
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&[record]);

        self.send(req).await?;
        tracing::debug!(table, id = %record.id, "remote upsert acknowledged");
        Ok(())
    }

    async fn delete(&self, table: &str, owner_id: &str, id: &str) -> Result<()> {
        let req = self
            .client
            .delete(self.table_url(table))
            .query(&[("id", format!("eq.{}", id)), ("owner_id", format!("eq.{}", owner_id))]);

        self.send(req).await?;
        tracing::debug!(table, id, "remote delete acknowledged");
        Ok(())
    }

    async fn select_all(&self, table: &str, owner_id: &str) -> Result<Vec<Record>> {
        let req = self
            .client
            .get(self.table_url(table))
            .query(&[("select", "*".to_string()), ("owner_id", format!("eq.{}", owner_id))]);

        let body = self
            .send(req)
            .await?
            .text()
            .await
            .map_err(|e| {
                RemoteError::new(0, "ParseError", format!("Failed to read response: {}", e))
            })?;

        let rows: Vec<Value> = serde_json::from_str(&body)
            .map_err(|e| {
                RemoteError::new(0, "ParseError", format!("Failed to parse JSON: {}", e))
            })?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match Record::from_value(row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(table, error = %e, "skipping malformed remote row"),
            }
        }
        Ok(records)
    }
}

// =============================================================================
// Tests
// =============================================================================
