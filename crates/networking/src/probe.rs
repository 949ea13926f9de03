//! Connectivity probe
//!
//! Hosts without a platform connectivity signal can poll the backend
//! instead. Any HTTP response, including errors, counts as reachable; only
//! transport failures and timeouts count as offline.

use reqwest::Client as ReqwestClient;
use std::time::Duration;

use crate::remote::{RemoteConfig, RemoteError};

/// Health check against the backend
pub struct ConnectivityProbe {
    client: ReqwestClient,
    url: String,
}

impl ConnectivityProbe {
    /// Create a probe hitting `{service_url}/rest/v1/`
    pub fn new(config: &RemoteConfig, timeout: Duration) -> Result<Self, RemoteError> {
        let client = ReqwestClient::builder()
            .timeout(timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| RemoteError::new(0, "ClientError", e.to_string()))?;

        let url = format!("{}/rest/v1/", config.service_url.trim_end_matches('/'));
        Ok(Self { client, url })
    }

    /// URL being probed
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Whether the backend answered at all
    pub async fn check(&self) -> bool {
        match self.client.head(&self.url).send().await {
            Ok(response) => {
                tracing::trace!(status = response.status().as_u16(), "connectivity probe answered");
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "connectivity probe failed");
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_probe_reachable_even_on_error_status() {
        let server = MockServer::start().await;
        Mock::given(method("HEAD"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let probe = ConnectivityProbe::new(&RemoteConfig::new(server.uri()), Duration::from_secs(2))
            .unwrap();
        assert!(probe.check().await);
    }

    #[tokio::test]
    async fn test_probe_unreachable() {
        // Port 9 (discard) on localhost is expected to refuse connections
        let probe = ConnectivityProbe::new(
            &RemoteConfig::new("http://127.0.0.1:9"),
            Duration::from_millis(500),
        )
        .unwrap();
        assert!(!probe.check().await);
        assert_eq!(probe.url(), "http://127.0.0.1:9/rest/v1/");
    }
}
