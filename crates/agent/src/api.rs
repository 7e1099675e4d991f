use reqwest::Method;
use serde_json::Value;

use harvest_common::config::ApiSection;
use harvest_common::ids::RequestId;
use harvest_common::{HarvestError, Result};

/// Homogeneous response shape for every coordinator call. Callers branch on
/// `status_code` alone; transport and decode failures are already flattened.
#[derive(Clone, Debug)]
pub struct ApiResponse {
    pub id: RequestId,
    pub status_code: u16,
    pub reason: String,
    pub url: String,
    pub response: Option<Value>,
}

/// Client for the coordinator API.
///
/// `request` never fails at the type level: anything that goes wrong on the
/// wire becomes a 500 response, so the startup path can degrade gracefully
/// when the coordinator is briefly unreachable.
pub struct ApiClient {
    base_url: String,
    token: String,
    client: reqwest::Client,
}

impl ApiClient {
    pub fn new(config: &ApiSection) -> Result<Self> {
        let mut builder = reqwest::Client::builder();

        if !config.ssl.verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        if let Some(pem) = &config.ssl.pem {
            let buf = std::fs::read(pem).map_err(|e| {
                HarvestError::Config(format!("Cannot read client certificate {}: {}", pem.display(), e))
            })?;
            let identity = reqwest::Identity::from_pem(&buf).map_err(|e| {
                HarvestError::Config(format!("Invalid client certificate {}: {}", pem.display(), e))
            })?;
            builder = builder.identity(identity);
        }

        let client = builder
            .build()
            .map_err(|e| HarvestError::Config(format!("Cannot build HTTP client: {}", e)))?;

        Ok(Self {
            base_url: format!("https://{}:{}", config.host, config.port),
            token: config.token.clone(),
            client,
        })
    }

    /// Issue a request to the coordinator. Every call gets a fresh
    /// correlation id which is logged alongside the outcome.
    pub async fn request(
        &self,
        method: Method,
        endpoint: &str,
        body: Option<&Value>,
    ) -> ApiResponse {
        let id = RequestId::new();
        let url = format!("{}/{}", self.base_url, endpoint.trim_start_matches('/'));

        tracing::debug!(request_id = %id, method = %method, url = %url, "Coordinator request");

        let mut request = self
            .client
            .request(method, &url)
            .bearer_auth(&self.token);

        if let Some(body) = body {
            request = request.json(body);
        }

        match request.send().await {
            Ok(response) => {
                let status = response.status();
                let reason = status
                    .canonical_reason()
                    .unwrap_or("Unknown")
                    .to_string();

                let decoded = match response.json::<Value>().await {
                    Ok(value) => Some(value),
                    Err(e) => Some(Value::String(format!(
                        "Failed to decode response JSON: {}",
                        e
                    ))),
                };

                ApiResponse {
                    id,
                    status_code: status.as_u16(),
                    reason,
                    url,
                    response: decoded,
                }
            }
            Err(e) => {
                tracing::error!(request_id = %id, url = %url, error = %e, "Coordinator request failed");

                ApiResponse {
                    id,
                    status_code: 500,
                    reason: "Internal Server Error".to_string(),
                    url,
                    response: None,
                }
            }
        }
    }

    pub async fn get(&self, endpoint: &str) -> ApiResponse {
        self.request(Method::GET, endpoint, None).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvest_common::config::SslConfig;

    fn unreachable_api() -> ApiSection {
        ApiSection {
            host: "127.0.0.1".into(),
            // Nothing listens on port 1; the connection is refused immediately.
            port: 1,
            token: "test".into(),
            ssl: SslConfig::default(),
        }
    }

    #[tokio::test]
    async fn test_transport_failure_flattens_to_500() {
        let client = ApiClient::new(&unreachable_api()).unwrap();
        let response = client.get("silos/get_all").await;

        assert_eq!(response.status_code, 500);
        assert_eq!(response.reason, "Internal Server Error");
        assert_eq!(response.url, "https://127.0.0.1:1/silos/get_all");
        assert!(response.response.is_none());
    }

    #[tokio::test]
    async fn test_requests_get_distinct_correlation_ids() {
        let client = ApiClient::new(&unreachable_api()).unwrap();
        let a = client.get("a").await;
        let b = client.get("b").await;
        assert_ne!(a.id, b.id);
    }
}
