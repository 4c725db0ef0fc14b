//! HTTP/JSON status sync client with client-side round robin across endpoints

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, warn};

use super::{StatusError, StatusResult, StatusSyncClient};
use crate::config::StatusConfig;
use crate::constants::ServiceStatus;

#[derive(Debug, Serialize)]
struct SetStatusRequest<'a> {
    status: &'a str,
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

pub struct HttpStatusClient {
    client: Client,
    endpoints: Vec<String>,
    current_index: AtomicUsize,
}

impl HttpStatusClient {
    pub fn new(config: &StatusConfig) -> StatusResult<Self> {
        if config.endpoints.is_empty() {
            return Err(StatusError::NoEndpoints);
        }
        let client = Client::builder()
            .timeout(config.request_timeout())
            .build()
            .map_err(|e| StatusError::request("build client", e.to_string()))?;

        Ok(Self {
            client,
            endpoints: config
                .endpoints
                .iter()
                .map(|e| e.trim_end_matches('/').to_string())
                .collect(),
            current_index: AtomicUsize::new(0),
        })
    }

    /// Endpoints in the order they should be tried for the next request
    fn rotation(&self) -> impl Iterator<Item = &str> {
        let start = self.current_index.fetch_add(1, Ordering::Relaxed) % self.endpoints.len();
        self.endpoints
            .iter()
            .cycle()
            .skip(start)
            .take(self.endpoints.len())
            .map(String::as_str)
    }

    async fn send(
        &self,
        operation: &str,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> StatusResult<reqwest::Response> {
        let mut last_error = None;

        for endpoint in self.rotation() {
            let url = format!("{endpoint}{path}");
            let mut request = self.client.request(method.clone(), &url);
            if let Some(body) = &body {
                request = request.json(body);
            }

            match request.send().await.and_then(|r| r.error_for_status()) {
                Ok(response) => {
                    debug!(operation = %operation, url = %url, "Status request completed");
                    return Ok(response);
                }
                Err(e) => {
                    warn!(operation = %operation, url = %url, error = %e, "Status request failed");
                    last_error = Some(e.to_string());
                }
            }
        }

        Err(StatusError::request(
            operation,
            last_error.unwrap_or_else(|| "no endpoint attempted".to_string()),
        ))
    }
}

#[async_trait]
impl StatusSyncClient for HttpStatusClient {
    async fn set_status(&self, service_id: &str, status: ServiceStatus) -> StatusResult<()> {
        let body = serde_json::to_value(SetStatusRequest {
            status: status.as_str(),
        })
        .map_err(|e| StatusError::Decode(e.to_string()))?;
        self.send(
            "set_status",
            Method::PUT,
            &format!("/v1/services/{service_id}/status"),
            Some(body),
        )
        .await?;
        Ok(())
    }

    async fn get_status(&self, service_id: &str) -> StatusResult<ServiceStatus> {
        let response = self
            .send(
                "get_status",
                Method::GET,
                &format!("/v1/services/{service_id}/status"),
                None,
            )
            .await?;
        let body: StatusResponse = response
            .json()
            .await
            .map_err(|e| StatusError::Decode(e.to_string()))?;
        body.status.parse().map_err(StatusError::Decode)
    }

    async fn check_status(&self, service_id: &str) -> StatusResult<()> {
        self.send(
            "check_status",
            Method::POST,
            &format!("/v1/services/{service_id}/check"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn ignore_delete(&self, resource_name: &str) -> StatusResult<()> {
        self.send(
            "ignore_delete",
            Method::PUT,
            &format!("/v1/ignore-delete/{resource_name}"),
            None,
        )
        .await?;
        Ok(())
    }

    async fn rm_ignore_delete(&self, resource_name: &str) -> StatusResult<()> {
        self.send(
            "rm_ignore_delete",
            Method::DELETE,
            &format!("/v1/ignore-delete/{resource_name}"),
            None,
        )
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(endpoints: &[&str]) -> HttpStatusClient {
        let config = StatusConfig {
            endpoints: endpoints.iter().map(|e| e.to_string()).collect(),
            ..StatusConfig::default()
        };
        HttpStatusClient::new(&config).unwrap()
    }

    #[test]
    fn test_requires_endpoints() {
        let config = StatusConfig {
            endpoints: vec![],
            ..StatusConfig::default()
        };
        assert!(matches!(
            HttpStatusClient::new(&config),
            Err(StatusError::NoEndpoints)
        ));
    }

    #[test]
    fn test_round_robin_rotation() {
        let client = client(&["http://a/", "http://b", "http://c"]);

        let first: Vec<_> = client.rotation().collect();
        let second: Vec<_> = client.rotation().collect();

        assert_eq!(first, vec!["http://a", "http://b", "http://c"]);
        assert_eq!(second, vec!["http://b", "http://c", "http://a"]);
    }
}
