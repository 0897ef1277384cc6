// Copyright 2025 coScene
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

// JSON REST backend implementation
//
// Talks to a Realtime-Database style endpoint where every node is reachable at
// `{url}/{path}.json`: PUT overwrites, PATCH merges children, GET reads a
// subtree and `?shallow=true` lists child keys without their values.

use super::backend::{patch_retrying, path_segments, ReadError, TelemetryStore};
use crate::config::RestStoreConfig;
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Error text the database returns when a read crosses its size limit
const SIZE_LIMIT_MARKER: &str = "exceeds the maximum size";

/// REST client for the hierarchical store
pub struct RestStore {
    client: Client,
    base_url: String,
    max_retries: u32,
}

impl RestStore {
    pub fn new(config: RestStoreConfig) -> Result<Self> {
        let mut client_builder = reqwest::ClientBuilder::new()
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .tcp_keepalive(Duration::from_secs(60))
            .timeout(Duration::from_secs(config.timeout_seconds));

        // Add auth token if provided
        if let Some(token) = &config.auth_token {
            let mut headers = reqwest::header::HeaderMap::new();
            let auth_value = format!("Bearer {}", token);
            headers.insert(
                reqwest::header::AUTHORIZATION,
                reqwest::header::HeaderValue::from_str(&auth_value)
                    .context("Invalid auth token")?,
            );
            client_builder = client_builder.default_headers(headers);
        }

        let client = client_builder
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: config.url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
        })
    }

    /// Retries for a patch: the caller's count, or the configured one when
    /// the caller asked for none
    pub fn retry_budget(&self, requested: u32) -> u32 {
        if requested > 0 {
            requested
        } else {
            self.max_retries
        }
    }

    /// Endpoint URL of a store path
    pub fn node_url(&self, path: &str) -> String {
        let segments = path_segments(path);
        if segments.is_empty() {
            format!("{}/.json", self.base_url)
        } else {
            format!("{}/{}.json", self.base_url, segments.join("/"))
        }
    }

    async fn expect_success(response: reqwest::Response, action: &str, path: &str) -> Result<()> {
        if response.status().is_success() {
            return Ok(());
        }
        let status = response.status();
        let error_text = response.text().await.unwrap_or_default();
        bail!(
            "{} of '{}' failed with status {}: {}",
            action,
            path,
            status,
            error_text
        )
    }
}

/// Map a read response onto the typed read result
pub fn classify_read_response(
    path: &str,
    status: StatusCode,
    body: &str,
) -> Result<Option<Value>, ReadError> {
    if status == StatusCode::PAYLOAD_TOO_LARGE {
        return Err(ReadError::too_large(path));
    }

    if !status.is_success() {
        let message = serde_json::from_str::<Value>(body)
            .ok()
            .and_then(|v| v.get("error").and_then(Value::as_str).map(str::to_string))
            .unwrap_or_else(|| body.to_string());

        if status == StatusCode::BAD_REQUEST && message.contains(SIZE_LIMIT_MARKER) {
            return Err(ReadError::too_large(path));
        }

        return Err(ReadError::Other(anyhow::anyhow!(
            "Read of '{}' failed with status {}: {}",
            path,
            status,
            message
        )));
    }

    let value: Value = serde_json::from_str(body)
        .with_context(|| format!("Invalid JSON returned for '{}'", path))?;
    Ok((!value.is_null()).then_some(value))
}

#[async_trait]
impl TelemetryStore for RestStore {
    async fn initialize(&self) -> Result<()> {
        if !self.health_check().await? {
            warn!("Store at {} is not reachable yet", self.base_url);
        }
        Ok(())
    }

    async fn write(&self, path: &str, value: Value) -> Result<()> {
        let response = self
            .client
            .put(self.node_url(path))
            .json(&value)
            .send()
            .await
            .context("Failed to send request")?;

        Self::expect_success(response, "Write", path).await
    }

    async fn patch_children(&self, path: &str, children: Map<String, Value>) -> Result<()> {
        debug!("Patching {} children under '{}'", children.len(), path);
        let response = self
            .client
            .patch(self.node_url(path))
            .json(&children)
            .send()
            .await
            .context("Failed to send request")?;

        Self::expect_success(response, "Patch", path).await
    }

    async fn patch_with_retry(
        &self,
        path: &str,
        children: Map<String, Value>,
        max_retries: u32,
    ) -> Result<()> {
        patch_retrying(self, path, children, self.retry_budget(max_retries)).await
    }

    async fn read(&self, path: &str) -> Result<Option<Value>, ReadError> {
        let response = self
            .client
            .get(self.node_url(path))
            .send()
            .await
            .context("Failed to send request")?;

        let status = response.status();
        let body = response
            .text()
            .await
            .context("Failed to read response body")?;

        classify_read_response(path, status, &body)
    }

    async fn list_child_keys(&self, path: &str, limit: usize) -> Result<Vec<String>> {
        let response = self
            .client
            .get(self.node_url(path))
            .query(&[("shallow", "true")])
            .send()
            .await
            .context("Failed to send request")?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            bail!(
                "Listing of '{}' failed with status {}: {}",
                path,
                status,
                error_text
            );
        }

        let value: Value = response
            .json()
            .await
            .context("Invalid shallow listing")?;

        let mut keys: Vec<String> = match value {
            Value::Object(map) => map.into_iter().map(|(k, _)| k).collect(),
            _ => Vec::new(),
        };
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let response = self
            .client
            .delete(self.node_url(path))
            .send()
            .await
            .context("Failed to send request")?;

        Self::expect_success(response, "Remove", path).await
    }

    async fn health_check(&self) -> Result<bool> {
        let url = self.node_url("");
        match self
            .client
            .get(&url)
            .query(&[("shallow", "true")])
            .send()
            .await
        {
            Ok(response) if response.status().is_success() => Ok(true),
            Ok(response) => {
                warn!("Health check failed with status: {}", response.status());
                Ok(false)
            }
            Err(e) => {
                warn!("Health check error: {}", e);
                Ok(false)
            }
        }
    }

    fn backend_type(&self) -> &str {
        "rest"
    }
}
