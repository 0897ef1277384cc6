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

// Storage backend trait for the hierarchical telemetry store

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use thiserror::Error;

/// Failure of a whole-subtree read.
///
/// The size-ceiling condition is its own variant so callers can branch on it
/// without inspecting error messages.
#[derive(Debug, Error)]
pub enum ReadError {
    #[error("subtree at '{path}' exceeds the store's read size ceiling")]
    TooLarge { path: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl ReadError {
    pub fn too_large(path: impl Into<String>) -> Self {
        ReadError::TooLarge { path: path.into() }
    }

    pub fn is_too_large(&self) -> bool {
        matches!(self, ReadError::TooLarge { .. })
    }
}

/// Hierarchical JSON store the recorder writes telemetry into
///
/// Paths are `/`-separated; each segment names one child of its parent.
#[async_trait]
pub trait TelemetryStore: Send + Sync {
    /// Prepare the backend (create root directory, check connectivity, ...)
    async fn initialize(&self) -> Result<()>;

    /// Overwrite the value at an exact path
    async fn write(&self, path: &str, value: Value) -> Result<()>;

    /// Atomically set several children under one parent, leaving other
    /// children untouched
    async fn patch_children(&self, path: &str, children: Map<String, Value>) -> Result<()>;

    /// Read a whole subtree; `Ok(None)` when nothing is stored at `path`
    async fn read(&self, path: &str) -> Result<Option<Value>, ReadError>;

    /// List immediate child keys (sorted, at most `limit`) without fetching values
    async fn list_child_keys(&self, path: &str, limit: usize) -> Result<Vec<String>>;

    async fn remove(&self, path: &str) -> Result<()>;

    /// Patch with retry logic (optional, has default implementation)
    ///
    /// # Arguments
    /// * `path` - Parent path
    /// * `children` - Children to set
    /// * `max_retries` - Maximum number of retry attempts
    async fn patch_with_retry(
        &self,
        path: &str,
        children: Map<String, Value>,
        max_retries: u32,
    ) -> Result<()> {
        patch_retrying(self, path, children, max_retries).await
    }

    /// Health check
    async fn health_check(&self) -> Result<bool>;

    /// Get backend type identifier
    fn backend_type(&self) -> &str;
}

/// Patch `children` under `path`, retrying failures with exponential backoff
pub async fn patch_retrying<S: TelemetryStore + ?Sized>(
    store: &S,
    path: &str,
    children: Map<String, Value>,
    max_retries: u32,
) -> Result<()> {
    use tokio::time::{sleep, Duration};
    use tracing::{info, warn};

    let mut attempt = 0;
    let mut delay = Duration::from_millis(100);

    loop {
        match store.patch_children(path, children.clone()).await {
            Ok(()) => {
                if attempt > 0 {
                    info!("Patched '{}' after {} retries", path, attempt);
                }
                return Ok(());
            }
            Err(e) if attempt < max_retries => {
                warn!(
                    "Patch of '{}' failed (attempt {}/{}): {}. Retrying in {:?}",
                    path,
                    attempt + 1,
                    max_retries,
                    e,
                    delay
                );
                sleep(delay).await;
                delay *= 2; // Exponential backoff
                delay = delay.min(Duration::from_secs(30));
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(
                    "Patch of '{}' failed after {} attempts: {}",
                    path,
                    max_retries,
                    e
                );
                return Err(e);
            }
        }
    }
}

/// Split a store path into its non-empty segments
pub fn path_segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|s| !s.is_empty()).collect()
}

/// Join a parent path and one child key
pub fn child_path(parent: &str, child: &str) -> String {
    let parent = parent.trim_end_matches('/');
    if parent.is_empty() {
        child.to_string()
    } else {
        format!("{}/{}", parent, child)
    }
}
