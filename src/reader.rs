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

// Reads a subtree back, splitting it into per-child reads whenever the store
// refuses a read for exceeding its size ceiling

use serde_json::{Map, Value};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::ReaderConfig;
use crate::storage::{child_path, ReadError, TelemetryStore};

/// Split depth used when the caller has no better estimate
pub const DEFAULT_MAX_DEPTH: usize = 4;

/// Requested depths above this are clamped
pub const MAX_SPLIT_DEPTH: usize = 8;

type FetchFuture<'a> = Pin<Box<dyn Future<Output = Result<Option<Value>, ReadError>> + Send + 'a>>;

/// What a fetch had to do to assemble its result
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FetchDiagnostics {
    /// Serialized size of the assembled value
    pub approx_bytes: usize,
    /// Immediate children of the assembled value
    pub child_count: usize,
    /// Reads that were refused as too large and split into child reads
    pub split_reads: usize,
    /// Children dropped after a non-size failure
    pub skipped_children: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct FetchOutcome {
    /// `None` when nothing is stored at the path
    pub value: Option<Value>,
    pub diagnostics: FetchDiagnostics,
}

pub struct RecursiveReader {
    store: Arc<dyn TelemetryStore>,
    default_depth: usize,
    list_limit: usize,
}

impl RecursiveReader {
    pub fn new(store: Arc<dyn TelemetryStore>, config: &ReaderConfig) -> Self {
        Self {
            store,
            default_depth: config.max_depth.min(MAX_SPLIT_DEPTH),
            list_limit: config.list_limit.max(1),
        }
    }

    /// Fetch with the configured depth budget
    pub async fn fetch_default(&self, path: &str) -> Result<FetchOutcome, ReadError> {
        self.fetch(path, self.default_depth).await
    }

    /// Read the subtree at `path`.
    ///
    /// A read refused as too large is retried child by child with one less
    /// level of budget, and the children that come back are merged into one
    /// object. A child failing for any other reason is skipped. Errors other
    /// than the size ceiling, and a ceiling hit with no budget left, are
    /// returned to the caller.
    pub async fn fetch(&self, path: &str, max_depth: usize) -> Result<FetchOutcome, ReadError> {
        let depth = if max_depth > MAX_SPLIT_DEPTH {
            warn!(
                "Requested split depth {} for '{}' exceeds the cap; using {}",
                max_depth, path, MAX_SPLIT_DEPTH
            );
            MAX_SPLIT_DEPTH
        } else {
            max_depth
        };

        let mut diagnostics = FetchDiagnostics::default();
        let value = self.fetch_at(path.to_string(), depth, &mut diagnostics).await?;

        if let Some(value) = &value {
            diagnostics.approx_bytes = serde_json::to_vec(value).map(|v| v.len()).unwrap_or(0);
            diagnostics.child_count = value.as_object().map(Map::len).unwrap_or(0);
        }

        if diagnostics.split_reads > 0 {
            info!(
                "Fetched '{}' in {} split reads: {} children, ~{} bytes, {} skipped",
                path,
                diagnostics.split_reads,
                diagnostics.child_count,
                diagnostics.approx_bytes,
                diagnostics.skipped_children.len()
            );
        }

        Ok(FetchOutcome { value, diagnostics })
    }

    fn fetch_at<'a>(
        &'a self,
        path: String,
        depth: usize,
        diagnostics: &'a mut FetchDiagnostics,
    ) -> FetchFuture<'a> {
        Box::pin(async move {
            match self.store.read(&path).await {
                Ok(value) => Ok(value),
                Err(ReadError::TooLarge { .. }) if depth > 0 => {
                    diagnostics.split_reads += 1;
                    self.fetch_children(&path, depth - 1, diagnostics).await
                }
                Err(e) => Err(e),
            }
        })
    }

    async fn fetch_children(
        &self,
        path: &str,
        depth: usize,
        diagnostics: &mut FetchDiagnostics,
    ) -> Result<Option<Value>, ReadError> {
        let keys = self.store.list_child_keys(path, self.list_limit).await?;
        if keys.len() >= self.list_limit {
            warn!(
                "Listing of '{}' hit the limit of {} keys; later children are not fetched",
                path, self.list_limit
            );
        }
        debug!(
            "Splitting read of '{}' into {} child reads (depth {} left)",
            path,
            keys.len(),
            depth
        );

        let mut merged = Map::new();
        for key in keys {
            let child = child_path(path, &key);
            match self.fetch_at(child.clone(), depth, diagnostics).await {
                Ok(Some(value)) => {
                    merged.insert(key, value);
                }
                Ok(None) => {}
                Err(e @ ReadError::TooLarge { .. }) => return Err(e),
                Err(ReadError::Other(e)) => {
                    warn!("Skipping child '{}': {:#}", child, e);
                    diagnostics.skipped_children.push(child);
                }
            }
        }

        Ok(Some(Value::Object(merged)))
    }
}
