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

// In-process store backend
//
// Keeps the whole hierarchy as one JSON tree. Useful for local runs and tests;
// an optional read ceiling reproduces the remote store's size limit.

use super::backend::{path_segments, ReadError, TelemetryStore};
use crate::config::MemoryStoreConfig;
use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;
use tracing::debug;

pub struct MemoryStore {
    root: RwLock<Map<String, Value>>,
    read_ceiling_bytes: Option<usize>,
}

impl MemoryStore {
    pub fn new(config: MemoryStoreConfig) -> Self {
        Self {
            root: RwLock::new(Map::new()),
            read_ceiling_bytes: config.read_ceiling_bytes,
        }
    }

    pub fn with_read_ceiling(read_ceiling_bytes: usize) -> Self {
        Self::new(MemoryStoreConfig {
            read_ceiling_bytes: Some(read_ceiling_bytes),
        })
    }

    /// Copy of the whole tree
    pub async fn snapshot(&self) -> Value {
        Value::Object(self.root.read().await.clone())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(MemoryStoreConfig::default())
    }
}

fn lookup<'a>(root: &'a Map<String, Value>, segments: &[&str]) -> Option<&'a Value> {
    let (first, rest) = segments.split_first()?;
    let mut node = root.get(*first)?;
    for segment in rest {
        node = node.as_object()?.get(*segment)?;
    }
    Some(node)
}

fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}

/// Set `value` at `segments` below `node`; null removes, emptied parents are pruned
fn assign(node: &mut Map<String, Value>, segments: &[&str], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        return;
    };

    if rest.is_empty() {
        if is_empty_value(&value) {
            node.remove(*first);
        } else {
            node.insert(first.to_string(), value);
        }
        return;
    }

    let child = node
        .entry(first.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !child.is_object() {
        *child = Value::Object(Map::new());
    }
    if let Value::Object(child_map) = child {
        assign(child_map, rest, value);
        if child_map.is_empty() {
            node.remove(*first);
        }
    }
}

#[async_trait]
impl TelemetryStore for MemoryStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn write(&self, path: &str, value: Value) -> Result<()> {
        let segments = path_segments(path);
        let mut root = self.root.write().await;

        if segments.is_empty() {
            *root = match value {
                Value::Object(map) => map,
                _ => Map::new(),
            };
            return Ok(());
        }

        assign(&mut root, &segments, value);
        Ok(())
    }

    async fn patch_children(&self, path: &str, children: Map<String, Value>) -> Result<()> {
        let segments = path_segments(path);
        let mut root = self.root.write().await;

        debug!("Patching {} children under '{}'", children.len(), path);
        for (key, value) in children {
            let mut child_segments = segments.clone();
            child_segments.push(&key);
            assign(&mut root, &child_segments, value);
        }
        Ok(())
    }

    async fn read(&self, path: &str) -> Result<Option<Value>, ReadError> {
        let segments = path_segments(path);
        let root = self.root.read().await;

        let value = if segments.is_empty() {
            if root.is_empty() {
                None
            } else {
                Some(Value::Object(root.clone()))
            }
        } else {
            lookup(&root, &segments).cloned()
        };

        if let (Some(ceiling), Some(value)) = (self.read_ceiling_bytes, value.as_ref()) {
            let size = serde_json::to_vec(value).map_err(anyhow::Error::from)?.len();
            if size > ceiling {
                return Err(ReadError::too_large(path));
            }
        }

        Ok(value)
    }

    async fn list_child_keys(&self, path: &str, limit: usize) -> Result<Vec<String>> {
        let segments = path_segments(path);
        let root = self.root.read().await;

        let node = if segments.is_empty() {
            Some(&*root)
        } else {
            lookup(&root, &segments).and_then(Value::as_object)
        };

        let mut keys: Vec<String> = node
            .map(|map| map.keys().cloned().collect())
            .unwrap_or_default();
        keys.sort();
        keys.truncate(limit);
        Ok(keys)
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.write(path, Value::Null).await
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn backend_type(&self) -> &str {
        "memory"
    }
}
