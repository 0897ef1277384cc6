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

// Filesystem backend implementation
//
// Objects map to directories and every non-object value to a `<key>.json`
// file inside its parent directory, so a store path maps 1:1 to a disk path.

use super::backend::{path_segments, ReadError, TelemetryStore};
use crate::config::FilesystemConfig;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

const LEAF_EXTENSION: &str = "json";

/// Filesystem backend storing the telemetry hierarchy on local disk
pub struct FilesystemStore {
    base_path: PathBuf,
    read_ceiling_bytes: Option<usize>,
}

/// Directory and leaf-file locations of one store path
#[derive(Debug, Clone)]
struct NodePaths {
    dir: PathBuf,
    file: Option<PathBuf>,
}

impl FilesystemStore {
    pub fn new(config: FilesystemConfig) -> Result<Self> {
        let base_path = PathBuf::from(&config.base_path);

        info!(
            "Initializing filesystem store at: {}",
            base_path.display()
        );

        Ok(Self {
            base_path,
            read_ceiling_bytes: config.read_ceiling_bytes,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    fn node_paths(&self, path: &str) -> NodePaths {
        let segments = path_segments(path);
        let mut dir = self.base_path.clone();
        for segment in &segments {
            dir.push(segment);
        }
        let file = segments
            .last()
            .map(|last| dir.with_file_name(format!("{}.{}", last, LEAF_EXTENSION)));
        NodePaths { dir, file }
    }

    /// Ensure base directory exists
    async fn ensure_base_directory(&self) -> Result<()> {
        if !self.base_path.exists() {
            info!("Creating base directory: {}", self.base_path.display());
            tokio::fs::create_dir_all(&self.base_path)
                .await
                .context("Failed to create base directory")?;
        } else {
            info!(
                "Base directory already exists: {}",
                self.base_path.display()
            );
        }
        Ok(())
    }
}

/// Byte budget consumed while assembling a subtree
struct ReadBudget<'a> {
    path: &'a str,
    remaining: Option<usize>,
}

impl ReadBudget<'_> {
    fn charge(&mut self, bytes: usize) -> Result<(), ReadError> {
        if let Some(remaining) = self.remaining.as_mut() {
            if bytes > *remaining {
                return Err(ReadError::too_large(self.path));
            }
            *remaining -= bytes;
        }
        Ok(())
    }
}

fn remove_node(node: &NodePaths) -> Result<()> {
    if node.dir.is_dir() {
        fs::remove_dir_all(&node.dir)
            .with_context(|| format!("Failed to remove {}", node.dir.display()))?;
    }
    if let Some(file) = node.file.as_ref().filter(|f| f.is_file()) {
        fs::remove_file(file).with_context(|| format!("Failed to remove {}", file.display()))?;
    }
    Ok(())
}

fn child_node(dir: &Path, key: &str) -> NodePaths {
    NodePaths {
        dir: dir.join(key),
        file: Some(dir.join(format!("{}.{}", key, LEAF_EXTENSION))),
    }
}

fn write_node(node: &NodePaths, value: Value) -> Result<()> {
    remove_node(node)?;

    match value {
        Value::Null => Ok(()),
        Value::Object(map) => {
            if map.is_empty() {
                return Ok(());
            }
            fs::create_dir_all(&node.dir)
                .with_context(|| format!("Failed to create {}", node.dir.display()))?;
            for (key, child) in map {
                write_node(&child_node(&node.dir, &key), child)?;
            }
            Ok(())
        }
        leaf => {
            let Some(file) = node.file.as_ref() else {
                anyhow::bail!("Cannot store a non-object value at the store root");
            };
            if let Some(parent) = file.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            let bytes = serde_json::to_vec(&leaf).context("Failed to serialize value")?;
            fs::write(file, bytes).with_context(|| format!("Failed to write {}", file.display()))
        }
    }
}

fn read_node(node: &NodePaths, budget: &mut ReadBudget<'_>) -> Result<Option<Value>, ReadError> {
    if let Some(file) = node.file.as_ref().filter(|f| f.is_file()) {
        let bytes = fs::read(file).with_context(|| format!("Failed to read {}", file.display()))?;
        budget.charge(bytes.len())?;
        let value = serde_json::from_slice(&bytes)
            .with_context(|| format!("Corrupt value in {}", file.display()))?;
        return Ok(Some(value));
    }

    if !node.dir.is_dir() {
        return Ok(None);
    }

    let mut map = Map::new();
    for key in child_names(&node.dir)? {
        if let Some(value) = read_node(&child_node(&node.dir, &key), budget)? {
            // key, quotes, colon and separator
            budget.charge(key.len() + 4)?;
            map.insert(key, value);
        }
    }

    Ok((!map.is_empty()).then_some(Value::Object(map)))
}

/// Child keys stored in `dir`: sub-directories and `.json` leaves
fn child_names(dir: &Path) -> Result<Vec<String>> {
    let mut names = Vec::new();
    let entries =
        fs::read_dir(dir).with_context(|| format!("Failed to list {}", dir.display()))?;

    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        if path.is_dir() {
            names.push(name.to_string());
        } else if let Some(stem) = name.strip_suffix(&format!(".{}", LEAF_EXTENSION)) {
            names.push(stem.to_string());
        }
    }

    names.sort();
    names.dedup();
    Ok(names)
}

async fn blocking<T, F>(task: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(task)
        .await
        .context("Filesystem task panicked")?
}

#[async_trait]
impl TelemetryStore for FilesystemStore {
    async fn initialize(&self) -> Result<()> {
        self.ensure_base_directory().await
    }

    async fn write(&self, path: &str, value: Value) -> Result<()> {
        let node = self.node_paths(path);
        debug!("Writing value to {}", node.dir.display());
        blocking(move || write_node(&node, value)).await
    }

    async fn patch_children(&self, path: &str, children: Map<String, Value>) -> Result<()> {
        let node = self.node_paths(path);
        debug!(
            "Patching {} children under {}",
            children.len(),
            node.dir.display()
        );
        blocking(move || {
            // A leaf at the parent path would shadow the new children
            if let Some(file) = node.file.as_ref().filter(|f| f.is_file()) {
                fs::remove_file(file)?;
            }
            fs::create_dir_all(&node.dir)
                .with_context(|| format!("Failed to create {}", node.dir.display()))?;
            for (key, value) in children {
                write_node(&child_node(&node.dir, &key), value)?;
            }
            Ok(())
        })
        .await
    }

    async fn read(&self, path: &str) -> Result<Option<Value>, ReadError> {
        let node = self.node_paths(path);
        let owned_path = path.to_string();
        let ceiling = self.read_ceiling_bytes;

        tokio::task::spawn_blocking(move || {
            let mut budget = ReadBudget {
                path: &owned_path,
                remaining: ceiling,
            };
            read_node(&node, &mut budget)
        })
        .await
        .map_err(|e| ReadError::Other(anyhow::anyhow!("Filesystem read panicked: {}", e)))?
    }

    async fn list_child_keys(&self, path: &str, limit: usize) -> Result<Vec<String>> {
        let node = self.node_paths(path);
        blocking(move || {
            if !node.dir.is_dir() {
                return Ok(Vec::new());
            }
            let mut names = child_names(&node.dir)?;
            names.truncate(limit);
            Ok(names)
        })
        .await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        let node = self.node_paths(path);
        if path_segments(path).is_empty() {
            anyhow::bail!("Refusing to remove the store root");
        }
        blocking(move || remove_node(&node)).await
    }

    async fn health_check(&self) -> Result<bool> {
        // Check if base directory is accessible and writable
        match tokio::fs::metadata(&self.base_path).await {
            Ok(metadata) if metadata.is_dir() => {
                let test_file = self.base_path.join(".health_check_test");
                match tokio::fs::File::create(&test_file).await {
                    Ok(mut f) => {
                        if let Err(e) = f.write_all(b"test").await {
                            warn!("Health check failed - cannot write: {}", e);
                            return Ok(false);
                        }
                        let _ = tokio::fs::remove_file(&test_file).await;
                        Ok(true)
                    }
                    Err(e) => {
                        warn!("Health check failed - cannot create file: {}", e);
                        Ok(false)
                    }
                }
            }
            Ok(_) => {
                warn!(
                    "Health check failed - base path is not a directory: {}",
                    self.base_path.display()
                );
                Ok(false)
            }
            Err(e) => {
                warn!(
                    "Health check failed - cannot access base path {}: {}",
                    self.base_path.display(),
                    e
                );
                Ok(false)
            }
        }
    }

    fn backend_type(&self) -> &str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn create_test_store(ceiling: Option<usize>) -> (FilesystemStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let config = FilesystemConfig {
            base_path: temp_dir.path().to_string_lossy().to_string(),
            read_ceiling_bytes: ceiling,
        };
        let store = FilesystemStore::new(config).unwrap();
        (store, temp_dir)
    }

    #[tokio::test]
    async fn test_initialize() {
        let (store, _temp_dir) = create_test_store(None);
        assert!(store.initialize().await.is_ok());
        assert!(store.base_path().exists());
    }

    #[tokio::test]
    async fn test_write_then_read_subtree() {
        let (store, temp_dir) = create_test_store(None);
        store.initialize().await.unwrap();

        store
            .write("org/session", json!({"user": "ada", "frame_rate": 30}))
            .await
            .unwrap();

        assert!(temp_dir.path().join("org/session/user.json").is_file());
        assert_eq!(
            store.read("org").await.unwrap(),
            Some(json!({"session": {"user": "ada", "frame_rate": 30}}))
        );
        assert_eq!(store.read("org/session/user").await.unwrap(), Some(json!("ada")));
        assert_eq!(store.read("org/none").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_write_replaces_existing_subtree() {
        let (store, _temp_dir) = create_test_store(None);
        store.write("a", json!({"x": 1, "y": 2})).await.unwrap();
        store.write("a", json!({"z": 3})).await.unwrap();

        assert_eq!(store.read("a").await.unwrap(), Some(json!({"z": 3})));
    }

    #[tokio::test]
    async fn test_patch_children_keeps_siblings() {
        let (store, _temp_dir) = create_test_store(None);
        store.write("frames/A/first", json!({"payload": "p0"})).await.unwrap();

        let mut batch = Map::new();
        batch.insert("second".to_string(), json!({"payload": "p1"}));
        store.patch_children("frames/A", batch).await.unwrap();

        assert_eq!(
            store.list_child_keys("frames/A", 10).await.unwrap(),
            vec!["first", "second"]
        );
    }

    #[tokio::test]
    async fn test_read_ceiling_reports_too_large() {
        let (store, _temp_dir) = create_test_store(Some(64));
        for i in 0..10 {
            store
                .write(&format!("big/child{}", i), json!("twenty bytes of data"))
                .await
                .unwrap();
        }

        let err = store.read("big").await.unwrap_err();
        assert!(err.is_too_large());
        assert!(store.read("big/child3").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_remove() {
        let (store, _temp_dir) = create_test_store(None);
        store.write("a/b", json!(1)).await.unwrap();
        store.remove("a/b").await.unwrap();

        assert_eq!(store.read("a/b").await.unwrap(), None);
        assert!(store.remove("").await.is_err());
    }

    #[tokio::test]
    async fn test_health_check() {
        let (store, _temp_dir) = create_test_store(None);
        assert!(store.health_check().await.unwrap());
    }
}
