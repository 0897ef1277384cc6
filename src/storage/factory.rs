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

// Backend factory for creating telemetry stores from configuration

use super::backend::TelemetryStore;
use super::filesystem::FilesystemStore;
use super::memory::MemoryStore;
use super::rest::RestStore;
use crate::config::StorageConfig;
use anyhow::{bail, Result};
use std::sync::Arc;

#[cfg(test)]
use crate::config::BackendConfig;

pub struct BackendFactory;

impl BackendFactory {
    /// Create telemetry store from configuration
    pub fn create(config: &StorageConfig) -> Result<Arc<dyn TelemetryStore>> {
        match config.backend.as_str() {
            "rest" => {
                let backend_config = config
                    .backend_config
                    .as_rest()
                    .ok_or_else(|| anyhow::anyhow!("REST store config missing"))?;

                let store = RestStore::new(backend_config.clone())?;
                Ok(Arc::new(store))
            }

            "filesystem" => {
                let backend_config = config
                    .backend_config
                    .as_filesystem()
                    .ok_or_else(|| anyhow::anyhow!("Filesystem config missing"))?;

                let store = FilesystemStore::new(backend_config.clone())?;
                Ok(Arc::new(store))
            }

            "memory" => {
                let backend_config = config
                    .backend_config
                    .as_memory()
                    .ok_or_else(|| anyhow::anyhow!("Memory store config missing"))?;

                Ok(Arc::new(MemoryStore::new(backend_config.clone())))
            }

            unknown => bail!(
                "Unknown storage backend: '{}'. Supported: memory, filesystem, rest",
                unknown
            ),
        }
    }
}
