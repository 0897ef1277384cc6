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

// Device, user and tenant identity used to place sessions in the store

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;
use uuid::Uuid;

/// Stable per-install identity of this device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub device_id: String,
    pub nickname: String,
}

impl DeviceIdentity {
    /// Load the identity stored at `path`, creating and persisting a new one
    /// (random id, `nickname`) on first run
    pub fn load_or_create<P: AsRef<Path>>(path: P, nickname: &str) -> Result<Self> {
        let path = path.as_ref();

        if path.exists() {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read device identity {}", path.display()))?;
            let identity: DeviceIdentity = serde_json::from_str(&content)
                .with_context(|| format!("Corrupt device identity {}", path.display()))?;
            return Ok(identity);
        }

        let identity = DeviceIdentity {
            device_id: Uuid::new_v4().to_string(),
            nickname: nickname.to_string(),
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let content = serde_json::to_string_pretty(&identity)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to persist device identity {}", path.display()))?;

        info!(
            "Created device identity {} ({}) at {}",
            identity.device_id,
            identity.nickname,
            path.display()
        );
        Ok(identity)
    }
}

/// Authenticated user of the current login
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub user_id: String,
    pub display_name: String,
    pub login_time: DateTime<Utc>,
}

impl UserIdentity {
    pub fn login_epoch(&self) -> i64 {
        self.login_time.timestamp_millis()
    }
}

/// Source of the identities a session is recorded under
pub trait IdentityProvider: Send + Sync {
    fn device(&self) -> DeviceIdentity;

    /// `None` while nobody is signed in
    fn user(&self) -> Option<UserIdentity>;

    /// Tenant the current user records into
    fn current_org(&self) -> Option<String>;
}

/// Fixed identities, for tools and tests
#[derive(Debug, Clone)]
pub struct StaticIdentity {
    pub device: DeviceIdentity,
    pub user: Option<UserIdentity>,
    pub org: Option<String>,
}

impl IdentityProvider for StaticIdentity {
    fn device(&self) -> DeviceIdentity {
        self.device.clone()
    }

    fn user(&self) -> Option<UserIdentity> {
        self.user.clone()
    }

    fn current_org(&self) -> Option<String> {
        self.org.clone()
    }
}
