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

// Configuration types for frame-telemetry

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TelemetryConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub recorder: RecorderSettings,
    #[serde(default)]
    pub reader: ReaderConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Storage configuration with backend selection
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Backend type: "memory", "filesystem", "rest"
    pub backend: String,

    /// Backend-specific configuration
    #[serde(flatten)]
    pub backend_config: BackendConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "memory".to_string(),
            backend_config: BackendConfig::Memory {
                memory: MemoryStoreConfig::default(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum BackendConfig {
    Rest {
        #[serde(rename = "rest")]
        rest: RestStoreConfig,
    },
    Filesystem {
        #[serde(rename = "filesystem")]
        filesystem: FilesystemConfig,
    },
    Memory {
        #[serde(rename = "memory")]
        memory: MemoryStoreConfig,
    },
}

impl BackendConfig {
    pub fn as_rest(&self) -> Option<&RestStoreConfig> {
        match self {
            BackendConfig::Rest { rest } => Some(rest),
            _ => None,
        }
    }

    pub fn as_rest_mut(&mut self) -> Option<&mut RestStoreConfig> {
        match self {
            BackendConfig::Rest { rest } => Some(rest),
            _ => None,
        }
    }

    pub fn as_filesystem(&self) -> Option<&FilesystemConfig> {
        match self {
            BackendConfig::Filesystem { filesystem } => Some(filesystem),
            _ => None,
        }
    }

    pub fn as_memory(&self) -> Option<&MemoryStoreConfig> {
        match self {
            BackendConfig::Memory { memory } => Some(memory),
            _ => None,
        }
    }
}

/// JSON REST store (Realtime-Database style `{url}/{path}.json` endpoints)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RestStoreConfig {
    pub url: String,
    #[serde(default)]
    pub auth_token: Option<String>,

    #[serde(default = "default_timeout")]
    pub timeout_seconds: u64,

    /// Patch retries used when the caller requests none
    #[serde(default = "default_retries")]
    pub max_retries: u32,
}

impl Default for RestStoreConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:9000".to_string(),
            auth_token: None,
            timeout_seconds: default_timeout(),
            max_retries: default_retries(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FilesystemConfig {
    pub base_path: String,

    /// Largest subtree (serialized bytes) a single read may return
    #[serde(default)]
    pub read_ceiling_bytes: Option<usize>,
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            base_path: "/data/telemetry".to_string(),
            read_ceiling_bytes: None,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MemoryStoreConfig {
    #[serde(default)]
    pub read_ceiling_bytes: Option<usize>,
}

/// Recorder-specific settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RecorderSettings {
    #[serde(default = "default_telemetry_root")]
    pub telemetry_root: String,

    /// Sampling cadence; also sizes the loss-detection window
    #[serde(default = "default_frame_rate")]
    pub frame_rate: u32,

    #[serde(default)]
    pub flush_policy: FlushPolicy,

    #[serde(default)]
    pub loss_detection: LossDetectionConfig,

    /// Retries for the one-time session metadata write
    #[serde(default = "default_retries")]
    pub metadata_max_retries: u32,
}

impl Default for RecorderSettings {
    fn default() -> Self {
        Self {
            telemetry_root: default_telemetry_root(),
            frame_rate: default_frame_rate(),
            flush_policy: FlushPolicy::default(),
            loss_detection: LossDetectionConfig::default(),
            metadata_max_retries: default_retries(),
        }
    }
}

impl RecorderSettings {
    /// Period of the per-frame sampling timer
    pub fn frame_period(&self) -> Duration {
        Self::period_for_rate(self.frame_rate)
    }

    /// Sampling period for `frame_rate`, never shorter than 1 ms
    pub fn period_for_rate(frame_rate: u32) -> Duration {
        Duration::from_millis((1000 / u64::from(frame_rate.max(1))).max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FlushPolicy {
    /// Buffered frame count that forces an immediate flush
    #[serde(default = "default_size_ceiling")]
    pub size_ceiling: usize,

    /// Period of the auto-flush timer
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Minimum frames before the timer flushes (avoid tiny batches)
    #[serde(default = "default_min_batch_size")]
    pub min_batch_size: usize,
}

impl Default for FlushPolicy {
    fn default() -> Self {
        Self {
            size_ceiling: default_size_ceiling(),
            flush_interval_ms: default_flush_interval_ms(),
            min_batch_size: default_min_batch_size(),
        }
    }
}

impl FlushPolicy {
    /// Auto-flush period; a zero interval is treated as 1 ms
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LossDetectionConfig {
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,

    #[serde(default = "default_data_loss_threshold_seconds")]
    pub data_loss_threshold_seconds: u64,
}

impl Default for LossDetectionConfig {
    fn default() -> Self {
        Self {
            check_interval_seconds: default_check_interval_seconds(),
            data_loss_threshold_seconds: default_data_loss_threshold_seconds(),
        }
    }
}

impl LossDetectionConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReaderConfig {
    #[serde(default = "default_max_depth")]
    pub max_depth: usize,

    /// Upper bound on child keys listed per split
    #[serde(default = "default_list_limit")]
    pub list_limit: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_depth: default_max_depth(),
            list_limit: default_list_limit(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String, // "trace", "debug", "info", "warn", "error"
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// Default value functions
fn default_timeout() -> u64 { 30 }
fn default_retries() -> u32 { 3 }
fn default_telemetry_root() -> String { "telemetry".to_string() }
fn default_frame_rate() -> u32 { 30 }
fn default_size_ceiling() -> usize { 30 }
fn default_flush_interval_ms() -> u64 { 7500 }
fn default_min_batch_size() -> usize { 5 }
fn default_check_interval_seconds() -> u64 { 10 }
fn default_data_loss_threshold_seconds() -> u64 { 2 }
fn default_max_depth() -> usize { 4 }
fn default_list_limit() -> usize { 1000 }
fn default_log_level() -> String { "info".to_string() }
