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

// Configuration loader with environment variable substitution

use super::types::*;
use crate::buffer::MAX_BATCH_FRAMES;
use crate::reader::MAX_SPLIT_DEPTH;
use anyhow::{bail, Context, Result};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration from file with environment variable substitution
    pub fn load<P: AsRef<Path>>(path: P) -> Result<TelemetryConfig> {
        let content =
            std::fs::read_to_string(path.as_ref()).context("Failed to read config file")?;
        Self::parse(&content)
    }

    /// Parse configuration text (after `${VAR}` substitution) and validate it
    pub fn parse(content: &str) -> Result<TelemetryConfig> {
        let content = Self::substitute_env_vars(content);

        let config: TelemetryConfig =
            serde_yaml::from_str(&content).context("Failed to parse YAML configuration")?;

        Self::validate(&config)?;

        Ok(config)
    }

    /// Substitute ${VAR} and ${VAR:-default} patterns with environment variables
    ///
    /// Examples:
    /// - ${HOME} -> /home/user
    /// - ${TELEMETRY_ROOT:-telemetry} -> telemetry (if TELEMETRY_ROOT not set)
    fn substitute_env_vars(content: &str) -> String {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let re = PATTERN.get_or_init(|| {
            Regex::new(r"\$\{([^}:]+)(?::-([^}]+))?\}").expect("env substitution pattern")
        });

        re.replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default_value = caps.get(2).map(|m| m.as_str());

            match std::env::var(var_name) {
                Ok(value) => value,
                Err(_) => match default_value {
                    Some(default) => default.to_string(),
                    // Keep original if no default and var not found
                    None => format!("${{{}}}", var_name),
                },
            }
        })
        .to_string()
    }

    /// Validate configuration
    pub fn validate(config: &TelemetryConfig) -> Result<()> {
        let recorder = &config.recorder;
        let policy = &recorder.flush_policy;

        if recorder.frame_rate == 0 {
            bail!("recorder.frame_rate must be > 0");
        }

        if recorder.frame_rate > 1000 {
            bail!("recorder.frame_rate must be <= 1000");
        }

        if policy.size_ceiling == 0 {
            bail!("flush_policy.size_ceiling must be > 0");
        }

        if policy.size_ceiling > MAX_BATCH_FRAMES {
            bail!("flush_policy.size_ceiling must be <= {}", MAX_BATCH_FRAMES);
        }

        if policy.flush_interval_ms == 0 {
            bail!("flush_policy.flush_interval_ms must be > 0");
        }

        if policy.min_batch_size == 0 {
            bail!("flush_policy.min_batch_size must be > 0");
        }

        if policy.min_batch_size > policy.size_ceiling {
            bail!("flush_policy.min_batch_size must not exceed flush_policy.size_ceiling");
        }

        let loss = &recorder.loss_detection;
        if loss.check_interval_seconds == 0 {
            bail!("loss_detection.check_interval_seconds must be > 0");
        }

        if loss.data_loss_threshold_seconds > loss.check_interval_seconds {
            bail!(
                "loss_detection.data_loss_threshold_seconds must not exceed check_interval_seconds"
            );
        }

        if recorder.telemetry_root.trim_matches('/').is_empty() {
            bail!("recorder.telemetry_root cannot be empty");
        }

        if config.reader.max_depth > MAX_SPLIT_DEPTH {
            bail!("reader.max_depth must be <= {}", MAX_SPLIT_DEPTH);
        }

        if config.reader.list_limit == 0 {
            bail!("reader.list_limit must be > 0");
        }

        match config.storage.backend.as_str() {
            "rest" => {
                let Some(rest) = config.storage.backend_config.as_rest() else {
                    bail!("rest backend selected but rest config missing");
                };
                if rest.url.is_empty() {
                    bail!("rest.url cannot be empty");
                }
            }
            "filesystem" => {
                if config.storage.backend_config.as_filesystem().is_none() {
                    bail!("filesystem backend selected but filesystem config missing");
                }
            }
            "memory" => {
                if config.storage.backend_config.as_memory().is_none() {
                    bail!("memory backend selected but memory config missing");
                }
            }
            unknown => bail!(
                "Unknown backend: '{}'. Supported: memory, filesystem, rest",
                unknown
            ),
        }

        Ok(())
    }
}
