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

use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

use crate::config::{ReaderConfig, RecorderSettings, TelemetryConfig};
use crate::error::SessionError;
use crate::identity::IdentityProvider;
use crate::layout::SessionLayout;
use crate::phase::PhaseTracker;
use crate::protocol::{LossWarning, Phase, SessionKey, SessionMetadata, SessionScope, SessionStats};
use crate::reader::RecursiveReader;
use crate::registry::{SessionEntry, SessionRegistry};
use crate::sampler::{FrameSampler, FrameSource};
use crate::sink::SessionSink;
use crate::storage::TelemetryStore;

const WARNING_CHANNEL_CAPACITY: usize = 64;

/// Entry point for recording telemetry sessions into a store
pub struct TelemetryRecorder {
    store: Arc<dyn TelemetryStore>,
    registry: SessionRegistry,
    settings: RecorderSettings,
    reader_config: ReaderConfig,
    warnings: broadcast::Sender<LossWarning>,
}

impl TelemetryRecorder {
    pub fn new(
        store: Arc<dyn TelemetryStore>,
        settings: RecorderSettings,
        reader_config: ReaderConfig,
    ) -> Self {
        let (warnings, _) = broadcast::channel(WARNING_CHANNEL_CAPACITY);
        Self {
            store,
            registry: SessionRegistry::new(),
            settings,
            reader_config,
            warnings,
        }
    }

    pub fn from_config(store: Arc<dyn TelemetryStore>, config: &TelemetryConfig) -> Self {
        Self::new(store, config.recorder.clone(), config.reader.clone())
    }

    pub fn store(&self) -> &Arc<dyn TelemetryStore> {
        &self.store
    }

    pub fn settings(&self) -> &RecorderSettings {
        &self.settings
    }

    /// Register a session and write its metadata.
    ///
    /// Returns true when this call created the session; repeated and
    /// concurrent calls for a live key write nothing.
    pub async fn initialize_session(
        &self,
        key: SessionKey,
        metadata: SessionMetadata,
        scope: SessionScope,
    ) -> Result<bool> {
        let layout = SessionLayout::new(&self.settings.telemetry_root, &scope, &key, &metadata);

        let (_, created) = self
            .registry
            .initialize(&key, || self.start_session(key.clone(), layout, metadata))
            .await
            .with_context(|| format!("Failed to initialize session {}", key))?;

        Ok(created)
    }

    async fn start_session(
        &self,
        key: SessionKey,
        layout: SessionLayout,
        metadata: SessionMetadata,
    ) -> Result<SessionEntry> {
        let fields = match serde_json::to_value(&metadata)? {
            Value::Object(fields) => fields,
            other => bail!("Session metadata serialized to a non-object: {}", other),
        };

        self.store
            .patch_with_retry(
                layout.metadata_path(),
                fields,
                self.settings.metadata_max_retries,
            )
            .await
            .with_context(|| format!("Failed to write metadata to '{}'", layout.metadata_path()))?;

        let mut settings = self.settings.clone();
        settings.frame_rate = metadata.frame_rate;

        let sink = SessionSink::spawn(
            key.to_string(),
            layout.clone(),
            Arc::clone(&self.store),
            PhaseTracker::new(),
            &settings,
            self.warnings.clone(),
        );

        info!(
            "Recording session {} under '{}' at {} fps",
            key,
            layout.metadata_path(),
            metadata.frame_rate
        );

        Ok(SessionEntry::new(key, layout, metadata, sink))
    }

    /// Build the session key, metadata and scope from `identity` and
    /// initialize the session
    pub async fn open_session(
        &self,
        identity: &dyn IdentityProvider,
        session_group_id: &str,
        recording_id: &str,
        frame_rate: u32,
    ) -> Result<SessionKey> {
        let user = identity
            .user()
            .ok_or_else(|| anyhow!("Cannot open a session without an authenticated user"))?;
        let org_id = identity
            .current_org()
            .ok_or_else(|| anyhow!("User {} has no current organization", user.user_id))?;
        let device = identity.device();

        let key = SessionKey::new(
            user.user_id.clone(),
            device.device_id.clone(),
            user.login_epoch(),
            recording_id,
        );
        let metadata = SessionMetadata {
            user_id: user.user_id,
            user_name: user.display_name,
            device_id: device.device_id,
            device_nickname: device.nickname,
            frame_rate,
            login_time: user.login_time,
            session_start: Utc::now(),
        };

        self.initialize_session(
            key.clone(),
            metadata,
            SessionScope::new(org_id, session_group_id),
        )
        .await?;
        Ok(key)
    }

    pub fn is_initialized(&self, key: &SessionKey) -> bool {
        self.registry.contains(key)
    }

    pub fn sessions(&self) -> Vec<SessionKey> {
        self.registry.keys()
    }

    /// Handle for producers that append to one session at frame rate
    pub fn sink(&self, key: &SessionKey) -> Option<SessionSink> {
        self.registry.get(key).map(|entry| entry.sink.clone())
    }

    pub fn layout(&self, key: &SessionKey) -> Option<SessionLayout> {
        self.registry.get(key).map(|entry| entry.layout.clone())
    }

    /// Change the session's phase; true when the phase actually changed
    pub fn set_phase(&self, key: &SessionKey, phase: Option<Phase>) -> bool {
        match self.registry.get(key) {
            Some(entry) => entry.sink.set_phase(phase),
            None => {
                warn!("Phase change ignored: session {} is not initialized", key);
                false
            }
        }
    }

    pub fn phase(&self, key: &SessionKey) -> Option<Phase> {
        self.registry
            .get(key)
            .and_then(|entry| entry.sink.phase().get_phase())
    }

    /// Buffer one frame; false if it was dropped
    pub fn append(&self, key: &SessionKey, payload: impl Into<String>) -> bool {
        match self.registry.get(key) {
            Some(entry) => entry.sink.append(payload),
            None => {
                warn!("Dropping frame: session {} is not initialized", key);
                false
            }
        }
    }

    /// Request a flush of the buffered frames
    pub fn flush(&self, key: &SessionKey, target: Option<Phase>) {
        match self.registry.get(key) {
            Some(entry) => entry.sink.flush(target),
            None => warn!("Flush skipped: session {} is not initialized", key),
        }
    }

    pub async fn stats(&self, key: &SessionKey) -> Result<SessionStats, SessionError> {
        self.entry(key)?.sink.stats().await
    }

    /// Wait for the session's in-flight write to settle, along with any size
    /// flush queued behind it
    pub async fn settle(&self, key: &SessionKey) -> Result<(), SessionError> {
        self.entry(key)?.sink.settle().await
    }

    /// Drive `append` from `source` once per frame until the session ends
    pub async fn start_sampler<S: FrameSource>(
        &self,
        key: &SessionKey,
        source: S,
    ) -> Result<(), SessionError> {
        let entry = self.entry(key)?;
        let sampler = FrameSampler::spawn(entry.sink.clone(), source, entry.metadata.frame_rate);
        entry.attach_sampler(sampler).await;
        Ok(())
    }

    /// Stop sampling, flush the remainder, wait for every write to settle and
    /// forget the session
    pub async fn end_session(&self, key: &SessionKey) -> Result<SessionStats, SessionError> {
        let entry = self.entry(key)?;

        entry.stop_sampler().await;
        let result = entry.sink.end().await;
        self.registry.forget(key, &entry);

        match &result {
            Ok(stats) => info!(
                "Session {} ended: {} appended, {} flushed, {} lost",
                key, stats.frames_appended, stats.frames_flushed, stats.frames_lost
            ),
            Err(e) => error!("Session {} ended abnormally: {}", key, e),
        }
        result
    }

    /// End every live session
    pub async fn shutdown(&self) -> Result<()> {
        let keys = self.registry.keys();
        info!("Shutting down recorder with {} active sessions", keys.len());

        let mut failed = 0;
        for key in keys {
            if let Err(e) = self.end_session(&key).await {
                error!("Failed to end session {}: {}", key, e);
                failed += 1;
            }
        }

        if failed > 0 {
            bail!("{} sessions did not end cleanly", failed);
        }
        Ok(())
    }

    /// Receive loss warnings raised by any session
    pub fn subscribe_warnings(&self) -> broadcast::Receiver<LossWarning> {
        self.warnings.subscribe()
    }

    pub fn reader(&self) -> RecursiveReader {
        RecursiveReader::new(Arc::clone(&self.store), &self.reader_config)
    }

    fn entry(&self, key: &SessionKey) -> Result<Arc<SessionEntry>, SessionError> {
        self.registry
            .get(key)
            .ok_or_else(|| SessionError::NotInitialized(key.to_string()))
    }
}
