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

// Shared test store: an in-memory tree with call recording, injectable write
// failures, a gate that holds frame writes, and scripted read failures

#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use frame_telemetry::config::{FlushPolicy, LossDetectionConfig, ReaderConfig, RecorderSettings};
use frame_telemetry::storage::{MemoryStore, ReadError, TelemetryStore};
use frame_telemetry::{SessionKey, SessionMetadata, SessionScope, TelemetryRecorder};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Semaphore;

#[derive(Debug, Clone)]
pub enum ScriptedRead {
    TooLarge,
    Fail(String),
}

#[derive(Debug, Clone)]
pub struct PatchCall {
    pub path: String,
    pub keys: Vec<String>,
}

pub struct ScriptedStore {
    inner: MemoryStore,
    patches: Mutex<Vec<PatchCall>>,
    reads: Mutex<Vec<String>>,
    listings: Mutex<Vec<String>>,
    read_script: Mutex<HashMap<String, ScriptedRead>>,
    fail_frame_writes: AtomicBool,
    fail_metadata_writes: AtomicUsize,
    gated: AtomicBool,
    gate: Semaphore,
}

impl ScriptedStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: MemoryStore::default(),
            patches: Mutex::new(Vec::new()),
            reads: Mutex::new(Vec::new()),
            listings: Mutex::new(Vec::new()),
            read_script: Mutex::new(HashMap::new()),
            fail_frame_writes: AtomicBool::new(false),
            fail_metadata_writes: AtomicUsize::new(0),
            gated: AtomicBool::new(false),
            gate: Semaphore::new(0),
        })
    }

    pub fn fail_frame_writes(&self, fail: bool) {
        self.fail_frame_writes.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` metadata writes
    pub fn fail_metadata_writes(&self, count: usize) {
        self.fail_metadata_writes.store(count, Ordering::SeqCst);
    }

    /// Hold every frame write until `release` is called
    pub fn close_gate(&self) {
        self.gated.store(true, Ordering::SeqCst);
    }

    pub fn release(&self, writes: usize) {
        self.gate.add_permits(writes);
    }

    pub fn open_gate(&self) {
        self.gated.store(false, Ordering::SeqCst);
        self.gate.add_permits(1 << 20);
    }

    pub fn script_read(&self, path: &str, outcome: ScriptedRead) {
        self.read_script
            .lock()
            .unwrap()
            .insert(path.to_string(), outcome);
    }

    pub fn patches(&self) -> Vec<PatchCall> {
        self.patches.lock().unwrap().clone()
    }

    pub fn frame_batches(&self) -> Vec<PatchCall> {
        self.patches()
            .into_iter()
            .filter(|call| is_frame_path(&call.path))
            .collect()
    }

    pub fn metadata_writes(&self) -> usize {
        self.patches()
            .iter()
            .filter(|call| !is_frame_path(&call.path))
            .count()
    }

    pub fn reads(&self) -> Vec<String> {
        self.reads.lock().unwrap().clone()
    }

    pub fn listings(&self) -> Vec<String> {
        self.listings.lock().unwrap().clone()
    }

    pub async fn snapshot(&self) -> Value {
        self.inner.snapshot().await
    }
}

fn is_frame_path(path: &str) -> bool {
    path.contains("/frames/")
}

#[async_trait]
impl TelemetryStore for ScriptedStore {
    async fn initialize(&self) -> Result<()> {
        Ok(())
    }

    async fn write(&self, path: &str, value: Value) -> Result<()> {
        self.inner.write(path, value).await
    }

    async fn patch_children(&self, path: &str, children: Map<String, Value>) -> Result<()> {
        self.patches.lock().unwrap().push(PatchCall {
            path: path.to_string(),
            keys: children.keys().cloned().collect(),
        });

        if is_frame_path(path) {
            if self.gated.load(Ordering::SeqCst) {
                self.gate.acquire().await?.forget();
            }
            if self.fail_frame_writes.load(Ordering::SeqCst) {
                return Err(anyhow!("store unavailable"));
            }
        } else {
            let remaining = self.fail_metadata_writes.load(Ordering::SeqCst);
            if remaining > 0 {
                self.fail_metadata_writes.store(remaining - 1, Ordering::SeqCst);
                return Err(anyhow!("metadata write refused"));
            }
        }

        self.inner.patch_children(path, children).await
    }

    async fn read(&self, path: &str) -> Result<Option<Value>, ReadError> {
        self.reads.lock().unwrap().push(path.to_string());
        let scripted = self.read_script.lock().unwrap().get(path).cloned();
        match scripted {
            Some(ScriptedRead::TooLarge) => Err(ReadError::too_large(path)),
            Some(ScriptedRead::Fail(message)) => Err(ReadError::Other(anyhow!(message))),
            None => self.inner.read(path).await,
        }
    }

    async fn list_child_keys(&self, path: &str, limit: usize) -> Result<Vec<String>> {
        self.listings.lock().unwrap().push(path.to_string());
        self.inner.list_child_keys(path, limit).await
    }

    async fn remove(&self, path: &str) -> Result<()> {
        self.inner.remove(path).await
    }

    async fn health_check(&self) -> Result<bool> {
        Ok(true)
    }

    fn backend_type(&self) -> &str {
        "scripted"
    }
}

/// Settings with timers far enough out that only explicit triggers fire
pub fn quiet_settings(size_ceiling: usize) -> RecorderSettings {
    RecorderSettings {
        telemetry_root: "telemetry".to_string(),
        frame_rate: 30,
        flush_policy: FlushPolicy {
            size_ceiling,
            flush_interval_ms: 3_600_000,
            min_batch_size: 1,
        },
        loss_detection: LossDetectionConfig::default(),
        metadata_max_retries: 0,
    }
}

pub fn recorder(store: Arc<ScriptedStore>, settings: RecorderSettings) -> TelemetryRecorder {
    TelemetryRecorder::new(store, settings, ReaderConfig::default())
}

pub fn session_key(recording_id: &str) -> SessionKey {
    SessionKey::new("user-1", "device-1", 1_700_000_000_000, recording_id)
}

pub fn session_metadata(frame_rate: u32) -> SessionMetadata {
    SessionMetadata {
        user_id: "user-1".to_string(),
        user_name: "Ada".to_string(),
        device_id: "device-1".to_string(),
        device_nickname: "Lab iPad".to_string(),
        frame_rate,
        login_time: Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
        session_start: Utc.timestamp_millis_opt(1_700_000_100_000).unwrap(),
    }
}

pub fn session_scope() -> SessionScope {
    SessionScope::new("org-1", "group-1")
}

pub async fn start_session(recorder: &TelemetryRecorder, recording_id: &str) -> SessionKey {
    let key = session_key(recording_id);
    recorder
        .initialize_session(key.clone(), session_metadata(30), session_scope())
        .await
        .unwrap();
    key
}
