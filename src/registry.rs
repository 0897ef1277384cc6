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

use anyhow::Result;
use dashmap::DashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info};

use crate::layout::SessionLayout;
use crate::protocol::{SessionKey, SessionMetadata};
use crate::sampler::FrameSampler;
use crate::sink::SessionSink;

/// Everything held for one initialized session
pub struct SessionEntry {
    pub key: SessionKey,
    pub layout: SessionLayout,
    pub metadata: SessionMetadata,
    pub sink: SessionSink,
    sampler: Mutex<Option<FrameSampler>>,
}

impl SessionEntry {
    pub fn new(
        key: SessionKey,
        layout: SessionLayout,
        metadata: SessionMetadata,
        sink: SessionSink,
    ) -> Self {
        Self {
            key,
            layout,
            metadata,
            sink,
            sampler: Mutex::new(None),
        }
    }

    /// Attach a sampler, stopping any previous one
    pub async fn attach_sampler(&self, sampler: FrameSampler) {
        let previous = self.sampler.lock().await.replace(sampler);
        if let Some(previous) = previous {
            previous.stop().await;
        }
    }

    /// Stop the attached sampler; true if one was running
    pub async fn stop_sampler(&self) -> bool {
        let sampler = self.sampler.lock().await.take();
        match sampler {
            Some(sampler) => {
                sampler.stop().await;
                true
            }
            None => false,
        }
    }
}

type Slot = Arc<OnceCell<Arc<SessionEntry>>>;

/// Sessions initialized in this process.
///
/// Initialization runs at most once per key while the key is registered, even
/// when several callers race; a failed initialization leaves the key free.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionKey, Slot>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the entry for `key`, running `init` only if the key is new.
    ///
    /// The boolean is true when this call created the entry.
    pub async fn initialize<F, Fut>(&self, key: &SessionKey, init: F) -> Result<(Arc<SessionEntry>, bool)>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<SessionEntry>>,
    {
        let slot: Slot = self.sessions.entry(key.clone()).or_default().clone();

        let created = AtomicBool::new(false);
        let created_flag = &created;
        let entry = slot
            .get_or_try_init(move || async move {
                created_flag.store(true, Ordering::Relaxed);
                init().await.map(Arc::new)
            })
            .await?;

        let created = created.load(Ordering::Relaxed);
        if created {
            info!("Session {} initialized", key);
        } else {
            debug!("Session {} already initialized", key);
        }

        Ok((Arc::clone(entry), created))
    }

    pub fn get(&self, key: &SessionKey) -> Option<Arc<SessionEntry>> {
        self.sessions
            .get(key)
            .and_then(|slot| slot.value().get().cloned())
    }

    pub fn contains(&self, key: &SessionKey) -> bool {
        self.get(key).is_some()
    }

    /// Forget `entry` if it is still the one registered under `key`.
    ///
    /// The caller must have drained its buffer. A session re-initialized under
    /// the same key in the meantime is left alone.
    pub fn forget(&self, key: &SessionKey, entry: &Arc<SessionEntry>) -> bool {
        let removed = self
            .sessions
            .remove_if(key, |_, slot| {
                slot.get().is_some_and(|current| Arc::ptr_eq(current, entry))
            })
            .is_some();
        if removed {
            info!("Session {} forgotten", key);
        } else {
            debug!("Session {} already replaced or forgotten", key);
        }
        removed
    }

    pub fn keys(&self) -> Vec<SessionKey> {
        self.sessions
            .iter()
            .filter(|slot| slot.value().initialized())
            .map(|slot| slot.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.keys().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
