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

use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

use crate::protocol::Phase;

/// Current phase slot of one session.
///
/// The host's control flow sets the phase (through `SessionSink::set_phase`
/// for a live session); `append` tags frames with whatever it reads here.
/// Clones share the same slot.
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    slot: Arc<watch::Sender<Option<Phase>>>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        let (slot, _) = watch::channel(None);
        Self {
            slot: Arc::new(slot),
        }
    }

    /// Set the phase; `None` stops recording. Returns true if it changed.
    pub fn set_phase(&self, phase: Option<Phase>) -> bool {
        self.slot.send_if_modified(|current| {
            if *current == phase {
                return false;
            }
            debug!(
                "Phase change: {:?} -> {:?}",
                current.as_ref().map(Phase::as_str),
                phase.as_ref().map(Phase::as_str)
            );
            *current = phase;
            true
        })
    }

    pub fn get_phase(&self) -> Option<Phase> {
        self.slot.borrow().clone()
    }

    pub fn is_recording(&self) -> bool {
        self.slot.borrow().is_some()
    }

    /// Receiver notified on every change
    pub fn subscribe(&self) -> watch::Receiver<Option<Phase>> {
        self.slot.subscribe()
    }
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}
