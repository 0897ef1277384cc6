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

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::protocol::{BatchKey, FrameRecord, Phase};

/// Largest batch whose indices still fit the 5-digit key field
pub const MAX_BATCH_FRAMES: usize = 100_000;

/// Frames detached from the buffer for one batch write
#[derive(Debug, Clone)]
pub struct FrameBatch {
    pub phase: Phase,
    pub batch_ms: u64,
    pub frames: Vec<FrameRecord>,
}

impl FrameBatch {
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = BatchKey> + '_ {
        (0..self.frames.len()).map(move |index| BatchKey::new(self.batch_ms, index))
    }

    /// Children of the phase node, keyed by batch key
    pub fn into_children(self) -> Map<String, Value> {
        let batch_ms = self.batch_ms;
        self.frames
            .into_iter()
            .enumerate()
            .map(|(index, frame)| {
                let value = serde_json::to_value(&frame).unwrap_or_else(|e| {
                    warn!("Failed to encode frame {}: {}", index, e);
                    Value::Null
                });
                (BatchKey::new(batch_ms, index).to_string(), value)
            })
            .collect()
    }
}

/// Ordered queue of pending frames for one session.
///
/// All buffered frames belong to a single phase; a frame under another phase
/// is refused until the buffer has been drained.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    frames: Vec<FrameRecord>,
    phase: Option<Phase>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Phase of the buffered frames, `None` while empty
    pub fn phase(&self) -> Option<&Phase> {
        self.phase.as_ref()
    }

    /// True when a frame under `phase` can be appended without mixing phases
    pub fn accepts(&self, phase: &Phase) -> bool {
        self.phase.as_ref().map_or(true, |current| current == phase)
    }

    /// Append a frame; hands it back if the buffer holds another phase
    pub fn push(&mut self, phase: &Phase, frame: FrameRecord) -> Result<usize, FrameRecord> {
        if !self.accepts(phase) {
            return Err(frame);
        }
        if self.phase.is_none() {
            self.phase = Some(phase.clone());
        }
        self.frames.push(frame);
        Ok(self.frames.len())
    }

    /// Detach up to `MAX_BATCH_FRAMES` frames, oldest first, stamped with `batch_ms`
    pub fn take_batch(&mut self, batch_ms: u64) -> Option<FrameBatch> {
        let phase = self.phase.clone()?;
        if self.frames.is_empty() {
            self.phase = None;
            return None;
        }

        let frames = if self.frames.len() > MAX_BATCH_FRAMES {
            let rest = self.frames.split_off(MAX_BATCH_FRAMES);
            std::mem::replace(&mut self.frames, rest)
        } else {
            std::mem::take(&mut self.frames)
        };

        if self.frames.is_empty() {
            self.phase = None;
        }

        debug!(
            "Detached batch of {} frames under phase '{}' ({} left)",
            frames.len(),
            phase,
            self.frames.len()
        );

        Some(FrameBatch {
            phase,
            batch_ms,
            frames,
        })
    }
}
