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

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one buffering lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SessionKey {
    pub user_id: String,
    pub device_id: String,
    pub login_epoch: i64,
    pub recording_id: String,
}

impl SessionKey {
    pub fn new(
        user_id: impl Into<String>,
        device_id: impl Into<String>,
        login_epoch: i64,
        recording_id: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            device_id: device_id.into(),
            login_epoch,
            recording_id: recording_id.into(),
        }
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/{}/{}",
            self.user_id, self.device_id, self.login_epoch, self.recording_id
        )
    }
}

/// Session metadata, written once when a session is initialized
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMetadata {
    pub user_id: String,
    pub user_name: String,
    pub device_id: String,
    pub device_nickname: String,
    pub frame_rate: u32,
    pub login_time: DateTime<Utc>,
    pub session_start: DateTime<Utc>,
}

/// Tenant placement of a session in the store hierarchy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionScope {
    pub org_id: String,
    pub session_group_id: String,
}

impl SessionScope {
    pub fn new(org_id: impl Into<String>, session_group_id: impl Into<String>) -> Self {
        Self {
            org_id: org_id.into(),
            session_group_id: session_group_id.into(),
        }
    }
}

/// Stage of the host session that buffered frames are filed under
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Phase(String);

impl Phase {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Phase {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for Phase {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// One sampled frame as stored under a batch key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameRecord {
    pub payload: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub captured_at: DateTime<Utc>,
}

impl FrameRecord {
    pub fn new(payload: impl Into<String>) -> Self {
        Self {
            payload: payload.into(),
            captured_at: Utc::now(),
        }
    }
}

/// Child key of one frame inside a batch write.
///
/// Both numbers are zero-padded so that lexicographic order of the keys
/// matches the order in which batches (and frames inside them) were written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BatchKey {
    pub batch_ms: u64,
    pub index: usize,
}

impl BatchKey {
    pub fn new(batch_ms: u64, index: usize) -> Self {
        Self { batch_ms, index }
    }

    /// Parse a key produced by the `Display` impl
    pub fn parse(key: &str) -> Option<Self> {
        let rest = key.strip_prefix("batch_")?;
        let (ms, index) = rest.split_once("_frame_")?;
        if ms.len() != 15 || index.len() != 5 {
            return None;
        }
        Some(Self {
            batch_ms: ms.parse().ok()?,
            index: index.parse().ok()?,
        })
    }
}

impl fmt::Display for BatchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "batch_{:015}_frame_{:05}", self.batch_ms, self.index)
    }
}

/// What caused a flush to be attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlushTrigger {
    Size,
    Timer,
    Boundary,
    Manual,
    Drain,
}

/// Settled result of one batch write
#[derive(Debug, Clone)]
pub struct FlushOutcome {
    pub phase: Phase,
    pub batch_ms: u64,
    pub frame_count: usize,
    pub trigger: FlushTrigger,
    pub error: Option<String>,
}

impl FlushOutcome {
    pub fn is_rejected(&self) -> bool {
        self.error.is_some()
    }
}

/// Rate-limited warning raised when recent flushes imply sustained data loss
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossWarning {
    pub session: String,
    pub lost_frames: usize,
    pub window_frames: usize,
    pub threshold_frames: usize,
    pub raised_at: DateTime<Utc>,
}

/// Snapshot of a session's buffering counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionStats {
    pub frames_appended: u64,
    pub frames_flushed: u64,
    pub frames_lost: u64,
    pub frames_skipped: u64,
    pub buffered: usize,
    pub buffered_phase: Option<Phase>,
    pub last_flushed_phase: Option<Phase>,
    pub batches_written: u64,
    pub batches_failed: u64,
    pub flushing: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_key_format() {
        let key = BatchKey::new(1_700_000_000_123, 7);
        assert_eq!(key.to_string(), "batch_001700000000123_frame_00007");
    }

    #[test]
    fn test_batch_key_lexicographic_order_matches_write_order() {
        let keys = [
            BatchKey::new(999, 99),
            BatchKey::new(1_000, 0),
            BatchKey::new(1_000, 1),
            BatchKey::new(1_000, 10),
            BatchKey::new(12_000, 0),
        ];
        let rendered: Vec<String> = keys.iter().map(ToString::to_string).collect();
        let mut sorted = rendered.clone();
        sorted.sort();
        assert_eq!(rendered, sorted);
    }

    #[test]
    fn test_batch_key_parse() {
        let key = BatchKey::new(42, 3);
        assert_eq!(BatchKey::parse(&key.to_string()), Some(key));
        assert_eq!(BatchKey::parse("batch_42_frame_3"), None);
        assert_eq!(BatchKey::parse("metadata"), None);
    }

    #[test]
    fn test_frame_record_serializes_millis() {
        let frame = FrameRecord {
            payload: "{\"x\":1}".to_string(),
            captured_at: DateTime::from_timestamp_millis(1_700_000_000_500).unwrap(),
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(value["captured_at"], 1_700_000_000_500i64);
        assert_eq!(value["payload"], "{\"x\":1}");
    }

    #[test]
    fn test_session_key_display() {
        let key = SessionKey::new("u1", "dev-a", 1700, "rec-9");
        assert_eq!(key.to_string(), "u1/dev-a/1700/rec-9");
    }
}
