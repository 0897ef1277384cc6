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

// Store path layout for one recording session
//
// {root}/{org}/{group}/{date}/{user_name}/{device_slug}/{login_epoch}/{recording_id}
//     frames/{phase}/batch_<ms>_frame_<index>

use crate::protocol::{Phase, SessionKey, SessionMetadata, SessionScope};

/// Resolved store paths for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLayout {
    prefix: String,
}

impl SessionLayout {
    pub fn new(
        telemetry_root: &str,
        scope: &SessionScope,
        key: &SessionKey,
        metadata: &SessionMetadata,
    ) -> Self {
        let device = if metadata.device_nickname.trim().is_empty() {
            &key.device_id
        } else {
            &metadata.device_nickname
        };

        let segments = [
            telemetry_root.trim_matches('/').to_string(),
            sanitize_segment(&scope.org_id),
            sanitize_segment(&scope.session_group_id),
            metadata.session_start.format("%Y-%m-%d").to_string(),
            sanitize_segment(&metadata.user_name),
            sanitize_segment(device),
            key.login_epoch.to_string(),
            sanitize_segment(&key.recording_id),
        ];

        Self {
            prefix: segments.join("/"),
        }
    }

    /// Path the session metadata is patched into
    pub fn metadata_path(&self) -> &str {
        &self.prefix
    }

    pub fn frames_root(&self) -> String {
        format!("{}/frames", self.prefix)
    }

    /// Parent of every batch written under `phase`
    pub fn frames_path(&self, phase: &Phase) -> String {
        format!("{}/frames/{}", self.prefix, sanitize_segment(phase.as_str()))
    }
}

/// Make a value safe to use as one path segment.
///
/// Separators and characters the hierarchical store reserves become `_`;
/// an empty value becomes `unknown`.
///
/// The mapping is lossy: values that differ only in reserved characters, such
/// as phases `pose match` and `pose_match`, land on the same node. Hosts that
/// need them apart must pick distinct names.
pub fn sanitize_segment(value: &str) -> String {
    let cleaned: String = value
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '.' | '#' | '$' | '[' | ']' => '_',
            c if c.is_whitespace() || c.is_control() => '_',
            c => c,
        })
        .collect();

    if cleaned.is_empty() {
        "unknown".to_string()
    } else {
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn metadata(nickname: &str) -> SessionMetadata {
        SessionMetadata {
            user_id: "uid-1".to_string(),
            user_name: "Ada Lovelace".to_string(),
            device_id: "dev-123".to_string(),
            device_nickname: nickname.to_string(),
            frame_rate: 30,
            login_time: Utc.with_ymd_and_hms(2025, 3, 1, 9, 0, 0).unwrap(),
            session_start: Utc.with_ymd_and_hms(2025, 3, 1, 9, 30, 0).unwrap(),
        }
    }

    #[test]
    fn test_layout_paths() {
        let key = SessionKey::new("uid-1", "dev-123", 1_740_819_600_000, "rec.7");
        let scope = SessionScope::new("org-a", "class/3");
        let layout = SessionLayout::new("/telemetry/", &scope, &key, &metadata("Lab iPad"));

        assert_eq!(
            layout.metadata_path(),
            "telemetry/org-a/class_3/2025-03-01/Ada_Lovelace/Lab_iPad/1740819600000/rec_7"
        );
        assert_eq!(
            layout.frames_path(&Phase::new("pose match")),
            format!("{}/frames/pose_match", layout.metadata_path())
        );
    }

    #[test]
    fn test_phases_differing_in_reserved_chars_share_a_node() {
        let key = SessionKey::new("uid-1", "dev-123", 1, "rec");
        let layout = SessionLayout::new("t", &SessionScope::new("o", "g"), &key, &metadata("pad"));

        assert_eq!(
            layout.frames_path(&Phase::new("pose match")),
            layout.frames_path(&Phase::new("pose_match"))
        );
        assert_ne!(
            layout.frames_path(&Phase::new("pose-match")),
            layout.frames_path(&Phase::new("pose_match"))
        );
    }

    #[test]
    fn test_layout_falls_back_to_device_id() {
        let key = SessionKey::new("uid-1", "dev-123", 1, "rec");
        let scope = SessionScope::new("org", "group");
        let layout = SessionLayout::new("root", &scope, &key, &metadata("  "));
        assert!(layout.metadata_path().contains("/dev-123/"));
    }

    #[test]
    fn test_sanitize_segment() {
        assert_eq!(sanitize_segment("a/b.c#d$e[f]"), "a_b_c_d_e_f_");
        assert_eq!(sanitize_segment("  "), "unknown");
        assert_eq!(sanitize_segment("intuition-1"), "intuition-1");
    }
}
