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

use chrono::Utc;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use crate::config::LossDetectionConfig;
use crate::protocol::LossWarning;

#[derive(Debug, Clone, Copy)]
struct FlushRecord {
    frames: usize,
    rejected: bool,
}

/// Debounced detector of sustained write loss.
///
/// Keeps the most recent flush outcomes covering `check_interval × frame_rate`
/// frames and warns when more than `threshold × frame_rate` of those frames
/// were rejected, at most once per check interval.
#[derive(Debug)]
pub struct LossDetector {
    window_frames: usize,
    threshold_frames: usize,
    check_interval: Duration,
    outcomes: VecDeque<FlushRecord>,
    frames_in_window: usize,
    last_alert: Option<Instant>,
}

impl LossDetector {
    pub fn new(config: &LossDetectionConfig, frame_rate: u32) -> Self {
        let rate = frame_rate.max(1) as usize;
        Self {
            window_frames: (config.check_interval_seconds as usize * rate).max(1),
            threshold_frames: config.data_loss_threshold_seconds as usize * rate,
            check_interval: config.check_interval(),
            outcomes: VecDeque::new(),
            frames_in_window: 0,
            last_alert: None,
        }
    }

    pub fn window_frames(&self) -> usize {
        self.window_frames
    }

    pub fn threshold_frames(&self) -> usize {
        self.threshold_frames
    }

    /// Frames rejected within the current window
    pub fn lost_in_window(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|r| r.rejected)
            .map(|r| r.frames)
            .sum()
    }

    /// Record one settled flush and return a warning if one is due
    pub fn observe(
        &mut self,
        session: &str,
        frames: usize,
        rejected: bool,
        now: Instant,
    ) -> Option<LossWarning> {
        self.outcomes.push_back(FlushRecord { frames, rejected });
        self.frames_in_window += frames;

        // Drop the oldest outcomes while the rest still cover the window
        while let Some(front) = self.outcomes.front() {
            if self.outcomes.len() > 1 && self.frames_in_window - front.frames >= self.window_frames
            {
                self.frames_in_window -= front.frames;
                self.outcomes.pop_front();
            } else {
                break;
            }
        }

        let lost = self.lost_in_window();
        if lost <= self.threshold_frames {
            return None;
        }

        if let Some(last) = self.last_alert {
            if now.saturating_duration_since(last) < self.check_interval {
                return None;
            }
        }

        self.last_alert = Some(now);
        Some(LossWarning {
            session: session.to_string(),
            lost_frames: lost,
            window_frames: self.window_frames,
            threshold_frames: self.threshold_frames,
            raised_at: Utc::now(),
        })
    }
}
