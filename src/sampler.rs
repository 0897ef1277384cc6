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

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, warn};

use crate::config::RecorderSettings;
use crate::sink::SessionSink;

/// Produces the serialized payload of the current frame
pub trait FrameSource: Send + 'static {
    /// `None` when nothing was detected this frame
    fn next_frame(&mut self) -> Option<String>;
}

impl<F> FrameSource for F
where
    F: FnMut() -> Option<String> + Send + 'static,
{
    fn next_frame(&mut self) -> Option<String> {
        self()
    }
}

/// Per-frame timer feeding a session sink
pub struct FrameSampler {
    stop: oneshot::Sender<()>,
    handle: JoinHandle<u64>,
}

impl FrameSampler {
    /// Sample `source` every `1000 / frame_rate` ms (at least 1 ms) until
    /// stopped.
    ///
    /// Late ticks are skipped rather than bunched up, and the loop never waits
    /// on a flush.
    pub fn spawn<S: FrameSource>(sink: SessionSink, mut source: S, frame_rate: u32) -> Self {
        let period = RecorderSettings::period_for_rate(frame_rate);
        let (stop, mut stopped) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            let mut sampled = 0u64;

            loop {
                tokio::select! {
                    _ = &mut stopped => break,
                    _ = ticker.tick() => {
                        if let Some(payload) = source.next_frame() {
                            if sink.append(payload) {
                                sampled += 1;
                            } else if sink.is_closed() {
                                warn!("Sampler for session {} outlived its session", sink.label());
                                break;
                            }
                        }
                    }
                }
            }

            debug!("Sampler for session {} stopped after {} frames", sink.label(), sampled);
            sampled
        });

        Self { stop, handle }
    }

    /// Cancel the timer and wait for the loop to exit; returns frames sampled
    pub async fn stop(self) -> u64 {
        let _ = self.stop.send(());
        self.handle.await.unwrap_or_default()
    }
}
