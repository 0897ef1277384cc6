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

// Per-session buffering and flush control
//
// Every session owns one worker task. Producers hand frames to it over an
// unbounded channel, so `append` never waits on I/O; the worker owns the
// buffer, the auto-flush timer and the single in-flight batch write.
//
// Flush triggers:
// - size: buffer length reaches `size_ceiling` (checked on append and when a
//   write settles)
// - timer: every `flush_interval_ms`, if at least `min_batch_size` frames are
//   buffered and no boundary flush ran since the previous tick
// - boundary: the phase changed; old-phase frames are written before any
//   new-phase frame is buffered
//
// Phase changes travel over the same channel as frames so the worker sees
// them in the order the producer issued them.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::buffer::FrameBuffer;
use crate::config::{FlushPolicy, RecorderSettings};
use crate::error::SessionError;
use crate::layout::SessionLayout;
use crate::loss::LossDetector;
use crate::phase::PhaseTracker;
use crate::protocol::{FlushOutcome, FlushTrigger, FrameRecord, LossWarning, Phase, SessionStats};
use crate::storage::TelemetryStore;

enum SinkCommand {
    Append { phase: Phase, frame: FrameRecord },
    PhaseChanged(Option<Phase>),
    Flush { target: Option<Phase> },
    Stats(oneshot::Sender<SessionStats>),
    Settle(oneshot::Sender<()>),
    End(oneshot::Sender<SessionStats>),
}

/// Handle to a session's buffering worker. Cheap to clone.
#[derive(Clone)]
pub struct SessionSink {
    label: Arc<str>,
    commands: mpsc::UnboundedSender<SinkCommand>,
    phase: PhaseTracker,
    skipped: Arc<AtomicU64>,
}

impl SessionSink {
    /// Start the worker for one session
    pub fn spawn(
        label: impl Into<String>,
        layout: SessionLayout,
        store: Arc<dyn TelemetryStore>,
        phase: PhaseTracker,
        settings: &RecorderSettings,
        warnings: broadcast::Sender<LossWarning>,
    ) -> Self {
        let label: Arc<str> = Arc::from(label.into());
        let (commands, receiver) = mpsc::unbounded_channel();

        let worker = SinkWorker {
            label: Arc::clone(&label),
            layout,
            store,
            policy: settings.flush_policy.clone(),
            buffer: FrameBuffer::new(),
            in_flight: JoinSet::new(),
            pending: None,
            loss: LossDetector::new(&settings.loss_detection, settings.frame_rate),
            warnings,
            last_flushed_phase: None,
            last_batch_ms: 0,
            boundary_flushed_this_tick: false,
            counters: Counters::default(),
        };

        tokio::spawn(worker.run(receiver));

        Self {
            label,
            commands,
            phase,
            skipped: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn phase(&self) -> &PhaseTracker {
        &self.phase
    }

    /// Move the session to `phase`; true when it actually changed.
    ///
    /// Leaving a phase flushes the frames buffered under it.
    pub fn set_phase(&self, phase: Option<Phase>) -> bool {
        if !self.phase.set_phase(phase.clone()) {
            return false;
        }
        if self
            .commands
            .send(SinkCommand::PhaseChanged(phase))
            .is_err()
        {
            warn!("Phase change not delivered: session {} is not initialized", self.label);
        }
        true
    }

    /// Queue one frame under the current phase.
    ///
    /// Returns false when no phase is active or the session has ended; the
    /// frame is dropped in both cases.
    pub fn append(&self, payload: impl Into<String>) -> bool {
        let Some(phase) = self.phase.get_phase() else {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        let frame = FrameRecord::new(payload);
        if self
            .commands
            .send(SinkCommand::Append { phase, frame })
            .is_err()
        {
            warn!("Dropping frame: session {} is not initialized", self.label);
            return false;
        }
        true
    }

    /// Request a flush; a no-op while another flush is in flight
    pub fn flush(&self, target: Option<Phase>) {
        if self.commands.send(SinkCommand::Flush { target }).is_err() {
            warn!("Flush skipped: session {} is not initialized", self.label);
        }
    }

    pub async fn stats(&self) -> Result<SessionStats, SessionError> {
        let (reply, response) = oneshot::channel();
        self.request(SinkCommand::Stats(reply))?;
        let mut stats = response.await.map_err(|_| self.stopped())?;
        stats.frames_skipped = self.skipped.load(Ordering::Relaxed);
        Ok(stats)
    }

    /// Wait until the in-flight write (if any) has settled, along with any
    /// size flush it was holding back
    pub async fn settle(&self) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.request(SinkCommand::Settle(reply))?;
        response.await.map_err(|_| self.stopped())
    }

    /// Flush the remainder, wait for every write to settle and stop the worker
    pub async fn end(&self) -> Result<SessionStats, SessionError> {
        let (reply, response) = oneshot::channel();
        self.request(SinkCommand::End(reply))?;
        let mut stats = response.await.map_err(|_| self.stopped())?;
        stats.frames_skipped = self.skipped.load(Ordering::Relaxed);
        Ok(stats)
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    fn request(&self, command: SinkCommand) -> Result<(), SessionError> {
        self.commands.send(command).map_err(|_| self.stopped())
    }

    fn stopped(&self) -> SessionError {
        SessionError::WorkerStopped(self.label.to_string())
    }
}

#[derive(Debug, Default)]
struct Counters {
    frames_appended: u64,
    frames_flushed: u64,
    frames_lost: u64,
    batches_written: u64,
    batches_failed: u64,
}

/// Batch currently being written
#[derive(Debug, Clone)]
struct PendingFlush {
    phase: Phase,
    batch_ms: u64,
    frame_count: usize,
    trigger: FlushTrigger,
}

impl PendingFlush {
    fn into_outcome(self, error: Option<String>) -> FlushOutcome {
        FlushOutcome {
            phase: self.phase,
            batch_ms: self.batch_ms,
            frame_count: self.frame_count,
            trigger: self.trigger,
            error,
        }
    }
}

struct SinkWorker {
    label: Arc<str>,
    layout: SessionLayout,
    store: Arc<dyn TelemetryStore>,
    policy: FlushPolicy,
    buffer: FrameBuffer,
    /// Holds at most one write
    in_flight: JoinSet<FlushOutcome>,
    pending: Option<PendingFlush>,
    loss: LossDetector,
    warnings: broadcast::Sender<LossWarning>,
    last_flushed_phase: Option<Phase>,
    last_batch_ms: u64,
    boundary_flushed_this_tick: bool,
    counters: Counters,
}

impl SinkWorker {
    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<SinkCommand>) {
        if self.policy.flush_interval_ms == 0 {
            warn!("Session {} has a zero flush interval; using 1 ms", self.label);
        }
        let period = self.policy.flush_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        debug!("Session worker {} started", self.label);

        loop {
            tokio::select! {
                biased;

                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    self.complete(joined);
                    self.flush_if_full();
                }

                command = commands.recv() => match command {
                    Some(SinkCommand::End(reply)) => {
                        self.drain().await;
                        let _ = reply.send(self.stats());
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        debug!("All handles for session {} dropped", self.label);
                        self.drain().await;
                        break;
                    }
                },

                _ = ticker.tick() => self.on_tick(),
            }
        }

        info!(
            "Session worker {} stopped: {} frames flushed, {} lost",
            self.label, self.counters.frames_flushed, self.counters.frames_lost
        );
    }

    async fn handle(&mut self, command: SinkCommand) {
        match command {
            SinkCommand::Append { phase, frame } => self.append(phase, frame).await,
            SinkCommand::PhaseChanged(phase) => self.on_phase_change(phase).await,
            SinkCommand::Flush { target } => self.flush_requested(target),
            SinkCommand::Stats(reply) => {
                let _ = reply.send(self.stats());
            }
            SinkCommand::Settle(reply) => {
                self.settle().await;
                let _ = reply.send(());
            }
            // handled by the run loop
            SinkCommand::End(reply) => {
                let _ = reply.send(self.stats());
            }
        }
    }

    async fn append(&mut self, phase: Phase, frame: FrameRecord) {
        if !self.buffer.accepts(&phase) {
            self.flush_boundary().await;
        }

        match self.buffer.push(&phase, frame) {
            Ok(len) => {
                self.counters.frames_appended += 1;
                if len >= self.policy.size_ceiling {
                    debug!(
                        "Size ceiling reached for session {}: {} frames",
                        self.label, len
                    );
                    self.start_flush(FlushTrigger::Size);
                }
            }
            Err(_) => {
                error!(
                    "Frame under phase '{}' refused by session {} buffer",
                    phase, self.label
                );
            }
        }
    }

    fn flush_requested(&mut self, target: Option<Phase>) {
        let Some(buffered) = self.buffer.phase().cloned() else {
            debug!("Flush skipped for session {}: buffer is empty", self.label);
            return;
        };

        let resolved = target.unwrap_or_else(|| buffered.clone());
        if resolved != buffered {
            warn!(
                "Flush skipped for session {}: target phase '{}' does not match buffered phase '{}'",
                self.label, resolved, buffered
            );
            return;
        }

        self.start_flush(FlushTrigger::Manual);
    }

    async fn on_phase_change(&mut self, phase: Option<Phase>) {
        let crossed = self
            .buffer
            .phase()
            .is_some_and(|buffered| Some(buffered) != phase.as_ref());
        if crossed {
            self.flush_boundary().await;
        }
    }

    fn on_tick(&mut self) {
        if std::mem::take(&mut self.boundary_flushed_this_tick) {
            debug!(
                "Timer flush skipped for session {}: boundary flush already ran",
                self.label
            );
            return;
        }

        if self.buffer.len() >= self.policy.min_batch_size {
            self.start_flush(FlushTrigger::Timer);
        }
    }

    /// Write out every buffered frame of the old phase, waiting for any
    /// in-flight write first so the flush cannot be skipped
    async fn flush_boundary(&mut self) {
        while !self.buffer.is_empty() {
            self.wait_in_flight().await;
            self.start_flush(FlushTrigger::Boundary);
        }
        self.boundary_flushed_this_tick = true;
    }

    async fn drain(&mut self) {
        self.wait_in_flight().await;
        while !self.buffer.is_empty() {
            self.start_flush(FlushTrigger::Drain);
            self.wait_in_flight().await;
        }
    }

    async fn wait_in_flight(&mut self) {
        while let Some(joined) = self.in_flight.join_next().await {
            self.complete(joined);
        }
    }

    /// Size trigger re-checked once the in-flight write is done
    fn flush_if_full(&mut self) -> bool {
        self.buffer.len() >= self.policy.size_ceiling && self.start_flush(FlushTrigger::Size)
    }

    /// Wait until no write is in flight and the buffer is below the ceiling
    async fn settle(&mut self) {
        loop {
            self.wait_in_flight().await;
            if !self.flush_if_full() {
                break;
            }
        }
    }

    /// Batch timestamp, strictly greater than the previous one
    fn next_batch_ms(&self) -> u64 {
        let now = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
        now.max(self.last_batch_ms + 1)
    }

    fn start_flush(&mut self, trigger: FlushTrigger) -> bool {
        if !self.in_flight.is_empty() {
            debug!(
                "Flush already in progress for session {}; ignoring {:?} trigger",
                self.label, trigger
            );
            return false;
        }

        let batch_ms = self.next_batch_ms();
        let Some(batch) = self.buffer.take_batch(batch_ms) else {
            return false;
        };
        self.last_batch_ms = batch_ms;

        let pending = PendingFlush {
            phase: batch.phase.clone(),
            batch_ms,
            frame_count: batch.len(),
            trigger,
        };
        let path = self.layout.frames_path(&batch.phase);
        let children = batch.into_children();

        debug!(
            "Flushing {} frames of session {} to '{}' ({:?})",
            pending.frame_count, self.label, path, trigger
        );

        let store = Arc::clone(&self.store);
        let settled = pending.clone();
        self.in_flight.spawn(async move {
            let result = store.patch_children(&path, children).await;
            settled.into_outcome(result.err().map(|e| format!("{:#}", e)))
        });
        self.pending = Some(pending);
        true
    }

    fn complete(&mut self, joined: Result<FlushOutcome, JoinError>) {
        let pending = self.pending.take();
        let outcome = match (joined, pending) {
            (Ok(outcome), _) => outcome,
            (Err(e), Some(pending)) => pending.into_outcome(Some(format!("flush task failed: {}", e))),
            (Err(e), None) => {
                error!("Untracked flush task for session {} failed: {}", self.label, e);
                return;
            }
        };

        match &outcome.error {
            None => {
                self.counters.frames_flushed += outcome.frame_count as u64;
                self.counters.batches_written += 1;
                self.last_flushed_phase = Some(outcome.phase.clone());
                debug!(
                    "Batch {} of session {} stored ({} frames under '{}')",
                    outcome.batch_ms, self.label, outcome.frame_count, outcome.phase
                );
            }
            Some(e) => {
                self.counters.frames_lost += outcome.frame_count as u64;
                self.counters.batches_failed += 1;
                error!(
                    "Batch {} of session {} rejected ({} frames under '{}'): {}",
                    outcome.batch_ms, self.label, outcome.frame_count, outcome.phase, e
                );
            }
        }

        if let Some(warning) = self.loss.observe(
            &self.label,
            outcome.frame_count,
            outcome.is_rejected(),
            Instant::now(),
        ) {
            warn!(
                "Sustained telemetry loss for session {}: {} of the last {} frames were rejected",
                self.label, warning.lost_frames, warning.window_frames
            );
            // No subscribers is fine
            let _ = self.warnings.send(warning);
        }
    }

    fn stats(&self) -> SessionStats {
        SessionStats {
            frames_appended: self.counters.frames_appended,
            frames_flushed: self.counters.frames_flushed,
            frames_lost: self.counters.frames_lost,
            frames_skipped: 0,
            buffered: self.buffer.len(),
            buffered_phase: self.buffer.phase().cloned(),
            last_flushed_phase: self.last_flushed_phase.clone(),
            batches_written: self.counters.batches_written,
            batches_failed: self.counters.batches_failed,
            flushing: !self.in_flight.is_empty(),
        }
    }
}
