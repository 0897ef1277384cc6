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

// Buffered per-frame telemetry recorder
//
// Captures motion-tracking frames during an interactive session and ships
// them to a hierarchical JSON store:
// - Buffers frames per session and phase without blocking the sampling loop
// - Flushes on size, on a timer and at phase boundaries
// - Warns when recent writes imply sustained data loss
// - Reads large subtrees back by splitting them into child reads

pub mod buffer;
pub mod config;
pub mod error;
pub mod identity;
pub mod layout;
pub mod loss;
pub mod phase;
pub mod protocol;
pub mod reader;
pub mod recorder;
pub mod registry;
pub mod sampler;
pub mod sink;
pub mod storage;

// Re-export main types
pub use buffer::{FrameBatch, FrameBuffer, MAX_BATCH_FRAMES};
pub use config::{load_config, load_config_with_env, TelemetryConfig};
pub use error::SessionError;
pub use identity::{DeviceIdentity, IdentityProvider, StaticIdentity, UserIdentity};
pub use layout::{sanitize_segment, SessionLayout};
pub use loss::LossDetector;
pub use phase::PhaseTracker;
pub use protocol::{
    BatchKey, FlushOutcome, FlushTrigger, FrameRecord, LossWarning, Phase, SessionKey,
    SessionMetadata, SessionScope, SessionStats,
};
pub use reader::{FetchDiagnostics, FetchOutcome, RecursiveReader, DEFAULT_MAX_DEPTH, MAX_SPLIT_DEPTH};
pub use recorder::TelemetryRecorder;
pub use registry::{SessionEntry, SessionRegistry};
pub use sampler::{FrameSampler, FrameSource};
pub use sink::SessionSink;
pub use storage::{BackendFactory, ReadError, TelemetryStore};
