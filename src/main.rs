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

use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde_json::json;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use frame_telemetry::config::{load_config_with_env, ConfigLoader};
use frame_telemetry::{
    BackendFactory, DeviceIdentity, Phase, StaticIdentity, TelemetryConfig, TelemetryRecorder,
    UserIdentity,
};

/// Frame Telemetry - buffered motion telemetry recorder
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/default.yaml")]
    config: PathBuf,

    /// Frame rate (overrides config file)
    #[arg(long)]
    frame_rate: Option<u32>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Record a synthetic session into the configured store
    Record {
        #[arg(long, default_value_t = 10)]
        seconds: u64,

        /// Phases to cycle through
        #[arg(long, value_delimiter = ',', default_value = "warmup,pose,rest")]
        phases: Vec<String>,

        /// Seconds spent in each phase
        #[arg(long, default_value_t = 3)]
        phase_seconds: u64,

        #[arg(long, default_value = "demo-user")]
        user: String,

        #[arg(long, default_value = "demo-org")]
        org: String,

        #[arg(long, default_value = "demo-group")]
        group: String,

        /// Recording id (defaults to the current epoch-ms)
        #[arg(long)]
        recording: Option<String>,

        /// Where the device identity is kept between runs
        #[arg(long, default_value = ".frame-telemetry/device.json")]
        identity_file: PathBuf,
    },

    /// Read a subtree back, splitting reads the store refuses as too large
    Fetch {
        path: String,

        /// Split depth (defaults to reader.max_depth)
        #[arg(long)]
        max_depth: Option<usize>,

        /// Write the value here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Check that the configured store is reachable
    Health,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = load_config_with_env(&args.config)?;
    if let Some(frame_rate) = args.frame_rate {
        config.recorder.frame_rate = frame_rate;
    }
    ConfigLoader::validate(&config)?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.logging.level.to_lowercase()));
    let subscriber = FmtSubscriber::builder().with_env_filter(filter).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Loaded configuration from: {:?}", args.config);
    info!("Storage backend: {}", config.storage.backend);

    let store = BackendFactory::create(&config.storage)?;
    store.initialize().await?;
    info!("Storage backend initialized: {}", store.backend_type());

    match args.command {
        Command::Record {
            seconds,
            phases,
            phase_seconds,
            user,
            org,
            group,
            recording,
            identity_file,
        } => {
            let recorder = TelemetryRecorder::from_config(store, &config);
            let device = DeviceIdentity::load_or_create(&identity_file, "frame-telemetry-cli")?;
            let identity = StaticIdentity {
                device,
                user: Some(UserIdentity {
                    user_id: user.clone(),
                    display_name: user,
                    login_time: Utc::now(),
                }),
                org: Some(org),
            };
            let recording = recording.unwrap_or_else(|| Utc::now().timestamp_millis().to_string());

            record(
                &recorder,
                &identity,
                &config,
                &group,
                &recording,
                &phases,
                Duration::from_secs(seconds),
                Duration::from_secs(phase_seconds.max(1)),
            )
            .await?;
        }

        Command::Fetch {
            path,
            max_depth,
            output,
        } => {
            let recorder = TelemetryRecorder::from_config(store, &config);
            let reader = recorder.reader();
            let outcome = reader
                .fetch(&path, max_depth.unwrap_or(config.reader.max_depth))
                .await
                .with_context(|| format!("Failed to fetch '{}'", path))?;

            info!(
                "Fetched '{}': ~{} bytes, {} children, {} split reads, {} skipped",
                path,
                outcome.diagnostics.approx_bytes,
                outcome.diagnostics.child_count,
                outcome.diagnostics.split_reads,
                outcome.diagnostics.skipped_children.len()
            );

            let value = outcome.value.unwrap_or(serde_json::Value::Null);
            let rendered = serde_json::to_string_pretty(&value)?;
            match output {
                Some(file) => {
                    std::fs::write(&file, rendered)
                        .with_context(|| format!("Failed to write {}", file.display()))?;
                    info!("Wrote '{}' to {}", path, file.display());
                }
                None => println!("{}", rendered),
            }
        }

        Command::Health => {
            let healthy = store.health_check().await?;
            println!("{}: {}", store.backend_type(), if healthy { "healthy" } else { "unhealthy" });
            if !healthy {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn record(
    recorder: &TelemetryRecorder,
    identity: &StaticIdentity,
    config: &TelemetryConfig,
    group: &str,
    recording: &str,
    phases: &[String],
    duration: Duration,
    phase_duration: Duration,
) -> Result<()> {
    let frame_rate = config.recorder.frame_rate;
    let key = recorder
        .open_session(identity, group, recording, frame_rate)
        .await?;

    let mut warnings = recorder.subscribe_warnings();
    tokio::spawn(async move {
        while let Ok(warning) = warnings.recv().await {
            warn!(
                "Loss warning for {}: {}/{} frames rejected",
                warning.session, warning.lost_frames, warning.window_frames
            );
        }
    });

    let mut frame = 0u64;
    recorder
        .start_sampler(&key, move || {
            frame += 1;
            let t = frame as f64 / f64::from(frame_rate);
            let pose = json!({
                "frame": frame,
                "landmarks": [
                    { "x": t.sin(), "y": t.cos(), "z": 0.0, "visibility": 0.98 },
                    { "x": (t * 0.5).sin(), "y": (t * 0.5).cos(), "z": 0.1, "visibility": 0.95 },
                ],
            });
            Some(pose.to_string())
        })
        .await?;

    let started = tokio::time::Instant::now();
    let mut phase_index = 0usize;
    loop {
        if !phases.is_empty() {
            let phase = Phase::new(phases[phase_index % phases.len()].clone());
            info!("Entering phase '{}'", phase);
            recorder.set_phase(&key, Some(phase));
            phase_index += 1;
        }

        let elapsed = started.elapsed();
        if elapsed >= duration {
            break;
        }
        tokio::select! {
            _ = tokio::time::sleep(phase_duration.min(duration - elapsed)) => {}
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, ending session");
                break;
            }
        }
        if started.elapsed() >= duration {
            break;
        }
    }

    let layout = recorder.layout(&key);
    let stats = recorder.end_session(&key).await?;
    if let Some(layout) = layout {
        info!("Session stored under '{}'", layout.metadata_path());
    }
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}
