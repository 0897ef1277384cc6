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

/// Session lifecycle, buffering and flush trigger tests
///
mod common;

use common::*;
use frame_telemetry::{BatchKey, Phase, SessionError, SessionStats, TelemetryStore};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn assert_accounted(stats: &SessionStats) {
    assert_eq!(
        stats.frames_flushed + stats.buffered as u64 + stats.frames_lost,
        stats.frames_appended,
        "frames unaccounted for: {:?}",
        stats
    );
}

#[tokio::test]
async fn test_initialize_is_idempotent() {
    let store = ScriptedStore::new();
    let recorder = recorder(store.clone(), quiet_settings(30));
    let key = session_key("rec-1");

    let mut created = Vec::new();
    for _ in 0..3 {
        created.push(
            recorder
                .initialize_session(key.clone(), session_metadata(30), session_scope())
                .await
                .unwrap(),
        );
    }

    assert_eq!(created, vec![true, false, false]);
    assert_eq!(store.metadata_writes(), 1);
    assert!(recorder.is_initialized(&key));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_initialize_writes_metadata_once() {
    let store = ScriptedStore::new();
    let recorder = Arc::new(recorder(store.clone(), quiet_settings(30)));
    let key = session_key("rec-1");

    let mut handles = Vec::new();
    for _ in 0..8 {
        let recorder = recorder.clone();
        let key = key.clone();
        handles.push(tokio::spawn(async move {
            recorder
                .initialize_session(key, session_metadata(30), session_scope())
                .await
                .unwrap()
        }));
    }

    let mut created = 0;
    for handle in handles {
        if handle.await.unwrap() {
            created += 1;
        }
    }

    assert_eq!(created, 1);
    assert_eq!(store.metadata_writes(), 1);
}

#[tokio::test]
async fn test_failed_initialize_can_be_retried() {
    let store = ScriptedStore::new();
    store.fail_metadata_writes(1);
    let recorder = recorder(store.clone(), quiet_settings(30));
    let key = session_key("rec-1");

    let first = recorder
        .initialize_session(key.clone(), session_metadata(30), session_scope())
        .await;
    assert!(first.is_err());
    assert!(!recorder.is_initialized(&key));

    let second = recorder
        .initialize_session(key.clone(), session_metadata(30), session_scope())
        .await
        .unwrap();
    assert!(second);
    assert!(recorder.is_initialized(&key));
}

#[tokio::test]
async fn test_metadata_lands_under_session_prefix() {
    let store = ScriptedStore::new();
    let recorder = recorder(store.clone(), quiet_settings(30));
    let key = start_session(&recorder, "rec-1").await;

    let layout = recorder.layout(&key).unwrap();
    assert_eq!(
        layout.metadata_path(),
        "telemetry/org-1/group-1/2023-11-14/Ada/Lab_iPad/1700000000000/rec-1"
    );

    let snapshot = store.snapshot().await;
    let session = &snapshot["telemetry"]["org-1"]["group-1"]["2023-11-14"]["Ada"]["Lab_iPad"]
        ["1700000000000"]["rec-1"];
    assert_eq!(session["user_name"], "Ada");
    assert_eq!(session["frame_rate"], 30);
}

#[tokio::test]
async fn test_flushed_plus_buffered_equals_appended() {
    let store = ScriptedStore::new();
    let recorder = recorder(store.clone(), quiet_settings(4));
    let key = start_session(&recorder, "rec-1").await;

    recorder.set_phase(&key, Some(Phase::new("A")));
    for i in 0..10 {
        assert!(recorder.append(&key, format!("{{\"frame\":{}}}", i)));
    }
    recorder.settle(&key).await.unwrap();

    let stats = recorder.stats(&key).await.unwrap();
    assert_eq!(stats.frames_appended, 10);
    assert_eq!(stats.frames_lost, 0);
    assert!(stats.frames_flushed >= 4);
    assert_accounted(&stats);

    let stored: usize = store.frame_batches().iter().map(|b| b.keys.len()).sum();
    assert_eq!(stored as u64, stats.frames_flushed);
}

#[tokio::test]
async fn test_failed_flushes_are_counted_as_lost() {
    let store = ScriptedStore::new();
    store.fail_frame_writes(true);
    let recorder = recorder(store.clone(), quiet_settings(3));
    let key = start_session(&recorder, "rec-1").await;

    recorder.set_phase(&key, Some(Phase::new("A")));
    for i in 0..7 {
        recorder.append(&key, i.to_string());
    }
    recorder.settle(&key).await.unwrap();

    let stats = recorder.stats(&key).await.unwrap();
    assert_eq!(stats.frames_flushed, 0);
    assert!(stats.frames_lost >= 3);
    assert!(stats.batches_failed >= 1);
    assert_eq!(stats.last_flushed_phase, None);
    assert_accounted(&stats);

    store.fail_frame_writes(false);
    let ended = recorder.end_session(&key).await.unwrap();
    assert_eq!(ended.buffered, 0);
    assert_eq!(ended.frames_flushed + ended.frames_lost, 7);
}

#[tokio::test]
async fn test_batch_keys_strictly_increase_across_flushes() {
    let store = ScriptedStore::new();
    let recorder = recorder(store.clone(), quiet_settings(100));
    let key = start_session(&recorder, "rec-1").await;
    recorder.set_phase(&key, Some(Phase::new("A")));

    for round in 0..3 {
        recorder.append(&key, format!("{}a", round));
        recorder.append(&key, format!("{}b", round));
        recorder.flush(&key, None);
        recorder.settle(&key).await.unwrap();
    }

    let batches = store.frame_batches();
    assert_eq!(batches.len(), 3);

    let keys: Vec<String> = batches.iter().flat_map(|b| b.keys.clone()).collect();
    assert_eq!(keys.len(), 6);
    for pair in keys.windows(2) {
        assert!(pair[0] < pair[1], "{} !< {}", pair[0], pair[1]);
    }

    let stamps: Vec<u64> = batches
        .iter()
        .map(|b| BatchKey::parse(&b.keys[0]).unwrap().batch_ms)
        .collect();
    assert!(stamps[0] < stamps[1] && stamps[1] < stamps[2]);
}

#[tokio::test]
async fn test_phase_change_flushes_old_phase_first() {
    let store = ScriptedStore::new();
    let recorder = recorder(store.clone(), quiet_settings(100));
    let key = start_session(&recorder, "rec-1").await;

    recorder.set_phase(&key, Some(Phase::new("A")));
    for i in 0..3 {
        recorder.append(&key, format!("a{}", i));
    }
    recorder.set_phase(&key, Some(Phase::new("B")));
    for i in 0..2 {
        recorder.append(&key, format!("b{}", i));
    }
    recorder.settle(&key).await.unwrap();

    let batches = store.frame_batches();
    assert_eq!(batches.len(), 1);
    assert!(batches[0].path.ends_with("/frames/A"));
    assert_eq!(batches[0].keys.len(), 3);

    let stats = recorder.stats(&key).await.unwrap();
    assert_eq!(stats.buffered, 2);
    assert_eq!(stats.buffered_phase, Some(Phase::new("B")));
    assert_eq!(stats.last_flushed_phase, Some(Phase::new("A")));
}

#[tokio::test]
async fn test_boundary_flush_waits_for_in_flight_write() {
    let store = ScriptedStore::new();
    store.close_gate();
    let recorder = recorder(store.clone(), quiet_settings(100));
    let key = start_session(&recorder, "rec-1").await;

    recorder.set_phase(&key, Some(Phase::new("A")));
    for i in 0..3 {
        recorder.append(&key, format!("a{}", i));
    }
    recorder.flush(&key, None);
    for i in 3..5 {
        recorder.append(&key, format!("a{}", i));
    }
    recorder.set_phase(&key, Some(Phase::new("B")));
    recorder.append(&key, "b0");

    store.release(2);
    recorder.settle(&key).await.unwrap();

    let batches = store.frame_batches();
    assert_eq!(batches.len(), 2);
    assert!(batches.iter().all(|b| b.path.ends_with("/frames/A")));
    assert_eq!(batches[0].keys.len(), 3);
    assert_eq!(batches[1].keys.len(), 2);

    let stats = recorder.stats(&key).await.unwrap();
    assert_eq!(stats.buffered, 1);
    assert_eq!(stats.buffered_phase, Some(Phase::new("B")));
    assert_accounted(&stats);
}

#[tokio::test]
async fn test_flush_while_flushing_is_a_no_op() {
    let store = ScriptedStore::new();
    store.close_gate();
    let recorder = recorder(store.clone(), quiet_settings(100));
    let key = start_session(&recorder, "rec-1").await;

    recorder.set_phase(&key, Some(Phase::new("A")));
    for i in 0..3 {
        recorder.append(&key, i.to_string());
    }
    recorder.flush(&key, None);
    recorder.append(&key, "3");
    recorder.append(&key, "4");
    recorder.flush(&key, None);

    let stats = recorder.stats(&key).await.unwrap();
    assert!(stats.flushing);
    assert_eq!(stats.buffered, 2);

    store.release(1);
    recorder.settle(&key).await.unwrap();

    let stats = recorder.stats(&key).await.unwrap();
    assert!(!stats.flushing);
    assert_eq!(stats.batches_written, 1);
    assert_eq!(stats.frames_flushed, 3);
    assert_eq!(stats.buffered, 2);
    assert_eq!(store.frame_batches().len(), 1);
}

#[tokio::test]
async fn test_size_ceiling_rechecked_when_write_settles() {
    let store = ScriptedStore::new();
    store.close_gate();
    let recorder = recorder(store.clone(), quiet_settings(3));
    let key = start_session(&recorder, "rec-1").await;

    recorder.set_phase(&key, Some(Phase::new("A")));
    for i in 0..6 {
        recorder.append(&key, i.to_string());
    }

    // second full batch waits behind the gated write
    let stats = recorder.stats(&key).await.unwrap();
    assert!(stats.flushing);
    assert_eq!(stats.buffered, 3);

    store.release(2);
    recorder.settle(&key).await.unwrap();

    let stats = recorder.stats(&key).await.unwrap();
    assert_eq!(stats.batches_written, 2);
    assert_eq!(stats.frames_flushed, 6);
    assert_eq!(stats.buffered, 0);
    assert!(!stats.flushing);
    assert_accounted(&stats);

    let batches = store.frame_batches();
    assert_eq!(batches.len(), 2);
    assert!(batches.iter().all(|b| b.keys.len() == 3));
}

#[tokio::test]
async fn test_flush_refuses_mismatched_target_phase() {
    let store = ScriptedStore::new();
    let recorder = recorder(store.clone(), quiet_settings(100));
    let key = start_session(&recorder, "rec-1").await;

    recorder.set_phase(&key, Some(Phase::new("A")));
    recorder.append(&key, "0");
    recorder.append(&key, "1");
    recorder.flush(&key, Some(Phase::new("B")));
    recorder.settle(&key).await.unwrap();

    assert!(store.frame_batches().is_empty());
    assert_eq!(recorder.stats(&key).await.unwrap().buffered, 2);

    recorder.flush(&key, Some(Phase::new("A")));
    recorder.settle(&key).await.unwrap();
    assert_eq!(store.frame_batches().len(), 1);
}

#[tokio::test]
async fn test_frames_without_phase_are_skipped() {
    let store = ScriptedStore::new();
    let recorder = recorder(store.clone(), quiet_settings(100));
    let key = start_session(&recorder, "rec-1").await;

    assert!(!recorder.append(&key, "early"));
    recorder.set_phase(&key, Some(Phase::new("A")));
    assert!(recorder.append(&key, "0"));
    recorder.set_phase(&key, None);
    assert!(!recorder.append(&key, "late"));
    recorder.settle(&key).await.unwrap();

    let stats = recorder.stats(&key).await.unwrap();
    assert_eq!(stats.frames_appended, 1);
    assert_eq!(stats.frames_skipped, 2);
    // leaving the phase is a boundary too
    assert_eq!(stats.frames_flushed, 1);
    assert_eq!(stats.buffered, 0);
}

#[tokio::test]
async fn test_calls_on_unknown_session_degrade_to_warnings() {
    let store = ScriptedStore::new();
    let recorder = recorder(store.clone(), quiet_settings(100));
    let key = session_key("never-initialized");

    assert!(!recorder.append(&key, "frame"));
    assert!(!recorder.set_phase(&key, Some(Phase::new("A"))));
    recorder.flush(&key, None);
    assert_eq!(recorder.phase(&key), None);

    assert!(matches!(
        recorder.stats(&key).await,
        Err(SessionError::NotInitialized(_))
    ));
    assert!(matches!(
        recorder.end_session(&key).await,
        Err(SessionError::NotInitialized(_))
    ));
    assert!(store.patches().is_empty());
}

#[tokio::test]
async fn test_end_session_drains_and_forgets() {
    let store = ScriptedStore::new();
    let recorder = recorder(store.clone(), quiet_settings(100));
    let key = start_session(&recorder, "rec-1").await;

    recorder.set_phase(&key, Some(Phase::new("A")));
    for i in 0..3 {
        recorder.append(&key, i.to_string());
    }

    let stats = recorder.end_session(&key).await.unwrap();
    assert_eq!(stats.buffered, 0);
    assert_eq!(stats.frames_flushed, 3);
    assert!(!recorder.is_initialized(&key));
    assert!(recorder.sessions().is_empty());

    let created = recorder
        .initialize_session(key.clone(), session_metadata(30), session_scope())
        .await
        .unwrap();
    assert!(created);
    assert_eq!(store.metadata_writes(), 2);

    // the second metadata write must not clobber stored frames
    let layout = recorder.layout(&key).unwrap();
    let stored = store
        .read(&layout.frames_path(&Phase::new("A")))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.as_object().unwrap().len(), 3);
}

#[tokio::test]
async fn test_end_session_waits_for_gated_write() {
    let store = ScriptedStore::new();
    store.close_gate();
    let recorder = Arc::new(recorder(store.clone(), quiet_settings(100)));
    let key = start_session(&recorder, "rec-1").await;

    recorder.set_phase(&key, Some(Phase::new("A")));
    recorder.append(&key, "0");
    recorder.flush(&key, None);
    recorder.append(&key, "1");

    let ending = {
        let recorder = recorder.clone();
        let key = key.clone();
        tokio::spawn(async move { recorder.end_session(&key).await })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!ending.is_finished());

    store.open_gate();
    let stats = ending.await.unwrap().unwrap();
    assert_eq!(stats.frames_flushed, 2);
    assert_eq!(stats.batches_written, 2);
    assert_eq!(stats.buffered, 0);
}

#[tokio::test(start_paused = true)]
async fn test_timer_flushes_only_min_batch() {
    let store = ScriptedStore::new();
    let mut settings = quiet_settings(100);
    settings.flush_policy.flush_interval_ms = 1000;
    settings.flush_policy.min_batch_size = 5;
    let recorder = recorder(store.clone(), settings);
    let key = start_session(&recorder, "rec-1").await;

    recorder.set_phase(&key, Some(Phase::new("A")));
    for i in 0..4 {
        recorder.append(&key, i.to_string());
    }
    recorder.settle(&key).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1100)).await;
    recorder.settle(&key).await.unwrap();
    assert!(store.frame_batches().is_empty());

    recorder.append(&key, "4");
    recorder.settle(&key).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1000)).await;
    recorder.settle(&key).await.unwrap();

    let batches = store.frame_batches();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0].keys.len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_boundary_flush_suppresses_next_timer_flush() {
    let store = ScriptedStore::new();
    let mut settings = quiet_settings(100);
    settings.flush_policy.flush_interval_ms = 1000;
    settings.flush_policy.min_batch_size = 1;
    let recorder = recorder(store.clone(), settings);
    let key = start_session(&recorder, "rec-1").await;

    recorder.set_phase(&key, Some(Phase::new("A")));
    recorder.append(&key, "a0");
    recorder.set_phase(&key, Some(Phase::new("B")));
    recorder.append(&key, "b0");
    recorder.settle(&key).await.unwrap();
    assert_eq!(store.frame_batches().len(), 1);

    // first tick is consumed by the boundary flush
    tokio::time::sleep(Duration::from_millis(1100)).await;
    recorder.settle(&key).await.unwrap();
    assert_eq!(store.frame_batches().len(), 1);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    recorder.settle(&key).await.unwrap();
    let batches = store.frame_batches();
    assert_eq!(batches.len(), 2);
    assert!(batches[1].path.ends_with("/frames/B"));
}

#[tokio::test(start_paused = true)]
async fn test_sampler_feeds_session_until_end() {
    let store = ScriptedStore::new();
    let recorder = recorder(store.clone(), quiet_settings(10));
    let key = start_session(&recorder, "rec-1").await;
    recorder.set_phase(&key, Some(Phase::new("A")));

    let produced = Arc::new(AtomicUsize::new(0));
    let counter = produced.clone();
    recorder
        .start_sampler(&key, move || {
            let n = counter.fetch_add(1, Ordering::SeqCst);
            Some(format!("{{\"frame\":{}}}", n))
        })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(1)).await;
    let stats = recorder.end_session(&key).await.unwrap();

    assert!(
        (25..=35).contains(&stats.frames_appended),
        "appended {}",
        stats.frames_appended
    );
    assert_eq!(stats.buffered, 0);
    assert_eq!(stats.frames_flushed, stats.frames_appended);

    let after_end = produced.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(produced.load(Ordering::SeqCst), after_end);
}

#[tokio::test(start_paused = true)]
async fn test_sampler_survives_frame_rate_above_1000() {
    let store = ScriptedStore::new();
    let recorder = recorder(store.clone(), quiet_settings(50));
    let key = session_key("rec-fast");
    recorder
        .initialize_session(key.clone(), session_metadata(2000), session_scope())
        .await
        .unwrap();
    recorder.set_phase(&key, Some(Phase::new("A")));

    recorder
        .start_sampler(&key, || Some("{}".to_string()))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(200)).await;
    let stats = recorder.end_session(&key).await.unwrap();

    assert!(stats.frames_appended >= 100, "appended {}", stats.frames_appended);
    assert_eq!(stats.frames_flushed, stats.frames_appended);
}
