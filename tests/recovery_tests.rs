//! Shard recovery tests against in-memory sources and stores.

#[allow(dead_code)]
mod common;

use common::*;
use meridian::actions::allocation::reroute;
use meridian::actions::indices::create_index;
use meridian::actions::shard_state::fail_shard;
use meridian::actions::CreateIndexRequest;
use meridian::recovery::{checksum, recovery_source, RecoveryOutcome, RecoveryPhase};
use meridian::state::ClusterState;
use std::sync::atomic::Ordering;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_replica_recovery_copies_files_and_operations() {
    let harness = RecoveryHarness::new(recovery_config());
    seed_shard(&harness.source_store, &shard(0), 4, 12, 7);

    let handle = harness.start();
    let outcome = within(WAIT, handle.wait()).await;

    let response = match outcome {
        RecoveryOutcome::Done(response) => response,
        other => panic!("expected done, got {:?}", other),
    };
    assert_eq!(response.phase1_file_names.len(), 4);
    assert_eq!(response.phase2_operations, 12);
    let expected_bytes: u64 = harness
        .source_store
        .files(&shard(0))
        .unwrap()
        .iter()
        .map(|f| f.length)
        .sum();
    assert_eq!(response.phase1_total_bytes, expected_bytes);

    for file in harness.source_store.files(&shard(0)).unwrap() {
        let copied = harness.target.file(&shard(0), &file.name).expect("file copied");
        assert_eq!(checksum(&copied), file.checksum);
    }
    assert_eq!(harness.target.operations(&shard(0)).len(), 12);
    assert!(harness.target.is_active(&shard(0)));
    assert_eq!(harness.target.open_handles(), 0);

    assert_eq!(handle.phase(), RecoveryPhase::Done);
    assert_eq!(harness.reporter.started_count(), 1);
    assert_eq!(harness.reporter.failed_count(), 0);
    assert!(harness.coordinator.sessions().is_empty());

    let trace = response.trace_summary.expect("trace");
    assert!(trace.contains("phase1: copied 4 files"));
    assert!(trace.contains("phase2: replayed 12 operations"));
}

#[tokio::test]
async fn test_start_twice_returns_running_session() {
    let harness = RecoveryHarness::new(recovery_config());
    seed_shard(&harness.source_store, &shard(0), 1, 0, 1);
    harness.source.stall_after_first_chunk();
    harness.source_store.put_file(&shard(0), "_big.seg", vec![7u8; 256]);

    let first = harness.start();
    let second = harness.start();
    assert_eq!(first.recovery_id(), second.recovery_id());
    assert_eq!(harness.coordinator.sessions().len(), 1);

    first.cancel();
    assert!(matches!(within(WAIT, second.wait()).await, RecoveryOutcome::Cancelled));
}

#[tokio::test]
async fn test_transient_source_failure_is_retried() {
    let harness = RecoveryHarness::new(recovery_config());
    seed_shard(&harness.source_store, &shard(0), 2, 3, 11);
    harness.source.fail_starts(1);

    let handle = harness.start();
    let outcome = within(WAIT, handle.wait()).await;

    assert!(matches!(outcome, RecoveryOutcome::Done(_)));
    assert_eq!(harness.source.start_calls.load(Ordering::SeqCst), 2);
    let trace = handle.trace_summary();
    assert!(trace.contains("file_copy attempt 1/3 failed"));
    assert_eq!(harness.reporter.started_count(), 1);
}

#[tokio::test]
async fn test_unreachable_source_fails_after_max_retries() {
    let harness = RecoveryHarness::new(recovery_config());
    seed_shard(&harness.source_store, &shard(0), 2, 3, 3);
    harness.source.fail_starts(u32::MAX);

    let handle = harness.start();
    let outcome = within(WAIT, handle.wait()).await;

    match outcome {
        RecoveryOutcome::Failed { reason } => assert!(reason.contains("Node disconnected")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(harness.source.start_calls.load(Ordering::SeqCst), 3);

    let session = handle.session();
    assert_eq!(session.phase(), RecoveryPhase::Failed);
    assert_eq!(session.trace().line_count(), 3);
    for attempt in 1..=3 {
        assert!(session
            .trace()
            .as_str()
            .contains(&format!("file_copy attempt {}/3 failed", attempt)));
    }

    assert_eq!(harness.reporter.failed_count(), 1);
    assert_eq!(harness.reporter.started_count(), 0);
    let (routing, _) = harness.reporter.failed.lock()[0].clone();
    assert_eq!(routing.allocation_id, harness.replica().allocation_id);
    assert_eq!(harness.target.open_handles(), 0);
}

#[tokio::test]
async fn test_cancel_during_file_copy_releases_handles() {
    let harness = RecoveryHarness::new(recovery_config());
    harness.source_store.put_file(&shard(0), "_0.seg", vec![1u8; 200]);
    harness.source.stall_after_first_chunk();

    let handle = harness.start();
    within(WAIT, harness.source.stalled.notified()).await;
    assert_eq!(handle.phase(), RecoveryPhase::FileCopy);
    assert_eq!(harness.target.open_handles_for(&shard(0)), 1);

    handle.cancel();
    let outcome = within(WAIT, handle.wait()).await;

    assert!(matches!(outcome, RecoveryOutcome::Cancelled));
    let session = handle.session();
    assert_eq!(session.phase(), RecoveryPhase::Failed);
    assert_eq!(session.failure(), Some("cancelled"));
    assert_eq!(harness.target.open_handles(), 0);
    assert_eq!(harness.reporter.failed_count(), 0);
    assert_eq!(harness.reporter.started_count(), 0);
    assert!(harness.coordinator.sessions().is_empty());

    // A second cancel is a no-op.
    handle.cancel();
    assert!(matches!(handle.wait().await, RecoveryOutcome::Cancelled));
}

#[tokio::test]
async fn test_mapping_update_retried_until_visible() {
    let harness = RecoveryHarness::with_mapping(recovery_config(), ScriptedMapping::not_visible_for(1));
    harness
        .source_store
        .index_document(&shard(0), "doc-1", fields(&[("message", "text"), ("user", "keyword")]));

    let handle = harness.start();
    let outcome = within(WAIT, handle.wait()).await;

    assert!(matches!(outcome, RecoveryOutcome::Done(_)));
    let updates = harness.mapping.updates.lock().clone();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].fields, fields(&[("user", "keyword")]));
    assert_eq!(harness.mapping.verifications.load(Ordering::SeqCst), 2);

    let trace = handle.trace_summary();
    assert!(trace.contains("mapping update attempt 1/3"));
    assert!(trace.contains("mapping update with 1 fields acknowledged"));
}

#[tokio::test]
async fn test_mapping_never_visible_fails_recovery() {
    let harness = RecoveryHarness::with_mapping(recovery_config(), ScriptedMapping::not_visible_for(u32::MAX));
    harness
        .source_store
        .index_document(&shard(0), "doc-1", fields(&[("user", "keyword")]));

    let handle = harness.start();
    let outcome = within(WAIT, handle.wait()).await;

    match outcome {
        RecoveryOutcome::Failed { reason } => assert!(reason.contains("Retry on primary")),
        other => panic!("expected failure, got {:?}", other),
    }
    // Three phase attempts, each with three mapping attempts.
    assert_eq!(harness.mapping.verifications.load(Ordering::SeqCst), 9);
    assert!(handle.trace_summary().contains("translog_replay attempt 3/3 failed"));
    assert!(harness.target.operations(&shard(0)).is_empty());
    assert_eq!(harness.reporter.failed_count(), 1);
}

#[tokio::test]
async fn test_known_fields_skip_mapping_update() {
    let harness = RecoveryHarness::new(recovery_config());
    seed_shard(&harness.source_store, &shard(0), 0, 5, 5);

    let handle = harness.start();
    assert!(matches!(within(WAIT, handle.wait()).await, RecoveryOutcome::Done(_)));
    assert!(harness.mapping.updates.lock().is_empty());
}

#[tokio::test]
async fn test_primary_recovers_from_empty_store() {
    let harness = RecoveryHarness::new(recovery_config());
    let request = CreateIndexRequest::new("metrics", 1, 0);
    let state = reroute(&create_index(&cluster_state(&["b"]), &request, 0).unwrap()).unwrap();
    let primary = initializing_copy(&state, &meridian::ShardId::new("metrics", 0), "b");
    assert!(recovery_source(&state, &primary).unwrap().is_none());

    let handle = harness.coordinator.start_recovery(primary, None).unwrap();
    let outcome = within(WAIT, handle.wait()).await;

    let response = match outcome {
        RecoveryOutcome::Done(response) => response,
        other => panic!("expected done, got {:?}", other),
    };
    assert!(response.phase1_file_names.is_empty());
    assert_eq!(response.phase2_operations, 0);
    assert!(harness.target.is_active(&meridian::ShardId::new("metrics", 0)));
    assert!(handle.trace_summary().contains("recovered from empty store"));
    assert_eq!(harness.source.start_calls.load(Ordering::SeqCst), 0);
    assert_eq!(harness.reporter.started_count(), 1);
}

#[tokio::test]
async fn test_copy_not_assigned_locally_is_rejected() {
    let harness = RecoveryHarness::new(recovery_config());
    let primary = harness
        .state
        .routing_table
        .primary(&shard(0))
        .cloned()
        .unwrap();
    assert!(harness.coordinator.start_recovery(primary, None).is_err());
}

#[tokio::test]
async fn test_cluster_state_starts_and_cancels_recovery() {
    let harness = RecoveryHarness::new(recovery_config());
    harness.source_store.put_file(&shard(0), "_0.seg", vec![3u8; 200]);
    harness.source.stall_after_first_chunk();

    let empty = ClusterState::empty("test-cluster");
    harness.coordinator.apply_cluster_state(&empty, &harness.state);
    let replica = harness.replica();
    let allocation_id = replica.allocation_id.unwrap();
    let handle = harness
        .coordinator
        .session(&shard(0), allocation_id)
        .expect("recovery started");
    within(WAIT, harness.source.stalled.notified()).await;

    let mut failed = fail_shard(&harness.state, &shard(0), allocation_id, "reassigned", 10).unwrap();
    failed.version = harness.state.version + 1;
    harness.coordinator.apply_cluster_state(&harness.state, &failed);

    assert!(matches!(within(WAIT, handle.wait()).await, RecoveryOutcome::Cancelled));
    assert!(harness.coordinator.session(&shard(0), allocation_id).is_none());
    assert_eq!(harness.target.open_handles(), 0);
    assert_eq!(harness.reporter.failed_count(), 0);
}

#[tokio::test]
async fn test_concurrent_recoveries_are_bounded() {
    let mut config = recovery_config();
    config.max_concurrent_recoveries = 1;
    let harness = RecoveryHarness::new(config);
    harness.source_store.put_file(&shard(0), "_0.seg", vec![9u8; 200]);
    harness.source.stall_after_first_chunk();

    let stalled = harness.start();
    within(WAIT, harness.source.stalled.notified()).await;

    let request = CreateIndexRequest::new("metrics", 1, 0);
    let state = reroute(&create_index(&cluster_state(&["b"]), &request, 0).unwrap()).unwrap();
    let primary = initializing_copy(&state, &meridian::ShardId::new("metrics", 0), "b");
    let waiting = harness.coordinator.start_recovery(primary, None).unwrap();

    // The second recovery waits for the permit held by the stalled one.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(waiting.phase(), RecoveryPhase::Init);

    stalled.cancel();
    assert!(matches!(within(WAIT, waiting.wait()).await, RecoveryOutcome::Done(_)));
}

#[tokio::test]
async fn test_started_report_retried_after_publication_failure() {
    let harness = RecoveryHarness::new(recovery_config());
    seed_shard(&harness.source_store, &shard(0), 1, 2, 2);
    harness.reporter.reject_reports(1);

    let handle = harness.start();
    assert!(matches!(within(WAIT, handle.wait()).await, RecoveryOutcome::Done(_)));

    assert_eq!(harness.reporter.calls.load(Ordering::SeqCst), 2);
    assert_eq!(harness.reporter.started_count(), 1);
    assert_eq!(harness.reporter.started.lock()[0].allocation_id, harness.replica().allocation_id);
}

#[tokio::test]
async fn test_failed_report_retried_after_publication_failure() {
    let harness = RecoveryHarness::new(recovery_config());
    seed_shard(&harness.source_store, &shard(0), 1, 0, 1);
    harness.source.fail_starts(u32::MAX);
    harness.reporter.reject_reports(2);

    let handle = harness.start();
    assert!(matches!(within(WAIT, handle.wait()).await, RecoveryOutcome::Failed { .. }));

    assert_eq!(harness.reporter.calls.load(Ordering::SeqCst), 3);
    assert_eq!(harness.reporter.failed_count(), 1);
    assert_eq!(harness.reporter.started_count(), 0);
}
