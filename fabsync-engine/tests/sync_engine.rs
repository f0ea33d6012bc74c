//! End-to-end tests of the sync engine against the fake cluster.
//!
//! Every attempt goes through the scheduler, the reconciler, the audit trail
//! and the circuit breaker exactly like in the daemon.

mod common;

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use common::{ENDPOINT, TestEngine};
use fabsync_engine::store::{FabricStore, UpdateFabricConfigRequest};
use fabsync_engine::{
    ActionStatus, AttemptOutcome, ClusterCredentials, CircuitState, EngineConfig, EngineError, ErrorClass,
    FakeConnector, ManualClock, RedbAuditTrail, RedbStore, RejectReason, ResourceDiff,
    ResourceKey, ResourceKind, ResourceSpec, SyncEngine, SyncState, Trigger, TriggerResult,
};

// =============================================================================
// Reconciliation
// =============================================================================

#[tokio::test]
async fn test_unmarked_resource_conflict_is_partial() {
    let t = TestEngine::new();
    t.add_fabric("fab-1", ENDPOINT).await;
    t.synced_ago("fab-1", 6).await;

    let cluster = t.cluster(ENDPOINT);
    let key = ResourceKey::new(ResourceKind::Vpc, "vpc-1");
    cluster.insert(ResourceSpec::new(key.clone(), json!({"vlan": 7})));
    t.desire("fab-1", ResourceKind::Vpc, "vpc-1", json!({"vlan": 10}))
        .await;

    let status = t.engine.get_state("fab-1").await.unwrap();
    assert_eq!(status.state, SyncState::OutOfSync);

    let report = t.engine.scheduler().tick().await.unwrap();
    assert_eq!(report.dispatched, 1);
    t.engine.wait_idle().await;

    let attempt = t.last_attempt("fab-1").await;
    assert_eq!(attempt.outcome, AttemptOutcome::Partial);
    assert_eq!(attempt.trigger, Trigger::Scheduled);
    assert_eq!(attempt.state_before, SyncState::OutOfSync);
    assert_eq!(attempt.actions.len(), 1);
    assert!(matches!(
        attempt.actions[0].diff,
        ResourceDiff::Conflict { .. }
    ));

    // never touched
    assert_eq!(cluster.get(&key).unwrap().spec, json!({"vlan": 7}));
    assert_eq!(cluster.write_count(), 0);

    let fabric = t.fabric("fab-1").await;
    assert_eq!(fabric.last_sync_at, Some(t.now()));
    assert!(fabric.last_error.is_none());
    assert_eq!(fabric.consecutive_failures, 0);

    let snapshot = t.engine.breaker().snapshot("fab-1");
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.consecutive_failures, 0);

    let status = t.engine.get_state("fab-1").await.unwrap();
    assert_eq!(status.state, SyncState::InSync);
    assert_eq!(status.history.partials, 1);
    assert_eq!(status.history.last_outcome, Some(AttemptOutcome::Partial));
}

#[tokio::test]
async fn test_second_run_is_all_no_op() {
    let t = TestEngine::new();
    t.add_fabric("fab-1", ENDPOINT).await;
    t.desire("fab-1", ResourceKind::Switch, "leaf-1", json!({"role": "server-leaf"}))
        .await;
    t.desire("fab-1", ResourceKind::Vpc, "vpc-1", json!({"subnets": {"default": {"vlan": 1000}}}))
        .await;
    t.desire("fab-1", ResourceKind::VpcAttachment, "vpc-1--srv-1", json!({"subnet": "vpc-1/default"}))
        .await;

    assert_eq!(t.trigger_and_wait("fab-1").await, TriggerResult::Accepted);
    let first = t.last_attempt("fab-1").await;
    assert_eq!(first.outcome, AttemptOutcome::Success);
    assert_eq!(first.counts().created, 3);

    let cluster = t.cluster(ENDPOINT);
    assert_eq!(cluster.write_count(), 3);

    t.advance_secs(600);
    assert_eq!(t.trigger_and_wait("fab-1").await, TriggerResult::Accepted);
    let second = t.last_attempt("fab-1").await;
    assert_eq!(second.outcome, AttemptOutcome::Success);
    assert_eq!(second.actions.len(), 3);
    assert!(second.actions.iter().all(|a| a.diff == ResourceDiff::NoOp));
    assert_eq!(cluster.write_count(), 3);
}

#[tokio::test]
async fn test_one_failing_resource_does_not_stop_the_rest() {
    let t = TestEngine::new();
    t.add_fabric("fab-1", ENDPOINT).await;
    for i in 0..10 {
        t.desire("fab-1", ResourceKind::Switch, &format!("leaf-{:02}", i), json!({"index": i}))
            .await;
    }
    let cluster = t.cluster(ENDPOINT);
    cluster.fail_on(ResourceKey::new(ResourceKind::Switch, "leaf-04"));

    t.trigger_and_wait("fab-1").await;

    let attempt = t.last_attempt("fab-1").await;
    assert_eq!(attempt.outcome, AttemptOutcome::Partial);
    let counts = attempt.counts();
    assert_eq!(counts.created, 9);
    assert_eq!(counts.failed, 1);
    assert_eq!(attempt.actions.len(), 10);
    for action in &attempt.actions {
        assert_eq!(action.diff, ResourceDiff::Create);
        if action.key.name == "leaf-04" {
            assert!(matches!(&action.status, ActionStatus::Failed { error } if error.contains("leaf-04")));
        } else {
            assert_eq!(action.status, ActionStatus::Applied, "{}", action.key);
        }
    }
    assert_eq!(cluster.objects().len(), 9);
    assert!(cluster
        .get(&ResourceKey::new(ResourceKind::Switch, "leaf-05"))
        .is_some());

    let fabric = t.fabric("fab-1").await;
    assert_eq!(fabric.last_sync_at, Some(t.now()));
    let err = fabric.last_error.unwrap();
    assert_eq!(err.class, ErrorClass::Resource);
    assert!(!err.fatal);
    assert_eq!(fabric.consecutive_failures, 0);

    // rejected resource is retried on the next run
    cluster.clear_failures();
    t.advance_secs(300);
    t.trigger_and_wait("fab-1").await;
    let retry = t.last_attempt("fab-1").await;
    assert_eq!(retry.outcome, AttemptOutcome::Success);
    assert_eq!(retry.counts().created, 1);
    assert!(t.fabric("fab-1").await.last_error.is_none());
}

#[tokio::test]
async fn test_rejected_resources_never_open_the_circuit() {
    let t = TestEngine::new();
    t.add_fabric("fab-1", ENDPOINT).await;
    t.desire("fab-1", ResourceKind::Switch, "leaf-01", json!({"role": "leaf"}))
        .await;
    let cluster = t.cluster(ENDPOINT);
    cluster.fail_on(ResourceKey::new(ResourceKind::Switch, "leaf-01"));

    for _ in 0..6 {
        assert_eq!(t.trigger_and_wait("fab-1").await, TriggerResult::Accepted);
        let attempt = t.last_attempt("fab-1").await;
        assert_eq!(attempt.outcome, AttemptOutcome::Partial);
        assert_eq!(attempt.error.unwrap().class, ErrorClass::Resource);
    }

    let status = t.engine.get_state("fab-1").await.unwrap();
    assert_eq!(status.state, SyncState::NeverSynced);
    assert_eq!(status.history.partials, 6);
    assert_eq!(status.history.consecutive_failures, 0);
    assert_eq!(status.history.circuit.state, CircuitState::Closed);
    assert_eq!(status.history.circuit.consecutive_failures, 0);
}

#[tokio::test(start_paused = true)]
async fn test_attempt_timeout_releases_session() {
    let config = EngineConfig {
        attempt_timeout: Duration::from_secs(5),
        ..Default::default()
    };
    let t = TestEngine::with_config(config);
    t.add_fabric("fab-1", ENDPOINT).await;
    let cluster = t.cluster(ENDPOINT);
    cluster.set_latency(Duration::from_secs(2));

    t.trigger_and_wait("fab-1").await;

    let attempt = t.last_attempt("fab-1").await;
    assert_eq!(attempt.outcome, AttemptOutcome::Failure);
    assert_eq!(attempt.error.as_ref().unwrap().class, ErrorClass::Timeout);
    assert_eq!(cluster.open_sessions(), 0);

    let fabric = t.fabric("fab-1").await;
    assert!(fabric.last_sync_at.is_none());
    assert_eq!(fabric.consecutive_failures, 1);
    assert_eq!(t.engine.breaker().snapshot("fab-1").consecutive_failures, 1);
}

#[tokio::test]
async fn test_worker_panic_is_recorded_as_internal_failure() {
    let t = TestEngine::new();
    t.add_fabric("fab-1", ENDPOINT).await;
    let cluster = t.cluster(ENDPOINT);
    cluster.set_panic_on_list(true);

    assert_eq!(t.trigger_and_wait("fab-1").await, TriggerResult::Accepted);

    let attempt = t.last_attempt("fab-1").await;
    assert_eq!(attempt.outcome, AttemptOutcome::Failure);
    assert_eq!(attempt.trigger, Trigger::Manual);
    assert_eq!(attempt.error.as_ref().unwrap().class, ErrorClass::Internal);
    assert_eq!(cluster.open_sessions(), 0);
    assert!(t.engine.scheduler().guard().is_empty());
    assert_eq!(t.engine.breaker().snapshot("fab-1").consecutive_failures, 1);
    assert_eq!(t.engine.scheduler().health().borrow().crashed_total, 1);

    // the fabric stays schedulable
    assert_eq!(t.trigger_and_wait("fab-1").await, TriggerResult::Accepted);
    assert_eq!(
        t.last_attempt("fab-1").await.outcome,
        AttemptOutcome::Success
    );
}

// =============================================================================
// Manual Trigger
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_trigger_now_is_single_flight() {
    let t = TestEngine::new();
    t.add_fabric("fab-1", ENDPOINT).await;
    t.cluster(ENDPOINT).set_latency(Duration::from_secs(1));

    assert_eq!(
        t.engine.trigger_now("fab-1").await.unwrap(),
        TriggerResult::Accepted
    );
    assert_eq!(
        t.engine.trigger_now("fab-1").await.unwrap(),
        TriggerResult::Rejected(RejectReason::AlreadySyncing)
    );
    assert_eq!(
        t.engine.get_state("fab-1").await.unwrap().state,
        SyncState::Syncing
    );

    t.engine.wait_idle().await;
    assert_eq!(t.engine.history("fab-1", 10).await.unwrap().len(), 1);
    assert_eq!(
        t.engine.get_state("fab-1").await.unwrap().state,
        SyncState::InSync
    );
}

#[tokio::test]
async fn test_trigger_now_rejects_unusable_fabrics() {
    let t = TestEngine::new();
    t.add_fabric("fab-1", ENDPOINT).await;
    t.add_fabric("bare", "").await;

    assert_eq!(
        t.engine.trigger_now("bare").await.unwrap(),
        TriggerResult::Rejected(RejectReason::NotConfigured)
    );

    t.engine
        .reconfigure(
            "fab-1",
            UpdateFabricConfigRequest {
                sync_enabled: Some(false),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        t.engine.trigger_now("fab-1").await.unwrap(),
        TriggerResult::Rejected(RejectReason::Disabled)
    );
    assert_eq!(
        t.engine.get_state("fab-1").await.unwrap().state,
        SyncState::Disabled
    );

    assert!(matches!(
        t.engine.trigger_now("missing").await,
        Err(EngineError::FabricNotFound(_))
    ));
    assert!(t.engine.history("fab-1", 10).await.unwrap().is_empty());
}

// =============================================================================
// Circuit Breaker
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_breaker_opens_then_allows_one_trial() {
    let t = TestEngine::new();
    t.add_fabric("fab-1", ENDPOINT).await;
    let cluster = t.cluster(ENDPOINT);
    cluster.set_reachable(false);

    for _ in 0..5 {
        assert_eq!(t.trigger_and_wait("fab-1").await, TriggerResult::Accepted);
    }
    assert_eq!(
        t.engine.trigger_now("fab-1").await.unwrap(),
        TriggerResult::Rejected(RejectReason::CircuitOpen)
    );
    let report = t.engine.scheduler().tick().await.unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.suppressed, 1);
    assert_eq!(report.dispatched, 0);

    // 10s * 2^5
    t.advance_secs(319);
    assert_eq!(
        t.engine.trigger_now("fab-1").await.unwrap(),
        TriggerResult::Rejected(RejectReason::CircuitOpen)
    );
    t.advance_secs(1);

    cluster.set_latency(Duration::from_secs(1));
    assert_eq!(
        t.engine.trigger_now("fab-1").await.unwrap(),
        TriggerResult::Accepted
    );
    assert!(!t.engine.breaker().may_attempt("fab-1"));
    t.engine.wait_idle().await;

    let status = t.engine.get_state("fab-1").await.unwrap();
    assert_eq!(status.state, SyncState::NeverSynced);
    assert_eq!(status.history.failures, 6);
    assert_eq!(status.history.consecutive_failures, 6);
    assert_eq!(status.history.circuit.consecutive_failures, 6);
    assert_eq!(
        status.history.circuit.reopen_at(),
        Some(t.now() + chrono::Duration::seconds(640))
    );
    assert_eq!(
        status.last_error.unwrap().class,
        ErrorClass::Connection
    );

    // breaker, fabric record and audit trail agree
    let history = t.engine.history("fab-1", 100).await.unwrap();
    assert_eq!(history.len(), 6);
    assert!(history.iter().all(|a| a.outcome == AttemptOutcome::Failure));
    assert_eq!(t.fabric("fab-1").await.consecutive_failures, 6);
}

#[tokio::test]
async fn test_recovery_closes_the_circuit() {
    let t = TestEngine::new();
    t.add_fabric("fab-1", ENDPOINT).await;
    let cluster = t.cluster(ENDPOINT);
    cluster.set_reachable(false);
    for _ in 0..5 {
        t.trigger_and_wait("fab-1").await;
    }
    assert!(matches!(
        t.engine.breaker().snapshot("fab-1").state,
        CircuitState::Open { .. }
    ));

    cluster.set_reachable(true);
    t.advance_secs(320);
    assert_eq!(t.trigger_and_wait("fab-1").await, TriggerResult::Accepted);

    let snapshot = t.engine.breaker().snapshot("fab-1");
    assert_eq!(snapshot.state, CircuitState::Closed);
    assert_eq!(snapshot.consecutive_failures, 0);
    let fabric = t.fabric("fab-1").await;
    assert_eq!(fabric.consecutive_failures, 0);
    assert!(fabric.last_error.is_none());
}

#[tokio::test]
async fn test_restore_rebuilds_open_circuits() {
    let t = TestEngine::new();
    t.add_fabric("fab-1", ENDPOINT).await;
    t.add_fabric("fab-2", "fake://dc2").await;
    t.cluster(ENDPOINT).set_reachable(false);
    for _ in 0..5 {
        t.trigger_and_wait("fab-1").await;
    }
    t.trigger_and_wait("fab-2").await;

    let restarted = t.restarted();
    assert_eq!(restarted.breaker().snapshot("fab-1").consecutive_failures, 0);
    assert_eq!(restarted.restore().await.unwrap(), 1);

    let snapshot = restarted.breaker().snapshot("fab-1");
    assert_eq!(snapshot.consecutive_failures, 5);
    assert_eq!(snapshot.reopen_at(), Some(t.now() + chrono::Duration::seconds(320)));
    assert_eq!(
        restarted.trigger_now("fab-1").await.unwrap(),
        TriggerResult::Rejected(RejectReason::CircuitOpen)
    );
    assert_eq!(restarted.breaker().snapshot("fab-2").state, CircuitState::Closed);
}

// =============================================================================
// Error Escalation and Reconfiguration
// =============================================================================

#[tokio::test]
async fn test_repeated_auth_failures_park_fabric_until_reconfigured() {
    let t = TestEngine::new();
    t.add_fabric("fab-1", ENDPOINT).await;
    let cluster = t.cluster(ENDPOINT);
    cluster.set_authorized(false);

    for expected in 1..=3u32 {
        t.trigger_and_wait("fab-1").await;
        let err = t.fabric("fab-1").await.last_error.unwrap();
        assert_eq!(err.class, ErrorClass::Authentication);
        assert_eq!(err.occurrences, expected);
        assert_eq!(err.fatal, expected == 3);
    }

    let status = t.engine.get_state("fab-1").await.unwrap();
    assert_eq!(status.state, SyncState::Error);
    assert!(status.last_error.unwrap().message.contains("Unauthorized"));

    let report = t.engine.scheduler().tick().await.unwrap();
    assert_eq!(report.due, 0);

    cluster.set_authorized(true);
    t.engine
        .reconfigure(
            "fab-1",
            UpdateFabricConfigRequest {
                credentials: Some(ClusterCredentials::new("token:rotated")),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let status = t.engine.get_state("fab-1").await.unwrap();
    assert_eq!(status.state, SyncState::NeverSynced);
    assert!(status.last_error.is_none());
    assert_eq!(status.history.circuit.consecutive_failures, 0);

    let report = t.engine.scheduler().tick().await.unwrap();
    assert_eq!(report.dispatched, 1);
    t.engine.wait_idle().await;
    assert_eq!(
        t.engine.get_state("fab-1").await.unwrap().state,
        SyncState::InSync
    );
}

#[tokio::test(start_paused = true)]
async fn test_reconfigure_during_attempt_is_not_overwritten() {
    let config = EngineConfig {
        auth_retry_limit: 1,
        ..Default::default()
    };
    let t = TestEngine::with_config(config);
    t.add_fabric("fab-1", ENDPOINT).await;
    t.engine
        .reconfigure(
            "fab-1",
            UpdateFabricConfigRequest {
                credentials: Some(ClusterCredentials::new("")),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    t.cluster(ENDPOINT).set_latency(Duration::from_secs(1));

    assert_eq!(
        t.engine.trigger_now("fab-1").await.unwrap(),
        TriggerResult::Accepted
    );
    t.engine
        .reconfigure(
            "fab-1",
            UpdateFabricConfigRequest {
                credentials: Some(ClusterCredentials::new("token:fixed")),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    t.engine.wait_idle().await;

    // the old credentials failed, but only the audit trail sees it
    let attempt = t.last_attempt("fab-1").await;
    assert_eq!(attempt.outcome, AttemptOutcome::Failure);
    assert_eq!(attempt.error.unwrap().class, ErrorClass::Authentication);

    let status = t.engine.get_state("fab-1").await.unwrap();
    assert_eq!(status.state, SyncState::NeverSynced);
    assert!(status.last_error.is_none());
    assert_eq!(status.history.consecutive_failures, 0);
    assert_eq!(status.history.circuit.consecutive_failures, 0);

    let report = t.engine.scheduler().tick().await.unwrap();
    assert_eq!(report.dispatched, 1);
    t.engine.wait_idle().await;
    assert_eq!(
        t.engine.get_state("fab-1").await.unwrap().state,
        SyncState::InSync
    );
}

#[tokio::test]
async fn test_invalid_endpoint_is_fatal_immediately() {
    let t = TestEngine::new();
    t.add_fabric("fab-1", "dc1.example:6443").await;

    t.trigger_and_wait("fab-1").await;

    let status = t.engine.get_state("fab-1").await.unwrap();
    assert_eq!(status.state, SyncState::Error);
    let err = status.last_error.unwrap();
    assert_eq!(err.class, ErrorClass::Configuration);
    assert!(err.fatal);

    t.engine
        .reconfigure(
            "fab-1",
            UpdateFabricConfigRequest {
                cluster_endpoint: Some(ENDPOINT.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        t.engine.get_state("fab-1").await.unwrap().state,
        SyncState::NeverSynced
    );
}

// =============================================================================
// Scheduling
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_never_synced_first_when_workers_are_saturated() {
    let config = EngineConfig {
        max_concurrent: 1,
        ..Default::default()
    };
    let t = TestEngine::with_config(config);
    t.add_fabric("old", "fake://old").await;
    t.synced_ago("old", 60).await;
    t.add_fabric("new", "fake://new").await;
    t.cluster("fake://old").set_latency(Duration::from_secs(1));
    t.cluster("fake://new").set_latency(Duration::from_secs(1));

    let report = t.engine.scheduler().tick().await.unwrap();
    assert_eq!(report.due, 2);
    assert_eq!(report.dispatched, 1);
    assert_eq!(report.deferred, 1);
    assert_eq!(
        t.engine.get_state("new").await.unwrap().state,
        SyncState::Syncing
    );
    assert_eq!(
        t.engine.get_state("old").await.unwrap().state,
        SyncState::OutOfSync
    );
    t.engine.wait_idle().await;

    let report = t.engine.scheduler().tick().await.unwrap();
    assert_eq!(report.due, 1);
    assert_eq!(report.dispatched, 1);
    t.engine.wait_idle().await;
    assert_eq!(
        t.engine.get_state("old").await.unwrap().state,
        SyncState::InSync
    );
}

#[tokio::test(start_paused = true)]
async fn test_manual_trigger_waits_for_a_free_worker() {
    let config = EngineConfig {
        max_concurrent: 1,
        ..Default::default()
    };
    let t = TestEngine::with_config(config);
    t.add_fabric("a", "fake://a").await;
    t.add_fabric("b", "fake://b").await;
    t.cluster("fake://a").set_latency(Duration::from_secs(1));
    t.cluster("fake://b").set_latency(Duration::from_secs(1));

    assert_eq!(
        t.engine.trigger_now("a").await.unwrap(),
        TriggerResult::Accepted
    );
    assert_eq!(
        t.engine.trigger_now("b").await.unwrap(),
        TriggerResult::Accepted
    );
    t.engine.wait_idle().await;

    let a = t.last_attempt("a").await;
    let b = t.last_attempt("b").await;
    assert_eq!(a.outcome, AttemptOutcome::Success);
    assert_eq!(b.outcome, AttemptOutcome::Success);
    assert_eq!(t.cluster("fake://a").open_sessions(), 0);
    assert_eq!(t.cluster("fake://b").open_sessions(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_scheduler_loop_reports_health_and_shuts_down() {
    let t = TestEngine::new();
    t.add_fabric("fab-1", ENDPOINT).await;
    t.desire("fab-1", ResourceKind::Switch, "spine-1", json!({"role": "spine"}))
        .await;

    let handle = t.engine.start();
    let mut health = handle.subscribe();
    health.wait_for(|h| h.running && h.ticks >= 1).await.unwrap();
    t.engine.wait_idle().await;
    assert!(!handle.is_finished());

    let current = handle.health();
    assert_eq!(current.dispatched_total, 1);
    assert!(current.last_tick_error.is_none());

    let attempt = t.last_attempt("fab-1").await;
    assert_eq!(attempt.trigger, Trigger::Scheduled);
    assert_eq!(attempt.outcome, AttemptOutcome::Success);

    handle.shutdown().await.unwrap();
    assert!(!health.borrow().running);
}

// =============================================================================
// Persistence
// =============================================================================

#[tokio::test]
async fn test_history_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let inventory = dir.path().join("inventory.redb");
    let audit_path = dir.path().join("audit.redb");
    let connector = Arc::new(FakeConnector::new());
    let clock = Arc::new(ManualClock::new(common::start_time()));

    {
        let store = Arc::new(RedbStore::open(&inventory).unwrap());
        let audit = Arc::new(RedbAuditTrail::open(&audit_path).unwrap());
        let engine = SyncEngine::new(
            EngineConfig::default(),
            store.clone(),
            connector.clone(),
            audit,
            clock.clone(),
        )
        .unwrap();
        store
            .create_fabric(fabsync_engine::store::CreateFabricRequest {
                id: Some("fab-1".to_string()),
                name: "dc1".to_string(),
                cluster_endpoint: ENDPOINT.to_string(),
                credentials: ClusterCredentials::new("token:t"),
                sync_enabled: true,
                sync_interval_secs: None,
            })
            .await
            .unwrap();

        assert_eq!(
            engine.trigger_now("fab-1").await.unwrap(),
            TriggerResult::Accepted
        );
        engine.wait_idle().await;
    }

    let store = Arc::new(RedbStore::open(&inventory).unwrap());
    let audit = Arc::new(RedbAuditTrail::open(&audit_path).unwrap());
    let engine = SyncEngine::new(
        EngineConfig::default(),
        store,
        connector,
        audit,
        clock,
    )
    .unwrap();
    assert_eq!(engine.restore().await.unwrap(), 0);

    let status = engine.get_state("fab-1").await.unwrap();
    assert_eq!(status.state, SyncState::InSync);
    assert_eq!(status.history.recent, 1);
    assert_eq!(status.history.successes, 1);
    assert_eq!(engine.history("fab-1", 10).await.unwrap().len(), 1);
}
