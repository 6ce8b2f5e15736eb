//! End-to-end behaviour of the broker orchestrator against an in-memory broker

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tether::config::ExecutorConfig;
use tether::testing::MockBroker;
use tether::{
    AdapterKind, BackoffConfig, BrokerError, BrokerOrchestrator, DeliveryLog, Properties,
    Reconnector, Registry, ResendOutcome,
};
use tokio::sync::Barrier;

fn props(value: serde_json::Value) -> Properties {
    value.as_object().cloned().unwrap()
}

fn fast_backoff() -> BackoffConfig {
    BackoffConfig::without_jitter(Duration::from_millis(5), 2)
}

async fn durable(broker: &MockBroker, dir: &TempDir) -> BrokerOrchestrator {
    tether::logging::init_test_logging();
    let log = DeliveryLog::initialize(dir.path(), ["q1"]).unwrap();
    let orchestrator = BrokerOrchestrator::new(
        Registry::new(),
        Some(log),
        Reconnector::new(broker.connectors(), fast_backoff()),
        &ExecutorConfig::default(),
    )
    .unwrap();
    orchestrator
        .activate("q1", AdapterKind::Kafka, Properties::new())
        .await
        .unwrap();
    orchestrator
}

async fn best_effort(broker: &MockBroker) -> BrokerOrchestrator {
    let orchestrator = BrokerOrchestrator::new(
        Registry::new(),
        None,
        Reconnector::new(broker.connectors(), fast_backoff()),
        &ExecutorConfig::default(),
    )
    .unwrap();
    orchestrator
        .activate("q1", AdapterKind::Amqp, Properties::new())
        .await
        .unwrap();
    orchestrator
}

fn assert_pointer_invariant(orchestrator: &BrokerOrchestrator) {
    let log = orchestrator.delivery_log().unwrap();
    for name in log.connections() {
        assert!(
            log.pointer(&name) <= log.entry_count(&name),
            "pointer {} beyond {} entries for {}",
            log.pointer(&name),
            log.entry_count(&name),
            name
        );
    }
}

#[tokio::test]
async fn scenario_a_unknown_connection() {
    let registry = Registry::new();
    let err = registry.get("missing").unwrap_err();
    assert!(matches!(err, BrokerError::ConnectionUnknown(name) if name == "missing"));
}

#[tokio::test]
async fn scenario_b_healthy_send_logs_nothing() {
    let dir = TempDir::new().unwrap();
    let broker = MockBroker::new();
    let orchestrator = durable(&broker, &dir).await;

    let receipts = orchestrator
        .send("q1", &props(json!({"a": 1})), &Properties::new())
        .await
        .unwrap();

    assert_eq!(receipts.len(), 1);
    assert_eq!(receipts[0].destination, "q1");
    assert_eq!(orchestrator.delivery_log().unwrap().entry_count("q1"), 0);
    assert_eq!(broker.delivered_to("q1"), vec![props(json!({"a": 1}))]);
    orchestrator.wait_idle().await;
    assert_eq!(orchestrator.delivery_log().unwrap().entry_count("q1"), 0);
}

#[tokio::test]
async fn scenario_c_unhealthy_send_is_recorded() {
    let dir = TempDir::new().unwrap();
    let broker = MockBroker::new();
    let orchestrator = durable(&broker, &dir).await;
    broker.set_healthy(false);

    let err = orchestrator
        .send("q1", &props(json!({"a": 1})), &Properties::new())
        .await
        .unwrap_err();

    assert!(matches!(err, BrokerError::Send { .. }));
    assert_eq!(orchestrator.delivery_log().unwrap().entry_count("q1"), 1);
    let conn = orchestrator.registry().get("q1").unwrap();
    assert!(!conn.is_connected());
    assert!(conn.is_reconnecting());
    assert_pointer_invariant(&orchestrator);

    orchestrator.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn scenario_d_concurrent_failures_schedule_one_reconnect() {
    let dir = TempDir::new().unwrap();
    let broker = MockBroker::new();
    let orchestrator = durable(&broker, &dir).await;
    broker.set_healthy(false);

    let senders = 8;
    let barrier = Arc::new(Barrier::new(senders));
    let handles: Vec<_> = (0..senders)
        .map(|i| {
            let orchestrator = orchestrator.clone();
            let barrier = Arc::clone(&barrier);
            tokio::spawn(async move {
                barrier.wait().await;
                orchestrator
                    .send("q1", &props(json!({"sender": i})), &Properties::new())
                    .await
            })
        })
        .collect();

    for handle in handles {
        assert!(handle.await.unwrap().is_err());
    }

    broker.set_healthy(true);
    orchestrator.wait_idle().await;

    assert_eq!(orchestrator.reconnector().invocations(), 1);
    let log = orchestrator.delivery_log().unwrap();
    assert_eq!(log.entry_count("q1"), 0);
    assert_eq!(log.pointer("q1"), 0);
    assert!(orchestrator.registry().get("q1").unwrap().is_connected());
}

#[tokio::test]
async fn scenario_e_reconnect_drains_backlog() {
    let dir = TempDir::new().unwrap();
    let broker = MockBroker::new();
    let orchestrator = durable(&broker, &dir).await;
    broker.set_healthy(false);

    assert!(orchestrator
        .send("q1", &props(json!({"a": 1})), &Properties::new())
        .await
        .is_err());

    broker.set_healthy(true);
    orchestrator.wait_idle().await;

    let log = orchestrator.delivery_log().unwrap();
    assert_eq!(log.entry_count("q1"), 0);
    assert_eq!(log.pointer("q1"), 0);
    let conn = orchestrator.registry().get("q1").unwrap();
    assert!(conn.is_connected());
    assert!(!conn.is_reconnecting());
    assert_eq!(broker.delivered_to("q1"), vec![props(json!({"a": 1}))]);
}

#[tokio::test]
async fn healthy_send_flushes_existing_backlog() {
    let dir = TempDir::new().unwrap();
    let broker = MockBroker::new();
    let orchestrator = durable(&broker, &dir).await;
    let log = orchestrator.delivery_log().unwrap();
    for i in 0..3 {
        log.append("q1", &props(json!({"seq": i})), &Properties::new())
            .unwrap();
    }

    orchestrator
        .send("q1", &props(json!({"seq": 3})), &Properties::new())
        .await
        .unwrap();
    orchestrator.wait_idle().await;

    let seqs: Vec<i64> = broker
        .delivered_to("q1")
        .iter()
        .map(|m| m["seq"].as_i64().unwrap())
        .collect();
    // The live message goes first; the backlog follows in log order
    assert_eq!(seqs, vec![3, 0, 1, 2]);
    assert_eq!(log.entry_count("q1"), 0);
    assert_eq!(log.pointer("q1"), 0);
    assert_eq!(orchestrator.reconnector().invocations(), 0);
}

#[tokio::test]
async fn resend_on_empty_backlog_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let broker = MockBroker::new();
    let orchestrator = durable(&broker, &dir).await;
    let manifest = dir.path().join("manifest.log");
    let before = std::fs::read_to_string(&manifest).unwrap();

    let report = orchestrator.resend("q1", 0).await.unwrap();

    assert_eq!(report.outcome, ResendOutcome::NothingToSend);
    assert_eq!(report.sent, 0);
    assert_eq!(broker.delivered_count(), 0);
    assert_eq!(std::fs::read_to_string(&manifest).unwrap(), before);
}

#[tokio::test]
async fn round_trip_append_resend_reset() {
    let dir = TempDir::new().unwrap();
    let broker = MockBroker::new();
    let orchestrator = durable(&broker, &dir).await;
    let log = orchestrator.delivery_log().unwrap();

    for i in 0..10 {
        log.append("q1", &props(json!({"seq": i})), &props(json!({"key": i})))
            .unwrap();
    }
    assert_eq!(log.backlog("q1"), 10);

    let report = orchestrator.resend("q1", 0).await.unwrap();
    assert_eq!(report.sent, 10);
    assert_eq!(report.outcome, ResendOutcome::Drained);
    assert_eq!(log.backlog("q1"), 0);

    log.reset("q1").unwrap();
    assert_eq!(log.entry_count("q1"), 0);
    assert_eq!(log.pointer("q1"), 0);

    let seqs: Vec<i64> = broker
        .delivered_to("q1")
        .iter()
        .map(|m| m["seq"].as_i64().unwrap())
        .collect();
    assert_eq!(seqs, (0..10).collect::<Vec<i64>>());
}

#[tokio::test]
async fn failures_during_outage_replay_in_order() {
    let dir = TempDir::new().unwrap();
    let broker = MockBroker::new();
    let orchestrator = durable(&broker, &dir).await;

    broker.set_accept_sends(false);
    let first = orchestrator
        .send("q1", &props(json!({"seq": 0})), &Properties::new())
        .await;
    assert!(first.is_err());

    // Disconnected: later sends fail fast and are not recorded
    let second = orchestrator
        .send("q1", &props(json!({"seq": 1})), &Properties::new())
        .await
        .unwrap_err();
    assert!(second.is_disconnected());
    assert_eq!(orchestrator.delivery_log().unwrap().entry_count("q1"), 1);

    broker.set_accept_sends(true);
    orchestrator.wait_idle().await;

    assert_eq!(broker.delivered_to("q1"), vec![props(json!({"seq": 0}))]);
    assert_pointer_invariant(&orchestrator);
}

#[tokio::test]
async fn best_effort_mode_drops_failed_sends() {
    let broker = MockBroker::new();
    let orchestrator = best_effort(&broker).await;
    broker.set_healthy(false);

    let err = orchestrator
        .send("q1", &props(json!({"a": 1})), &Properties::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::Send { .. }));
    assert!(!orchestrator.is_durable());
    assert!(orchestrator.registry().get("q1").unwrap().is_reconnecting());

    assert!(matches!(
        orchestrator.force_resend("q1", 0).await,
        Err(BrokerError::ResendDisabled)
    ));

    broker.set_healthy(true);
    orchestrator.wait_idle().await;

    // Reconnected, but the failed message is gone
    assert!(orchestrator.registry().get("q1").unwrap().is_connected());
    assert_eq!(broker.delivered_count(), 0);
}

#[tokio::test]
async fn shutdown_stops_endless_reconnect() {
    let dir = TempDir::new().unwrap();
    let broker = MockBroker::new();
    let orchestrator = durable(&broker, &dir).await;
    broker.set_accept_connections(false);
    broker.set_healthy(false);

    assert!(orchestrator
        .send("q1", &Properties::new(), &Properties::new())
        .await
        .is_err());
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(broker.refused() > 0);

    orchestrator.shutdown().await;

    assert!(orchestrator.registry().is_empty());
    assert!(orchestrator.list_connections().is_empty());
    assert_eq!(orchestrator.delivery_log().unwrap().entry_count("q1"), 1);
}
