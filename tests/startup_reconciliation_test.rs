//! Starting from configuration with delivery log state left by a previous run

use serde_json::{json, Map};
use tempfile::TempDir;
use tether::testing::MockBroker;
use tether::{BrokerOrchestrator, DeliveryLog, TetherConfig};

fn config_for(dir: &TempDir) -> TetherConfig {
    tether::logging::init_test_logging();
    let toml = format!(
        r#"
[delivery_log]
location = "{}"

[backoff]
base_delay_ms = 5
max_exponent = 2
jitter_min_ms = 0
jitter_max_ms = 0

[connections.orders]
type = "kafka"
bootstrap_servers = "localhost:9092"

[connections.audit]
type = "amqp"
uri = "amqp://localhost"

[connections.sensors]
type = "mqtt"
enabled = false
"#,
        dir.path().display()
    );
    TetherConfig::from_toml_str(&toml).unwrap()
}

#[tokio::test]
async fn test_backlog_from_previous_run_is_resent() {
    let dir = TempDir::new().unwrap();
    {
        let log = DeliveryLog::initialize(dir.path(), ["orders", "audit"]).unwrap();
        for i in 0..3 {
            let message = json!({"seq": i}).as_object().cloned().unwrap();
            log.append("orders", &message, &Map::new()).unwrap();
        }
        log.update_pointer("orders", 1).unwrap();
    }

    let broker = MockBroker::new();
    let orchestrator = BrokerOrchestrator::start(&config_for(&dir), broker.connectors())
        .await
        .unwrap();
    orchestrator.wait_idle().await;

    // Only the entries after the stored pointer are replayed
    let seqs: Vec<i64> = broker
        .delivered_to("orders")
        .iter()
        .map(|m| m["seq"].as_i64().unwrap())
        .collect();
    assert_eq!(seqs, vec![1, 2]);

    let log = orchestrator.delivery_log().unwrap();
    assert_eq!(log.entry_count("orders"), 0);
    assert_eq!(log.pointer("orders"), 0);

    let names: Vec<String> = orchestrator
        .list_connections()
        .into_iter()
        .map(|status| status.name)
        .collect();
    assert_eq!(names, vec!["audit", "orders"]);
}

#[tokio::test]
async fn test_unreachable_broker_at_startup_recovers() {
    let dir = TempDir::new().unwrap();
    let broker = MockBroker::new();
    broker.set_accept_connections(false);

    let orchestrator = BrokerOrchestrator::start(&config_for(&dir), broker.connectors())
        .await
        .unwrap();

    for status in orchestrator.list_connections() {
        assert!(!status.connected, "{} should start offline", status.name);
        assert!(status.reconnecting);
    }

    broker.set_accept_connections(true);
    orchestrator.wait_idle().await;

    for status in orchestrator.list_connections() {
        assert!(status.connected, "{} should have recovered", status.name);
        assert!(!status.reconnecting);
    }
    assert_eq!(orchestrator.reconnector().invocations(), 2);
}

#[tokio::test]
async fn test_disabled_delivery_log_creates_no_files() {
    let dir = TempDir::new().unwrap();
    let mut config = config_for(&dir);
    config.delivery_log.enabled = false;

    let broker = MockBroker::new();
    let orchestrator = BrokerOrchestrator::start(&config, broker.connectors())
        .await
        .unwrap();

    assert!(!orchestrator.is_durable());
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
    orchestrator.shutdown().await;
}
