//! Integration tests for SessionRegistry

mod common;

use cardwatch::broadcast::AlertBroadcaster;
use cardwatch::config::{Config, MonitorConfig};
use cardwatch::error::{ConnectionError, ValidationError};
use cardwatch::metrics::Metrics;
use cardwatch::protocol::ServerMessage;
use cardwatch::registry::{
    DisconnectReason, HealthCheckOutcome, SessionMetadata, SessionRegistry, SessionStatus,
};
use cardwatch::transport::Transport;
use chrono::Utc;
use common::{sample_event, RecordingTransport};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn registry() -> SessionRegistry {
    registry_with(Config::default().monitor)
}

fn registry_with(monitor: MonitorConfig) -> SessionRegistry {
    let config = Config::default();
    let broadcaster = Arc::new(AlertBroadcaster::new(
        config.delivery,
        Arc::new(Metrics::new()),
    ));
    SessionRegistry::new(monitor, broadcaster)
}

fn connect(registry: &SessionRegistry, card: &str) -> (Uuid, Arc<RecordingTransport>) {
    let transport = RecordingTransport::new();
    let dyn_transport: Arc<dyn Transport> = transport.clone();
    let info = registry
        .create_connection(dyn_transport, card, SessionMetadata::for_agent("agent-1"))
        .expect("session should open");
    (info.session_id, transport)
}

fn later(minutes: i64) -> chrono::DateTime<Utc> {
    Utc::now() + chrono::Duration::minutes(minutes)
}

#[tokio::test]
async fn test_create_connection() {
    let registry = registry();
    let (id, transport) = connect(&registry, "card_a");

    let messages = transport.messages();
    assert_eq!(messages.len(), 1);
    match &messages[0] {
        ServerMessage::ConnectionEstablished { session } => {
            assert_eq!(session.session_id, id);
            assert_eq!(session.card_token, "card_a");
            assert_eq!(session.status, SessionStatus::Active);
        }
        other => panic!("Expected ConnectionEstablished, got {:?}", other),
    }

    let health = registry.get_connection_health(id).unwrap();
    assert_eq!(health.status, SessionStatus::Active);
    assert_eq!(health.metadata.agent_id.as_deref(), Some("agent-1"));
    assert_eq!(registry.broadcaster().subscribers("card_a"), vec![id]);

    let metrics = registry.get_metrics();
    assert_eq!(metrics.total_connections, 1);
    assert_eq!(metrics.active_connections, 1);
}

#[tokio::test]
async fn test_create_rejects_empty_card_token() {
    let registry = registry();
    let transport: Arc<dyn Transport> = RecordingTransport::new();

    let result = registry.create_connection(transport, "   ", SessionMetadata::default());

    assert!(matches!(
        result,
        Err(ConnectionError::Validation(ValidationError::EmptyCardToken))
    ));
    assert_eq!(registry.session_count(), 0);
    assert_eq!(registry.get_metrics().failed_connections, 1);
}

#[tokio::test]
async fn test_create_rolls_back_when_transport_fails() {
    let registry = registry();
    let transport: Arc<dyn Transport> = RecordingTransport::failing();

    let result = registry.create_connection(transport, "card_a", SessionMetadata::default());

    assert!(matches!(result, Err(ConnectionError::Transport { .. })));
    assert_eq!(registry.session_count(), 0);
    assert_eq!(registry.broadcaster().session_count(), 0);
    assert_eq!(registry.broadcaster().card_count(), 0);
    assert_eq!(registry.get_metrics().active_connections, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_established_precedes_alerts_under_concurrent_broadcasts() {
    let registry = registry();
    let broadcaster = Arc::clone(registry.broadcaster());
    let stop = Arc::new(AtomicBool::new(false));

    let publisher = {
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            let event = sample_event("tx-busy", "card_x");
            while !stop.load(Ordering::SeqCst) {
                broadcaster.broadcast_alert("card_x", &event).unwrap();
            }
        })
    };

    let mut out_of_order = 0;
    for _ in 0..2_000 {
        let (id, transport) = connect(&registry, "card_x");
        registry.handle_disconnection(id, DisconnectReason::ClientClosed);

        if transport.messages().first().map(|m| m.kind()) != Some("connection_established") {
            out_of_order += 1;
        }
    }

    stop.store(true, Ordering::SeqCst);
    publisher.join().unwrap();

    assert_eq!(out_of_order, 0);
    assert_eq!(registry.broadcaster().session_count(), 0);
}

#[tokio::test]
async fn test_authenticate_connection() {
    let registry = registry();
    assert!(registry.authenticate_connection(Some("Bearer agent-token")));
    assert!(!registry.authenticate_connection(Some("Bearer ")));
    assert!(!registry.authenticate_connection(Some("agent-token")));
    assert!(!registry.authenticate_connection(None));
    assert_eq!(registry.session_count(), 0);
}

#[tokio::test]
async fn test_double_disconnect_is_noop() {
    let registry = registry();
    let (id, transport) = connect(&registry, "card_a");

    assert!(registry.handle_disconnection(id, DisconnectReason::ClientClosed));
    assert!(!registry.handle_disconnection(id, DisconnectReason::ClientClosed));

    let metrics = registry.get_metrics();
    assert_eq!(metrics.active_connections, 0);
    assert_eq!(metrics.total_connections, 1);
    assert_eq!(transport.count("disconnected"), 1);
    assert!(transport.is_closed());
    assert!(registry.get_connection_health(id).is_none());
    assert!(registry.broadcaster().subscribers("card_a").is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_disconnects_tear_down_once() {
    let registry = registry();
    let (id, _transport) = connect(&registry, "card_a");
    connect(&registry, "card_b");

    let mut handles = Vec::new();
    for i in 0..16 {
        let registry = registry.clone();
        let reason = if i % 2 == 0 {
            DisconnectReason::ClientClosed
        } else {
            DisconnectReason::Admin("operator".to_string())
        };
        handles.push(tokio::spawn(async move {
            registry.handle_disconnection(id, reason)
        }));
    }

    let mut winners = 0;
    for handle in handles {
        if handle.await.unwrap() {
            winners += 1;
        }
    }

    assert_eq!(winners, 1);
    assert_eq!(registry.get_metrics().active_connections, 1);
    assert_eq!(registry.session_count(), 1);
}

#[tokio::test]
async fn test_removed_session_gets_no_alerts() {
    let registry = registry();
    let (id, transport) = connect(&registry, "card_a");
    let (_, other) = connect(&registry, "card_a");

    registry.handle_disconnection(id, DisconnectReason::ClientClosed);
    let report = registry
        .broadcaster()
        .broadcast_alert("card_a", &sample_event("tx1", "card_a"))
        .unwrap();

    assert_eq!(report.successful, 1);
    assert!(transport.alerts().is_empty());
    assert_eq!(other.alert_ids(), vec!["tx1"]);
}

#[tokio::test]
async fn test_health_check_passes_when_fresh() {
    let registry = registry();
    let (id, _transport) = connect(&registry, "card_a");

    assert_eq!(registry.perform_health_check(id), HealthCheckOutcome::Passed);

    let health = registry.get_connection_health(id).unwrap();
    assert_eq!(health.status, SessionStatus::Active);
    assert_eq!(health.health_checks_passed, 1);
    assert_eq!(registry.get_metrics().health_checks_passed, 1);
}

#[tokio::test]
async fn test_stale_heartbeat_triggers_recovery() {
    let registry = registry();
    let (id, transport) = connect(&registry, "card_a");

    let outcome = registry.evaluate_health(id, later(2));
    assert_eq!(outcome, HealthCheckOutcome::Recovering { attempt: 1 });

    let health = registry.get_connection_health(id).unwrap();
    assert_eq!(health.status, SessionStatus::Recovering);
    assert_eq!(health.health_checks_failed, 1);
    assert_eq!(health.reconnect_attempts, 1);
    assert_eq!(transport.count("recovery"), 1);

    // Timestamps were reset, so a check right now succeeds
    assert_eq!(registry.perform_health_check(id), HealthCheckOutcome::Passed);
    assert_eq!(
        registry.get_connection_health(id).unwrap().status,
        SessionStatus::Active
    );

    let metrics = registry.get_metrics();
    assert_eq!(metrics.health_checks_failed, 1);
    assert_eq!(metrics.reconnection_attempts, 1);
}

#[tokio::test]
async fn test_exhausted_recovery_closes_session() {
    let registry = registry();
    let (id, transport) = connect(&registry, "card_a");

    for attempt in 1..=3 {
        assert_eq!(
            registry.evaluate_health(id, later(2)),
            HealthCheckOutcome::Recovering { attempt }
        );
    }

    assert_eq!(
        registry.evaluate_health(id, later(2)),
        HealthCheckOutcome::Closed(DisconnectReason::HealthCheckFailed)
    );
    assert!(registry.get_connection_health(id).is_none());

    let last = transport.messages().pop().unwrap();
    match last {
        ServerMessage::Disconnected { session_id, reason } => {
            assert_eq!(session_id, id);
            assert_eq!(reason, DisconnectReason::HealthCheckFailed);
        }
        other => panic!("Expected Disconnected, got {:?}", other),
    }

    let metrics = registry.get_metrics();
    assert_eq!(metrics.active_connections, 0);
    assert_eq!(metrics.failed_connections, 1);
    assert_eq!(metrics.health_checks_failed, 4);
}

#[tokio::test]
async fn test_idle_session_times_out() {
    let registry = registry();
    let (id, transport) = connect(&registry, "card_a");

    assert_eq!(
        registry.evaluate_health(id, later(6)),
        HealthCheckOutcome::Closed(DisconnectReason::Timeout)
    );
    assert!(registry.get_connection_health(id).is_none());
    assert_eq!(transport.count("disconnected"), 1);
    assert_eq!(
        registry.evaluate_health(id, later(6)),
        HealthCheckOutcome::UnknownSession
    );
}

#[tokio::test]
async fn test_failed_recovery_write_closes_session() {
    let registry = registry();
    let (id, transport) = connect(&registry, "card_a");
    transport.set_failing(true);

    assert_eq!(
        registry.evaluate_health(id, later(2)),
        HealthCheckOutcome::Closed(DisconnectReason::RecoveryFailed)
    );
    assert!(registry.get_connection_health(id).is_none());
}

#[tokio::test]
async fn test_heartbeat_and_activity_on_unknown_session() {
    let registry = registry();
    let (id, _transport) = connect(&registry, "card_a");

    assert!(registry.record_heartbeat(id));
    assert!(registry.record_activity(id));
    assert!(!registry.record_heartbeat(Uuid::new_v4()));
    assert!(registry.get_connection_health(Uuid::new_v4()).is_none());
}

#[tokio::test]
async fn test_subscribe_extra_card() {
    let registry = registry();
    let (id, transport) = connect(&registry, "card_a");

    registry.subscribe(id, "card_b").unwrap();
    registry
        .broadcaster()
        .broadcast_alert("card_b", &sample_event("tx-b", "card_b"))
        .unwrap();
    assert_eq!(transport.alert_ids(), vec!["tx-b"]);

    assert!(registry.subscribe(Uuid::new_v4(), "card_b").is_err());

    registry.handle_disconnection(id, DisconnectReason::ClientClosed);
    assert_eq!(registry.broadcaster().card_count(), 0);
}

#[tokio::test]
async fn test_get_all_connections() {
    let registry = registry();
    let (a, _) = connect(&registry, "card_a");
    let (b, _) = connect(&registry, "card_b");

    let ids: Vec<Uuid> = registry
        .get_all_connections()
        .into_iter()
        .map(|h| h.session_id)
        .collect();
    assert_eq!(ids.len(), 2);
    assert!(ids.contains(&a));
    assert!(ids.contains(&b));
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_pings() {
    let registry = registry();
    let (_id, transport) = connect(&registry, "card_a");

    tokio::time::sleep(Duration::from_secs(46)).await;

    assert_eq!(transport.count("ping"), 3);
}

#[tokio::test(start_paused = true)]
async fn test_keep_alive_failure_disconnects() {
    let registry = registry();
    let (id, transport) = connect(&registry, "card_a");
    transport.set_failing(true);

    tokio::time::sleep(Duration::from_secs(16)).await;

    assert!(registry.get_connection_health(id).is_none());
    assert_eq!(registry.get_metrics().failed_connections, 1);
    assert!(transport.is_closed());
}

#[tokio::test(start_paused = true)]
async fn test_health_monitor_runs() {
    let registry = registry();
    let (id, _transport) = connect(&registry, "card_a");

    tokio::time::sleep(Duration::from_secs(61)).await;

    let health = registry.get_connection_health(id).unwrap();
    assert_eq!(health.health_checks_passed, 2);
    assert_eq!(health.status, SessionStatus::Active);
}

#[tokio::test(start_paused = true)]
async fn test_monitors_stop_after_disconnect() {
    let registry = registry();
    let (id, transport) = connect(&registry, "card_a");
    registry.handle_disconnection(id, DisconnectReason::ClientClosed);

    tokio::time::sleep(Duration::from_secs(120)).await;

    assert_eq!(transport.count("ping"), 0);
    assert_eq!(registry.get_metrics().health_checks_passed, 0);
}

#[tokio::test(start_paused = true)]
async fn test_registry_drives_retry_sweep() {
    let registry = registry();
    let (id, transport) = connect(&registry, "card_a");

    transport.set_failing(true);
    registry
        .broadcaster()
        .broadcast_alert("card_a", &sample_event("tx1", "card_a"))
        .unwrap();
    assert_eq!(registry.broadcaster().queue_len(id), Some(1));
    transport.set_failing(false);

    tokio::time::sleep(Duration::from_secs(31)).await;

    assert_eq!(registry.broadcaster().queue_len(id), Some(0));
    assert_eq!(transport.alert_ids(), vec!["tx1"]);
}

#[tokio::test]
async fn test_shutdown_clears_everything() {
    let registry = registry();
    let (_, t1) = connect(&registry, "card_a");
    let (_, t2) = connect(&registry, "card_b");

    registry.shutdown();
    registry.shutdown();

    assert!(registry.is_shut_down());
    assert_eq!(registry.session_count(), 0);
    assert_eq!(registry.broadcaster().session_count(), 0);
    assert_eq!(registry.broadcaster().card_count(), 0);
    assert!(t1.is_closed());
    assert!(t2.is_closed());
    assert_eq!(registry.get_metrics().active_connections, 0);

    let transport: Arc<dyn Transport> = RecordingTransport::new();
    assert!(matches!(
        registry.create_connection(transport, "card_a", SessionMetadata::default()),
        Err(ConnectionError::ShutDown)
    ));
}

#[tokio::test]
async fn test_custom_recovery_limit() {
    let registry = registry_with(MonitorConfig {
        max_reconnect_attempts: 0,
        ..Default::default()
    });
    let (id, _transport) = connect(&registry, "card_a");

    assert_eq!(
        registry.evaluate_health(id, later(2)),
        HealthCheckOutcome::Closed(DisconnectReason::HealthCheckFailed)
    );
}

#[tokio::test]
async fn test_huge_timeouts_never_expire() {
    let registry = registry_with(MonitorConfig {
        connection_timeout_secs: u64::MAX,
        heartbeat_timeout_secs: u64::MAX,
        ..Default::default()
    });
    let (id, _transport) = connect(&registry, "card_a");

    assert_eq!(
        registry.evaluate_health(id, later(60 * 24 * 365)),
        HealthCheckOutcome::Passed
    );
}
