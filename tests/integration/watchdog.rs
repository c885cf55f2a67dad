//! Connection watchdog and start-up retry tests
//!
//! These tests verify:
//! - Escalation on every 5th consecutive failure
//! - A single "restored" notification after an escalation
//! - Start-up retry aborts on fatal errors and on cancellation

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use assert_matches::assert_matches;
use sensor_client::actors::watchdog::{ConnectionWatchdog, Startup, connect_with_retry};
use sensor_client::alerts::NotificationSink;
use sensor_client::connection::SessionState;
use sensor_client::error::ConnectionError;
use tokio_util::sync::CancellationToken;

use crate::helpers::*;

fn watchdog(
    connection: &Arc<ScriptedConnection>,
    notifier: &Arc<RecordingNotifier>,
) -> ConnectionWatchdog {
    ConnectionWatchdog::new(
        connection.clone(),
        Some(notifier.clone() as Arc<dyn NotificationSink>),
        Duration::from_secs(30),
    )
}

#[tokio::test]
async fn test_five_failed_reconnects_escalate_once_then_restore_once() {
    let connection = Arc::new(ScriptedConnection::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let mut watchdog = watchdog(&connection, &notifier);

    for _ in 0..5 {
        watchdog.cycle().await;
    }
    assert_eq!(notifier.notifications(), vec![Notification::Degraded(5)]);
    assert_eq!(watchdog.consecutive_failures(), 5);

    connection.set_healthy(true);
    watchdog.cycle().await;
    watchdog.cycle().await;

    assert_eq!(
        notifier.notifications(),
        vec![Notification::Degraded(5), Notification::Restored]
    );
    assert_eq!(watchdog.consecutive_failures(), 0);
}

#[tokio::test]
async fn test_escalation_repeats_every_fifth_failure() {
    let connection = Arc::new(ScriptedConnection::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let mut watchdog = watchdog(&connection, &notifier);

    for _ in 0..14 {
        watchdog.cycle().await;
    }

    assert_eq!(
        notifier.notifications(),
        vec![Notification::Degraded(5), Notification::Degraded(10)]
    );
    assert_eq!(connection.reconnects.load(Ordering::SeqCst), 14);
}

#[tokio::test]
async fn test_successful_reconnect_resets_counter_without_notification() {
    let connection = Arc::new(ScriptedConnection::default());
    let notifier = Arc::new(RecordingNotifier::default());
    let mut watchdog = watchdog(&connection, &notifier);

    for _ in 0..3 {
        watchdog.cycle().await;
    }
    connection.set_reconnect_succeeds(true);
    watchdog.cycle().await;

    assert_eq!(watchdog.consecutive_failures(), 0);
    assert!(notifier.notifications().is_empty());
}

#[tokio::test]
async fn test_healthy_ping_skips_reconnect() {
    let connection = Arc::new(ScriptedConnection::default());
    connection.set_healthy(true);
    let notifier = Arc::new(RecordingNotifier::default());
    let mut watchdog = watchdog(&connection, &notifier);

    watchdog.cycle().await;

    assert_eq!(connection.pings.load(Ordering::SeqCst), 1);
    assert_eq!(connection.reconnects.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn test_run_probes_at_ping_interval_until_cancelled() {
    let connection = Arc::new(ScriptedConnection::default());
    connection.set_healthy(true);
    let notifier = Arc::new(RecordingNotifier::default());
    let cancel = CancellationToken::new();

    let task = tokio::spawn(watchdog(&connection, &notifier).run(cancel.clone()));

    tokio::time::sleep(Duration::from_secs(95)).await;
    cancel.cancel();
    task.await.unwrap();

    // first probe one interval after start: 30s, 60s, 90s
    assert_eq!(connection.pings.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_watchdog_without_notifier_keeps_retrying() {
    let connection = Arc::new(ScriptedConnection::default());
    let mut watchdog = ConnectionWatchdog::new(connection.clone(), None, Duration::from_secs(30));

    for _ in 0..6 {
        watchdog.cycle().await;
    }

    assert_eq!(watchdog.consecutive_failures(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_startup_retries_and_escalates() {
    let connection = ScriptedConnection::default();
    connection.script_initialize(
        (0..6)
            .map(|_| Err(ConnectionError::Timeout("connect")))
            .collect(),
    );
    let notifier = RecordingNotifier::default();
    let cancel = CancellationToken::new();

    let result = connect_with_retry(
        &connection,
        Some(&notifier),
        Duration::from_secs(5),
        &cancel,
    )
    .await;

    assert_matches!(result, Ok(Startup::Connected));
    assert_eq!(connection.initializations.load(Ordering::SeqCst), 7);
    assert_eq!(
        notifier.notifications(),
        vec![Notification::Degraded(5), Notification::Restored]
    );
}

#[tokio::test(start_paused = true)]
async fn test_startup_aborts_on_fatal_error() {
    let connection = ScriptedConnection::default();
    connection.script_initialize(vec![
        Err(ConnectionError::Closed),
        Err(ConnectionError::Rejected("unknown user".to_string())),
    ]);
    let notifier = RecordingNotifier::default();

    let result = connect_with_retry(
        &connection,
        Some(&notifier),
        Duration::from_secs(5),
        &CancellationToken::new(),
    )
    .await;

    assert_matches!(result, Err(ConnectionError::Rejected(_)));
    assert_eq!(connection.initializations.load(Ordering::SeqCst), 2);
    assert!(notifier.notifications().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_startup_stops_when_cancelled() {
    let connection = ScriptedConnection::default();
    connection.script_initialize(
        (0..100)
            .map(|_| Err(ConnectionError::Timeout("connect")))
            .collect(),
    );
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = connect_with_retry(&connection, None, Duration::from_secs(5), &cancel).await;

    // a shutdown request is not a connection failure
    assert_matches!(result, Ok(Startup::Cancelled));
    assert_eq!(connection.initializations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_watchdog_reconnects_real_connection_after_drop() {
    let server = FakeAlertServer::new();
    let connection = server.connect();
    let notifier = Arc::new(RecordingNotifier::default());
    connect_with_retry(
        &*connection,
        Some(&*notifier),
        Duration::from_millis(10),
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    server.drop_connections();

    let mut watchdog = ConnectionWatchdog::new(
        connection.clone(),
        Some(notifier.clone() as Arc<dyn NotificationSink>),
        Duration::from_secs(30),
    );
    watchdog.cycle().await;

    assert_eq!(connection.state(), SessionState::Authenticated);
    assert_eq!(server.dials(), 2);
    assert_eq!(watchdog.consecutive_failures(), 0);
    assert!(notifier.notifications().is_empty());
}
