//! End-to-end evaluation scenarios
//!
//! These tests verify:
//! - Threshold crossing with and without alert delay
//! - Highest crossed level reported on the wire
//! - Weather data flowing from the HTTP source through the collector into
//!   state changes received by the alert server

use std::sync::{Arc, Mutex};
use std::time::Duration;

use sensor_client::actors::collector::DataCollector;
use sensor_client::actors::evaluator::SensorEvaluator;
use sensor_client::connection::protocol::{Direction, MessageKind, SensorRegistration};
use sensor_client::connection::ServerConnection;
use sensor_client::sensors::{Extreme, Location, Measurement, MeasurementSource, TriggerState};
use sensor_client::weather::HttpWeatherSource;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

/// Measurement source returning whatever the test sets
#[derive(Default)]
struct ManualSource(Mutex<Option<f64>>);

impl ManualSource {
    fn set(&self, value: f64) {
        *self.0.lock().unwrap() = Some(value);
    }
}

impl MeasurementSource for ManualSource {
    fn value(&self, _: &Location, _: &Measurement) -> Option<f64> {
        *self.0.lock().unwrap()
    }
}

async fn connected_server() -> (Arc<FakeAlertServer>, Arc<ServerConnection>) {
    let server = FakeAlertServer::new();
    let connection = server.connect();
    assert!(connection.initialize_communication().await);
    (server, connection)
}

fn sent_states(server: &FakeAlertServer) -> Vec<u64> {
    server
        .received_of(MessageKind::StateChange, Direction::Request)
        .iter()
        .map(|frame| frame.payload["state"].as_u64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_scenario_immediate_trigger() {
    let (server, connection) = connected_server().await;
    let source = Arc::new(ManualSource::default());
    let mut evaluator = SensorEvaluator::new(
        vec![create_test_sensor(1, vec![20], 0)],
        source.clone(),
        connection,
        Duration::from_secs(1),
    );
    let start = Instant::now();

    for (cycle, value) in [15.0, 25.0, 25.0].into_iter().enumerate() {
        source.set(value);
        evaluator
            .poll_cycle(start + Duration::from_secs(cycle as u64))
            .await;
    }

    assert_eq!(sent_states(&server), vec![1]);
    assert_eq!(evaluator.trigger_state(1), Some(TriggerState::Triggered));
}

#[tokio::test]
async fn test_scenario_short_spike_is_debounced() {
    let (server, connection) = connected_server().await;
    let source = Arc::new(ManualSource::default());
    let mut evaluator = SensorEvaluator::new(
        vec![create_test_sensor(1, vec![20], 60)],
        source.clone(),
        connection,
        Duration::from_secs(1),
    );
    let start = Instant::now();

    source.set(25.0);
    evaluator.poll_cycle(start).await;
    evaluator.poll_cycle(start + Duration::from_secs(15)).await;
    source.set(15.0);
    evaluator.poll_cycle(start + Duration::from_secs(30)).await;
    evaluator.poll_cycle(start + Duration::from_secs(120)).await;

    assert!(sent_states(&server).is_empty());
    assert_eq!(evaluator.trigger_state(1), Some(TriggerState::Normal));
}

#[tokio::test]
async fn test_highest_crossed_level_is_reported() {
    let (server, connection) = connected_server().await;
    let source = Arc::new(ManualSource::default());
    let mut evaluator = SensorEvaluator::new(
        vec![create_test_sensor(1, vec![30, 10, 20], 0)],
        source.clone(),
        connection,
        Duration::from_secs(1),
    );

    source.set(20.0);
    evaluator.poll_cycle(Instant::now()).await;

    let changes = server.received_of(MessageKind::StateChange, Direction::Request);
    assert_eq!(changes.len(), 1);
    assert_eq!(changes[0].payload["alertLevel"], 20);
}

#[tokio::test]
async fn test_events_queued_while_disconnected_are_sent_in_order() {
    let (server, connection) = connected_server().await;
    let source = Arc::new(ManualSource::default());
    let mut evaluator = SensorEvaluator::new(
        vec![create_test_sensor(1, vec![20], 0)],
        source.clone(),
        connection.clone(),
        Duration::from_secs(1),
    );
    let start = Instant::now();

    server.drop_connections();
    assert!(!connection.ping().await);

    source.set(25.0);
    evaluator.poll_cycle(start).await;
    source.set(15.0);
    evaluator.poll_cycle(start + Duration::from_secs(1)).await;
    assert_eq!(evaluator.backlog_len(), 2);

    assert!(connection.reconnect().await);
    evaluator.poll_cycle(start + Duration::from_secs(2)).await;

    assert_eq!(sent_states(&server), vec![1, 0]);
    assert_eq!(evaluator.backlog_len(), 0);
}

#[tokio::test]
async fn test_weather_pipeline_end_to_end() {
    let weather = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/KEY/conditions/forecast/q/DE/Berlin.json"))
        .respond_with(ResponseTemplate::new(200).set_body_json(create_weather_json(31.5, "40%")))
        .mount(&weather)
        .await;

    let source = HttpWeatherSource::new(weather.uri(), "KEY", Duration::from_secs(5)).unwrap();
    let mut collector = DataCollector::new(Arc::new(source), Duration::from_secs(600), 5);

    let hot = create_test_sensor(1, vec![30], 0);
    let mut rainy = create_test_sensor(2, vec![50], 0);
    rainy.measurement = Measurement::ForecastRain { day: 1 };
    let mut cold_night = create_test_sensor(3, vec![10], 0);
    cold_night.measurement = Measurement::ForecastTemperature {
        day: 0,
        extreme: Extreme::Low,
    };
    let sensors = vec![hot, rainy, cold_night];

    for sensor in &sensors {
        collector.add_location(sensor.location.clone());
    }
    assert_eq!(collector.locations().len(), 1);

    let cancel = CancellationToken::new();
    let handle = collector.start(cancel.clone());
    let summary = handle.poll_now().await.unwrap();
    assert_eq!(summary.failed, 0);

    let server = FakeAlertServer::new();
    let connection = Arc::new(ServerConnection::new(
        server.clone(),
        create_connection_settings(),
        sensors.iter().map(SensorRegistration::from).collect(),
    ));
    assert!(connection.initialize_communication().await);

    let mut evaluator = SensorEvaluator::new(
        sensors,
        Arc::new(handle),
        connection,
        Duration::from_secs(1),
    );
    evaluator.poll_cycle(Instant::now()).await;

    let mut triggered: Vec<u64> = server
        .received_of(MessageKind::StateChange, Direction::Request)
        .iter()
        .map(|frame| frame.payload["clientSensorId"].as_u64().unwrap())
        .collect();
    triggered.sort_unstable();

    // 31.5 >= 30, 80% rain tomorrow >= 50, tonight's low of 12 >= 10
    assert_eq!(triggered, vec![1, 2, 3]);

    cancel.cancel();
}
