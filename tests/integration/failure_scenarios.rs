//! Failure tests for the weather collector
//!
//! These tests verify that the collector handles failures gracefully:
//! - Network failures
//! - HTTP errors and weather API errors
//! - Malformed data
//! - Stale data served until the failure limit is exceeded

use std::sync::Arc;
use std::time::Duration;

use sensor_client::actors::collector::DataCollector;
use sensor_client::sensors::{Location, Measurement};
use sensor_client::weather::HttpWeatherSource;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

const BERLIN_PATH: &str = "/api/KEY/conditions/forecast/q/DE/Berlin.json";

fn berlin() -> Location {
    Location::new("DE", "Berlin")
}

fn collector(base_url: &str, max_failures: u32) -> DataCollector {
    let source = HttpWeatherSource::new(base_url, "KEY", Duration::from_secs(2)).unwrap();
    let mut collector = DataCollector::new(Arc::new(source), Duration::from_secs(600), max_failures);
    collector.add_location(berlin());
    collector
}

#[tokio::test]
async fn test_collector_handles_source_unreachable() {
    // nothing listens on this port
    let cancel = CancellationToken::new();
    let handle = collector("http://127.0.0.1:9", 5).start(cancel.clone());

    let summary = handle.poll_now().await.unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(handle.get_value(&berlin(), &Measurement::Temperature), None);

    cancel.cancel();
}

#[tokio::test]
async fn test_collector_handles_500_error() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(BERLIN_PATH))
        .respond_with(ResponseTemplate::new(500))
        .mount(&mock_server)
        .await;

    let cancel = CancellationToken::new();
    let handle = collector(&mock_server.uri(), 5).start(cancel.clone());

    let summary = handle.poll_now().await.unwrap();
    assert_eq!(summary.failed, 1);

    let entry = handle.entry(&berlin()).unwrap();
    assert!(entry.bundle.is_none());
    assert!(entry.consecutive_failures >= 1);

    cancel.cancel();
}

#[tokio::test]
async fn test_collector_handles_api_error_and_malformed_body() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(BERLIN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "response": { "error": { "type": "keynotfound", "description": "invalid key" } }
        })))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path(BERLIN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_string("{invalid json"))
        .mount(&mock_server)
        .await;

    let cancel = CancellationToken::new();
    let handle = collector(&mock_server.uri(), 5).start(cancel.clone());

    let summary = handle.poll_now().await.unwrap();
    assert_eq!(summary.failed, 1);
    let summary = handle.poll_now().await.unwrap();
    assert_eq!(summary.failed, 1);

    assert_eq!(handle.get_value(&berlin(), &Measurement::Humidity), None);

    cancel.cancel();
}

#[tokio::test]
async fn test_stale_value_served_until_failure_limit() {
    let mock_server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(BERLIN_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(create_weather_json(18.0, "55%")))
        .up_to_n_times(1)
        .mount(&mock_server)
        .await;
    Mock::given(method("GET"))
        .and(path(BERLIN_PATH))
        .respond_with(ResponseTemplate::new(503))
        .mount(&mock_server)
        .await;

    let cancel = CancellationToken::new();
    let handle = collector(&mock_server.uri(), 2).start(cancel.clone());

    // the first fetch (initial tick or poll) gets the only good response
    assert!(
        wait_until(Duration::from_secs(2), || {
            handle
                .entry(&berlin())
                .is_some_and(|entry| entry.bundle.is_some())
        })
        .await
    );

    let humidity = handle.get_value(&berlin(), &Measurement::Humidity);
    assert_eq!(humidity, Some(55.0));
    // reads between fetches are identical
    assert_eq!(handle.get_value(&berlin(), &Measurement::Humidity), humidity);

    while handle.entry(&berlin()).unwrap().consecutive_failures < 2 {
        handle.poll_now().await.unwrap();
    }
    assert_eq!(handle.get_value(&berlin(), &Measurement::Temperature), Some(18.0));

    handle.poll_now().await.unwrap();
    assert_eq!(handle.get_value(&berlin(), &Measurement::Temperature), None);

    cancel.cancel();
}

#[tokio::test]
async fn test_shutdown_command_stops_collector() {
    let mock_server = MockServer::start().await;
    let handle = collector(&mock_server.uri(), 5).start(CancellationToken::new());

    handle.shutdown().await.unwrap();

    // the actor exits and drops its receiver, so later commands fail
    let stopped = tokio::time::timeout(Duration::from_secs(1), async {
        while handle.poll_now().await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(stopped.is_ok());
}
