//! End-to-end aggregation tests against mocked feed endpoints.
//!
//! Each test starts a `wiremock` server standing in for the upstream
//! meteorological JSON API and the CAP Atom feed, then drives the real
//! fetch, parse and merge path through `Aggregator`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

use hazardwatch::feed::{
    create_http_client, fetch_source, AlertPolicy, FetchErrorKind, Severity, SYSTEM_SOURCE,
};
use hazardwatch::{AlertProvider, Aggregator, Poller, SourceDescriptor};

// ---- Helpers ----------------------------------------------------------------

const WARNINGS_JSON: &str = r#"[
    {"id": "w1", "warning_type": "Heavy Rainfall", "message": "Extremely heavy rain likely",
     "severity": "High", "district": "Punjab", "valid_from": "2024-07-01T06:00:00Z"}
]"#;

const CAP_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom" xmlns:cap="urn:oasis:names:tc:emergency:cap:1.2">
  <entry>
    <id>e1</id>
    <title>Flood Watch</title>
    <updated>2024-07-02T06:00:00Z</updated>
    <summary>Sutlej above danger mark</summary>
    <cap:severity>Moderate</cap:severity>
    <cap:areaDesc>Punjab</cap:areaDesc>
  </entry>
</feed>"#;

fn three_entry_feed() -> String {
    let mut body = String::from(r#"<feed xmlns:cap="urn:oasis:names:tc:emergency:cap:1.2">"#);
    for (i, area) in ["Assam", "Kerala", "Odisha"].iter().enumerate() {
        body.push_str(&format!(
            "<entry><id>x{i}</id><title>Alert {i}</title><updated>2024-07-0{d}T00:00:00Z</updated><cap:areaDesc>{area}</cap:areaDesc></entry>",
            d = i + 1
        ));
    }
    body.push_str("</feed>");
    body
}

async fn mount(server: &MockServer, route: &str, response: ResponseTemplate) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(response)
        .mount(server)
        .await;
}

fn sources(server: &MockServer) -> Vec<SourceDescriptor> {
    vec![
        SourceDescriptor::json(format!("{}/warnings", server.uri())).with_timeout_ms(500),
        SourceDescriptor::xml(format!("{}/cap.xml", server.uri())).with_timeout_ms(500),
    ]
}

async fn aggregate(server: &MockServer, region: &str) -> Vec<hazardwatch::AlertRecord> {
    let aggregator = Aggregator::new(sources(server), AlertPolicy::default()).unwrap();
    aggregator.aggregate(region, &CancellationToken::new()).await
}

// ---- Tests ------------------------------------------------------------------

#[tokio::test]
async fn both_sources_merge_for_matching_region() {
    let server = MockServer::start().await;
    mount(&server, "/warnings", ResponseTemplate::new(200).set_body_string(WARNINGS_JSON)).await;
    mount(&server, "/cap.xml", ResponseTemplate::new(200).set_body_string(CAP_FEED)).await;

    let alerts = aggregate(&server, "Punjab").await;

    assert_eq!(alerts.len(), 2);
    // The XML entry is a day newer, so it sorts first.
    assert_eq!(alerts[0].id, "e1");
    assert_eq!(alerts[0].severity, Severity::Moderate);
    assert_eq!(alerts[1].id, "w1");
    assert_eq!(alerts[1].severity, Severity::Severe);
    assert!(alerts.iter().all(|a| a.area == "Punjab"));
}

#[tokio::test]
async fn failing_source_does_not_hide_the_other() {
    let server = MockServer::start().await;
    mount(&server, "/warnings", ResponseTemplate::new(500)).await;
    mount(&server, "/cap.xml", ResponseTemplate::new(200).set_body_string(three_entry_feed())).await;

    let alerts = aggregate(&server, "All India").await;

    assert_eq!(alerts.len(), 3);
    assert!(alerts.iter().all(|a| a.source != SYSTEM_SOURCE));
    assert_eq!(alerts[0].id, "x2");
}

#[tokio::test]
async fn malformed_json_counts_as_source_failure() {
    let server = MockServer::start().await;
    mount(&server, "/warnings", ResponseTemplate::new(200).set_body_string("[{\"id\": ")).await;
    mount(&server, "/cap.xml", ResponseTemplate::new(200).set_body_string(CAP_FEED)).await;

    let alerts = aggregate(&server, "All India").await;

    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].id, "e1");
}

#[tokio::test]
async fn all_sources_failing_yields_placeholder() {
    let server = MockServer::start().await;
    mount(&server, "/warnings", ResponseTemplate::new(404)).await;
    mount(&server, "/cap.xml", ResponseTemplate::new(200).set_body_string("<html>proxy error</html>")).await;

    let alerts = aggregate(&server, "Punjab").await;

    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].source, SYSTEM_SOURCE);
    assert_eq!(alerts[0].severity, Severity::Moderate);
}

#[tokio::test]
async fn unknown_region_filters_to_empty() {
    let server = MockServer::start().await;
    mount(&server, "/warnings", ResponseTemplate::new(200).set_body_string(WARNINGS_JSON)).await;
    mount(&server, "/cap.xml", ResponseTemplate::new(200).set_body_string(CAP_FEED)).await;

    assert!(aggregate(&server, "Sikkim").await.is_empty());
    assert_eq!(aggregate(&server, "All India").await.len(), 2);
}

#[tokio::test]
async fn slow_source_times_out_without_stalling_the_other() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/warnings",
        ResponseTemplate::new(200)
            .set_body_string(WARNINGS_JSON)
            .set_delay(Duration::from_secs(5)),
    )
    .await;
    mount(&server, "/cap.xml", ResponseTemplate::new(200).set_body_string(CAP_FEED)).await;

    let started = Instant::now();
    let alerts = aggregate(&server, "All India").await;

    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].id, "e1");
}

#[tokio::test]
async fn fetch_errors_are_typed() {
    let server = MockServer::start().await;
    mount(&server, "/missing", ResponseTemplate::new(503)).await;
    mount(&server, "/empty", ResponseTemplate::new(200).set_body_string("  ")).await;
    mount(
        &server,
        "/slow",
        ResponseTemplate::new(200)
            .set_body_string("[]")
            .set_delay(Duration::from_secs(5)),
    )
    .await;

    let client = create_http_client().unwrap();
    let cancel = CancellationToken::new();

    let missing = SourceDescriptor::json(format!("{}/missing", server.uri()));
    let err = fetch_source(&client, &missing, &cancel).await.unwrap_err();
    assert_eq!(err.kind, FetchErrorKind::HttpStatus);
    assert_eq!(err.status, Some(503));

    let empty = SourceDescriptor::json(format!("{}/empty", server.uri()));
    let err = fetch_source(&client, &empty, &cancel).await.unwrap_err();
    assert_eq!(err.kind, FetchErrorKind::EmptyBody);

    let slow = SourceDescriptor::json(format!("{}/slow", server.uri())).with_timeout_ms(200);
    let err = fetch_source(&client, &slow, &cancel).await.unwrap_err();
    assert_eq!(err.kind, FetchErrorKind::Timeout);

    // Nothing listens on port 9 (discard) on test machines.
    let unreachable = SourceDescriptor::json("http://127.0.0.1:9/warnings").with_timeout_ms(2000);
    let err = fetch_source(&client, &unreachable, &cancel).await.unwrap_err();
    assert_eq!(err.kind, FetchErrorKind::Network);
}

#[tokio::test]
async fn cancelled_fetch_returns_promptly() {
    let server = MockServer::start().await;
    mount(
        &server,
        "/slow",
        ResponseTemplate::new(200)
            .set_body_string("[]")
            .set_delay(Duration::from_secs(5)),
    )
    .await;

    let client = create_http_client().unwrap();
    let cancel = CancellationToken::new();
    let source = SourceDescriptor::json(format!("{}/slow", server.uri()));

    let canceller = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        canceller.cancel();
    });

    let started = Instant::now();
    let err = fetch_source(&client, &source, &cancel).await.unwrap_err();
    assert_eq!(err.kind, FetchErrorKind::Cancelled);
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn poller_publishes_aggregated_snapshot() {
    let server = MockServer::start().await;
    mount(&server, "/warnings", ResponseTemplate::new(200).set_body_string(WARNINGS_JSON)).await;
    mount(&server, "/cap.xml", ResponseTemplate::new(200).set_body_string(CAP_FEED)).await;

    let aggregator = Arc::new(Aggregator::new(sources(&server), AlertPolicy::default()).unwrap());
    let poller = Poller::with_region(aggregator, "Punjab");
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _subscription = poller.subscribe(move |snapshot| {
        let _ = tx.send(snapshot.len());
    });

    poller.start(60).unwrap();
    let first = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first, 2);

    let refreshed = poller.refresh().await.unwrap();
    assert_eq!(refreshed.len(), 2);

    poller.stop().await;
    assert_eq!(poller.latest().unwrap().len(), 2);
}
