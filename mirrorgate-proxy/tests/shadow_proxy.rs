//! End-to-end dispatcher behavior against mock baseline/candidate upstreams.

mod helpers;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use helpers::{MockUpstream, ProxyHarness, body_bytes, config_for, dead_addr};
use mirrorgate_core::config::MirrorConfig;
use std::time::{Duration, Instant};

#[tokio::test]
async fn test_baseline_response_passes_through_verbatim() {
    let (baseline_addr, baseline) = MockUpstream::new()
        .with_status(StatusCode::CREATED)
        .with_header("x-upstream", "v1")
        .with_body(r#"{"id":7}"#)
        .start()
        .await;
    let (candidate_addr, candidate) = MockUpstream::new().start().await;

    let harness = ProxyHarness::new(MirrorConfig {
        mirror_fraction: 0.0,
        ..config_for(baseline_addr, candidate_addr)
    });

    let request = Request::builder()
        .method("POST")
        .uri("/orders?dry_run=true")
        .header("host", "proxy.example:8080")
        .header("x-tenant", "acme")
        .body(Body::from(r#"{"qty":2}"#))
        .unwrap();
    let response = harness.send(request).await;

    assert_eq!(response.status(), StatusCode::CREATED);
    assert_eq!(response.headers().get("x-upstream").unwrap(), "v1");
    assert_eq!(body_bytes(response).await, r#"{"id":7}"#);

    let seen = baseline.last_request().await.unwrap();
    assert_eq!(seen.method, "POST");
    assert_eq!(seen.path_and_query, "/orders?dry_run=true");
    assert_eq!(seen.headers.get("x-tenant").unwrap(), "acme");
    assert_ne!(seen.headers.get("host").unwrap(), "proxy.example:8080");
    assert_eq!(seen.body, r#"{"qty":2}"#);

    harness.drain_mirrors().await;
    assert_eq!(candidate.request_count().await, 0);
}

#[tokio::test]
async fn test_dead_baseline_returns_502_and_skips_mirror() {
    let (candidate_addr, candidate) = MockUpstream::new().start().await;
    let harness = ProxyHarness::new(config_for(dead_addr(), candidate_addr));

    let response = harness.request("GET", "/health/deep").await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_bytes(response).await, "baseline upstream error\n");

    harness.drain_mirrors().await;
    assert_eq!(candidate.request_count().await, 0);

    // Baseline attempt is still counted.
    let metrics = harness.metrics_text();
    assert!(metrics.contains(r#"mirror_requests_total{route="GET /health/deep",target="baseline"} 1"#));
    assert!(!metrics.contains(r#"target="candidate""#));
}

#[tokio::test]
async fn test_mirror_replays_identical_request() {
    let (baseline_addr, _baseline) = MockUpstream::new()
        .with_body(r#"{"ok":true,"timestamp":"t1"}"#)
        .start()
        .await;
    let (candidate_addr, candidate) = MockUpstream::new()
        .with_body(r#"{"timestamp":"t2","ok":true}"#)
        .start()
        .await;
    let harness = ProxyHarness::new(config_for(baseline_addr, candidate_addr));

    let request = Request::builder()
        .method("PUT")
        .uri("/items/9?force=1")
        .header("x-tenant", "acme")
        .body(Body::from("payload"))
        .unwrap();
    let response = harness.send(request).await;
    assert_eq!(response.status(), StatusCode::OK);

    harness.drain_mirrors().await;
    assert_eq!(candidate.request_count().await, 1);

    let seen = candidate.last_request().await.unwrap();
    assert_eq!(seen.method, "PUT");
    assert_eq!(seen.path_and_query, "/items/9?force=1");
    assert_eq!(seen.headers.get("x-tenant").unwrap(), "acme");
    assert_eq!(seen.body, "payload");

    let metrics = harness.metrics_text();
    assert!(metrics.contains(r#"mirror_requests_total{route="PUT /items/9",target="candidate"} 1"#));
    assert!(!metrics.contains("mirror_diff_mismatches_total{"));
    assert_eq!(harness.guardrail.status().breach_streak, 0);
}

#[tokio::test]
async fn test_structural_mismatch_is_counted() {
    let (baseline_addr, _baseline) = MockUpstream::new()
        .with_body(r#"{"amount":5}"#)
        .start()
        .await;
    let (candidate_addr, _candidate) = MockUpstream::new()
        .with_body(r#"{"amount":6}"#)
        .start()
        .await;
    let harness = ProxyHarness::new(config_for(baseline_addr, candidate_addr));

    harness.request("GET", "/price").await;
    harness.drain_mirrors().await;

    let metrics = harness.metrics_text();
    assert!(metrics.contains(r#"mirror_diff_mismatches_total{route="GET /price"} 1"#));
}

#[tokio::test]
async fn test_empty_body_skips_diff() {
    let (baseline_addr, _baseline) = MockUpstream::new().start().await;
    let (candidate_addr, candidate) = MockUpstream::new()
        .with_body(r#"{"unexpected":true}"#)
        .start()
        .await;
    let harness = ProxyHarness::new(config_for(baseline_addr, candidate_addr));

    harness.request("DELETE", "/items/1").await;
    harness.drain_mirrors().await;

    assert_eq!(candidate.request_count().await, 1);
    assert!(!harness.metrics_text().contains("mirror_diff_mismatches_total{"));
}

#[tokio::test]
async fn test_baseline_5xx_is_served_and_mirrored() {
    let (baseline_addr, _baseline) = MockUpstream::new()
        .with_status(StatusCode::SERVICE_UNAVAILABLE)
        .with_body("down")
        .start()
        .await;
    let (candidate_addr, candidate) = MockUpstream::new()
        .with_status(StatusCode::INTERNAL_SERVER_ERROR)
        .with_body("down")
        .start()
        .await;
    let harness = ProxyHarness::new(config_for(baseline_addr, candidate_addr));

    let response = harness.request("GET", "/flaky").await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    harness.drain_mirrors().await;
    assert_eq!(candidate.request_count().await, 1);
    // Both sides erroring is not a candidate regression.
    assert_eq!(harness.guardrail.status().breach_streak, 0);
}

#[tokio::test]
async fn test_candidate_errors_trip_guardrail() {
    let (baseline_addr, _baseline) = MockUpstream::new().with_body("ok").start().await;
    let (candidate_addr, candidate) = MockUpstream::new()
        .with_status(StatusCode::INTERNAL_SERVER_ERROR)
        .with_body("boom")
        .start()
        .await;
    let harness = ProxyHarness::new(MirrorConfig {
        breach_consecutive: 3,
        cooldown: Duration::from_secs(60),
        ..config_for(baseline_addr, candidate_addr)
    });

    for _ in 0..3 {
        let response = harness.request("GET", "/checkout").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_bytes(response).await, "ok");
        harness.drain_mirrors().await;
    }

    let status = harness.guardrail.status();
    assert!(!status.enabled);
    assert_eq!(status.breach_streak, 0);
    assert!(status.last_abort_reason.contains("route=GET /checkout"));
    assert!(status.last_abort_reason.contains("candidateErr=true"));
    assert_eq!(harness.metrics.aborts_total.get(), 1);
    assert_eq!(harness.metrics.enabled.get(), 0);

    // Clients keep being served; the candidate no longer sees traffic.
    let response = harness.request("GET", "/checkout").await;
    assert_eq!(response.status(), StatusCode::OK);
    harness.drain_mirrors().await;
    assert_eq!(candidate.request_count().await, 3);
}

#[tokio::test]
async fn test_candidate_timeout_counts_as_error() {
    let (baseline_addr, _baseline) = MockUpstream::new().with_body("ok").start().await;
    let (candidate_addr, _candidate) = MockUpstream::new()
        .with_body("ok")
        .with_delay(Duration::from_secs(2))
        .start()
        .await;
    let harness = ProxyHarness::new(MirrorConfig {
        mirror_timeout: Duration::from_millis(200),
        ..config_for(baseline_addr, candidate_addr)
    });

    harness.request("GET", "/slow").await;
    harness.drain_mirrors().await;

    assert_eq!(harness.guardrail.status().breach_streak, 1);
}

#[tokio::test]
async fn test_slow_candidate_does_not_delay_client() {
    let (baseline_addr, _baseline) = MockUpstream::new().with_body("fast").start().await;
    let (candidate_addr, candidate) = MockUpstream::new()
        .with_body("fast")
        .with_delay(Duration::from_secs(2))
        .start()
        .await;
    let harness = ProxyHarness::new(config_for(baseline_addr, candidate_addr));

    let start = Instant::now();
    let response = harness.request("GET", "/latency").await;
    assert_eq!(body_bytes(response).await, "fast");
    assert!(start.elapsed() < Duration::from_secs(1));

    harness.drain_mirrors().await;
    assert_eq!(candidate.request_count().await, 1);
}

#[tokio::test]
async fn test_in_flight_limit_drops_excess_mirrors() {
    let (baseline_addr, _baseline) = MockUpstream::new().with_body("ok").start().await;
    let (candidate_addr, candidate) = MockUpstream::new()
        .with_body("ok")
        .with_delay(Duration::from_millis(500))
        .start()
        .await;
    let harness = ProxyHarness::new(MirrorConfig {
        mirror_max_in_flight: 1,
        ..config_for(baseline_addr, candidate_addr)
    });

    harness.request("GET", "/a").await;
    harness.request("GET", "/b").await;
    assert_eq!(harness.metrics.in_flight.get(), 1);

    harness.drain_mirrors().await;
    assert_eq!(candidate.request_count().await, 1);
    assert_eq!(harness.metrics.in_flight.get(), 0);
    assert!(
        harness
            .metrics_text()
            .contains(r#"mirror_dropped_total{reason="saturated"} 1"#)
    );
}

#[tokio::test]
async fn test_manual_disable_stops_mirroring() {
    let (baseline_addr, _baseline) = MockUpstream::new().with_body("ok").start().await;
    let (candidate_addr, candidate) = MockUpstream::new().with_body("ok").start().await;
    let harness = ProxyHarness::new(config_for(baseline_addr, candidate_addr));

    harness.guardrail.disable("maintenance");
    harness.request("GET", "/x").await;
    harness.drain_mirrors().await;
    assert_eq!(candidate.request_count().await, 0);

    harness.guardrail.enable("done");
    harness.request("GET", "/x").await;
    harness.drain_mirrors().await;
    assert_eq!(candidate.request_count().await, 1);
}

#[tokio::test]
async fn test_mirror_completes_after_client_hangs_up() {
    let (baseline_addr, _baseline) = MockUpstream::new().with_body("ok").start().await;
    let (candidate_addr, candidate) = MockUpstream::new()
        .with_status(StatusCode::INTERNAL_SERVER_ERROR)
        .with_body("boom")
        .with_delay(Duration::from_millis(300))
        .start()
        .await;
    let harness = ProxyHarness::new(config_for(baseline_addr, candidate_addr));

    let response = harness.request("GET", "/abandoned").await;
    assert_eq!(response.status(), StatusCode::OK);
    // Client goes away without reading the body.
    drop(response);
    assert_eq!(harness.guardrail.status().breach_streak, 0);

    harness.drain_mirrors().await;
    assert_eq!(candidate.request_count().await, 1);
    assert_eq!(harness.guardrail.status().breach_streak, 1);
}

#[tokio::test]
async fn test_client_disconnect_abandons_baseline_and_mirror() {
    let (baseline_addr, baseline) = MockUpstream::new()
        .with_body("late")
        .with_delay(Duration::from_millis(500))
        .start()
        .await;
    let (candidate_addr, candidate) = MockUpstream::new().start().await;
    let harness = ProxyHarness::new(config_for(baseline_addr, candidate_addr));

    // Dropping the in-flight request future is a client disconnect.
    let pending = harness.request("GET", "/gone");
    assert!(
        tokio::time::timeout(Duration::from_millis(100), pending)
            .await
            .is_err()
    );

    tokio::time::sleep(Duration::from_millis(700)).await;
    harness.drain_mirrors().await;

    assert_eq!(baseline.request_count().await, 1);
    assert_eq!(candidate.request_count().await, 0);
    // The abandoned baseline call never completed, so nothing was recorded.
    assert!(!harness.metrics_text().contains(r#"route="GET /gone""#));
    assert_eq!(harness.guardrail.status().breach_streak, 0);
}

#[tokio::test]
async fn test_mirroring_does_not_change_client_response() {
    let (baseline_addr, _baseline) = MockUpstream::new()
        .with_status(StatusCode::ACCEPTED)
        .with_header("x-upstream", "v1")
        .with_body(r#"{"id":1}"#)
        .start()
        .await;
    let mirrored = ProxyHarness::new(config_for(baseline_addr, dead_addr()));
    let direct = ProxyHarness::new(MirrorConfig {
        mirror_fraction: 0.0,
        ..config_for(baseline_addr, dead_addr())
    });

    let with_mirror = mirrored.request("GET", "/same").await;
    let without_mirror = direct.request("GET", "/same").await;
    assert_eq!(with_mirror.status(), without_mirror.status());
    assert_eq!(
        with_mirror.headers().get("x-upstream"),
        without_mirror.headers().get("x-upstream")
    );
    assert_eq!(body_bytes(with_mirror).await, body_bytes(without_mirror).await);

    // The unreachable candidate only shows up in the guardrail.
    mirrored.drain_mirrors().await;
    assert_eq!(mirrored.guardrail.status().breach_streak, 1);
}
