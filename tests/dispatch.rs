use bulkflow::config::RecordType;
use bulkflow::testing::*;
use bulkflow::{AdaptiveConfig, Auth, IngestError, Pipeline, RetryConfig, RunConfig};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use wiremock::matchers::{header, header_exists, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config(server: &MockServer) -> RunConfig {
    RunConfig {
        api_base: Some(server.uri()),
        auth: Some(Auth::ApiSecret {
            secret: "test-secret".into(),
        }),
        workers: 2,
        records_per_batch: 5,
        retry: RetryConfig {
            max_retries: 3,
            initial_delay_ms: 1,
            max_delay_ms: 5,
            ..RetryConfig::default()
        },
        adaptive: AdaptiveConfig {
            enabled: false,
            ..AdaptiveConfig::default()
        },
        ..RunConfig::default()
    }
}

fn imported(n: u64) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({ "code": 200, "num_records_imported": n }))
}

#[tokio::test]
async fn every_batch_is_posted_with_credentials() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/import"))
        .and(header_exists("authorization"))
        .and(header("content-type", "application/json"))
        .respond_with(imported(5))
        .expect(4)
        .mount(&server)
        .await;

    let summary = Pipeline::new(config(&server)).run(events(20)).await.unwrap();
    let c = summary.counters;
    assert_eq!((c.total, c.success, c.failed), (20, 20, 0));
    assert_eq!((c.batches, c.requests, c.retries), (4, 4, 0));
    assert_eq!(summary.unaccounted(), 0);
}

#[tokio::test]
async fn partial_failure_logs_the_rejected_record() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/import"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "code": 400,
            "num_records_imported": 4,
            "failed_records": [{ "index": 2, "insert_id": "ins-2", "message": "bad" }]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let summary = Pipeline::new(config(&server)).run(events(5)).await.unwrap();
    assert_eq!(summary.counters.success, 4);
    assert_eq!(summary.counters.failed, 1);
    assert_eq!(summary.counters.retries, 0);
    assert_eq!(summary.failures.len(), 1);
    let f = &summary.failures[0];
    assert_eq!((f.batch, f.index), (0, 2));
    assert_eq!(f.message, "bad");
    assert_eq!(f.record["event"], "event-2");
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(imported(3))
        .mount(&server)
        .await;

    let summary = Pipeline::new(config(&server)).run(events(3)).await.unwrap();
    let c = summary.counters;
    assert_eq!(c.success, 3);
    assert_eq!((c.requests, c.retries, c.server_errors), (3, 2, 2));
    assert_eq!(c.rate_limited, 0);
}

#[tokio::test]
async fn rate_limits_honor_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(imported(2))
        .mount(&server)
        .await;

    let summary = Pipeline::new(config(&server)).run(events(2)).await.unwrap();
    assert_eq!(summary.counters.success, 2);
    assert_eq!(summary.counters.rate_limited, 1);
    assert_eq!(summary.counters.retries, 1);
}

#[tokio::test]
async fn exhausted_retries_fail_the_batch_not_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .expect(2)
        .mount(&server)
        .await;

    let mut cfg = config(&server);
    cfg.retry.max_retries = 1;
    let summary = Pipeline::new(cfg).run(events(4)).await.unwrap();
    assert_eq!(summary.counters.failed, 4);
    assert_eq!(summary.counters.success, 0);
    assert_eq!(summary.failures.len(), 4);
    assert!(summary.failures.iter().all(|f| f.message.contains("500")));
}

#[tokio::test]
async fn rejected_credentials_stop_the_run() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid secret"))
        .mount(&server)
        .await;

    let err = Pipeline::new(config(&server)).run(events(50)).await.unwrap_err();
    match err {
        IngestError::Auth { status, body, .. } => {
            assert_eq!(status.as_u16(), 401);
            assert_eq!(body, "invalid secret");
        }
        other => panic!("expected an auth error, got {other:?}"),
    }
    // The run stops early instead of sending all ten batches.
    let requests = server.received_requests().await.unwrap();
    assert!(requests.len() < 10, "{} requests", requests.len());
}

#[tokio::test]
async fn profile_status_zero_fails_the_batch() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/engage"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": 0, "error": "missing $token" })))
        .expect(1)
        .mount(&server)
        .await;

    let mut cfg = config(&server);
    cfg.record_type = RecordType::User;
    cfg.normalize = false;
    let summary = Pipeline::new(cfg).run(profiles(3)).await.unwrap();
    assert_eq!(summary.counters.failed, 3);
    assert_eq!(summary.failures[0].message, "missing $token");
}

#[tokio::test]
async fn gzip_bodies_are_labelled() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(header("content-encoding", "gzip"))
        .respond_with(imported(5))
        .expect(1)
        .mount(&server)
        .await;

    let mut cfg = config(&server);
    cfg.compress = true;
    let summary = Pipeline::new(cfg).run(events(5)).await.unwrap();
    assert_eq!(summary.counters.success, 5);

    let requests = server.received_requests().await.unwrap();
    assert_eq!(&requests[0].body[..2], &[0x1f, 0x8b]);
}

#[tokio::test]
async fn slow_first_byte_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(imported(1).set_delay(std::time::Duration::from_millis(500)))
        .mount(&server)
        .await;

    let mut cfg = config(&server);
    cfg.first_byte_timeout_ms = 50;
    cfg.retry.max_retries = 0;
    let summary = Pipeline::new(cfg).run(events(1)).await.unwrap();
    assert_eq!(summary.counters.failed, 1);
    assert!(summary.failures[0].message.contains("timed out"), "{}", summary.failures[0].message);
}

#[tokio::test]
async fn hooks_see_outcomes_and_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .respond_with(imported(5))
        .mount(&server)
        .await;

    let outcomes = Arc::new(AtomicU32::new(0));
    let attempts = Arc::new(AtomicU32::new(0));
    let (o, a) = (Arc::clone(&outcomes), Arc::clone(&attempts));
    let mut cfg = config(&server);
    cfg.workers = 1;
    Pipeline::new(cfg)
        .on_response(move |_| {
            o.fetch_add(1, Ordering::Relaxed);
        })
        .on_error(move |_, attempt| {
            a.store(attempt, Ordering::Relaxed);
        })
        .run(events(15))
        .await
        .unwrap();

    assert_eq!(outcomes.load(Ordering::Relaxed), 3);
    assert_eq!(attempts.load(Ordering::Relaxed), 1);
}
