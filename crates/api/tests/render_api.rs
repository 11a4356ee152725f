//! Integration tests for the HTTP render endpoints, using a fake engine and
//! in-memory storage behind the production router.

mod common;

use std::sync::atomic::Ordering;
use std::time::Duration;

use axum::http::StatusCode;
use common::*;
use folio_core::quota::UsageLedger;
use folio_core::types::PartitionKey;
use folio_pool::PoolStats;
use serde_json::json;

/// Poll the caller's pool until `done` holds.
async fn wait_for_pool(app: &TestApp, caller_id: i64, done: impl Fn(&PoolStats) -> bool) -> PoolStats {
    let partition = PartitionKey::for_caller(caller_id);
    for _ in 0..1000 {
        if let Some(stats) = app.state.pools.stats(&partition).await {
            if done(&stats) {
                return stats;
            }
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pool never reached the expected state");
}

// ---------------------------------------------------------------------------
// Test: health check reports pools and sessions
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn health_check_reports_ok() {
    let app = build_test_app();

    let response = get(&app.router, "/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["pools"], 0);
    assert_eq!(json["sessions"], 0);
    assert!(json.get("db_healthy").is_none());
}

// ---------------------------------------------------------------------------
// Test: a rendered job returns its output URL and rate headers
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn render_returns_output_and_rate_headers() {
    let app = build_test_app();

    let response = post_json(
        &app.router,
        "/api/v1/render",
        Some(FREE_KEY),
        json!({ "html": "<h1>Invoice</h1>", "metadata": { "order": 42 } }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-limit"), "20");
    assert_eq!(header(&response, "x-ratelimit-remaining"), "19");
    assert!(header(&response, "x-ratelimit-reset").parse::<i64>().is_ok());

    let json = body_json(response).await;
    assert_eq!(json["success"], true);
    assert!(json["output_url"]
        .as_str()
        .unwrap()
        .starts_with("https://files.test/caller-1/"));
    assert_eq!(json["metadata"]["order"], 42);
    assert!(json.get("error").is_none());

    assert_eq!(app.storage.upload_count(), 1);
    let record = app.ledger.current(&caller(1)).await.unwrap().unwrap();
    assert_eq!(record.used, 1);
    assert_eq!(record.reserved, 0);
}

// ---------------------------------------------------------------------------
// Test: missing and unknown keys are rejected
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn render_requires_a_known_key() {
    let app = build_test_app();

    let response = post_json(&app.router, "/api/v1/render", None, html_job("<p>x</p>")).await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["code"], "UNAUTHORIZED");

    let response = post_json(
        &app.router,
        "/api/v1/render",
        Some("not-a-real-key-000000000"),
        html_job("<p>x</p>"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert_eq!(app.engine.renders.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Test: an invalid job is refused without spending a rate token
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn invalid_job_does_not_consume_rate_token() {
    let app = build_test_app();

    let response = post_json(&app.router, "/api/v1/render", Some(FREE_KEY), html_job("   ")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(header(&response, "x-ratelimit-remaining"), "20");

    let json = body_json(response).await;
    assert_eq!(json["code"], "INVALID_REQUEST");
    assert_eq!(json["retryable"], false);

    let response = post_json(
        &app.router,
        "/api/v1/render",
        Some(FREE_KEY),
        json!({ "url": "ftp://example.com/report" }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    assert!(app.ledger.current(&caller(1)).await.unwrap().is_none());
}

// ---------------------------------------------------------------------------
// Test: free tier bursts to 20, then waits six seconds per token
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn burst_is_limited_with_retry_after() {
    let app = build_test_app();

    for i in 0..20 {
        let response =
            post_json(&app.router, "/api/v1/render", Some(FREE_KEY), html_job("<p>x</p>")).await;
        assert_eq!(response.status(), StatusCode::OK, "request {i}");
    }

    let response =
        post_json(&app.router, "/api/v1/render", Some(FREE_KEY), html_job("<p>x</p>")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(header(&response, "retry-after"), "6");
    assert_eq!(header(&response, "x-ratelimit-remaining"), "0");

    let json = body_json(response).await;
    assert_eq!(json["code"], "RATE_LIMITED");
    assert_eq!(json["retryable"], true);
    assert_eq!(json["retry_after_secs"], 6);

    // Another caller has its own bucket.
    let response =
        post_json(&app.router, "/api/v1/render", Some(PRO_KEY), html_job("<p>x</p>")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-limit"), "600");
}

// ---------------------------------------------------------------------------
// Test: exhausted quota refuses further jobs until the period resets
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn quota_exhaustion_is_refused() {
    let app = build_test_app();

    for _ in 0..2 {
        let response = post_json(
            &app.router,
            "/api/v1/render",
            Some(TINY_QUOTA_KEY),
            html_job("<p>x</p>"),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = post_json(
        &app.router,
        "/api/v1/render",
        Some(TINY_QUOTA_KEY),
        html_job("<p>x</p>"),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get("retry-after").is_none());

    let json = body_json(response).await;
    assert_eq!(json["code"], "QUOTA_EXCEEDED");
    assert_eq!(json["retryable"], false);
    assert_eq!(json["remaining"], 0);
    assert!(json["reset_at"].is_string());

    assert_eq!(app.engine.renders.load(Ordering::SeqCst), 2);
}

// ---------------------------------------------------------------------------
// Test: a batch larger than the remaining quota is refused whole
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn batch_larger_than_remaining_quota_is_refused_whole() {
    let app = build_test_app();
    app.ledger.seed_usage(&caller(1), 98);

    let jobs: Vec<_> = (0..3).map(|i| html_job(&format!("<p>{i}</p>"))).collect();
    let response = post_json(
        &app.router,
        "/api/v1/render/batch",
        Some(FREE_KEY),
        json!({ "jobs": jobs }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

    let json = body_json(response).await;
    assert_eq!(json["code"], "QUOTA_EXCEEDED");
    assert_eq!(json["remaining"], 2);
    assert_eq!(app.engine.renders.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Test: batch entries fail independently and keep input order
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn batch_reports_each_job_in_order() {
    let app = build_test_app();

    let jobs = json!({ "jobs": [
        { "html": "<p>0</p>", "metadata": "a" },
        { "html": "<p>1</p>", "metadata": "b" },
        { "html": format!("<p>2</p>{REJECT}"), "metadata": "c" },
        { "url": "https://example.com/3", "metadata": "d" },
    ]});
    let response = post_json(&app.router, "/api/v1/render/batch", Some(FREE_KEY), jobs).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "x-ratelimit-remaining"), "19");

    let json = body_json(response).await;
    assert_eq!(json["succeeded"], 3);
    assert_eq!(json["failed"], 1);

    let results = json["results"].as_array().unwrap();
    let tags: Vec<_> = results.iter().map(|r| r["metadata"].as_str().unwrap()).collect();
    assert_eq!(tags, ["a", "b", "c", "d"]);
    assert_eq!(results[2]["success"], false);
    assert_eq!(results[2]["error"]["code"], "RENDER_FAILED");
    assert_eq!(results[2]["error"]["retryable"], false);
    assert_eq!(results[3]["success"], true);

    // Only successful jobs are charged.
    let record = app.ledger.current(&caller(1)).await.unwrap().unwrap();
    assert_eq!(record.used, 3);
    assert_eq!(record.reserved, 0);
}

// ---------------------------------------------------------------------------
// Test: empty and oversize batches are invalid
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn batch_size_is_bounded() {
    let app = build_test_app();

    let response = post_json(
        &app.router,
        "/api/v1/render/batch",
        Some(PRO_KEY),
        json!({ "jobs": [] }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let jobs: Vec<_> = (0..101).map(|_| html_job("<p>x</p>")).collect();
    let response = post_json(
        &app.router,
        "/api/v1/render/batch",
        Some(PRO_KEY),
        json!({ "jobs": jobs }),
    )
    .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["code"], "INVALID_REQUEST");

    assert_eq!(app.engine.renders.load(Ordering::SeqCst), 0);
}

// ---------------------------------------------------------------------------
// Test: a crash is retried once on a fresh worker and the pool refills
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn crash_is_retried_on_another_worker() {
    let app = build_test_app();
    app.engine.crash_budget.store(1, Ordering::SeqCst);

    let response = post_json(
        &app.router,
        "/api/v1/render",
        Some(FREE_KEY),
        html_job(&format!("<p>x</p>{CRASH_ONCE}")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["success"], true);
    assert_eq!(app.engine.renders.load(Ordering::SeqCst), 2);

    let stats = wait_for_pool(&app, 1, |s| s.idle == 2 && s.active == 0).await;
    assert_eq!(stats.counters.crashed, 1);
    assert_eq!(stats.counters.served, 1);
}

// ---------------------------------------------------------------------------
// Test: repeated crashes fail the job and roll back its quota
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn repeated_crash_fails_job_without_charge() {
    let app = build_test_app();

    let response = post_json(
        &app.router,
        "/api/v1/render",
        Some(FREE_KEY),
        html_job(&format!("<p>x</p>{CRASH}")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(header(&response, "x-ratelimit-remaining"), "19");

    let json = body_json(response).await;
    assert_eq!(json["code"], "WORKER_CRASHED");
    assert_eq!(json["retryable"], true);
    assert!(json["job_id"].is_string());

    assert_eq!(app.engine.renders.load(Ordering::SeqCst), 2);
    let record = app.ledger.current(&caller(1)).await.unwrap().unwrap();
    assert_eq!(record.used, 0);
    assert_eq!(record.reserved, 0);
}

// ---------------------------------------------------------------------------
// Test: a render past the deadline fails as RENDER_TIMEOUT
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn slow_render_times_out() {
    let app = build_test_app();

    let response = post_json(
        &app.router,
        "/api/v1/render",
        Some(PRO_KEY),
        html_job(&format!("<p>x</p>{SLOW}")),
    )
    .await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    let json = body_json(response).await;
    assert_eq!(json["code"], "RENDER_TIMEOUT");
    assert_eq!(json["retryable"], true);

    // Both timed-out workers were discarded.
    let stats = wait_for_pool(&app, 2, |s| s.idle == 2).await;
    assert_eq!(stats.counters.crashed, 2);
}

// ---------------------------------------------------------------------------
// Test: an exhausted pool fails fast as BUSY
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn exhausted_pool_reports_busy() {
    let mut config = test_config();
    config.pool.min_size = 1;
    config.pool.max_size = 1;
    config.dispatch.acquire_timeout = Duration::from_millis(200);
    let app = build_test_app_with(config);

    let router = app.router.clone();
    let slow = tokio::spawn(async move {
        post_json(
            &router,
            "/api/v1/render",
            Some(PRO_KEY),
            html_job(&format!("<p>x</p>{SLOW}")),
        )
        .await
    });

    // Let the slow job take the only worker.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let response =
        post_json(&app.router, "/api/v1/render", Some(PRO_KEY), html_job("<p>x</p>")).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(header(&response, "retry-after"), "1");

    let json = body_json(response).await;
    assert_eq!(json["code"], "BUSY");
    assert_eq!(json["retryable"], true);

    let slow = slow.await.unwrap();
    assert_eq!(slow.status(), StatusCode::SERVICE_UNAVAILABLE);
}

// ---------------------------------------------------------------------------
// Test: a storage failure fails the job as STORAGE_FAILED
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn storage_failure_is_bad_gateway() {
    let app = build_test_app();
    app.storage.fail.store(true, Ordering::SeqCst);

    let response =
        post_json(&app.router, "/api/v1/render", Some(FREE_KEY), html_job("<p>x</p>")).await;
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    let json = body_json(response).await;
    assert_eq!(json["code"], "STORAGE_FAILED");
    assert_eq!(json["retryable"], true);

    let record = app.ledger.current(&caller(1)).await.unwrap().unwrap();
    assert_eq!(record.used, 0);
}

// ---------------------------------------------------------------------------
// Test: GET /pools shows the caller's pool, bucket and usage
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn pools_overview_reflects_usage() {
    let app = build_test_app();

    let response = get(&app.router, "/api/v1/pools", Some(FREE_KEY)).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["partition"], "caller-1");
    assert!(json["pool"].is_null());
    assert!(json["quota"].is_null());
    assert_eq!(json["rate_limit"]["remaining"], 20);

    let response =
        post_json(&app.router, "/api/v1/render", Some(FREE_KEY), html_job("<p>x</p>")).await;
    assert_eq!(response.status(), StatusCode::OK);

    let response = get(&app.router, "/api/v1/pools", Some(FREE_KEY)).await;
    assert_eq!(header(&response, "x-ratelimit-remaining"), "19");
    let json = body_json(response).await;
    assert_eq!(json["pool"]["max_size"], 4);
    assert_eq!(json["pool"]["counters"]["served"], 1);
    assert_eq!(json["quota"]["used"], 1);
    assert_eq!(json["quota"]["limit"], 100);
}
