// Drives AppStoreFeedClient against a local stand-in for the upstream feed.

use std::path::Path;
use std::time::Duration;

use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use revwatch_adapters::{AppStoreFeedClient, FeedClient, FetchError};
use revwatch_storage::{HttpClientConfig, HttpError, HttpFetcher, RetryDisposition};
use tokio::net::TcpListener;

async fn upstream(uri: Uri) -> Response {
    let path = uri.path().to_string();
    if path.contains("id=595068606/") {
        let fixture = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/app-store/customerreviews.json");
        let body = tokio::fs::read(fixture).await.expect("fixture");
        ([("content-type", "application/json")], body).into_response()
    } else if path.contains("id=500/") {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
    } else if path.contains("id=slow/") {
        tokio::time::sleep(Duration::from_secs(3)).await;
        (StatusCode::OK, "{}").into_response()
    } else if path.contains("id=garbage/") {
        (StatusCode::OK, "<html>maintenance</html>").into_response()
    } else {
        (StatusCode::NOT_FOUND, "").into_response()
    }
}

async fn spawn_upstream() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, Router::new().fallback(upstream))
            .await
            .expect("serve");
    });
    format!("http://{addr}")
}

fn client(base_url: &str) -> AppStoreFeedClient {
    let http = HttpFetcher::new(HttpClientConfig {
        timeout: Duration::from_millis(500),
        user_agent: Some("revwatch-test".to_string()),
    })
    .expect("http client");
    AppStoreFeedClient::new(http).with_base_url(base_url)
}

#[tokio::test]
async fn fetches_and_normalizes_the_recorded_feed() {
    let base = spawn_upstream().await;
    let reviews = client(&base).fetch("595068606").await.expect("fetch");

    assert_eq!(reviews.len(), 3);
    assert!(reviews.iter().all(|r| r.app_id == "595068606"));
    assert_eq!(reviews[0].title, "Great app!");
}

#[tokio::test]
async fn non_success_status_is_a_retryable_fetch_error() {
    let base = spawn_upstream().await;
    let err = client(&base).fetch("500").await.unwrap_err();

    assert!(matches!(
        err,
        FetchError::Http(HttpError::HttpStatus { status: 500, .. })
    ));
    assert_eq!(err.disposition(), RetryDisposition::Retryable);
}

#[tokio::test]
async fn missing_feed_is_not_retried() {
    let base = spawn_upstream().await;
    let err = client(&base).fetch("unknown").await.unwrap_err();
    assert_eq!(err.disposition(), RetryDisposition::NonRetryable);
}

#[tokio::test]
async fn unparseable_body_is_a_fetch_error() {
    let base = spawn_upstream().await;
    let err = client(&base).fetch("garbage").await.unwrap_err();
    assert!(matches!(err, FetchError::Parse(_)));
}

#[tokio::test]
async fn slow_upstream_times_out() {
    let base = spawn_upstream().await;
    let err = client(&base).fetch("slow").await.unwrap_err();

    match err {
        FetchError::Http(HttpError::Request(inner)) => assert!(inner.is_timeout()),
        other => panic!("expected timeout, got {other:?}"),
    }
}
