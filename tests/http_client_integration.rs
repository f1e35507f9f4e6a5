mod common;

use std::time::{Duration, Instant};

use serde_json::{json, Value};
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use invoice_sync::connectors::http::ApiClient;
use invoice_sync::connectors::TokenSession;
use invoice_sync::db::models::Provider;
use invoice_sync::error::SyncError;

use common::{bundle, FakeAdapter};

async fn request_count(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .expect("request recording enabled")
        .len()
}

#[tokio::test]
async fn rate_limited_request_waits_as_advertised_then_succeeds() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me/messages"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .up_to_n_times(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me/messages"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": [] })))
        .mount(&server)
        .await;

    let (adapter, state) = FakeAdapter::new(Provider::Outlook);
    let mut session = TokenSession::new(&adapter, bundle("live"));
    let client = ApiClient::new(Provider::Outlook, 5);

    let started = Instant::now();
    let body = client
        .get_text(&mut session, &format!("{}/me/messages", server.uri()))
        .await
        .expect("body after backoff");

    let parsed: Value = serde_json::from_str(&body).expect("json body");
    assert_eq!(parsed, json!({ "value": [] }));
    // Retry-After: 0 replaces the one-second default backoff.
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(request_count(&server).await, 3);
    assert_eq!(state.refreshes.get(), 0);
}

#[tokio::test]
async fn exhausted_rate_limit_is_reported_with_attempt_count() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/users/me/messages"))
        .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "0"))
        .mount(&server)
        .await;

    let (adapter, _state) = FakeAdapter::new(Provider::Gmail);
    let mut session = TokenSession::new(&adapter, bundle("live"));
    let client = ApiClient::new(Provider::Gmail, 2);

    let error = client
        .get_text(&mut session, &format!("{}/users/me/messages", server.uri()))
        .await
        .expect_err("rate limit exhausted");

    assert!(matches!(
        error,
        SyncError::ProviderRateLimit {
            provider: Provider::Gmail,
            attempts: 3
        }
    ));
    assert_eq!(request_count(&server).await, 3);
}

#[tokio::test]
async fn rejected_token_is_refreshed_once_and_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .and(header("authorization", "Bearer live"))
        .respond_with(ResponseTemplate::new(401).set_body_string("token expired"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .and(header("authorization", "Bearer live-refreshed"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "id": "me" })))
        .mount(&server)
        .await;

    let (adapter, state) = FakeAdapter::new(Provider::Outlook);
    let mut session = TokenSession::new(&adapter, bundle("live"));
    let client = ApiClient::new(Provider::Outlook, 5);

    let body = client
        .get_text(&mut session, &format!("{}/me", server.uri()))
        .await
        .expect("body after refresh");
    assert!(body.contains("\"me\""));
    assert_eq!(state.refreshes.get(), 1);

    let (tokens, refreshed) = session.into_parts();
    assert!(refreshed);
    assert_eq!(tokens.access_token, "live-refreshed");
    assert_eq!(request_count(&server).await, 2);
}

#[tokio::test]
async fn second_rejection_after_refresh_is_an_error() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/me"))
        .respond_with(ResponseTemplate::new(401).set_body_string("unauthorized"))
        .mount(&server)
        .await;

    let (adapter, state) = FakeAdapter::new(Provider::Outlook);
    let mut session = TokenSession::new(&adapter, bundle("live"));
    let client = ApiClient::new(Provider::Outlook, 5);

    let error = client
        .get_text(&mut session, &format!("{}/me", server.uri()))
        .await
        .expect_err("still unauthorized");

    assert!(matches!(error, SyncError::Unexpected(_)));
    assert!(error.to_string().contains("status=401"));
    assert_eq!(state.refreshes.get(), 1);
    assert_eq!(request_count(&server).await, 2);
}
