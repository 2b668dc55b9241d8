use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use satchel::storage::MemoryRepository;
use satchel::Config;
use serde_json::{json, Value};
use tower::util::ServiceExt;

fn app() -> Router {
    let state = satchel::build_app_state(Arc::new(MemoryRepository::new()), &Config::default());
    satchel::http::router(state)
}

async fn create_mock_key(app: &Router, name: &str) -> (String, i64) {
    create_key_with(app, json!({ "name": name, "provider": "mock" })).await
}

async fn create_key_with(app: &Router, payload: Value) -> (String, i64) {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/config/app-keys")
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    (
        parsed["key"].as_str().unwrap().to_string(),
        parsed["id"].as_i64().unwrap(),
    )
}

fn chat_request(secret: &str, payload: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {secret}"))
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

#[tokio::test]
async fn non_stream_happy_path_returns_mock_completion() {
    let app = app();
    let (secret, _) = create_mock_key(&app, "happy path").await;

    let payload = json!({
        "model": "m",
        "messages": [{ "role": "user", "content": "hi" }]
    });
    let response = app.clone().oneshot(chat_request(&secret, &payload)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(
        parsed["choices"][0]["message"]["content"],
        "Mock response to: \"hi\""
    );
    assert!(parsed["usage"]["completion_tokens"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn stream_happy_path_preserves_sse_bytes() {
    let app = app();
    let (secret, _) = create_mock_key(&app, "stream path").await;

    let payload = json!({
        "model": "m",
        "stream": true,
        "messages": [{ "role": "user", "content": "hi" }]
    });
    let response = app.clone().oneshot(chat_request(&secret, &payload)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = std::str::from_utf8(&body).unwrap();
    assert!(text.matches("data: {").count() > 1);
    assert!(text.trim_end().ends_with("data: [DONE]"));
}

#[tokio::test]
async fn missing_and_bogus_keys_are_unauthorized() {
    let app = app();

    let payload = json!({ "model": "m", "messages": [] });
    let no_auth = Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap();
    let response = app.clone().oneshot(no_auth).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = app
        .clone()
        .oneshot(chat_request("sa-not-a-real-secret", &payload))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn key_names_validate_on_codepoint_count_and_charset() {
    let app = app();

    // Exactly fifty multibyte codepoints is fine.
    let name = "あ".repeat(50);
    let (_, _) = create_key_with(&app, json!({ "name": name, "provider": "mock" })).await;

    let over = "あ".repeat(51);
    let request = Request::builder()
        .method("POST")
        .uri("/v1/config/app-keys")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "name": over, "provider": "mock" }).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let request = Request::builder()
        .method("POST")
        .uri("/v1/config/app-keys")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "name": "invalid!", "provider": "mock" }).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn body_cap_is_exact_at_ten_mebibytes() {
    let app = app();
    let (secret, _) = create_mock_key(&app, "body cap").await;

    const CAP: usize = 10 * 1024 * 1024;
    let skeleton = json!({
        "model": "m",
        "messages": [{ "role": "user", "content": "" }]
    })
    .to_string();
    let padding = CAP - skeleton.len();
    let payload = json!({
        "model": "m",
        "messages": [{ "role": "user", "content": "a".repeat(padding) }]
    });
    let body = payload.to_string();
    assert_eq!(body.len(), CAP);

    let response = app.clone().oneshot(chat_request(&secret, &payload)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let over = json!({
        "model": "m",
        "messages": [{ "role": "user", "content": "a".repeat(padding + 1) }]
    });
    assert_eq!(over.to_string().len(), CAP + 1);
    let response = app.clone().oneshot(chat_request(&secret, &over)).await.unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
}

#[tokio::test]
async fn unknown_middleware_ids_are_skipped() {
    let app = app();
    let (secret, _) = create_key_with(
        &app,
        json!({
            "name": "unknown middleware",
            "provider": "mock",
            "middlewares": [{ "id": "does_not_exist" }]
        }),
    )
    .await;

    let payload = json!({
        "model": "m",
        "messages": [{ "role": "user", "content": "still works" }]
    });
    let response = app.clone().oneshot(chat_request(&secret, &payload)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}

#[tokio::test]
async fn rate_limit_middleware_rejects_within_the_window() {
    let app = app();
    let (secret, _) = create_key_with(
        &app,
        json!({
            "name": "rate limited",
            "provider": "mock",
            "middlewares": [{
                "id": "rate_limit",
                "config": { "limit": 1, "period": 60 }
            }]
        }),
    )
    .await;

    let payload = json!({
        "model": "m",
        "messages": [{ "role": "user", "content": "hi" }]
    });
    let first = app.clone().oneshot(chat_request(&secret, &payload)).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);

    let second = app.clone().oneshot(chat_request(&secret, &payload)).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}
