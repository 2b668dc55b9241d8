use std::sync::Arc;

use axum::body::{to_bytes, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use httpmock::prelude::*;
use satchel::http::AppState;
use satchel::storage::MemoryRepository;
use satchel::Config;
use serde_json::{json, Value};
use tower::util::ServiceExt;

fn openai_app(upstream: &MockServer) -> (Router, AppState) {
    let config = Config {
        openai_api_key: Some("upstream-secret".to_string()),
        openai_base_url: Some(upstream.base_url()),
        ..Config::default()
    };
    let state = satchel::build_app_state(Arc::new(MemoryRepository::new()), &config);
    (satchel::http::router(state.clone()), state)
}

async fn create_openai_key(app: &Router) -> String {
    let request = Request::builder()
        .method("POST")
        .uri("/v1/config/app-keys")
        .header("content-type", "application/json")
        .body(Body::from(
            json!({ "name": "openai key", "provider": "openai" }).to_string(),
        ))
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    parsed["key"].as_str().unwrap().to_string()
}

fn chat(secret: &str, payload: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri("/v1/chat/completions")
        .header("authorization", format!("Bearer {secret}"))
        .header("content-type", "application/json")
        .body(Body::from(payload.to_string()))
        .unwrap()
}

async fn key_usage(state: &AppState) -> f64 {
    state.keys.list().await.expect("list")[0].budget_usage
}

#[tokio::test]
async fn buffered_openai_call_is_forwarded_and_metered() {
    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                .header("authorization", "Bearer upstream-secret");
            then.status(200)
                .header("content-type", "application/json")
                .json_body(json!({
                    "choices": [{
                        "message": { "role": "assistant", "content": "hello back" },
                        "finish_reason": "stop"
                    }],
                    "usage": { "prompt_tokens": 1, "completion_tokens": 40 }
                }));
        })
        .await;

    let (app, state) = openai_app(&upstream);
    let secret = create_openai_key(&app).await;

    let payload = json!({
        "model": "gpt-4o-mini",
        "messages": [{ "role": "user", "content": "hi" }]
    });
    let response = app.clone().oneshot(chat(&secret, &payload)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    mock.assert_async().await;

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let parsed: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(parsed["choices"][0]["message"]["content"], "hello back");

    // Input priced from the estimate plus 40 reported output tokens.
    let usage = key_usage(&state).await;
    assert!(usage > 40.0 / 1000.0 * 0.0006 - 1e-12);
}

#[tokio::test]
async fn streamed_openai_call_settles_from_the_usage_trailer() {
    let sse_body = concat!(
        "data: {\"choices\":[{\"delta\":{\"content\":\"hello \"}}]}\n\n",
        "data: {\"choices\":[{\"delta\":{\"content\":\"world\"}}]}\n\n",
        "data: {\"choices\":[],\"usage\":{\"prompt_tokens\":100,\"completion_tokens\":200}}\n\n",
        "data: [DONE]\n\n",
    );

    let upstream = MockServer::start_async().await;
    let mock = upstream
        .mock_async(|when, then| {
            when.method(POST)
                .path("/chat/completions")
                // The gateway must have asked for the usage trailer.
                .body_includes("include_usage");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(sse_body);
        })
        .await;

    let (app, state) = openai_app(&upstream);
    let secret = create_openai_key(&app).await;

    let payload = json!({
        "model": "gpt-4o-mini",
        "stream": true,
        "messages": [{ "role": "user", "content": "hi" }]
    });
    let response = app.clone().oneshot(chat(&secret, &payload)).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert_eq!(&body[..], sse_body.as_bytes());
    mock.assert_async().await;

    // Commit lands after the stream is drained.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    let expected = 100.0 / 1000.0 * 0.00015 + 200.0 / 1000.0 * 0.0006;
    let usage = key_usage(&state).await;
    assert!(
        (usage - expected).abs() < 1e-9,
        "usage {usage} != reported-cost {expected}"
    );
}

#[tokio::test]
async fn upstream_failure_reconciles_the_reservation_to_zero() {
    let upstream = MockServer::start_async().await;
    // No mock registered for the path: httpmock answers 404, but a dead
    // connection is the more interesting case, so point at a closed port.
    drop(upstream);

    let closed = Config {
        openai_api_key: Some("upstream-secret".to_string()),
        openai_base_url: Some("http://127.0.0.1:9".to_string()),
        ..Config::default()
    };
    let state = satchel::build_app_state(Arc::new(MemoryRepository::new()), &closed);
    let app = satchel::http::router(state.clone());
    let secret = create_openai_key(&app).await;

    let payload = json!({
        "model": "gpt-4o-mini",
        "messages": [{ "role": "user", "content": "hello out there" }]
    });
    let response = app.clone().oneshot(chat(&secret, &payload)).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);

    // The reservation was refunded in full.
    assert_eq!(key_usage(&state).await, 0.0);
}
