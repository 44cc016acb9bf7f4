//! HTTP route surface exercised in-process with `tower::ServiceExt`.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use botdock::api::router;
use serde_json::{json, Value};
use tower::ServiceExt;

use super::support::{Harness, LONG_RUNNING_BOT};

async fn call(h: &Harness, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let mut builder = Request::builder().method(method).uri(uri);
    let body = match body {
        Some(value) => {
            builder = builder.header("content-type", "application/json");
            Body::from(value.to_string())
        }
        None => Body::empty(),
    };
    let response = router(Arc::clone(&h.state))
        .oneshot(builder.body(body).expect("request"))
        .await
        .expect("response");

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .expect("body");
    let json = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, json)
}

#[tokio::test]
async fn health_reports_ok() {
    let h = Harness::new().await;
    let (status, body) = call(&h, "GET", "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "status": "ok" }));
}

#[tokio::test]
async fn unknown_bot_is_a_json_404() {
    let h = Harness::new().await;
    let (status, body) = call(&h, "GET", "/bots/nope", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], "error");
    assert_eq!(body["error"], "bot nope not found");
}

#[tokio::test]
async fn deploy_status_and_stop_round_trip() {
    let h = Harness::new().await;
    let bot = h
        .create_bot("owner-1", h.source_repo("api", LONG_RUNNING_BOT))
        .await;

    let (status, body) = call(&h, "POST", &format!("/bots/{}/deploy", bot.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["mainFile"], "bot.sh");

    let (status, body) = call(&h, "GET", &format!("/bots/{}", bot.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["running"], true);
    assert_eq!(body["bot"]["status"], "online");

    let (status, body) = call(&h, "GET", &format!("/bots/{}/process", bot.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "running");

    let (status, body) = call(&h, "GET", "/processes", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body.as_array().map(Vec::len), Some(1));

    let (status, body) = call(&h, "POST", &format!("/bots/{}/stop", bot.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["stopped"], true);

    let (status, _) = call(&h, "GET", &format!("/bots/{}/process", bot.id), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn failed_deploy_is_reported_in_the_body() {
    let h = Harness::new().await;
    let bot = h.create_bot("owner-1", h.empty_repo("bare")).await;

    let (status, body) = call(&h, "POST", &format!("/bots/{}/deploy", bot.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], false);
    assert_eq!(body["error"], "No main bot file found");
}

#[tokio::test]
async fn pair_returns_code_and_validates_number() {
    let h = Harness::new().await;
    let bot = h
        .create_bot("owner-1", h.source_repo("pair-api", LONG_RUNNING_BOT))
        .await;

    let (status, body) = call(
        &h,
        "POST",
        &format!("/bots/{}/pair", bot.id),
        Some(json!({ "number": "not a number" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");

    let (status, body) = call(
        &h,
        "POST",
        &format!("/bots/{}/pair", bot.id),
        Some(json!({ "number": "+44 20 7946 0958" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], "TEST-CODE");

    let (status, _) = call(
        &h,
        "POST",
        &format!("/bots/{}/pair", bot.id),
        Some(json!({ "number": "+44 20 7946 0958" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT, "one attempt in flight per bot");

    let (status, _) = call(&h, "DELETE", &format!("/sessions/owner-1/{}", bot.id), None).await;
    assert_eq!(status, StatusCode::CONFLICT, "in-flight session cannot be deleted");
}

#[tokio::test]
async fn session_routes_report_and_delete() {
    let h = Harness::new().await;
    let (status, body) = call(&h, "GET", "/sessions/owner-1/bot-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["exists"], false);
    assert_eq!(body["connected"], false);

    h.connect_session("owner-1", "bot-1").await;

    let (status, body) = call(&h, "GET", "/sessions/owner-1/bot-1/info", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["check"]["connected"], true);
    assert_eq!(body["files"], json!(["creds.json", "status.json"]));

    let (status, body) = call(&h, "DELETE", "/sessions/owner-1/bot-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["deleted"], true);

    let (status, body) = call(&h, "GET", "/sessions/owner-1/bot-1", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["exists"], false);
}

#[tokio::test]
async fn unsafe_session_ids_are_rejected() {
    let h = Harness::new().await;
    let (status, _) = call(&h, "GET", "/sessions/owner-1/..", None).await;
    assert_ne!(status, StatusCode::OK);
}
