//! HTTP completion client against a local mock endpoint.

use std::net::{SocketAddr, TcpListener};
use std::time::Duration;

use axum::{
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};

use crate::rag::{
    AnswerField, CompletionClient, CompletionError, CompletionSettings, HttpCompletionClient,
    DEFAULT_ANSWER_FIELDS,
};

async fn chat(headers: HeaderMap, Json(body): Json<Value>) -> Json<Value> {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("none")
        .to_string();
    let prompt = body["messages"][0]["content"].as_str().unwrap_or_default();

    Json(json!({
        "choices": [{
            "message": {
                "content": format!(
                    "model={} max_tokens={} role={} auth={} prompt={}",
                    body["model"].as_str().unwrap_or_default(),
                    body["max_tokens"],
                    body["messages"][0]["role"].as_str().unwrap_or_default(),
                    auth,
                    prompt,
                )
            }
        }]
    }))
}

async fn legacy() -> Json<Value> {
    Json(json!({"result": "legacy answer"}))
}

async fn failing() -> (StatusCode, &'static str) {
    (StatusCode::INTERNAL_SERVER_ERROR, "model overloaded")
}

async fn not_json() -> &'static str {
    "<html>gateway</html>"
}

fn mock_router() -> Router {
    Router::new()
        .route("/v1/chat", post(chat))
        .route("/v1/legacy", post(legacy))
        .route("/v1/fail", post(failing))
        .route("/v1/html", post(not_json))
}

/// Serve the mock endpoint on `listener` from a background runtime.
fn spawn_mock(listener: TcpListener) {
    listener.set_nonblocking(true).unwrap();
    std::thread::spawn(move || {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        runtime.block_on(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, mock_router()).await.unwrap();
        });
    });
}

fn start_mock() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    spawn_mock(listener);
    addr
}

fn client(addr: SocketAddr, path: &str, api_key: Option<&str>) -> HttpCompletionClient {
    HttpCompletionClient::new(CompletionSettings {
        url: url::Url::parse(&format!("http://{addr}{path}")).unwrap(),
        api_key: api_key.map(str::to_string),
        model: "gpt-4o-mini".to_string(),
        max_tokens: 300,
        timeout: Duration::from_secs(5),
        answer_fields: DEFAULT_ANSWER_FIELDS.to_vec(),
    })
    .unwrap()
}

#[test]
fn test_request_shape_and_bearer() {
    let addr = start_mock();

    let answer = client(addr, "/v1/chat", Some("sk-test"))
        .complete("the prompt")
        .unwrap();
    assert_eq!(
        answer,
        "model=gpt-4o-mini max_tokens=300 role=user auth=Bearer sk-test prompt=the prompt"
    );

    let answer = client(addr, "/v1/chat", None).complete("p").unwrap();
    assert!(answer.contains("auth=none"));
}

#[test]
fn test_result_field_fallback() {
    let addr = start_mock();
    let answer = client(addr, "/v1/legacy", None).complete("p").unwrap();
    assert_eq!(answer, "legacy answer");

    let mut only_chat = client(addr, "/v1/legacy", None).settings().clone();
    only_chat.answer_fields = vec![AnswerField::MessageContent];
    let answer = HttpCompletionClient::new(only_chat)
        .unwrap()
        .complete("p")
        .unwrap();
    assert_eq!(answer, "");
}

#[test]
fn test_error_status_carries_body() {
    let addr = start_mock();
    match client(addr, "/v1/fail", None).complete("p") {
        Err(CompletionError::Upstream { status, detail }) => {
            assert_eq!(status, 500);
            assert_eq!(detail, "model overloaded");
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[test]
fn test_non_json_success_is_malformed() {
    let addr = start_mock();
    let result = client(addr, "/v1/html", None).complete("p");
    assert!(matches!(result, Err(CompletionError::Malformed(_))));
}

#[test]
fn test_unreachable_then_recovered_endpoint() {
    // reserve a free port, then release it so nothing listens there
    let reserved = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = reserved.local_addr().unwrap();
    drop(reserved);

    let client = client(addr, "/v1/chat", None);
    let result = client.complete("p");
    assert!(matches!(result, Err(CompletionError::Unavailable(_))));

    spawn_mock(TcpListener::bind(addr).unwrap());
    let answer = client.complete("p").unwrap();
    assert!(answer.ends_with("prompt=p"));
}
