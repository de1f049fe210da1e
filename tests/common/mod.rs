//! Shared test utilities and fixtures
//!
//! Common infrastructure for integration tests.

#![allow(dead_code)]

use std::time::Duration;

use serde_json::{Value, json};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use parley_providers::retry::RetryConfig;
use parley_providers::{ApiConfig, ApiKey, OpenAiClient};

pub const CHAT_PATH: &str = "/v1/chat/completions";

/// Start a mock server that simulates an OpenAI-compatible API
pub async fn start_openai_mock() -> MockServer {
    MockServer::start().await
}

/// Client pointed at `server`, without retries.
pub fn client(server: &MockServer) -> OpenAiClient {
    client_with_retry(server, RetryConfig::none())
}

pub fn client_with_retry(server: &MockServer, retry: RetryConfig) -> OpenAiClient {
    let config = ApiConfig::new(ApiKey::new("test-key"), &format!("{}/v1", server.uri()))
        .unwrap()
        .with_request_timeout(Duration::from_secs(5))
        .with_stream_idle_timeout(Duration::from_secs(5));
    OpenAiClient::new(config).unwrap().with_retry(retry)
}

pub fn chat_body(content: &str) -> Value {
    json!({
        "id": "chatcmpl-test",
        "object": "chat.completion",
        "model": "gpt-4o-mini",
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": content},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 10, "completion_tokens": 20, "total_tokens": 30}
    })
}

/// Mount a reply served exactly once. Mount several to script a sequence;
/// earlier mounts answer first.
pub async fn mount_reply_once(server: &MockServer, content: &str) {
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body(content)))
        .up_to_n_times(1)
        .mount(server)
        .await;
}

pub async fn mount_replies(server: &MockServer, contents: &[&str]) {
    for content in contents {
        mount_reply_once(server, content).await;
    }
}

/// Chat Completions SSE body: one chunk per delta, a finish chunk, a usage
/// chunk and `[DONE]`.
pub fn sse_body(chunks: &[&str]) -> String {
    let mut body = String::new();
    for chunk in chunks {
        let data = json!({"choices": [{"index": 0, "delta": {"content": chunk}, "finish_reason": null}]});
        body.push_str(&format!("data: {data}\n\n"));
    }
    let finish = json!({"choices": [{"index": 0, "delta": {}, "finish_reason": "stop"}]});
    body.push_str(&format!("data: {finish}\n\n"));
    let usage = json!({"choices": [], "usage": {"prompt_tokens": 7, "completion_tokens": 3}});
    body.push_str(&format!("data: {usage}\n\n"));
    body.push_str("data: [DONE]\n\n");
    body
}

pub async fn mount_streaming_reply_once(server: &MockServer, chunks: &[&str]) {
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("content-type", "text/event-stream")
                .set_body_string(sse_body(chunks)),
        )
        .up_to_n_times(1)
        .mount(server)
        .await;
}

/// Bodies of every chat request the server has seen, in order.
pub async fn request_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| request.body_json::<Value>().unwrap())
        .collect()
}
