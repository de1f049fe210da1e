//! `OpenAiClient` against a mock Chat Completions endpoint.

use std::time::Duration;

use tokio::sync::mpsc;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, ResponseTemplate};

use parley_providers::retry::RetryConfig;
use parley_providers::{
    ApiConfig, ApiKey, CompletionError, CompletionRequest, CompletionService, Message,
    StreamEvent,
};
use parley_types::Role;

use crate::common::{
    CHAT_PATH, chat_body, client, client_with_retry, mount_reply_once,
    mount_streaming_reply_once, request_bodies, start_openai_mock,
};

fn conversation() -> Vec<Message> {
    vec![
        Message::try_new(Role::System, "Be brief.").unwrap(),
        Message::try_user("Hello").unwrap(),
    ]
}

#[tokio::test]
async fn blocking_reply_returns_text_and_usage() {
    let server = start_openai_mock().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .and(header("authorization", "Bearer test-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(chat_body("  Hi there!  ")))
        .expect(1)
        .mount(&server)
        .await;

    let messages = conversation();
    let completion = client(&server)
        .complete(CompletionRequest::new("gpt-4o-mini", &messages).with_max_tokens(50))
        .await
        .unwrap();

    assert_eq!(completion.text.as_str(), "Hi there!");
    assert_eq!(completion.usage.prompt_tokens, 10);
    assert_eq!(completion.usage.completion_tokens, 20);

    let bodies = request_bodies(&server).await;
    assert_eq!(bodies[0]["model"], "gpt-4o-mini");
    assert_eq!(bodies[0]["max_tokens"], 50);
    assert_eq!(bodies[0]["stream"], false);
    assert!(bodies[0].get("stream_options").is_none());
    assert_eq!(bodies[0]["messages"][0]["role"], "system");
    assert_eq!(bodies[0]["messages"][1]["content"], "Hello");
}

#[tokio::test]
async fn streaming_reply_forwards_deltas() {
    let server = start_openai_mock().await;
    mount_streaming_reply_once(&server, &["Hel", "lo ", "world"]).await;

    let messages = conversation();
    let (tx, mut rx) = mpsc::channel(32);
    let completion = client(&server)
        .complete(CompletionRequest::new("gpt-4o-mini", &messages).streaming(tx))
        .await
        .unwrap();

    assert_eq!(completion.text.as_str(), "Hello world");
    assert_eq!(completion.usage.prompt_tokens, 7);

    let mut deltas = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let StreamEvent::TextDelta(delta) = event {
            deltas.push(delta);
        }
    }
    assert_eq!(deltas, ["Hel", "lo ", "world"]);

    let bodies = request_bodies(&server).await;
    assert_eq!(bodies[0]["stream"], true);
    assert_eq!(bodies[0]["stream_options"]["include_usage"], true);
}

#[tokio::test]
async fn unauthorized_is_an_api_error() {
    let server = start_openai_mock().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
        .mount(&server)
        .await;

    let messages = conversation();
    let err = client(&server)
        .complete(CompletionRequest::new("gpt-4o-mini", &messages))
        .await
        .unwrap_err();

    match err {
        CompletionError::Api { status, body } => {
            assert_eq!(status, 401);
            assert!(body.contains("bad key"));
        }
        other => panic!("expected API error, got {other:?}"),
    }
}

#[tokio::test]
async fn server_errors_are_retried() {
    let server = start_openai_mock().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_reply_once(&server, "Recovered").await;

    let retry = RetryConfig {
        max_retries: 2,
        initial_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        jitter_factor: 0.0,
    };
    let messages = conversation();
    let completion = client_with_retry(&server, retry)
        .complete(CompletionRequest::new("gpt-4o-mini", &messages))
        .await
        .unwrap();

    assert_eq!(completion.text.as_str(), "Recovered");
    assert_eq!(request_bodies(&server).await.len(), 2);
}

#[tokio::test]
async fn blank_reply_is_empty_error() {
    let server = start_openai_mock().await;
    mount_reply_once(&server, "   ").await;

    let messages = conversation();
    let err = client(&server)
        .complete(CompletionRequest::new("gpt-4o-mini", &messages))
        .await
        .unwrap_err();
    assert!(matches!(err, CompletionError::Empty));
}

#[test]
fn plain_http_is_only_allowed_for_loopback() {
    assert!(ApiConfig::new(ApiKey::new("k"), "http://api.example.com/v1").is_err());
    assert!(ApiConfig::new(ApiKey::new("k"), "http://127.0.0.1:8080/v1").is_ok());
    assert!(ApiConfig::new(ApiKey::new("k"), "https://api.example.com/v1").is_ok());
}
