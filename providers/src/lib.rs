//! Completion-service clients with streaming support.
//!
//! # Architecture
//!
//! - [`CompletionService`] - the seam every caller talks to; one call in, one
//!   assistant reply out
//! - [`openai`] - OpenAI-compatible Chat Completions client
//! - [`retry`] - backoff policy shared by all HTTP calls
//!
//! Streaming is opt-in per request: supplying a
//! [`tokio::sync::mpsc::Sender<StreamEvent>`] makes the client forward text
//! deltas as they arrive. The accumulated reply is returned either way, so
//! callers never have to reassemble a stream themselves.
//!
//! # Error Handling
//!
//! Every failure resolves to a [`CompletionError`]. When streaming, the same
//! failure is also sent as `StreamEvent::Error` so a renderer can show it in
//! place of the partial text.

pub mod openai;
pub mod retry;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::time::Duration;

pub use parley_types::{ApiUsage, Message, NonEmptyString, StreamEvent};
pub(crate) use tokio::sync::mpsc;

pub use openai::OpenAiClient;

/// Canonical OpenAI API base URL. The client appends `/chat/completions`.
pub const OPENAI_API_BASE_URL: &str = "https://api.openai.com/v1";

const CONNECT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 120;
const DEFAULT_STREAM_IDLE_TIMEOUT_SECS: u64 = 60;
const TCP_KEEPALIVE_SECS: u64 = 60;

const MAX_SSE_BUFFER_BYTES: usize = 4 * 1024 * 1024;
const MAX_SSE_PARSE_ERRORS: usize = 3;
const MAX_ERROR_BODY_BYTES: usize = 32 * 1024;

// ============================================================================
// Service seam
// ============================================================================

/// One completion call.
pub struct CompletionRequest<'a> {
    pub model: &'a str,
    pub messages: &'a [Message],
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    /// When set, text deltas are forwarded here as they stream in.
    pub stream: Option<mpsc::Sender<StreamEvent>>,
}

impl<'a> CompletionRequest<'a> {
    #[must_use]
    pub fn new(model: &'a str, messages: &'a [Message]) -> Self {
        Self {
            model,
            messages,
            max_tokens: None,
            temperature: None,
            stream: None,
        }
    }

    #[must_use]
    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    #[must_use]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    #[must_use]
    pub fn streaming(mut self, tx: mpsc::Sender<StreamEvent>) -> Self {
        self.stream = Some(tx);
        self
    }
}

/// A finished completion. The text is never empty.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub text: NonEmptyString,
    pub usage: ApiUsage,
}

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },
    #[error("request failed after {attempts} attempt(s): {message}")]
    Transport { attempts: u32, message: String },
    #[error("stream failed: {0}")]
    Stream(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("completion returned no text")]
    Empty,
}

pub type CompletionFut<'a> = Pin<Box<dyn Future<Output = Result<Completion, CompletionError>> + Send + 'a>>;

/// Anything that can turn a message list into one assistant reply.
///
/// Implementations must be safe to call concurrently; the expert panel fans
/// several requests out over one shared service.
pub trait CompletionService: Send + Sync {
    fn complete<'a>(&'a self, request: CompletionRequest<'a>) -> CompletionFut<'a>;
}

// ============================================================================
// Configuration
// ============================================================================

/// API secret. `Debug` never prints the value.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiKey(String);

impl ApiKey {
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    #[must_use]
    pub fn expose_secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ApiKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ApiKey(<redacted>)")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ApiConfigError {
    #[error("API key is empty")]
    EmptyKey,
    #[error("invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },
}

/// Credentials and endpoint for an OpenAI-compatible service.
///
/// The constructor rejects plain-HTTP endpoints unless they point at a
/// loopback host, so a typo cannot send the key over the network in clear.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    api_key: ApiKey,
    base_url: url::Url,
    request_timeout: Duration,
    stream_idle_timeout: Duration,
}

impl ApiConfig {
    pub fn new(api_key: ApiKey, base_url: &str) -> Result<Self, ApiConfigError> {
        if api_key.expose_secret().trim().is_empty() {
            return Err(ApiConfigError::EmptyKey);
        }
        let invalid = |reason: &str| ApiConfigError::InvalidBaseUrl {
            url: base_url.to_string(),
            reason: reason.to_string(),
        };
        let parsed = url::Url::parse(base_url).map_err(|e| invalid(&e.to_string()))?;
        match parsed.scheme() {
            "https" => {}
            "http" if is_loopback(&parsed) => {}
            "http" => return Err(invalid("plain http is only allowed for loopback hosts")),
            other => return Err(invalid(&format!("unsupported scheme '{other}'"))),
        }

        Ok(Self {
            api_key,
            base_url: parsed,
            request_timeout: Duration::from_secs(DEFAULT_REQUEST_TIMEOUT_SECS),
            stream_idle_timeout: Duration::from_secs(DEFAULT_STREAM_IDLE_TIMEOUT_SECS),
        })
    }

    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_stream_idle_timeout(mut self, timeout: Duration) -> Self {
        self.stream_idle_timeout = timeout;
        self
    }

    #[must_use]
    pub fn api_key(&self) -> &str {
        self.api_key.expose_secret()
    }

    #[must_use]
    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    #[must_use]
    pub fn requires_https(&self) -> bool {
        self.base_url.scheme() == "https"
    }

    #[must_use]
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    #[must_use]
    pub fn stream_idle_timeout(&self) -> Duration {
        self.stream_idle_timeout
    }
}

fn is_loopback(url: &url::Url) -> bool {
    match url.host() {
        Some(url::Host::Domain(domain)) => domain.eq_ignore_ascii_case("localhost"),
        Some(url::Host::Ipv4(addr)) => addr.is_loopback(),
        Some(url::Host::Ipv6(addr)) => addr.is_loopback(),
        None => false,
    }
}

// ============================================================================
// HTTP plumbing
// ============================================================================

fn client_builder(https_only: bool) -> reqwest::ClientBuilder {
    use reqwest::header::{HeaderMap, HeaderValue};

    let mut default_headers = HeaderMap::new();
    default_headers.insert(
        "X-Client-OS",
        HeaderValue::from_static(std::env::consts::OS),
    );
    default_headers.insert(
        "X-Client-Arch",
        HeaderValue::from_static(std::env::consts::ARCH),
    );

    reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
        .redirect(reqwest::redirect::Policy::none())
        .https_only(https_only)
        .tcp_keepalive(Some(Duration::from_secs(TCP_KEEPALIVE_SECS)))
        .default_headers(default_headers)
}

/// Shared client for HTTPS endpoints; local endpoints get their own.
pub(crate) fn http_client(https_only: bool) -> Result<reqwest::Client, reqwest::Error> {
    static HTTPS_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
    if !https_only {
        return client_builder(false).build();
    }
    if let Some(client) = HTTPS_CLIENT.get() {
        return Ok(client.clone());
    }
    let client = client_builder(true).build()?;
    Ok(HTTPS_CLIENT.get_or_init(|| client).clone())
}

pub(crate) async fn read_capped_error_body(response: reqwest::Response) -> String {
    use futures_util::StreamExt;

    let mut body = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let Ok(chunk) = chunk else { break };
        body.extend_from_slice(&chunk);
        if body.len() > MAX_ERROR_BODY_BYTES {
            body.truncate(MAX_ERROR_BODY_BYTES);
            let text = String::from_utf8_lossy(&body);
            return format!("{text}...(truncated)");
        }
    }
    String::from_utf8_lossy(&body).into_owned()
}

/// Turns a retry outcome into a 2xx response or a typed error.
pub(crate) async fn into_success(
    outcome: retry::RetryOutcome,
) -> Result<reqwest::Response, CompletionError> {
    match outcome {
        retry::RetryOutcome::Success(response) => Ok(response),
        retry::RetryOutcome::HttpError(response) => {
            let status = response.status().as_u16();
            let body = read_capped_error_body(response).await;
            Err(CompletionError::Api { status, body })
        }
        retry::RetryOutcome::ConnectionError { attempts, source } => {
            Err(CompletionError::Transport {
                attempts,
                message: source.to_string(),
            })
        }
    }
}

// ============================================================================
// Server-sent events
// ============================================================================

fn find_sse_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = buffer.windows(2).position(|w| w == b"\n\n");
    let crlf = buffer.windows(4).position(|w| w == b"\r\n\r\n");
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a <= b { (a, 2) } else { (b, 4) }),
        (Some(a), None) => Some((a, 2)),
        (None, Some(b)) => Some((b, 4)),
        (None, None) => None,
    }
}

fn drain_next_sse_event(buffer: &mut Vec<u8>) -> Option<Vec<u8>> {
    let (pos, delim_len) = find_sse_event_boundary(buffer)?;
    let event = buffer[..pos].to_vec();
    buffer.drain(..pos + delim_len);
    Some(event)
}

fn extract_sse_data(event: &str) -> Option<String> {
    let mut data = String::new();
    let mut found = false;

    for line in event.lines() {
        let line = line.strip_suffix('\r').unwrap_or(line);
        let Some(rest) = line.strip_prefix("data:") else {
            continue;
        };
        let rest = rest.strip_prefix(' ').unwrap_or(rest);
        if found {
            data.push('\n');
        }
        data.push_str(rest);
        found = true;
    }

    found.then_some(data)
}

#[derive(Debug)]
pub(crate) enum SseParseAction {
    /// Nothing to emit for this payload.
    Continue,
    Emit(Vec<StreamEvent>),
    Error(String),
}

pub(crate) trait SseParser {
    fn parse(&mut self, json: &serde_json::Value) -> SseParseAction;

    /// Whether the payloads seen so far amount to a finished reply, for
    /// servers that close the connection without a `[DONE]` marker.
    fn is_complete(&self) -> bool {
        false
    }
}

pub(crate) fn parse_sse_payload<T>(json: &serde_json::Value) -> Option<T>
where
    T: serde::de::DeserializeOwned,
{
    match serde_json::from_value(json.clone()) {
        Ok(event) => Some(event),
        Err(e) => {
            tracing::warn!(%e, "Failed to parse SSE event");
            None
        }
    }
}

/// Text and usage accumulated from a stream.
#[derive(Debug, Default)]
pub(crate) struct StreamedReply {
    pub text: String,
    pub usage: ApiUsage,
}

/// Forwards events to the listener until it goes away.
///
/// A dropped receiver does not abort the stream: the reply is still
/// accumulated and returned to the caller.
struct Forwarder<'a> {
    tx: &'a mpsc::Sender<StreamEvent>,
    listening: bool,
}

impl Forwarder<'_> {
    async fn send(&mut self, event: StreamEvent) {
        if self.listening && self.tx.send(event).await.is_err() {
            tracing::debug!("Stream listener dropped; continuing without forwarding");
            self.listening = false;
        }
    }

    async fn fail(&mut self, message: String) -> CompletionError {
        self.send(StreamEvent::Error(message.clone())).await;
        CompletionError::Stream(message)
    }
}

/// Reads an SSE response to the end, forwarding deltas and accumulating the reply.
///
/// Handles idle timeouts, buffer limits, UTF-8 validation, event boundaries,
/// the `[DONE]` marker and a small budget of malformed payloads.
pub(crate) async fn process_sse_stream<P: SseParser>(
    response: reqwest::Response,
    parser: &mut P,
    tx: &mpsc::Sender<StreamEvent>,
    idle_timeout: Duration,
) -> Result<StreamedReply, CompletionError> {
    use futures_util::StreamExt;

    let mut stream = response.bytes_stream();
    let mut buffer: Vec<u8> = Vec::new();
    let mut parse_errors = 0usize;
    let mut reply = StreamedReply::default();
    let mut out = Forwarder {
        tx,
        listening: true,
    };

    loop {
        let Ok(next) = tokio::time::timeout(idle_timeout, stream.next()).await else {
            return Err(out.fail("Stream idle timeout".to_string()).await);
        };

        let Some(chunk) = next else { break };
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return Err(out.fail(format!("Stream read failed: {e}")).await),
        };
        buffer.extend_from_slice(&chunk);

        if buffer.len() > MAX_SSE_BUFFER_BYTES {
            return Err(out
                .fail("SSE buffer exceeded maximum size (4 MiB)".to_string())
                .await);
        }

        while let Some(event) = drain_next_sse_event(&mut buffer) {
            if event.is_empty() {
                continue;
            }

            let Ok(event) = std::str::from_utf8(&event) else {
                return Err(out
                    .fail("Received invalid UTF-8 from SSE stream".to_string())
                    .await);
            };

            let Some(data) = extract_sse_data(event) else {
                continue;
            };

            if data == "[DONE]" {
                out.send(StreamEvent::Done).await;
                return Ok(reply);
            }

            match serde_json::from_str::<serde_json::Value>(&data) {
                Ok(json) => {
                    parse_errors = 0;
                    match parser.parse(&json) {
                        SseParseAction::Continue => {}
                        SseParseAction::Emit(events) => {
                            for event in events {
                                match &event {
                                    StreamEvent::TextDelta(delta) => reply.text.push_str(delta),
                                    StreamEvent::Usage(usage) => reply.usage.merge(*usage),
                                    StreamEvent::Done | StreamEvent::Error(_) => {}
                                }
                                out.send(event).await;
                            }
                        }
                        SseParseAction::Error(message) => return Err(out.fail(message).await),
                    }
                }
                Err(e) => {
                    parse_errors = parse_errors.saturating_add(1);
                    tracing::warn!(%e, payload_bytes = data.len(), "Invalid SSE JSON payload");
                    if parse_errors >= MAX_SSE_PARSE_ERRORS {
                        return Err(out.fail(format!("Invalid stream payload: {e}")).await);
                    }
                }
            }
        }
    }

    if parser.is_complete() {
        out.send(StreamEvent::Done).await;
        return Ok(reply);
    }

    Err(out
        .fail("Connection closed before stream completed".to_string())
        .await)
}
