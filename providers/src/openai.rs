//! OpenAI-compatible Chat Completions client.
//!
//! Talks to `{base_url}/chat/completions`. Streaming requests ask for
//! `stream_options.include_usage` so token usage arrives in the final chunk.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::retry::{RetryConfig, send_with_retry};
use crate::{
    ApiConfig, ApiUsage, Completion, CompletionError, CompletionFut, CompletionRequest,
    CompletionService, Message, NonEmptyString, SseParseAction, SseParser, StreamEvent,
    http_client, into_success, mpsc, parse_sse_payload, process_sse_stream,
};

// ========================================================================
// Wire types
// ========================================================================

#[derive(Debug, Serialize)]
struct ChatRequestBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    stream_options: Option<StreamOptions>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct WireUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

impl From<WireUsage> for ApiUsage {
    fn from(usage: WireUsage) -> Self {
        ApiUsage {
            prompt_tokens: usage.prompt_tokens,
            completion_tokens: usage.completion_tokens,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChatChunk {
    choices: Vec<ChunkChoice>,
    usage: Option<WireUsage>,
    error: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChunkChoice {
    delta: ChunkDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ChunkDelta {
    content: Option<String>,
}

// ========================================================================
// SSE parser
// ========================================================================

#[derive(Debug, Default)]
struct ChatChunkParser {
    finished: bool,
}

impl SseParser for ChatChunkParser {
    fn parse(&mut self, json: &Value) -> SseParseAction {
        let Some(chunk) = parse_sse_payload::<ChatChunk>(json) else {
            return SseParseAction::Continue;
        };

        if let Some(error) = chunk.error {
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .map_or_else(|| error.to_string(), str::to_string);
            return SseParseAction::Error(format!("Service error: {message}"));
        }

        let mut events = Vec::new();
        for choice in chunk.choices {
            if let Some(content) = choice.delta.content.filter(|c| !c.is_empty()) {
                events.push(StreamEvent::TextDelta(content));
            }
            if choice.finish_reason.is_some() {
                self.finished = true;
            }
        }
        if let Some(usage) = chunk.usage {
            events.push(StreamEvent::Usage(usage.into()));
        }

        if events.is_empty() {
            SseParseAction::Continue
        } else {
            SseParseAction::Emit(events)
        }
    }

    fn is_complete(&self) -> bool {
        self.finished
    }
}

// ========================================================================
// Client
// ========================================================================

/// [`CompletionService`] backed by an OpenAI-compatible HTTP endpoint.
#[derive(Debug, Clone)]
pub struct OpenAiClient {
    config: ApiConfig,
    http: reqwest::Client,
    retry: RetryConfig,
}

impl OpenAiClient {
    pub fn new(config: ApiConfig) -> Result<Self, CompletionError> {
        let http = http_client(config.requires_https()).map_err(|e| {
            CompletionError::Transport {
                attempts: 0,
                message: format!("failed to build HTTP client: {e}"),
            }
        })?;
        Ok(Self {
            config,
            http,
            retry: RetryConfig::default(),
        })
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.config.base_url().trim_end_matches('/')
        )
    }

    fn build_request(
        &self,
        url: &str,
        body: &ChatRequestBody<'_>,
        timeout: Option<Duration>,
    ) -> reqwest::RequestBuilder {
        let builder = self
            .http
            .post(url)
            .bearer_auth(self.config.api_key())
            .json(body);
        match timeout {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        }
    }

    async fn complete_blocking(
        &self,
        request: &CompletionRequest<'_>,
    ) -> Result<Completion, CompletionError> {
        let body = build_request_body(request, false);
        let url = self.endpoint();
        let timeout = Some(self.config.request_timeout());

        let outcome =
            send_with_retry(|| self.build_request(&url, &body, timeout), &self.retry).await;
        let response = into_success(outcome).await?;

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| CompletionError::InvalidResponse(e.to_string()))?;
        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .unwrap_or_default();

        Ok(Completion {
            text: NonEmptyString::new(text.trim()).map_err(|_| CompletionError::Empty)?,
            usage: parsed.usage.map(ApiUsage::from).unwrap_or_default(),
        })
    }

    async fn complete_streaming(
        &self,
        request: &CompletionRequest<'_>,
        tx: &mpsc::Sender<StreamEvent>,
    ) -> Result<Completion, CompletionError> {
        let body = build_request_body(request, true);
        let url = self.endpoint();

        let outcome = send_with_retry(|| self.build_request(&url, &body, None), &self.retry).await;
        let response = match into_success(outcome).await {
            Ok(response) => response,
            Err(e) => {
                let _ = tx.send(StreamEvent::Error(e.to_string())).await;
                return Err(e);
            }
        };

        let mut parser = ChatChunkParser::default();
        let reply =
            process_sse_stream(response, &mut parser, tx, self.config.stream_idle_timeout())
                .await?;

        Ok(Completion {
            text: NonEmptyString::new(reply.text.trim()).map_err(|_| CompletionError::Empty)?,
            usage: reply.usage,
        })
    }
}

fn build_request_body<'a>(request: &'a CompletionRequest<'a>, stream: bool) -> ChatRequestBody<'a> {
    ChatRequestBody {
        model: request.model,
        messages: request.messages,
        max_tokens: request.max_tokens,
        temperature: request.temperature,
        stream,
        stream_options: stream.then_some(StreamOptions {
            include_usage: true,
        }),
    }
}

impl CompletionService for OpenAiClient {
    fn complete<'a>(&'a self, request: CompletionRequest<'a>) -> CompletionFut<'a> {
        Box::pin(async move {
            tracing::debug!(
                model = request.model,
                messages = request.messages.len(),
                streaming = request.stream.is_some(),
                "Sending completion request"
            );
            let result = match &request.stream {
                Some(tx) => self.complete_streaming(&request, tx).await,
                None => self.complete_blocking(&request).await,
            };
            if let Err(e) = &result {
                tracing::warn!(error = %e, model = request.model, "Completion request failed");
            }
            result
        })
    }
}
