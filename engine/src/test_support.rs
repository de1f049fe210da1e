//! Fake completion service for engine tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use parley_providers::{
    Completion, CompletionError, CompletionFut, CompletionRequest, CompletionService,
};
use parley_types::{ApiUsage, NonEmptyString, StreamEvent};

#[derive(Debug, Clone)]
pub(crate) enum Reply {
    Text(String),
    Fail,
    /// Never resolves.
    Hang,
}

impl Reply {
    pub(crate) fn text(text: impl Into<String>) -> Self {
        Reply::Text(text.into())
    }
}

impl From<&str> for Reply {
    fn from(text: &str) -> Self {
        Reply::text(text)
    }
}

impl From<String> for Reply {
    fn from(text: String) -> Self {
        Reply::Text(text)
    }
}

#[derive(Debug)]
enum Mode {
    Scripted(Mutex<VecDeque<Reply>>),
    EchoSystem,
    FailWhenSystemContains(String),
}

#[derive(Debug)]
pub(crate) struct FakeService {
    mode: Mode,
    temperatures: Mutex<Vec<Option<f32>>>,
}

impl FakeService {
    /// Replies in order; fails once the script runs out.
    pub(crate) fn scripted<R: Into<Reply>>(replies: impl IntoIterator<Item = R>) -> Self {
        Self::with_mode(Mode::Scripted(Mutex::new(
            replies.into_iter().map(Into::into).collect(),
        )))
    }

    /// Replies with the request's system prompt.
    pub(crate) fn echo_system_prefix() -> Self {
        Self::with_mode(Mode::EchoSystem)
    }

    /// Echoes like [`Self::echo_system_prefix`] but fails when the system
    /// prompt contains `needle`.
    pub(crate) fn failing_when_system_contains(needle: &str) -> Self {
        Self::with_mode(Mode::FailWhenSystemContains(needle.to_string()))
    }

    fn with_mode(mode: Mode) -> Self {
        Self {
            mode,
            temperatures: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn calls(&self) -> usize {
        self.temperatures.lock().unwrap().len()
    }

    pub(crate) fn temperatures(&self) -> Vec<Option<f32>> {
        self.temperatures.lock().unwrap().clone()
    }
}

impl CompletionService for FakeService {
    fn complete<'a>(&'a self, request: CompletionRequest<'a>) -> CompletionFut<'a> {
        self.temperatures.lock().unwrap().push(request.temperature);
        let system = request
            .messages
            .iter()
            .find(|m| m.is_system())
            .map(|m| m.content().to_string())
            .unwrap_or_default();
        let reply = match &self.mode {
            Mode::Scripted(queue) => queue.lock().unwrap().pop_front().unwrap_or(Reply::Fail),
            Mode::EchoSystem => Reply::Text(system),
            Mode::FailWhenSystemContains(needle) if system.contains(needle.as_str()) => Reply::Fail,
            Mode::FailWhenSystemContains(_) => Reply::Text(system),
        };
        let stream = request.stream;

        Box::pin(async move {
            match reply {
                Reply::Hang => std::future::pending().await,
                Reply::Fail => Err(CompletionError::Api {
                    status: 500,
                    body: "fake failure".to_string(),
                }),
                Reply::Text(text) => {
                    if let Some(tx) = stream {
                        let _ = tx.send(StreamEvent::TextDelta(text.clone())).await;
                        let _ = tx.send(StreamEvent::Done).await;
                    }
                    Ok(Completion {
                        text: NonEmptyString::new(text).map_err(|_| CompletionError::Empty)?,
                        usage: ApiUsage::default(),
                    })
                }
            }
        })
    }
}
