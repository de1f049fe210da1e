//! Scripted completion service for unit tests.

use std::collections::VecDeque;
use std::sync::Mutex;

use parley_providers::{
    ApiUsage, Completion, CompletionError, CompletionFut, CompletionRequest, CompletionService,
    NonEmptyString,
};

#[derive(Debug, Clone)]
pub(crate) struct RecordedRequest {
    pub model: String,
    pub messages: Vec<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
}

/// Replies with queued texts in order; errors once the queue is empty.
#[derive(Debug, Default)]
pub(crate) struct ScriptedService {
    replies: Mutex<VecDeque<String>>,
    requests: Mutex<Vec<RecordedRequest>>,
}

impl ScriptedService {
    pub(crate) fn new<S: Into<String>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self {
            replies: Mutex::new(replies.into_iter().map(Into::into).collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn failing() -> Self {
        Self::default()
    }

    pub(crate) fn calls(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub(crate) fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl CompletionService for ScriptedService {
    fn complete<'a>(&'a self, request: CompletionRequest<'a>) -> CompletionFut<'a> {
        self.requests.lock().unwrap().push(RecordedRequest {
            model: request.model.to_string(),
            messages: request
                .messages
                .iter()
                .map(|m| m.content().to_string())
                .collect(),
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        });
        let reply = self.replies.lock().unwrap().pop_front();
        Box::pin(async move {
            let Some(reply) = reply else {
                return Err(CompletionError::Api {
                    status: 500,
                    body: "scripted failure".to_string(),
                });
            };
            Ok(Completion {
                text: NonEmptyString::new(reply).map_err(|_| CompletionError::Empty)?,
                usage: ApiUsage::default(),
            })
        })
    }
}
