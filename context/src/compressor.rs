//! Sliding-window compression.
//!
//! The most recent `recent_window_size` conversational messages are always
//! sent verbatim. Everything older is replaced by one synthetic system
//! message carrying the accumulated summaries.
//!
//! ```text
//! transcript:  [sys] m0 m1 ... m(k-1) | m(k) ... m(n-1)
//!                    \___ old ______/   \___ recent ___/
//! submission:  [sys] [sys: "Previous conversation summary: s0 s1 ..."] recent
//! ```
//!
//! Summaries are append-only. The first one covers the whole old prefix seen
//! at that moment; later ones each cover one full batch of
//! `summary_batch_size` messages that no summary has claimed yet.
//!
//! Work is split in two: [`ContextCompressor::prepare`] performs every
//! summarization call against `&self` and returns a [`CompressionPlan`];
//! [`ContextCompressor::commit`] applies it. A turn that is abandoned between
//! the two leaves the compressor untouched.

use std::fmt::Write;

use thiserror::Error;

use parley_providers::{CompletionError, CompletionRequest, CompletionService};
use parley_types::{Message, NonEmptyString, Role};

use crate::token_counter::TokenCounter;

const SUMMARY_SYSTEM_PROMPT: &str = "Summarize the following conversation concisely, \
capturing key points, decisions, and context. Keep it under 100 tokens.";

const SUMMARY_PREFIX: &str = "Previous conversation summary: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompressorConfig {
    /// Conversational messages always sent verbatim.
    pub recent_window_size: usize,
    /// Messages covered by each summary after the first.
    pub summary_batch_size: usize,
    pub summary_max_tokens: u32,
}

impl Default for CompressorConfig {
    fn default() -> Self {
        Self {
            recent_window_size: 14,
            summary_batch_size: 14,
            summary_max_tokens: 100,
        }
    }
}

/// Token accounting for the most recent compression.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompressionStats {
    pub original_tokens: u32,
    pub compressed_tokens: u32,
}

impl CompressionStats {
    #[must_use]
    pub fn saved(&self) -> u32 {
        self.original_tokens.saturating_sub(self.compressed_tokens)
    }

    /// Percentage of the original tokens saved.
    #[must_use]
    pub fn ratio(&self) -> f64 {
        if self.original_tokens == 0 {
            return 0.0;
        }
        f64::from(self.saved()) / f64::from(self.original_tokens) * 100.0
    }
}

#[derive(Debug, Error)]
pub enum CompressionError {
    #[error("failed to summarize messages {start}..{end}: {source}")]
    Summarization {
        start: usize,
        end: usize,
        #[source]
        source: CompletionError,
    },
}

/// Output of [`ContextCompressor::prepare`].
#[derive(Debug, Clone)]
pub struct CompressionPlan {
    submission: Vec<Message>,
    new_summaries: Vec<String>,
    base_summary_count: usize,
    stats: CompressionStats,
}

impl CompressionPlan {
    #[must_use]
    pub fn submission(&self) -> &[Message] {
        &self.submission
    }

    /// Summaries produced while preparing, not yet committed.
    #[must_use]
    pub fn new_summaries(&self) -> &[String] {
        &self.new_summaries
    }

    #[must_use]
    pub fn stats(&self) -> CompressionStats {
        self.stats
    }
}

/// Snapshot reported to the user.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressorStats {
    pub summaries: usize,
    pub last: CompressionStats,
}

#[derive(Debug, Clone, Default)]
pub struct ContextCompressor {
    config: CompressorConfig,
    summaries: Vec<String>,
    last_stats: CompressionStats,
}

impl ContextCompressor {
    #[must_use]
    pub fn new(config: CompressorConfig) -> Self {
        Self {
            config,
            summaries: Vec::new(),
            last_stats: CompressionStats::default(),
        }
    }

    #[must_use]
    pub fn config(&self) -> CompressorConfig {
        self.config
    }

    #[must_use]
    pub fn summaries(&self) -> &[String] {
        &self.summaries
    }

    #[must_use]
    pub fn stats(&self) -> CompressorStats {
        CompressorStats {
            summaries: self.summaries.len(),
            last: self.last_stats,
        }
    }

    /// Build the submission for `transcript`, summarizing whatever old
    /// messages are not yet covered.
    ///
    /// Summaries are requested one at a time, in order. The first failure
    /// aborts the whole plan.
    pub async fn prepare(
        &self,
        transcript: &[Message],
        counter: &TokenCounter,
        service: &dyn CompletionService,
        model: &str,
    ) -> Result<CompressionPlan, CompressionError> {
        let original_tokens = counter.count_all(transcript);
        let (system, conversation): (Vec<&Message>, Vec<&Message>) =
            transcript.iter().partition(|m| m.is_system());

        let window = self.config.recent_window_size;
        if conversation.len() <= window {
            return Ok(CompressionPlan {
                submission: transcript.to_vec(),
                new_summaries: Vec::new(),
                base_summary_count: self.summaries.len(),
                stats: CompressionStats {
                    original_tokens,
                    compressed_tokens: original_tokens,
                },
            });
        }

        let split = conversation.len() - window;
        let (old, recent) = conversation.split_at(split);

        let mut new_summaries = Vec::new();
        for (start, end) in self.uncovered_ranges(old.len()) {
            let summary = summarize(
                &old[start..end],
                service,
                model,
                self.config.summary_max_tokens,
            )
            .await
            .map_err(|source| CompressionError::Summarization { start, end, source })?;
            tracing::debug!(start, end, "Summarized conversation batch");
            new_summaries.push(summary);
        }

        let joined = self
            .summaries
            .iter()
            .chain(&new_summaries)
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(" ");

        let mut submission: Vec<Message> = system.into_iter().cloned().collect();
        if let Ok(content) = NonEmptyString::new(format!("{SUMMARY_PREFIX}{joined}")) {
            submission.push(Message::system(content));
        }
        submission.extend(recent.iter().map(|m| (*m).clone()));

        let compressed_tokens = counter.count_all(&submission);
        Ok(CompressionPlan {
            submission,
            new_summaries,
            base_summary_count: self.summaries.len(),
            stats: CompressionStats {
                original_tokens,
                compressed_tokens,
            },
        })
    }

    /// Apply a plan produced by [`Self::prepare`].
    ///
    /// A plan prepared against a different summary count (the compressor was
    /// reset or committed in between) only updates the statistics.
    pub fn commit(&mut self, plan: CompressionPlan) {
        if plan.base_summary_count == self.summaries.len() {
            self.summaries.extend(plan.new_summaries);
        } else if !plan.new_summaries.is_empty() {
            tracing::warn!(
                prepared_against = plan.base_summary_count,
                current = self.summaries.len(),
                "Discarding summaries from a stale compression plan"
            );
        }
        self.last_stats = plan.stats;
    }

    /// [`Self::prepare`] followed by [`Self::commit`].
    pub async fn compress(
        &mut self,
        transcript: &[Message],
        counter: &TokenCounter,
        service: &dyn CompletionService,
        model: &str,
    ) -> Result<Vec<Message>, CompressionError> {
        let plan = self.prepare(transcript, counter, service, model).await?;
        let submission = plan.submission.clone();
        self.commit(plan);
        Ok(submission)
    }

    pub fn reset(&mut self) {
        self.summaries.clear();
        self.last_stats = CompressionStats::default();
    }

    /// Index ranges of `old` that still need a summary.
    fn uncovered_ranges(&self, old_len: usize) -> Vec<(usize, usize)> {
        let existing = self.summaries.len();
        if existing == 0 {
            return vec![(0, old_len)];
        }

        let batch = self.config.summary_batch_size.max(1);
        if old_len <= existing * batch {
            return Vec::new();
        }

        let needed = (old_len / batch).saturating_sub(existing);
        (0..needed)
            .map(|i| {
                let start = (existing + i) * batch;
                (start, (start + batch).min(old_len))
            })
            .filter(|(start, _)| *start < old_len)
            .collect()
    }
}

async fn summarize(
    messages: &[&Message],
    service: &dyn CompletionService,
    model: &str,
    max_tokens: u32,
) -> Result<String, CompletionError> {
    let mut conversation = String::new();
    for message in messages {
        let _ = writeln!(conversation, "{}: {}", message.role().label(), message.content());
    }

    let mut prompt = Vec::with_capacity(2);
    if let Ok(system) = Message::try_new(Role::System, SUMMARY_SYSTEM_PROMPT) {
        prompt.push(system);
    }
    let Ok(user) = Message::try_user(conversation) else {
        return Err(CompletionError::InvalidResponse(
            "nothing to summarize".to_string(),
        ));
    };
    prompt.push(user);

    let request = CompletionRequest::new(model, &prompt).with_max_tokens(max_tokens);
    let completion = service.complete(request).await?;
    Ok(completion.text.into_inner())
}

#[cfg(test)]
mod tests {
    use parley_types::{Message, Role};

    use super::{CompressionStats, CompressorConfig, ContextCompressor, SUMMARY_PREFIX};
    use crate::test_support::ScriptedService;
    use crate::token_counter::TokenCounter;

    fn transcript(conversational: usize) -> Vec<Message> {
        let mut messages = vec![Message::try_new(Role::System, "You are helpful.").unwrap()];
        for i in 0..conversational {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            messages.push(Message::try_new(role, format!("message {i}")).unwrap());
        }
        messages
    }

    fn summary_text(submission: &[Message]) -> &str {
        submission[1]
            .content()
            .strip_prefix(SUMMARY_PREFIX)
            .expect("summary message")
    }

    #[tokio::test]
    async fn short_transcript_is_returned_unchanged() {
        let service = ScriptedService::new(Vec::<&str>::new());
        let counter = TokenCounter::new();
        let mut compressor = ContextCompressor::default();
        let input = transcript(5);

        let output = compressor
            .compress(&input, &counter, &service, "m")
            .await
            .unwrap();

        assert_eq!(output, input);
        assert_eq!(service.calls(), 0);
        let stats = compressor.stats().last;
        assert_eq!(stats.original_tokens, stats.compressed_tokens);
        assert_eq!(stats.saved(), 0);
    }

    #[tokio::test]
    async fn long_transcript_gets_one_summary_plus_recent_window() {
        let service = ScriptedService::new(["early chat"]);
        let counter = TokenCounter::new();
        let mut compressor = ContextCompressor::default();
        let input = transcript(20);

        let output = compressor
            .compress(&input, &counter, &service, "m")
            .await
            .unwrap();

        assert_eq!(output.len(), 1 + 1 + 14);
        assert_eq!(output[0], input[0]);
        assert!(output[1].is_system());
        assert_eq!(summary_text(&output), "early chat");
        assert_eq!(&output[2..], &input[7..]);
        assert_eq!(compressor.summaries(), ["early chat"]);

        // Old prefix went to the summarizer as capitalized role lines.
        let request = &service.requests()[0];
        assert_eq!(request.max_tokens, Some(100));
        assert!(request.messages[1].starts_with("User: message 0\nAssistant: message 1\n"));
    }

    #[tokio::test]
    async fn repeated_compress_does_not_resummarize() {
        let service = ScriptedService::new(["first", "second"]);
        let counter = TokenCounter::new();
        let mut compressor = ContextCompressor::default();

        compressor
            .compress(&transcript(20), &counter, &service, "m")
            .await
            .unwrap();
        compressor
            .compress(&transcript(20), &counter, &service, "m")
            .await
            .unwrap();
        let output = compressor
            .compress(&transcript(22), &counter, &service, "m")
            .await
            .unwrap();

        assert_eq!(service.calls(), 1);
        assert_eq!(compressor.summaries().len(), 1);
        assert_eq!(summary_text(&output), "first");
    }

    #[tokio::test]
    async fn new_batch_is_summarized_once_it_is_full() {
        let service = ScriptedService::new(["first", "second"]);
        let counter = TokenCounter::new();
        let mut compressor = ContextCompressor::default();

        compressor
            .compress(&transcript(20), &counter, &service, "m")
            .await
            .unwrap();
        // 42 conversational messages leave 28 old ones: batch 1 (14..28) is new.
        let output = compressor
            .compress(&transcript(42), &counter, &service, "m")
            .await
            .unwrap();

        assert_eq!(service.calls(), 2);
        assert_eq!(compressor.summaries(), ["first", "second"]);
        assert_eq!(summary_text(&output), "first second");
        assert!(service.requests()[1].messages[1].starts_with("User: message 14\n"));
    }

    #[tokio::test]
    async fn summarization_failure_propagates_and_leaves_state() {
        let service = ScriptedService::failing();
        let counter = TokenCounter::new();
        let mut compressor = ContextCompressor::default();

        let result = compressor
            .compress(&transcript(20), &counter, &service, "m")
            .await;

        assert!(result.is_err());
        assert!(compressor.summaries().is_empty());
    }

    #[tokio::test]
    async fn prepared_plan_is_inert_until_committed() {
        let service = ScriptedService::new(["summary"]);
        let counter = TokenCounter::new();
        let mut compressor = ContextCompressor::default();

        let plan = compressor
            .prepare(&transcript(20), &counter, &service, "m")
            .await
            .unwrap();
        assert_eq!(plan.new_summaries(), ["summary"]);
        assert!(compressor.summaries().is_empty());

        compressor.commit(plan);
        assert_eq!(compressor.summaries(), ["summary"]);
    }

    #[tokio::test]
    async fn stale_plan_does_not_add_summaries() {
        let service = ScriptedService::new(["a", "b"]);
        let counter = TokenCounter::new();
        let mut compressor = ContextCompressor::default();

        let stale = compressor
            .prepare(&transcript(20), &counter, &service, "m")
            .await
            .unwrap();
        compressor
            .compress(&transcript(20), &counter, &service, "m")
            .await
            .unwrap();
        compressor.commit(stale);

        assert_eq!(compressor.summaries(), ["b"]);
    }

    #[tokio::test]
    async fn reset_clears_summaries_and_stats() {
        let service = ScriptedService::new(["s"]);
        let counter = TokenCounter::new();
        let mut compressor = ContextCompressor::new(CompressorConfig::default());
        compressor
            .compress(&transcript(20), &counter, &service, "m")
            .await
            .unwrap();

        compressor.reset();
        assert!(compressor.summaries().is_empty());
        assert_eq!(compressor.stats().last, CompressionStats::default());
    }

    #[test]
    fn ratio_is_percentage_saved() {
        let stats = CompressionStats {
            original_tokens: 200,
            compressed_tokens: 50,
        };
        assert_eq!(stats.saved(), 150);
        assert!((stats.ratio() - 75.0).abs() < f64::EPSILON);
        assert!(CompressionStats::default().ratio().abs() < f64::EPSILON);
    }
}
