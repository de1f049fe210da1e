//! Sticky facts: a small structured memory the model keeps up to date.
//!
//! After each exchange the recent conversation and the current [`FactSheet`]
//! go to the model, which returns the complete updated sheet as JSON. The
//! submission for a turn is then the system prompt with the facts appended,
//! plus only the last few conversational messages.
//!
//! Extraction is staged like compression: [`StickyFactsManager::extract`]
//! reads `&self` and returns a [`FactExtraction`]; [`StickyFactsManager::apply`]
//! validates and installs it. An update that would drop a stored category or
//! decision key is rejected outright, so facts never disappear silently.

use serde_json::Value;

use parley_providers::{CompletionRequest, CompletionService};
use parley_types::{FactSheet, Message, Role};

const EXTRACTION_TEMPLATE: &str =
    include_str!(concat!(env!("CARGO_MANIFEST_DIR"), "/assets/extract_facts.md"));

const EXTRACTION_SYSTEM_PROMPT: &str =
    "You extract key facts from conversations and return JSON only.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StickyFactsConfig {
    /// Conversational messages shown to the extractor.
    pub fact_window: usize,
    /// Conversational messages sent verbatim with each turn.
    pub recent_messages: usize,
}

impl Default for StickyFactsConfig {
    fn default() -> Self {
        Self {
            fact_window: 6,
            recent_messages: 6,
        }
    }
}

/// A staged extraction result, not yet applied.
#[derive(Debug, Clone, PartialEq)]
pub enum FactExtraction {
    /// Nothing to extract from.
    Skipped,
    Parsed(FactSheet),
    Failed(String),
}

/// What [`StickyFactsManager::apply`] did with an extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExtractionOutcome {
    Updated,
    Unchanged,
    /// The update dropped previously stored facts (`category` or
    /// `category.key`); nothing was applied.
    Rejected { lost: Vec<String> },
    Failed { reason: String },
}

impl ExtractionOutcome {
    #[must_use]
    pub fn is_updated(&self) -> bool {
        matches!(self, Self::Updated)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StickyFactsStats {
    pub total_facts: usize,
    pub categories: usize,
}

#[derive(Debug, Clone, Default)]
pub struct StickyFactsManager {
    config: StickyFactsConfig,
    facts: FactSheet,
}

impl StickyFactsManager {
    #[must_use]
    pub fn new(config: StickyFactsConfig) -> Self {
        Self {
            config,
            facts: FactSheet::new(),
        }
    }

    /// Starts from previously persisted facts.
    #[must_use]
    pub fn with_facts(mut self, facts: FactSheet) -> Self {
        self.facts = facts;
        self
    }

    #[must_use]
    pub fn facts(&self) -> &FactSheet {
        &self.facts
    }

    #[must_use]
    pub fn facts_prompt(&self) -> String {
        self.facts.render_prompt()
    }

    #[must_use]
    pub fn stats(&self) -> StickyFactsStats {
        StickyFactsStats {
            total_facts: self.facts.total_facts(),
            categories: self.facts.iter().filter(|(_, v)| !v.is_empty()).count(),
        }
    }

    pub fn reset(&mut self) {
        self.facts = FactSheet::new();
    }

    /// System prompt(s) with the facts addendum, then the most recent
    /// conversational messages.
    #[must_use]
    pub fn build_submission(&self, transcript: &[Message]) -> Vec<Message> {
        let addendum = self.facts_prompt();
        let mut submission = Vec::new();
        let mut addendum_placed = addendum.is_empty();

        for message in transcript.iter().filter(|m| m.is_system()) {
            if addendum_placed {
                submission.push(message.clone());
            } else {
                let content = message.non_empty_content().clone().append(&addendum);
                submission.push(Message::system(content));
                addendum_placed = true;
            }
        }
        if !addendum_placed
            && let Ok(message) = Message::try_new(Role::System, addendum.trim_start())
        {
            submission.push(message);
        }

        let conversation: Vec<&Message> = transcript.iter().filter(|m| !m.is_system()).collect();
        let keep = self.config.recent_messages.min(conversation.len());
        submission.extend(
            conversation[conversation.len() - keep..]
                .iter()
                .map(|m| (*m).clone()),
        );
        submission
    }

    /// Ask the model for an updated fact sheet.
    ///
    /// Transport failures and malformed replies become
    /// [`FactExtraction::Failed`]; they are never errors for the caller.
    pub async fn extract(
        &self,
        transcript: &[Message],
        service: &dyn CompletionService,
        model: &str,
    ) -> FactExtraction {
        let conversation: Vec<&Message> = transcript.iter().filter(|m| !m.is_system()).collect();
        if conversation.is_empty() {
            return FactExtraction::Skipped;
        }

        let start = conversation.len().saturating_sub(self.config.fact_window);
        let lines = conversation[start..]
            .iter()
            .map(|m| format!("{}: {}", m.role_str(), m.content()))
            .collect::<Vec<_>>()
            .join("\n");
        let prompt = EXTRACTION_TEMPLATE
            .replace("{current_facts}", &self.facts.to_pretty_json())
            .replace("{conversation}", &lines);

        let messages = match (
            Message::try_new(Role::System, EXTRACTION_SYSTEM_PROMPT),
            Message::try_user(prompt),
        ) {
            (Ok(system), Ok(user)) => vec![system, user],
            _ => return FactExtraction::Failed("empty extraction prompt".to_string()),
        };

        let request = CompletionRequest::new(model, &messages).with_temperature(0.0);
        match service.complete(request).await {
            Ok(completion) => match parse_fact_reply(completion.text.as_str()) {
                Ok(sheet) => FactExtraction::Parsed(sheet),
                Err(reason) => FactExtraction::Failed(reason),
            },
            Err(e) => FactExtraction::Failed(e.to_string()),
        }
    }

    /// Validate and install a staged extraction.
    pub fn apply(&mut self, extraction: FactExtraction) -> ExtractionOutcome {
        match extraction {
            FactExtraction::Skipped => ExtractionOutcome::Unchanged,
            FactExtraction::Failed(reason) => {
                tracing::warn!(%reason, "Fact extraction failed; keeping existing facts");
                ExtractionOutcome::Failed { reason }
            }
            FactExtraction::Parsed(next) => {
                let lost = self.facts.losses_in(&next);
                if !lost.is_empty() {
                    tracing::warn!(?lost, "Rejecting fact update that drops stored facts");
                    return ExtractionOutcome::Rejected { lost };
                }
                if next == self.facts {
                    return ExtractionOutcome::Unchanged;
                }
                tracing::debug!(total = next.total_facts(), "Sticky facts updated");
                self.facts = next;
                ExtractionOutcome::Updated
            }
        }
    }

    /// [`Self::extract`] followed by [`Self::apply`].
    pub async fn extract_facts(
        &mut self,
        transcript: &[Message],
        service: &dyn CompletionService,
        model: &str,
    ) -> ExtractionOutcome {
        let extraction = self.extract(transcript, service, model).await;
        self.apply(extraction)
    }
}

/// Parse the model reply, tolerating a surrounding code fence.
fn parse_fact_reply(reply: &str) -> Result<FactSheet, String> {
    let mut text = reply.trim();
    if let Some(rest) = text.strip_prefix("```") {
        text = rest.strip_prefix("json").unwrap_or(rest);
        text = text.trim_end().strip_suffix("```").unwrap_or(text);
    }
    let value: Value =
        serde_json::from_str(text.trim()).map_err(|e| format!("invalid facts JSON: {e}"))?;
    FactSheet::from_json(value).map_err(|e| e.to_string())
}
