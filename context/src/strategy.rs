//! The active context strategy of a session.
//!
//! A turn drives the strategy in three steps:
//!
//! 1. [`ContextStrategy::prepare`] builds the submission from the staged
//!    transcript (user message included). May call the model.
//! 2. [`ContextStrategy::after_reply`] stages any post-reply work once the
//!    assistant message is known. May call the model.
//! 3. [`ContextStrategy::commit`] applies everything staged. Synchronous.
//!
//! Steps 1 and 2 only read the strategy, so dropping a turn before step 3
//! changes nothing.

use std::fmt;

use parley_providers::CompletionService;
use parley_types::{Message, StrategyKind};

use crate::branching::{BranchingError, BranchingManager, BranchingStats};
use crate::compressor::{
    CompressionError, CompressionPlan, CompressorConfig, CompressorStats, ContextCompressor,
};
use crate::sticky_facts::{
    ExtractionOutcome, FactExtraction, StickyFactsConfig, StickyFactsManager, StickyFactsStats,
};
use crate::store::{PersistenceGateway, StoreError};
use crate::token_counter::TokenCounter;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StrategyConfig {
    pub compressor: CompressorConfig,
    pub sticky_facts: StickyFactsConfig,
}

#[derive(Debug)]
pub enum ContextStrategy {
    SlidingWindow {
        compressor: ContextCompressor,
        enabled: bool,
    },
    StickyFacts(StickyFactsManager),
    Branching(BranchingManager),
}

/// Staged strategy updates for one turn.
#[derive(Debug, Default)]
pub struct PendingUpdate {
    compression: Option<CompressionPlan>,
    facts: Option<FactExtraction>,
}

/// Output of [`ContextStrategy::prepare`].
#[derive(Debug)]
pub struct PreparedContext {
    submission: Vec<Message>,
    pending: PendingUpdate,
}

impl PreparedContext {
    #[must_use]
    pub fn submission(&self) -> &[Message] {
        &self.submission
    }

    #[must_use]
    pub fn into_parts(self) -> (Vec<Message>, PendingUpdate) {
        (self.submission, self.pending)
    }
}

/// What [`ContextStrategy::commit`] did besides applying staged state.
#[derive(Debug, Default)]
pub struct CommitReport {
    pub facts: Option<ExtractionOutcome>,
    pub branch_messages_written: usize,
    pub branch_error: Option<BranchingError>,
    pub store_error: Option<StoreError>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StrategyStats {
    SlidingWindow {
        enabled: bool,
        compressor: CompressorStats,
    },
    StickyFacts(StickyFactsStats),
    Branching(BranchingStats),
}

impl fmt::Display for StrategyStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StrategyStats::SlidingWindow { enabled: false, .. } => {
                write!(f, "compression off")
            }
            StrategyStats::SlidingWindow {
                enabled: true,
                compressor,
            } => write!(
                f,
                "summaries: {} | saved {} of {} tokens ({:.1}%)",
                compressor.summaries,
                compressor.last.saved(),
                compressor.last.original_tokens,
                compressor.last.ratio()
            ),
            StrategyStats::StickyFacts(stats) => write!(
                f,
                "facts: {} in {} categories",
                stats.total_facts, stats.categories
            ),
            StrategyStats::Branching(stats) => {
                write!(
                    f,
                    "checkpoints: {} | branches: {} | current: ",
                    stats.checkpoints, stats.branches
                )?;
                match &stats.current_branch {
                    Some(id) => write!(f, "{id}"),
                    None => f.write_str("main"),
                }
            }
        }
    }
}

impl ContextStrategy {
    #[must_use]
    pub fn new(kind: StrategyKind, config: StrategyConfig) -> Self {
        match kind {
            StrategyKind::SlidingWindow => ContextStrategy::SlidingWindow {
                compressor: ContextCompressor::new(config.compressor),
                enabled: true,
            },
            StrategyKind::StickyFacts => {
                ContextStrategy::StickyFacts(StickyFactsManager::new(config.sticky_facts))
            }
            StrategyKind::Branching => ContextStrategy::Branching(BranchingManager::new()),
        }
    }

    #[must_use]
    pub fn kind(&self) -> StrategyKind {
        match self {
            ContextStrategy::SlidingWindow { .. } => StrategyKind::SlidingWindow,
            ContextStrategy::StickyFacts(_) => StrategyKind::StickyFacts,
            ContextStrategy::Branching(_) => StrategyKind::Branching,
        }
    }

    /// Build the submission for `transcript`.
    pub async fn prepare(
        &self,
        transcript: &[Message],
        counter: &TokenCounter,
        service: &dyn CompletionService,
        model: &str,
    ) -> Result<PreparedContext, CompressionError> {
        match self {
            ContextStrategy::SlidingWindow {
                compressor,
                enabled: true,
            } => {
                let plan = compressor
                    .prepare(transcript, counter, service, model)
                    .await?;
                Ok(PreparedContext {
                    submission: plan.submission().to_vec(),
                    pending: PendingUpdate {
                        compression: Some(plan),
                        facts: None,
                    },
                })
            }
            ContextStrategy::StickyFacts(manager) => Ok(PreparedContext {
                submission: manager.build_submission(transcript),
                pending: PendingUpdate::default(),
            }),
            ContextStrategy::SlidingWindow { enabled: false, .. }
            | ContextStrategy::Branching(_) => Ok(PreparedContext {
                submission: transcript.to_vec(),
                pending: PendingUpdate::default(),
            }),
        }
    }

    /// Stage post-reply work against the transcript that now ends with the
    /// assistant reply.
    pub async fn after_reply(
        &self,
        transcript: &[Message],
        service: &dyn CompletionService,
        model: &str,
        pending: &mut PendingUpdate,
    ) {
        if let ContextStrategy::StickyFacts(manager) = self {
            pending.facts = Some(manager.extract(transcript, service, model).await);
        }
    }

    /// Apply staged updates. `transcript` is the committed transcript.
    pub fn commit(
        &mut self,
        pending: PendingUpdate,
        transcript: &[Message],
        counter: &TokenCounter,
        store: &mut dyn PersistenceGateway,
    ) -> CommitReport {
        let mut report = CommitReport::default();
        match self {
            ContextStrategy::SlidingWindow { compressor, .. } => {
                if let Some(plan) = pending.compression {
                    compressor.commit(plan);
                }
            }
            ContextStrategy::StickyFacts(manager) => {
                if let Some(extraction) = pending.facts {
                    report.facts = Some(manager.apply(extraction));
                }
            }
            ContextStrategy::Branching(manager) => {
                match manager.update_current_branch(transcript, counter, store) {
                    Ok(write) => {
                        let (written, error) = write.into_parts();
                        report.branch_messages_written = written;
                        report.store_error = error;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "Branch update failed");
                        report.branch_error = Some(e);
                    }
                }
            }
        }
        report
    }

    /// Turn compression on or off. Returns `false` for other strategies.
    ///
    /// Switching off discards the summaries.
    pub fn set_compression(&mut self, on: bool) -> bool {
        match self {
            ContextStrategy::SlidingWindow {
                compressor,
                enabled,
            } => {
                if !on {
                    compressor.reset();
                }
                *enabled = on;
                true
            }
            _ => false,
        }
    }

    #[must_use]
    pub fn compression_enabled(&self) -> Option<bool> {
        match self {
            ContextStrategy::SlidingWindow { enabled, .. } => Some(*enabled),
            _ => None,
        }
    }

    #[must_use]
    pub fn sticky_facts(&self) -> Option<&StickyFactsManager> {
        match self {
            ContextStrategy::StickyFacts(manager) => Some(manager),
            _ => None,
        }
    }

    pub fn sticky_facts_mut(&mut self) -> Option<&mut StickyFactsManager> {
        match self {
            ContextStrategy::StickyFacts(manager) => Some(manager),
            _ => None,
        }
    }

    #[must_use]
    pub fn branching(&self) -> Option<&BranchingManager> {
        match self {
            ContextStrategy::Branching(manager) => Some(manager),
            _ => None,
        }
    }

    pub fn branching_mut(&mut self) -> Option<&mut BranchingManager> {
        match self {
            ContextStrategy::Branching(manager) => Some(manager),
            _ => None,
        }
    }

    #[must_use]
    pub fn stats(&self) -> StrategyStats {
        match self {
            ContextStrategy::SlidingWindow {
                compressor,
                enabled,
            } => StrategyStats::SlidingWindow {
                enabled: *enabled,
                compressor: compressor.stats(),
            },
            ContextStrategy::StickyFacts(manager) => StrategyStats::StickyFacts(manager.stats()),
            ContextStrategy::Branching(manager) => StrategyStats::Branching(manager.stats()),
        }
    }
}
