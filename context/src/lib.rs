//! Context management for long conversations.
//!
//! Each session runs exactly one strategy for keeping its requests inside
//! the model's window:
//!
//! - Sliding window: recent messages verbatim, older ones summarized
//! - Sticky facts: a model-maintained fact sheet plus the last few messages
//! - Branching: full transcript, with checkpoints and alternate branches
//!
//! # Architecture
//!
//! ```text
//! ContextStrategy
//! ├── SlidingWindow: ContextCompressor (append-only summaries)
//! ├── StickyFacts:   StickyFactsManager (FactSheet)
//! └── Branching:     BranchingManager (checkpoints, branches, saved counts)
//!
//! PersistenceGateway (trait)
//! └── SqliteStore (sessions, messages, facts, checkpoints, branches)
//!
//! TokenCounter (tiktoken cl100k_base)
//! ```

mod branching;
mod compressor;
mod sqlite_store;
mod sticky_facts;
mod store;
mod strategy;
#[cfg(test)]
mod test_support;
mod token_counter;

pub use branching::{Branch, BranchSummary, BranchingError, BranchingManager, BranchingStats};
pub use compressor::{
    CompressionError, CompressionPlan, CompressionStats, CompressorConfig, CompressorStats,
    ContextCompressor,
};
pub use sqlite_store::SqliteStore;
pub use sticky_facts::{
    ExtractionOutcome, FactExtraction, StickyFactsConfig, StickyFactsManager, StickyFactsStats,
};
pub use store::{
    BranchRecord, Checkpoint, NewSession, PersistenceGateway, SessionRecord, StoreError,
    WriteThrough,
};
pub use strategy::{
    CommitReport, ContextStrategy, PendingUpdate, PreparedContext, StrategyConfig, StrategyStats,
};
pub use token_counter::{LIST_OVERHEAD, MESSAGE_OVERHEAD, TokenCounter};
