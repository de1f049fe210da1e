//! Conversation engine for Parley.
//!
//! [`ConversationSession`] owns one conversation: its transcript, the active
//! [`ContextStrategy`](parley_context::ContextStrategy) and the durable
//! record behind it. Everything here is UI-free; the binary drives it.

mod commands;
mod error;
mod experts;
mod report;
mod session;
#[cfg(test)]
mod test_support;
mod title;

pub use commands::{
    BranchCommand, Command, CommandSpec, CompressionArg, command_help_summary, command_specs,
};
pub use error::{SessionError, TurnError, TurnWarning};
pub use experts::{EXPERT_TEMPERATURE, EXPERTS, Expert, ExpertAnswer, consult_experts};
pub use report::{TokenBudget, TurnReport};
pub use session::{
    ConversationSession, DEFAULT_TOKEN_LIMIT, DEFAULT_WARNING_THRESHOLD, SessionOptions,
};
pub use title::{DEFAULT_SESSION_NAME, generate_title};

// Re-export from crates for public API
pub use parley_context::{
    BranchSummary, BranchingError, Checkpoint, CompressorConfig, ExtractionOutcome,
    PersistenceGateway, SessionRecord, SqliteStore, StickyFactsConfig, StoreError,
    StrategyConfig, StrategyStats,
};
pub use parley_providers::retry::RetryConfig;
pub use parley_providers::{ApiConfig, ApiKey, CompletionService, OpenAiClient};
pub use parley_types::{
    ApiUsage, FactCategory, FactSheet, FactValue, Message, Role, SessionId, StrategyKind,
    StreamEvent,
};
