//! Core domain types for Parley.
//!
//! This crate contains pure domain types with no IO, no async, and minimal dependencies.
//! Everything here can be used from any layer of the application.

mod facts;
mod ids;
mod message;
mod proofs;
mod strategy;

pub use facts::{FactCategory, FactParseError, FactRow, FactSheet, FactValue};
pub use ids::{BranchId, CheckpointId, IdParseError, SessionId};
pub use message::{Message, Role, RoleParseError};
pub use proofs::{EmptyStringError, NonEmptyString};
pub use strategy::{StrategyKind, UnknownStrategy};

use serde::{Deserialize, Serialize};

// ============================================================================
// Streaming Types
// ============================================================================

/// Events emitted while a completion streams in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Text content delta.
    TextDelta(String),
    /// Token usage reported by the service, usually just before `Done`.
    Usage(ApiUsage),
    /// Stream completed.
    Done,
    /// Error occurred.
    Error(String),
}

/// Token usage reported by the completion service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl ApiUsage {
    #[must_use]
    pub fn total(self) -> u32 {
        self.prompt_tokens.saturating_add(self.completion_tokens)
    }

    pub fn merge(&mut self, other: ApiUsage) {
        self.prompt_tokens = self.prompt_tokens.saturating_add(other.prompt_tokens);
        self.completion_tokens = self
            .completion_tokens
            .saturating_add(other.completion_tokens);
    }
}
