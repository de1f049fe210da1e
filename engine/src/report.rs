use std::fmt;

use parley_context::{ExtractionOutcome, StrategyStats};
use parley_types::ApiUsage;

use crate::error::TurnWarning;

/// Live transcript size against the configured token limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBudget {
    pub used: u32,
    pub limit: u32,
    pub threshold: f64,
}

impl TokenBudget {
    /// Percentage of `limit` in use.
    #[must_use]
    pub fn percent(&self) -> f64 {
        if self.limit == 0 {
            return 0.0;
        }
        f64::from(self.used) / f64::from(self.limit) * 100.0
    }

    /// At or over `threshold * limit`.
    #[must_use]
    pub fn is_warning(&self) -> bool {
        f64::from(self.used) >= f64::from(self.limit) * self.threshold
    }
}

impl fmt::Display for TokenBudget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{} tokens ({:.1}%)",
            self.used,
            self.limit,
            self.percent()
        )
    }
}

/// Everything a completed turn produced.
#[derive(Debug)]
pub struct TurnReport {
    pub reply: String,
    /// Tokens in the submission actually sent.
    pub prompt_tokens: u32,
    /// Tokens in the full live transcript after the turn.
    pub history_tokens: u32,
    pub response_tokens: u32,
    /// Usage as reported by the service, when it reports any.
    pub usage: ApiUsage,
    pub strategy: StrategyStats,
    pub facts: Option<ExtractionOutcome>,
    /// Set when the session was titled during this turn.
    pub new_title: Option<String>,
    pub budget: TokenBudget,
    pub warnings: Vec<TurnWarning>,
}
