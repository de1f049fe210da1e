use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Which context strategy a session runs with. Fixed at session creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    SlidingWindow,
    StickyFacts,
    Branching,
}

impl StrategyKind {
    pub const ALL: [StrategyKind; 3] = [
        StrategyKind::SlidingWindow,
        StrategyKind::StickyFacts,
        StrategyKind::Branching,
    ];

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            StrategyKind::SlidingWindow => "sliding_window",
            StrategyKind::StickyFacts => "sticky_facts",
            StrategyKind::Branching => "branching",
        }
    }

    #[must_use]
    pub const fn display_name(self) -> &'static str {
        match self {
            StrategyKind::SlidingWindow => "Sliding Window",
            StrategyKind::StickyFacts => "Sticky Facts",
            StrategyKind::Branching => "Branching",
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown strategy '{0}' (expected sliding_window, sticky_facts or branching)")]
pub struct UnknownStrategy(pub String);

impl FromStr for StrategyKind {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
        StrategyKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == normalized)
            .ok_or_else(|| UnknownStrategy(s.to_string()))
    }
}
