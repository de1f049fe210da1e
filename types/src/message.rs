//! Conversation message model.
//!
//! A message is a role plus validated content. The serialized form is the
//! Chat Completions shape (`{"role": "...", "content": "..."}`), so a slice of
//! messages can go on the wire as-is.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::proofs::{EmptyStringError, NonEmptyString};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }

    /// Capitalized label used when rendering transcripts for summarization.
    #[must_use]
    pub const fn label(self) -> &'static str {
        match self {
            Role::System => "System",
            Role::User => "User",
            Role::Assistant => "Assistant",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown message role: {0}")]
pub struct RoleParseError(pub String);

impl FromStr for Role {
    type Err = RoleParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(RoleParseError(other.to_string())),
        }
    }
}

/// A single conversational message.
///
/// Immutable once built; strategies copy messages into derived sequences but
/// never edit them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    role: Role,
    content: NonEmptyString,
}

impl Message {
    #[must_use]
    pub fn new(role: Role, content: NonEmptyString) -> Self {
        Self { role, content }
    }

    pub fn try_new(role: Role, content: impl Into<String>) -> Result<Self, EmptyStringError> {
        Ok(Self::new(role, NonEmptyString::new(content)?))
    }

    #[must_use]
    pub fn system(content: NonEmptyString) -> Self {
        Self::new(Role::System, content)
    }

    #[must_use]
    pub fn user(content: NonEmptyString) -> Self {
        Self::new(Role::User, content)
    }

    #[must_use]
    pub fn assistant(content: NonEmptyString) -> Self {
        Self::new(Role::Assistant, content)
    }

    pub fn try_user(content: impl Into<String>) -> Result<Self, EmptyStringError> {
        Self::try_new(Role::User, content)
    }

    #[must_use]
    pub fn role(&self) -> Role {
        self.role
    }

    #[must_use]
    pub fn role_str(&self) -> &'static str {
        self.role.as_str()
    }

    #[must_use]
    pub fn content(&self) -> &str {
        self.content.as_str()
    }

    #[must_use]
    pub fn non_empty_content(&self) -> &NonEmptyString {
        &self.content
    }

    #[must_use]
    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }
}
