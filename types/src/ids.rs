use std::fmt;

use thiserror::Error;

/// Row id of a persisted session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct SessionId(i64);

impl SessionId {
    #[must_use]
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    #[must_use]
    pub fn value(self) -> i64 {
        self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("malformed {kind} id: {value}")]
pub struct IdParseError {
    pub kind: &'static str,
    pub value: String,
}

/// Splits `<prefix>_<sequence>_<millis>` and returns the sequence.
fn parse_sequence(prefix: &str, value: &str) -> Option<u64> {
    let rest = value.strip_prefix(prefix)?.strip_prefix('_')?;
    let (sequence, millis) = rest.split_once('_')?;
    millis.parse::<i64>().ok()?;
    sequence.parse().ok()
}

/// Identifier of a checkpoint, shaped `cp_<sequence>_<unix-millis>`.
///
/// The sequence is a per-manager counter; it is recovered from persisted ids
/// so that new ids stay unique after a reload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct CheckpointId(String);

impl CheckpointId {
    const PREFIX: &'static str = "cp";

    #[must_use]
    pub fn generate(sequence: u64, unix_millis: i64) -> Self {
        Self(format!("{}_{sequence}_{unix_millis}", Self::PREFIX))
    }

    pub fn parse(value: impl Into<String>) -> Result<Self, IdParseError> {
        let value = value.into();
        if parse_sequence(Self::PREFIX, &value).is_some() {
            Ok(Self(value))
        } else {
            Err(IdParseError {
                kind: "checkpoint",
                value,
            })
        }
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        parse_sequence(Self::PREFIX, &self.0).unwrap_or(0)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CheckpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a branch, shaped `br_<sequence>_<unix-millis>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct BranchId(String);

impl BranchId {
    const PREFIX: &'static str = "br";

    #[must_use]
    pub fn generate(sequence: u64, unix_millis: i64) -> Self {
        Self(format!("{}_{sequence}_{unix_millis}", Self::PREFIX))
    }

    pub fn parse(value: impl Into<String>) -> Result<Self, IdParseError> {
        let value = value.into();
        if parse_sequence(Self::PREFIX, &value).is_some() {
            Ok(Self(value))
        } else {
            Err(IdParseError {
                kind: "branch",
                value,
            })
        }
    }

    #[must_use]
    pub fn sequence(&self) -> u64 {
        parse_sequence(Self::PREFIX, &self.0).unwrap_or(0)
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BranchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
