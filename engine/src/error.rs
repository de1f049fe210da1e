use thiserror::Error;

use parley_context::{BranchingError, CompressionError, StoreError};
use parley_providers::CompletionError;
use parley_types::SessionId;

/// Failure to open, create or manage a session.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("session {0} is open; switch to another session before deleting it")]
    ActiveSession(SessionId),
    #[error("session name must not be empty")]
    EmptyName,
}

/// A turn that did not complete. Nothing was committed.
#[derive(Debug, Error)]
pub enum TurnError {
    #[error("message is empty")]
    EmptyInput,
    #[error(transparent)]
    Compression(#[from] CompressionError),
    #[error(transparent)]
    Completion(#[from] CompletionError),
}

/// A problem that did not stop the turn. In-memory state is authoritative;
/// the durable copy may lag until the next successful write.
#[derive(Debug, Error)]
pub enum TurnWarning {
    #[error("failed to persist: {0}")]
    Store(#[from] StoreError),
    #[error("branch not updated: {0}")]
    Branch(#[from] BranchingError),
}
