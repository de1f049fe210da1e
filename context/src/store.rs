//! Durable storage seam.
//!
//! [`PersistenceGateway`] is what the session and the branching manager write
//! through. It is synchronous: writes happen in the commit step of a turn,
//! never across a completion call. [`crate::SqliteStore`] is the production
//! implementation.

use parley_types::{BranchId, CheckpointId, FactSheet, Message, SessionId, StrategyKind};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("session {0} not found")]
    SessionNotFound(SessionId),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Everything needed to create a session row.
#[derive(Debug, Clone, Copy)]
pub struct NewSession<'a> {
    pub name: &'a str,
    pub strategy: StrategyKind,
    pub model: &'a str,
    pub system_prompt: Option<&'a str>,
}

/// A persisted session header. Timestamps are unix seconds.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    pub id: SessionId,
    pub name: String,
    pub strategy: StrategyKind,
    pub model: String,
    pub system_prompt: Option<String>,
    pub created_at: i64,
    pub last_updated: i64,
    pub total_tokens: u64,
    pub message_count: u64,
    /// Leading trunk messages hidden by history clears. They stay stored so
    /// checkpoints taken before a clear keep their prefix.
    pub cleared_messages: u64,
}

/// A checkpoint: the transcript length at creation, plus where that
/// transcript came from (`None` for the trunk).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub id: CheckpointId,
    pub name: String,
    pub message_index: usize,
    pub source_branch: Option<BranchId>,
    /// Trunk messages hidden by clears when the checkpoint was taken.
    /// Always 0 for branch checkpoints.
    pub trunk_offset: usize,
}

/// A persisted branch header; its messages are stored separately.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchRecord {
    pub id: BranchId,
    pub checkpoint_id: CheckpointId,
    pub name: String,
    pub is_active: bool,
}

/// Durable store for sessions, transcripts, facts, checkpoints and branches.
///
/// Every child row belongs to a session; deleting the session removes them.
pub trait PersistenceGateway: Send {
    fn create_session(&mut self, session: NewSession<'_>) -> Result<SessionId, StoreError>;

    fn load_session(&self, id: SessionId) -> Result<SessionRecord, StoreError>;

    /// Most recently updated first.
    fn list_sessions(&self) -> Result<Vec<SessionRecord>, StoreError>;

    /// Returns `false` if no such session existed.
    fn delete_session(&mut self, id: SessionId) -> Result<bool, StoreError>;

    fn rename_session(&mut self, id: SessionId, name: &str) -> Result<(), StoreError>;

    /// Appends trunk messages at the next sequence numbers and bumps the
    /// session's counters. Either every message is stored or none is.
    fn append_messages(
        &mut self,
        id: SessionId,
        messages: &[(&Message, u32)],
    ) -> Result<(), StoreError>;

    fn append_message(
        &mut self,
        id: SessionId,
        message: &Message,
        token_count: u32,
    ) -> Result<(), StoreError> {
        self.append_messages(id, &[(message, token_count)])
    }

    /// Every trunk message in sequence order, including those hidden by a
    /// clear. Never includes the system prompt.
    fn load_messages(&self, id: SessionId) -> Result<Vec<Message>, StoreError>;

    /// Hide the first `count` trunk messages from the live transcript.
    fn set_cleared_messages(&mut self, id: SessionId, count: u64) -> Result<(), StoreError>;

    /// Bumps session counters for messages stored elsewhere (branch turns).
    fn touch_session(
        &mut self,
        id: SessionId,
        added_messages: u32,
        added_tokens: u32,
    ) -> Result<(), StoreError>;

    /// Replaces the stored facts with `facts`.
    fn save_facts(&mut self, id: SessionId, facts: &FactSheet) -> Result<(), StoreError>;

    fn load_facts(&self, id: SessionId) -> Result<FactSheet, StoreError>;

    fn save_checkpoint(&mut self, id: SessionId, checkpoint: &Checkpoint)
    -> Result<(), StoreError>;

    /// In creation order.
    fn load_checkpoints(&self, id: SessionId) -> Result<Vec<Checkpoint>, StoreError>;

    fn save_branch(&mut self, id: SessionId, branch: &BranchRecord) -> Result<(), StoreError>;

    /// Marks `branch` active and every other branch of the session inactive.
    /// `None` deactivates all branches.
    fn set_active_branch(
        &mut self,
        id: SessionId,
        branch: Option<&BranchId>,
    ) -> Result<(), StoreError>;

    /// In creation order.
    fn load_branches(&self, id: SessionId) -> Result<Vec<BranchRecord>, StoreError>;

    fn append_branch_message(
        &mut self,
        id: SessionId,
        branch: &BranchId,
        sequence: u32,
        message: &Message,
        token_count: u32,
    ) -> Result<(), StoreError>;

    /// Branch-local messages (those after the checkpoint), in sequence order.
    fn load_branch_messages(
        &self,
        id: SessionId,
        branch: &BranchId,
    ) -> Result<Vec<Message>, StoreError>;
}

/// Result of an operation whose in-memory effect always applies but whose
/// durable write may have failed.
#[derive(Debug)]
#[must_use]
pub struct WriteThrough<T> {
    pub value: T,
    pub store_error: Option<StoreError>,
}

impl<T> WriteThrough<T> {
    pub(crate) fn stored(value: T) -> Self {
        Self {
            value,
            store_error: None,
        }
    }

    pub(crate) fn from_write(value: T, write: Result<(), StoreError>) -> Self {
        Self {
            value,
            store_error: write.err(),
        }
    }

    /// Splits into the value and the write error, if any.
    pub fn into_parts(self) -> (T, Option<StoreError>) {
        (self.value, self.store_error)
    }
}
