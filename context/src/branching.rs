//! Checkpoints and branches over the conversation transcript.
//!
//! A checkpoint records a transcript length (`message_index`) and the
//! transcript it was taken from: the trunk, or the branch that was current.
//! A branch starts as a copy of that source's first `message_index` messages
//! and then grows on its own.
//!
//! ```text
//! trunk:     s u a u a u a
//!                    ^ cp_1 (index 4)
//! br_1:      s u a u | u a u        prefix = trunk[..4]
//!                          ^ cp_2 (index 6, source br_1)
//! br_2:      s u a u u a | u        prefix = br_1[..6]
//! ```
//!
//! The trunk handed to the manager is the whole stored trunk, including
//! messages a history clear has hidden. A trunk checkpoint remembers how many
//! were hidden when it was taken, so its prefix is read from the same view
//! of the trunk the user saw.
//!
//! Persistence is incremental. Each branch keeps a saved count of messages
//! already written past its checkpoint; [`BranchingManager::update_current_branch`]
//! writes only the ones after it and advances the count per successful write,
//! so a retried update never duplicates rows.

use std::borrow::Cow;
use std::collections::HashMap;

use thiserror::Error;

use parley_types::{BranchId, CheckpointId, Message, SessionId};

use crate::store::{
    BranchRecord, Checkpoint, PersistenceGateway, StoreError, WriteThrough,
};
use crate::token_counter::TokenCounter;

#[derive(Debug, Error)]
pub enum BranchingError {
    #[error("checkpoint '{0}' not found")]
    UnknownCheckpoint(String),
    #[error("branch '{0}' not found")]
    UnknownBranch(String),
    #[error(
        "checkpoint {checkpoint} covers {needed} messages but its source only has {available}"
    )]
    PrefixUnavailable {
        checkpoint: CheckpointId,
        needed: usize,
        available: usize,
    },
    #[error("transcript does not start with the checkpoint prefix of branch {branch}")]
    PrefixMismatch { branch: BranchId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Branch {
    id: BranchId,
    checkpoint_id: CheckpointId,
    name: String,
    messages: Vec<Message>,
}

impl Branch {
    #[must_use]
    pub fn id(&self) -> &BranchId {
        &self.id
    }

    #[must_use]
    pub fn checkpoint_id(&self) -> &CheckpointId {
        &self.checkpoint_id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn messages(&self) -> &[Message] {
        &self.messages
    }
}

/// One row of [`BranchingManager::list_branches`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSummary {
    pub id: BranchId,
    pub checkpoint_id: CheckpointId,
    pub name: String,
    /// Messages added on the branch since its checkpoint.
    pub message_count: usize,
    pub is_current: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchingStats {
    pub checkpoints: usize,
    pub branches: usize,
    pub current_branch: Option<BranchId>,
}

#[derive(Debug, Default)]
pub struct BranchingManager {
    /// Writes go through only when attached to a session.
    session: Option<SessionId>,
    checkpoints: Vec<Checkpoint>,
    branches: Vec<Branch>,
    current: Option<BranchId>,
    checkpoint_counter: u64,
    branch_counter: u64,
    saved_counts: HashMap<BranchId, usize>,
    /// Trunk messages currently hidden by history clears.
    trunk_hidden: usize,
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// `trunk` with the first `hidden` non-system messages removed.
fn trunk_view(trunk: &[Message], hidden: usize) -> Cow<'_, [Message]> {
    if hidden == 0 {
        return Cow::Borrowed(trunk);
    }
    let system = trunk.iter().take_while(|m| m.is_system()).count();
    let start = (system + hidden).min(trunk.len());
    Cow::Owned(trunk[..system].iter().chain(&trunk[start..]).cloned().collect())
}

impl BranchingManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Persist subsequent changes under `session`.
    pub fn attach(&mut self, session: SessionId) {
        self.session = Some(session);
    }

    fn write(
        &self,
        store: &mut dyn PersistenceGateway,
        op: impl FnOnce(&mut dyn PersistenceGateway, SessionId) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        match self.session {
            Some(session) => op(store, session),
            None => Ok(()),
        }
    }

    /// Record that the first `hidden` trunk messages were cleared from view.
    /// Later trunk checkpoints index into what remains.
    pub fn hide_trunk_messages(&mut self, hidden: usize) {
        self.trunk_hidden = hidden;
    }

    fn find_checkpoint(&self, id: &str) -> Option<&Checkpoint> {
        self.checkpoints.iter().find(|cp| cp.id.as_str() == id)
    }

    fn find_branch(&self, id: &str) -> Option<&Branch> {
        self.branches.iter().find(|br| br.id.as_str() == id)
    }

    /// Record the current length of `transcript` as a checkpoint.
    pub fn create_checkpoint(
        &mut self,
        name: &str,
        transcript: &[Message],
        store: &mut dyn PersistenceGateway,
    ) -> WriteThrough<CheckpointId> {
        self.checkpoint_counter += 1;
        let checkpoint = Checkpoint {
            id: CheckpointId::generate(self.checkpoint_counter, now_millis()),
            name: name.to_string(),
            message_index: transcript.len(),
            source_branch: self.current.clone(),
            trunk_offset: if self.current.is_some() {
                0
            } else {
                self.trunk_hidden
            },
        };
        tracing::info!(
            checkpoint = %checkpoint.id,
            index = checkpoint.message_index,
            source = ?checkpoint.source_branch,
            "Created checkpoint"
        );

        let write = self.write(store, |store, session| {
            store.save_checkpoint(session, &checkpoint)
        });
        let id = checkpoint.id.clone();
        self.checkpoints.push(checkpoint);
        WriteThrough::from_write(id, write)
    }

    /// Fork a new, inactive branch at `checkpoint_id`.
    ///
    /// The prefix comes from the checkpoint's source: the full stored `trunk`
    /// for trunk checkpoints, otherwise the source branch's messages.
    pub fn create_branch(
        &mut self,
        checkpoint_id: &str,
        name: &str,
        trunk: &[Message],
        store: &mut dyn PersistenceGateway,
    ) -> Result<WriteThrough<BranchId>, BranchingError> {
        let checkpoint = self
            .find_checkpoint(checkpoint_id)
            .ok_or_else(|| BranchingError::UnknownCheckpoint(checkpoint_id.to_string()))?;
        let base = match &checkpoint.source_branch {
            None => trunk_view(trunk, checkpoint.trunk_offset),
            Some(source) => self
                .find_branch(source.as_str())
                .map(|br| Cow::Borrowed(br.messages()))
                .ok_or_else(|| BranchingError::UnknownBranch(source.to_string()))?,
        };
        if base.len() < checkpoint.message_index {
            return Err(BranchingError::PrefixUnavailable {
                checkpoint: checkpoint.id.clone(),
                needed: checkpoint.message_index,
                available: base.len(),
            });
        }

        let messages = base[..checkpoint.message_index].to_vec();
        let checkpoint_id = checkpoint.id.clone();
        self.branch_counter += 1;
        let branch = Branch {
            id: BranchId::generate(self.branch_counter, now_millis()),
            checkpoint_id,
            name: name.to_string(),
            messages,
        };
        tracing::info!(branch = %branch.id, checkpoint = %branch.checkpoint_id, "Created branch");

        let record = BranchRecord {
            id: branch.id.clone(),
            checkpoint_id: branch.checkpoint_id.clone(),
            name: branch.name.clone(),
            is_active: false,
        };
        let write = self.write(store, |store, session| store.save_branch(session, &record));

        let id = branch.id.clone();
        self.saved_counts.insert(id.clone(), 0);
        self.branches.push(branch);
        Ok(WriteThrough::from_write(id, write))
    }

    /// Make `branch_id` current and return a copy of its messages.
    pub fn switch_branch(
        &mut self,
        branch_id: &str,
        store: &mut dyn PersistenceGateway,
    ) -> Result<WriteThrough<Vec<Message>>, BranchingError> {
        let branch = self
            .find_branch(branch_id)
            .ok_or_else(|| BranchingError::UnknownBranch(branch_id.to_string()))?;
        let id = branch.id.clone();
        let messages = branch.messages.clone();

        let write = self.write(store, |store, session| {
            store.set_active_branch(session, Some(&id))
        });
        tracing::info!(branch = %id, messages = messages.len(), "Switched branch");
        self.current = Some(id);
        Ok(WriteThrough::from_write(messages, write))
    }

    /// Return to the trunk.
    pub fn detach(&mut self, store: &mut dyn PersistenceGateway) -> WriteThrough<()> {
        if self.current.take().is_none() {
            return WriteThrough::stored(());
        }
        let write = self.write(store, |store, session| store.set_active_branch(session, None));
        WriteThrough::from_write((), write)
    }

    /// Persist the messages `transcript` adds to the current branch, then
    /// mirror it.
    ///
    /// The value is the number of messages written. Writing stops at the
    /// first failure; the remainder goes out on the next call.
    pub fn update_current_branch(
        &mut self,
        transcript: &[Message],
        counter: &TokenCounter,
        store: &mut dyn PersistenceGateway,
    ) -> Result<WriteThrough<usize>, BranchingError> {
        let Some(current) = self.current.clone() else {
            return Ok(WriteThrough::stored(0));
        };
        let branch_idx = self
            .branches
            .iter()
            .position(|br| br.id == current)
            .ok_or_else(|| BranchingError::UnknownBranch(current.to_string()))?;
        let index = {
            let branch = &self.branches[branch_idx];
            let checkpoint = self
                .find_checkpoint(branch.checkpoint_id.as_str())
                .ok_or_else(|| BranchingError::UnknownCheckpoint(branch.checkpoint_id.to_string()))?;
            checkpoint.message_index
        };

        let prefix = &self.branches[branch_idx].messages[..index];
        if transcript.len() < index || &transcript[..index] != prefix {
            return Err(BranchingError::PrefixMismatch { branch: current });
        }

        let mut saved = self.saved_counts.get(&current).copied().unwrap_or(0);
        let start = (index + saved).min(transcript.len());
        let mut written = 0;
        let mut store_error = None;
        for message in &transcript[start..] {
            let sequence = u32::try_from(saved).unwrap_or(u32::MAX);
            let tokens = counter.count(message.content());
            let write = self.write(store, |store, session| {
                store.append_branch_message(session, &current, sequence, message, tokens)
            });
            if let Err(e) = write {
                tracing::warn!(branch = %current, sequence, error = %e, "Failed to persist branch message");
                store_error = Some(e);
                break;
            }
            saved += 1;
            written += 1;
        }

        self.saved_counts.insert(current, saved);
        self.branches[branch_idx].messages = transcript.to_vec();
        Ok(WriteThrough {
            value: written,
            store_error,
        })
    }

    /// Rebuild checkpoints and branches for `session` from `store`. `trunk`
    /// is the full stored trunk; call [`Self::hide_trunk_messages`] afterwards
    /// to restore the clear boundary.
    ///
    /// Branches whose checkpoint or source is missing are skipped with a
    /// warning rather than failing the load.
    pub fn load_from_db(
        &mut self,
        session: SessionId,
        trunk: &[Message],
        store: &dyn PersistenceGateway,
    ) -> Result<(), StoreError> {
        self.reset();
        self.session = Some(session);

        let checkpoints = store.load_checkpoints(session)?;
        let records = store.load_branches(session)?;
        self.checkpoint_counter = checkpoints
            .iter()
            .map(|cp| cp.id.sequence())
            .max()
            .unwrap_or(0);
        self.branch_counter = records
            .iter()
            .map(|br| br.id.sequence())
            .max()
            .unwrap_or(0);
        self.checkpoints = checkpoints;

        for record in records {
            let Some(checkpoint) = self.find_checkpoint(record.checkpoint_id.as_str()) else {
                tracing::warn!(branch = %record.id, "Skipping branch with missing checkpoint");
                continue;
            };
            let base = match &checkpoint.source_branch {
                None => Some(trunk_view(trunk, checkpoint.trunk_offset)),
                Some(source) => self
                    .find_branch(source.as_str())
                    .map(|br| Cow::Borrowed(br.messages())),
            };
            let index = checkpoint.message_index;
            let Some(mut messages) = base
                .filter(|base| base.len() >= index)
                .map(|base| base[..index].to_vec())
            else {
                tracing::warn!(branch = %record.id, "Skipping branch whose prefix is unavailable");
                continue;
            };

            let persisted = store.load_branch_messages(session, &record.id)?;
            self.saved_counts.insert(record.id.clone(), persisted.len());
            messages.extend(persisted);

            if record.is_active {
                self.current = Some(record.id.clone());
            }
            self.branches.push(Branch {
                id: record.id,
                checkpoint_id: record.checkpoint_id,
                name: record.name,
                messages,
            });
        }

        tracing::info!(
            session = %session,
            checkpoints = self.checkpoints.len(),
            branches = self.branches.len(),
            current = ?self.current,
            "Loaded branching state"
        );
        Ok(())
    }

    #[must_use]
    pub fn list_checkpoints(&self) -> &[Checkpoint] {
        &self.checkpoints
    }

    /// Branches in creation order, optionally only those of one checkpoint.
    #[must_use]
    pub fn list_branches(&self, checkpoint_id: Option<&str>) -> Vec<BranchSummary> {
        self.branches
            .iter()
            .filter(|br| checkpoint_id.is_none_or(|cp| br.checkpoint_id.as_str() == cp))
            .map(|br| {
                let index = self
                    .find_checkpoint(br.checkpoint_id.as_str())
                    .map_or(0, |cp| cp.message_index);
                BranchSummary {
                    id: br.id.clone(),
                    checkpoint_id: br.checkpoint_id.clone(),
                    name: br.name.clone(),
                    message_count: br.messages.len().saturating_sub(index),
                    is_current: self.current.as_ref() == Some(&br.id),
                }
            })
            .collect()
    }

    #[must_use]
    pub fn current_branch(&self) -> Option<&Branch> {
        self.current
            .as_ref()
            .and_then(|id| self.find_branch(id.as_str()))
    }

    #[must_use]
    pub fn branch(&self, id: &str) -> Option<&Branch> {
        self.find_branch(id)
    }

    #[must_use]
    pub fn stats(&self) -> BranchingStats {
        BranchingStats {
            checkpoints: self.checkpoints.len(),
            branches: self.branches.len(),
            current_branch: self.current.clone(),
        }
    }

    /// Forget all in-memory state. Stored rows are left alone.
    pub fn reset(&mut self) {
        self.checkpoints.clear();
        self.branches.clear();
        self.current = None;
        self.checkpoint_counter = 0;
        self.branch_counter = 0;
        self.saved_counts.clear();
        self.trunk_hidden = 0;
    }
}

#[cfg(test)]
mod tests {
    use parley_types::{Message, Role, SessionId, StrategyKind};

    use super::{BranchingError, BranchingManager};
    use crate::sqlite_store::SqliteStore;
    use crate::store::{NewSession, PersistenceGateway};
    use crate::token_counter::TokenCounter;

    fn msg(role: Role, text: &str) -> Message {
        Message::try_new(role, text).unwrap()
    }

    fn trunk() -> Vec<Message> {
        vec![
            msg(Role::System, "sys"),
            msg(Role::User, "u1"),
            msg(Role::Assistant, "a1"),
            msg(Role::User, "u2"),
        ]
    }

    fn store_with_session() -> (SqliteStore, SessionId) {
        let mut store = SqliteStore::open_in_memory().unwrap();
        let id = store
            .create_session(NewSession {
                name: "branches",
                strategy: StrategyKind::Branching,
                model: "m",
                system_prompt: Some("sys"),
            })
            .unwrap();
        (store, id)
    }

    fn extend(mut transcript: Vec<Message>, texts: &[&str]) -> Vec<Message> {
        for (i, text) in texts.iter().enumerate() {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            transcript.push(msg(role, text));
        }
        transcript
    }

    #[test]
    fn checkpoint_records_transcript_length() {
        let (mut store, _) = store_with_session();
        let mut manager = BranchingManager::new();
        let cp = manager
            .create_checkpoint("start", &trunk(), &mut store)
            .value;

        let checkpoints = manager.list_checkpoints();
        assert_eq!(checkpoints.len(), 1);
        assert_eq!(checkpoints[0].id, cp);
        assert_eq!(checkpoints[0].message_index, 4);
        assert_eq!(checkpoints[0].source_branch, None);
        assert_eq!(cp.sequence(), 1);
    }

    #[test]
    fn unknown_ids_are_reported() {
        let (mut store, _) = store_with_session();
        let mut manager = BranchingManager::new();
        assert!(matches!(
            manager.create_branch("cp_9_1", "x", &trunk(), &mut store),
            Err(BranchingError::UnknownCheckpoint(id)) if id == "cp_9_1"
        ));
        assert!(matches!(
            manager.switch_branch("br_9_1", &mut store),
            Err(BranchingError::UnknownBranch(_))
        ));
    }

    #[test]
    fn switching_away_and_back_restores_branch_messages() {
        let (mut store, session) = store_with_session();
        let counter = TokenCounter::new();
        let mut manager = BranchingManager::new();
        manager.attach(session);

        let base = trunk();
        let cp = manager.create_checkpoint("cp", &base, &mut store).value;
        let a = manager
            .create_branch(cp.as_str(), "a", &base, &mut store)
            .unwrap()
            .value;
        let b = manager
            .create_branch(cp.as_str(), "b", &base, &mut store)
            .unwrap()
            .value;

        let live = manager.switch_branch(a.as_str(), &mut store).unwrap().value;
        assert_eq!(live, base);
        let live = extend(live, &["a-u", "a-a", "a-u2"]);
        let written = manager
            .update_current_branch(&live, &counter, &mut store)
            .unwrap();
        assert_eq!(written.value, 3);
        assert!(written.store_error.is_none());

        let other = manager.switch_branch(b.as_str(), &mut store).unwrap().value;
        assert_eq!(other, base);

        let back = manager.switch_branch(a.as_str(), &mut store).unwrap().value;
        assert_eq!(back, live);
        assert_eq!(&back[..4], &base[..]);

        let summaries = manager.list_branches(Some(cp.as_str()));
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].message_count, 3);
        assert!(summaries[0].is_current);
        assert_eq!(summaries[1].message_count, 0);
    }

    #[test]
    fn update_persists_each_message_exactly_once() {
        let (mut store, session) = store_with_session();
        let counter = TokenCounter::new();
        let mut manager = BranchingManager::new();
        manager.attach(session);

        let base = trunk();
        let cp = manager.create_checkpoint("cp", &base, &mut store).value;
        let br = manager
            .create_branch(cp.as_str(), "br", &base, &mut store)
            .unwrap()
            .value;
        manager.switch_branch(br.as_str(), &mut store).unwrap();

        let live = extend(base.clone(), &["q", "r"]);
        manager
            .update_current_branch(&live, &counter, &mut store)
            .unwrap();
        let again = manager
            .update_current_branch(&live, &counter, &mut store)
            .unwrap();
        assert_eq!(again.value, 0);

        let live = extend(live, &["q2"]);
        manager
            .update_current_branch(&live, &counter, &mut store)
            .unwrap();

        let stored: Vec<String> = store
            .load_branch_messages(session, &br)
            .unwrap()
            .iter()
            .map(|m| m.content().to_string())
            .collect();
        assert_eq!(stored, ["q", "r", "q2"]);
    }

    #[test]
    fn diverging_prefix_is_rejected() {
        let (mut store, _) = store_with_session();
        let counter = TokenCounter::new();
        let mut manager = BranchingManager::new();

        let base = trunk();
        let cp = manager.create_checkpoint("cp", &base, &mut store).value;
        let br = manager
            .create_branch(cp.as_str(), "br", &base, &mut store)
            .unwrap()
            .value;
        manager.switch_branch(br.as_str(), &mut store).unwrap();

        let mut rewritten = base.clone();
        rewritten[1] = msg(Role::User, "edited history");
        assert!(matches!(
            manager.update_current_branch(&rewritten, &counter, &mut store),
            Err(BranchingError::PrefixMismatch { .. })
        ));
        assert_eq!(manager.branch(br.as_str()).unwrap().messages(), &base[..]);
    }

    #[test]
    fn checkpoint_on_branch_uses_branch_prefix() {
        let (mut store, _) = store_with_session();
        let counter = TokenCounter::new();
        let mut manager = BranchingManager::new();

        let base = trunk();
        let cp1 = manager.create_checkpoint("cp1", &base, &mut store).value;
        let br1 = manager
            .create_branch(cp1.as_str(), "br1", &base, &mut store)
            .unwrap()
            .value;
        let live = manager.switch_branch(br1.as_str(), &mut store).unwrap().value;
        let live = extend(live, &["x", "y"]);
        manager
            .update_current_branch(&live, &counter, &mut store)
            .unwrap();

        let cp2 = manager.create_checkpoint("cp2", &live, &mut store).value;
        assert_eq!(
            manager.list_checkpoints()[1].source_branch.as_ref(),
            Some(&br1)
        );

        // The trunk is shorter than cp2's index; the prefix must come from br1.
        let br2 = manager
            .create_branch(cp2.as_str(), "br2", &base, &mut store)
            .unwrap()
            .value;
        assert_eq!(manager.branch(br2.as_str()).unwrap().messages(), &live[..]);
    }

    #[test]
    fn short_base_is_refused() {
        let (mut store, _) = store_with_session();
        let mut manager = BranchingManager::new();
        let cp = manager
            .create_checkpoint("cp", &trunk(), &mut store)
            .value;
        let result = manager.create_branch(cp.as_str(), "br", &trunk()[..2], &mut store);
        assert!(matches!(
            result,
            Err(BranchingError::PrefixUnavailable {
                needed: 4,
                available: 2,
                ..
            })
        ));
    }

    #[test]
    fn trunk_checkpoints_keep_their_view_across_a_clear() {
        let (mut store, session) = store_with_session();
        let mut manager = BranchingManager::new();
        manager.attach(session);

        // Before the clear: sys u1 a1 u2.
        let before = manager.create_checkpoint("before", &trunk(), &mut store).value;

        // Clear hides u1 a1 u2; the live trunk is sys n1 n2.
        manager.hide_trunk_messages(3);
        let full = extend(trunk(), &["n1", "n2"]);
        let live = vec![
            msg(Role::System, "sys"),
            msg(Role::User, "n1"),
            msg(Role::Assistant, "n2"),
        ];
        let after = manager.create_checkpoint("after", &live, &mut store).value;
        assert_eq!(manager.list_checkpoints()[1].trunk_offset, 3);

        let br_before = manager
            .create_branch(before.as_str(), "old", &full, &mut store)
            .unwrap()
            .value;
        let br_after = manager
            .create_branch(after.as_str(), "new", &full, &mut store)
            .unwrap()
            .value;
        let messages = |m: &BranchingManager, id: &str| m.branch(id).unwrap().messages().to_vec();
        assert_eq!(messages(&manager, br_before.as_str()), trunk());
        assert_eq!(messages(&manager, br_after.as_str()), live);

        let mut restored = BranchingManager::new();
        restored.load_from_db(session, &full, &store).unwrap();
        assert_eq!(messages(&restored, br_before.as_str()), trunk());
        assert_eq!(messages(&restored, br_after.as_str()), live);
    }

    #[test]
    fn reload_restores_branches_counters_and_active_branch() {
        let (mut store, session) = store_with_session();
        let counter = TokenCounter::new();
        let base = trunk();

        let (br1, br2, live2) = {
            let mut manager = BranchingManager::new();
            manager.attach(session);
            let cp1 = manager.create_checkpoint("cp1", &base, &mut store).value;
            let br1 = manager
                .create_branch(cp1.as_str(), "br1", &base, &mut store)
                .unwrap()
                .value;
            let live = manager.switch_branch(br1.as_str(), &mut store).unwrap().value;
            let live = extend(live, &["x", "y"]);
            manager
                .update_current_branch(&live, &counter, &mut store)
                .unwrap();
            let cp2 = manager.create_checkpoint("cp2", &live, &mut store).value;
            let br2 = manager
                .create_branch(cp2.as_str(), "br2", &base, &mut store)
                .unwrap()
                .value;
            let live2 = manager.switch_branch(br2.as_str(), &mut store).unwrap().value;
            let live2 = extend(live2, &["z"]);
            manager
                .update_current_branch(&live2, &counter, &mut store)
                .unwrap();
            (br1, br2, live2)
        };

        let mut restored = BranchingManager::new();
        restored.load_from_db(session, &base, &store).unwrap();

        assert_eq!(restored.stats().checkpoints, 2);
        assert_eq!(restored.stats().branches, 2);
        assert_eq!(restored.current_branch().unwrap().id(), &br2);
        assert_eq!(restored.current_branch().unwrap().messages(), &live2[..]);
        assert_eq!(
            restored.branch(br1.as_str()).unwrap().messages().len(),
            base.len() + 2
        );

        // Saved counts survive: re-sending the same transcript writes nothing.
        let again = restored
            .update_current_branch(&live2, &counter, &mut store)
            .unwrap();
        assert_eq!(again.value, 0);

        // Counters continue past the persisted ids.
        let cp3 = restored.create_checkpoint("cp3", &live2, &mut store).value;
        assert_eq!(cp3.sequence(), 3);
    }

    #[test]
    fn only_one_branch_active_after_switches() {
        let (mut store, session) = store_with_session();
        let mut manager = BranchingManager::new();
        manager.attach(session);
        let base = trunk();
        let cp = manager.create_checkpoint("cp", &base, &mut store).value;
        let ids: Vec<_> = (0..3)
            .map(|i| {
                manager
                    .create_branch(cp.as_str(), &format!("b{i}"), &base, &mut store)
                    .unwrap()
                    .value
            })
            .collect();

        for id in [&ids[0], &ids[2], &ids[1], &ids[2]] {
            manager.switch_branch(id.as_str(), &mut store).unwrap();
        }

        let active: Vec<_> = store
            .load_branches(session)
            .unwrap()
            .into_iter()
            .filter(|br| br.is_active)
            .map(|br| br.id)
            .collect();
        assert_eq!(active, vec![ids[2].clone()]);

        let _ = manager.detach(&mut store);
        assert!(manager.current_branch().is_none());
        assert!(store.load_branches(session).unwrap().iter().all(|br| !br.is_active));
    }

    #[test]
    fn store_failures_do_not_block_in_memory_state() {
        let (mut store, _) = store_with_session();
        let mut manager = BranchingManager::new();
        manager.attach(SessionId::new(999));

        let result = manager.create_checkpoint("cp", &trunk(), &mut store);
        assert!(result.store_error.is_some());
        assert_eq!(manager.list_checkpoints().len(), 1);
    }

    #[test]
    fn reset_clears_memory_only() {
        let (mut store, session) = store_with_session();
        let mut manager = BranchingManager::new();
        manager.attach(session);
        let _ = manager.create_checkpoint("cp", &trunk(), &mut store);

        manager.reset();
        assert!(manager.list_checkpoints().is_empty());
        assert_eq!(store.load_checkpoints(session).unwrap().len(), 1);
    }
}
