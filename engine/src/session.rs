//! One conversation: transcript, active strategy and durable record.
//!
//! # Turn lifecycle
//!
//! [`ConversationSession::send`] works in two phases:
//!
//! - **Staging.** The user message is appended to a copy of the live
//!   transcript. The strategy builds the submission, the reply is fetched,
//!   post-reply work (fact extraction, titling) runs. Nothing owned by the
//!   session is touched, so dropping the future here cancels cleanly.
//! - **Commit.** A synchronous block persists the exchange, swaps the staged
//!   transcript in and applies staged strategy updates.
//!
//! # Trunk and branches
//!
//! `trunk` is the main line stored in the `messages` table. While a branch is
//! current the live transcript is that branch's messages and turns are stored
//! as branch messages instead.
//!
//! Clearing history hides the stored trunk from the live view without
//! deleting it. The hidden messages are kept in `cleared` so trunk
//! checkpoints taken before the clear still resolve their prefix.

use std::sync::Arc;

use tokio::sync::mpsc;

use parley_context::{
    BranchSummary, BranchingError, Checkpoint, ContextStrategy, ExtractionOutcome, NewSession,
    PersistenceGateway, SessionRecord, StickyFactsManager, StoreError, StrategyConfig,
    StrategyStats, TokenCounter, WriteThrough,
};
use parley_providers::{CompletionRequest, CompletionService};
use parley_types::{
    BranchId, CheckpointId, FactSheet, Message, Role, SessionId, StrategyKind,
    StreamEvent,
};

use crate::error::{SessionError, TurnError, TurnWarning};
use crate::report::{TokenBudget, TurnReport};
use crate::title::{DEFAULT_SESSION_NAME, generate_title};

pub const DEFAULT_TOKEN_LIMIT: u32 = 5000;
pub const DEFAULT_WARNING_THRESHOLD: f64 = 0.8;

/// Per-session settings that do not live in the session row.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub model: String,
    pub system_prompt: Option<String>,
    pub token_limit: u32,
    pub warning_threshold: f64,
    pub strategy: StrategyConfig,
}

impl SessionOptions {
    #[must_use]
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            system_prompt: None,
            token_limit: DEFAULT_TOKEN_LIMIT,
            warning_threshold: DEFAULT_WARNING_THRESHOLD,
            strategy: StrategyConfig::default(),
        }
    }

    #[must_use]
    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = Some(prompt.into());
        self
    }
}

fn system_message(prompt: Option<&str>) -> Vec<Message> {
    prompt
        .and_then(|p| Message::try_new(Role::System, p).ok())
        .into_iter()
        .collect()
}

/// System prompt, then every stored trunk message.
fn full_trunk(trunk: &[Message], cleared: &[Message]) -> Vec<Message> {
    let system = trunk.iter().take_while(|m| m.is_system()).count();
    trunk[..system]
        .iter()
        .chain(cleared)
        .chain(&trunk[system..])
        .cloned()
        .collect()
}

pub struct ConversationSession {
    service: Arc<dyn CompletionService>,
    store: Box<dyn PersistenceGateway>,
    counter: TokenCounter,
    options: SessionOptions,
    record: SessionRecord,
    /// What the next turn builds on.
    transcript: Vec<Message>,
    /// Live trunk: system prompt plus the messages since the last clear.
    trunk: Vec<Message>,
    /// Stored trunk messages hidden by clears, oldest first.
    cleared: Vec<Message>,
    strategy: ContextStrategy,
}

impl std::fmt::Debug for ConversationSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversationSession")
            .field("id", &self.record.id)
            .field("name", &self.record.name)
            .field("strategy", &self.strategy.kind())
            .field("messages", &self.transcript.len())
            .finish_non_exhaustive()
    }
}

impl ConversationSession {
    /// Start a new session. `name` defaults to "New Chat", which makes the
    /// first turn generate a title.
    pub fn create(
        service: Arc<dyn CompletionService>,
        mut store: Box<dyn PersistenceGateway>,
        kind: StrategyKind,
        name: Option<&str>,
        options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let name = name
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_SESSION_NAME);
        let id = store.create_session(NewSession {
            name,
            strategy: kind,
            model: &options.model,
            system_prompt: options.system_prompt.as_deref(),
        })?;
        let record = store.load_session(id)?;

        let mut strategy = ContextStrategy::new(kind, options.strategy);
        if let Some(branching) = strategy.branching_mut() {
            branching.attach(id);
        }
        let trunk = system_message(options.system_prompt.as_deref());
        tracing::info!(session = %id, strategy = %kind, model = %options.model, "Created session");

        Ok(Self {
            service,
            store,
            counter: TokenCounter::new(),
            options,
            record,
            transcript: trunk.clone(),
            trunk,
            cleared: Vec::new(),
            strategy,
        })
    }

    /// Resume a stored session. Model and system prompt come from the stored
    /// row; the rest of `options` applies as given.
    pub fn load(
        service: Arc<dyn CompletionService>,
        store: Box<dyn PersistenceGateway>,
        id: SessionId,
        mut options: SessionOptions,
    ) -> Result<Self, SessionError> {
        let record = store.load_session(id)?;
        options.model.clone_from(&record.model);
        options.system_prompt.clone_from(&record.system_prompt);

        let mut cleared = store.load_messages(id)?;
        let hidden = usize::try_from(record.cleared_messages)
            .map_or(cleared.len(), |n| n.min(cleared.len()));
        let visible = cleared.split_off(hidden);
        let mut trunk = system_message(options.system_prompt.as_deref());
        trunk.extend(visible);
        let mut transcript = trunk.clone();

        let mut strategy = ContextStrategy::new(record.strategy, options.strategy);
        match &mut strategy {
            ContextStrategy::StickyFacts(manager) => {
                let facts = store.load_facts(id)?;
                *manager = StickyFactsManager::new(options.strategy.sticky_facts).with_facts(facts);
            }
            ContextStrategy::Branching(manager) => {
                manager.load_from_db(id, &full_trunk(&trunk, &cleared), store.as_ref())?;
                manager.hide_trunk_messages(cleared.len());
                if let Some(branch) = manager.current_branch() {
                    transcript = branch.messages().to_vec();
                }
            }
            ContextStrategy::SlidingWindow { .. } => {}
        }

        tracing::info!(
            session = %id,
            strategy = %record.strategy,
            trunk = trunk.len(),
            cleared = cleared.len(),
            live = transcript.len(),
            "Loaded session"
        );
        Ok(Self {
            service,
            store,
            counter: TokenCounter::new(),
            options,
            record,
            transcript,
            trunk,
            cleared,
            strategy,
        })
    }

    // ------------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------------

    /// Close the session and hand back its store, e.g. to open another.
    #[must_use]
    pub fn into_store(self) -> Box<dyn PersistenceGateway> {
        self.store
    }

    #[must_use]
    pub fn id(&self) -> SessionId {
        self.record.id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.record.name
    }

    #[must_use]
    pub fn record(&self) -> &SessionRecord {
        &self.record
    }

    #[must_use]
    pub fn model(&self) -> &str {
        &self.options.model
    }

    #[must_use]
    pub fn strategy_kind(&self) -> StrategyKind {
        self.strategy.kind()
    }

    #[must_use]
    pub fn transcript(&self) -> &[Message] {
        &self.transcript
    }

    #[must_use]
    pub fn trunk(&self) -> &[Message] {
        &self.trunk
    }

    /// `None` unless the session uses sticky facts.
    #[must_use]
    pub fn facts(&self) -> Option<&FactSheet> {
        self.strategy.sticky_facts().map(StickyFactsManager::facts)
    }

    #[must_use]
    pub fn stats(&self) -> StrategyStats {
        self.strategy.stats()
    }

    #[must_use]
    pub fn service(&self) -> &Arc<dyn CompletionService> {
        &self.service
    }

    #[must_use]
    pub fn check_token_limit(&self) -> TokenBudget {
        TokenBudget {
            used: self.counter.count_all(&self.transcript),
            limit: self.options.token_limit,
            threshold: self.options.warning_threshold,
        }
    }

    // ------------------------------------------------------------------------
    // Turns
    // ------------------------------------------------------------------------

    /// Run one exchange. With `stream`, reply deltas are forwarded as they
    /// arrive.
    ///
    /// On error nothing changes. Dropping the future before it resolves has
    /// the same effect.
    pub async fn send(
        &mut self,
        input: &str,
        stream: Option<mpsc::Sender<StreamEvent>>,
    ) -> Result<TurnReport, TurnError> {
        let user = Message::try_user(input.trim()).map_err(|_| TurnError::EmptyInput)?;
        let service = Arc::clone(&self.service);
        let model = self.options.model.clone();

        let mut staged = self.transcript.clone();
        staged.push(user);

        let prepared = self
            .strategy
            .prepare(&staged, &self.counter, service.as_ref(), &model)
            .await?;
        let (submission, mut pending) = prepared.into_parts();
        let prompt_tokens = self.counter.count_all(&submission);

        let mut request = CompletionRequest::new(&model, &submission);
        if let Some(tx) = stream {
            request = request.streaming(tx);
        }
        let completion = service.complete(request).await?;
        let response_tokens = self.counter.count(completion.text.as_str());
        staged.push(Message::assistant(completion.text));

        self.strategy
            .after_reply(&staged, service.as_ref(), &model, &mut pending)
            .await;

        let new_title = if self.record.name == DEFAULT_SESSION_NAME
            && self.record.message_count == 0
            && let [.., user, assistant] = staged.as_slice()
        {
            generate_title(service.as_ref(), &model, user, assistant).await
        } else {
            None
        };

        // Commit. No awaits past this point.
        let mut warnings = Vec::new();
        self.persist_exchange(&staged, &mut warnings);
        self.transcript = staged;

        let commit = self
            .strategy
            .commit(pending, &self.transcript, &self.counter, self.store.as_mut());
        warnings.extend(commit.store_error.map(TurnWarning::from));
        warnings.extend(commit.branch_error.map(TurnWarning::from));
        if matches!(commit.facts, Some(ExtractionOutcome::Updated))
            && let Some(manager) = self.strategy.sticky_facts()
            && let Err(e) = self.store.save_facts(self.record.id, manager.facts())
        {
            tracing::warn!(session = %self.record.id, error = %e, "Failed to persist facts");
            warnings.push(e.into());
        }

        if let Some(title) = &new_title {
            match self.store.rename_session(self.record.id, title) {
                Ok(()) => tracing::info!(session = %self.record.id, title = %title, "Titled session"),
                Err(e) => warnings.push(e.into()),
            }
            self.record.name.clone_from(title);
        }

        let reply = self
            .transcript
            .last()
            .map(|m| m.content().to_string())
            .unwrap_or_default();
        Ok(TurnReport {
            reply,
            prompt_tokens,
            history_tokens: self.counter.count_all(&self.transcript),
            response_tokens,
            usage: completion.usage,
            strategy: self.strategy.stats(),
            facts: commit.facts,
            new_title,
            budget: self.check_token_limit(),
            warnings,
        })
    }

    /// Store the last two messages of `staged` and bump session counters.
    fn persist_exchange(&mut self, staged: &[Message], warnings: &mut Vec<TurnWarning>) {
        let exchange = &staged[staged.len().saturating_sub(2)..];
        let tokens: Vec<u32> = exchange
            .iter()
            .map(|m| self.counter.count(m.content()))
            .collect();
        let total: u32 = tokens.iter().sum();
        let id = self.record.id;
        let on_branch = self
            .strategy
            .branching()
            .is_some_and(|b| b.current_branch().is_some());

        if on_branch {
            // Branch messages are written by the strategy commit.
            if let Err(e) = self.store.touch_session(id, 2, total) {
                tracing::warn!(session = %id, error = %e, "Failed to update session counters");
                warnings.push(e.into());
            }
        } else {
            let rows: Vec<(&Message, u32)> = exchange.iter().zip(tokens).collect();
            if let Err(e) = self.store.append_messages(id, &rows) {
                tracing::warn!(session = %id, error = %e, "Failed to persist exchange");
                warnings.push(e.into());
            }
            self.trunk.extend_from_slice(exchange);
        }

        self.record.message_count += 2;
        self.record.total_tokens += u64::from(total);
    }

    /// Drop everything but the system prompt from the live transcript.
    ///
    /// Stored messages are kept but hidden, also after a reload; summaries
    /// are discarded and the current branch is left. Facts stay.
    pub fn clear_history(&mut self) -> Option<StoreError> {
        let keep = usize::from(self.has_system_prompt());
        self.transcript.truncate(keep);
        let dropped = self.trunk.split_off(keep);
        self.cleared.extend(dropped);
        if let ContextStrategy::SlidingWindow { compressor, .. } = &mut self.strategy {
            compressor.reset();
        }

        let id = self.record.id;
        let hidden = self.cleared.len();
        let mut error = self
            .store
            .set_cleared_messages(id, u64::try_from(hidden).unwrap_or(u64::MAX))
            .err();
        if let Some(e) = &error {
            tracing::warn!(session = %id, error = %e, "Failed to persist history clear");
        }
        self.record.cleared_messages = u64::try_from(hidden).unwrap_or(u64::MAX);

        let store = self.store.as_mut();
        if let Some(branching) = self.strategy.branching_mut() {
            branching.hide_trunk_messages(hidden);
            error = error.or(branching.detach(store).store_error);
        }
        tracing::info!(session = %id, hidden, "Cleared history");
        error
    }

    fn has_system_prompt(&self) -> bool {
        self.trunk.first().is_some_and(Message::is_system)
    }

    /// Forget every fact, in memory and in the store. `None` unless the
    /// session uses sticky facts.
    pub fn reset_facts(&mut self) -> Option<WriteThrough<()>> {
        let manager = self.strategy.sticky_facts_mut()?;
        manager.reset();
        let store_error = self
            .store
            .save_facts(self.record.id, manager.facts())
            .err();
        tracing::info!(session = %self.record.id, "Reset sticky facts");
        Some(WriteThrough {
            value: (),
            store_error,
        })
    }

    /// `None` for strategies without compression.
    pub fn set_compression(&mut self, on: bool) -> Option<bool> {
        self.strategy.set_compression(on).then_some(on)
    }

    #[must_use]
    pub fn compression_enabled(&self) -> Option<bool> {
        self.strategy.compression_enabled()
    }

    // ------------------------------------------------------------------------
    // Session management
    // ------------------------------------------------------------------------

    pub fn rename(&mut self, name: &str) -> Result<(), SessionError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(SessionError::EmptyName);
        }
        self.store.rename_session(self.record.id, name)?;
        self.record.name = name.to_string();
        Ok(())
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRecord>, SessionError> {
        Ok(self.store.list_sessions()?)
    }

    /// Delete another session and everything stored under it.
    pub fn delete_session(&mut self, id: SessionId) -> Result<bool, SessionError> {
        if id == self.record.id {
            return Err(SessionError::ActiveSession(id));
        }
        let deleted = self.store.delete_session(id)?;
        tracing::info!(session = %id, deleted, "Deleted session");
        Ok(deleted)
    }

    // ------------------------------------------------------------------------
    // Checkpoints and branches
    // ------------------------------------------------------------------------

    /// `None` unless the session uses branching.
    pub fn create_checkpoint(&mut self, name: &str) -> Option<WriteThrough<CheckpointId>> {
        let store = self.store.as_mut();
        let transcript = &self.transcript;
        self.strategy
            .branching_mut()
            .map(|b| b.create_checkpoint(name, transcript, store))
    }

    pub fn create_branch(
        &mut self,
        checkpoint_id: &str,
        name: &str,
    ) -> Result<WriteThrough<BranchId>, BranchingError> {
        let trunk = full_trunk(&self.trunk, &self.cleared);
        let store = self.store.as_mut();
        let branching = self
            .strategy
            .branching_mut()
            .ok_or_else(|| BranchingError::UnknownCheckpoint(checkpoint_id.to_string()))?;
        branching.create_branch(checkpoint_id, name, &trunk, store)
    }

    /// Make `branch_id` current; the live transcript becomes its messages.
    pub fn switch_branch(&mut self, branch_id: &str) -> Result<Option<StoreError>, BranchingError> {
        let store = self.store.as_mut();
        let branching = self
            .strategy
            .branching_mut()
            .ok_or_else(|| BranchingError::UnknownBranch(branch_id.to_string()))?;
        let (messages, error) = branching.switch_branch(branch_id, store)?.into_parts();
        self.transcript = messages;
        Ok(error)
    }

    /// Leave the current branch and continue on the trunk.
    pub fn switch_to_trunk(&mut self) -> Option<StoreError> {
        let store = self.store.as_mut();
        let error = self
            .strategy
            .branching_mut()
            .and_then(|b| b.detach(store).store_error);
        self.transcript.clone_from(&self.trunk);
        error
    }

    #[must_use]
    pub fn checkpoints(&self) -> &[Checkpoint] {
        match self.strategy.branching() {
            Some(branching) => branching.list_checkpoints(),
            None => &[],
        }
    }

    #[must_use]
    pub fn branches(&self, checkpoint_id: Option<&str>) -> Vec<BranchSummary> {
        self.strategy
            .branching()
            .map(|b| b.list_branches(checkpoint_id))
            .unwrap_or_default()
    }
}
