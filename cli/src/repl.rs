//! Interactive loop: one line in, one turn or command out.

use std::io::{self, Write};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use parley_engine::{
    BranchCommand, Command, CompletionService, CompressionArg, ConversationSession, EXPERTS,
    ExtractionOutcome, FactValue, PersistenceGateway, Role, SessionError, SessionOptions,
    StrategyKind, StreamEvent, TurnReport, command_help_summary, command_specs,
    consult_experts,
};

use crate::input::Input;
use crate::picker::{self, Pick};

enum Flow {
    Continue,
    Exit,
    Switch(Pick),
}

pub(crate) struct Repl {
    service: Arc<dyn CompletionService>,
    options: SessionOptions,
    /// Strategy for newly created sessions.
    kind: StrategyKind,
    input: Input,
    /// Tokens the service reported as used during this run.
    api_tokens: u64,
}

impl Repl {
    pub(crate) fn new(
        service: Arc<dyn CompletionService>,
        options: SessionOptions,
        kind: StrategyKind,
        input: Input,
    ) -> Self {
        Self {
            service,
            options,
            kind,
            input,
            api_tokens: 0,
        }
    }

    /// Let the user pick or create a session in `store`. `None` if cancelled.
    pub(crate) async fn open(
        &mut self,
        store: Box<dyn PersistenceGateway>,
    ) -> Result<Option<ConversationSession>> {
        let records = store.list_sessions()?;
        match picker::pick_session(&records, &mut self.input).await? {
            Pick::Cancel => Ok(None),
            pick => self.open_pick(store, pick).map(Some),
        }
    }

    fn open_pick(
        &self,
        store: Box<dyn PersistenceGateway>,
        pick: Pick,
    ) -> Result<ConversationSession> {
        let session = match pick {
            Pick::Load(id) => {
                let session = ConversationSession::load(
                    Arc::clone(&self.service),
                    store,
                    id,
                    self.options.clone(),
                )?;
                println!("Loaded session '{}'.\n", session.name());
                replay(&session);
                session
            }
            Pick::Create | Pick::Cancel => {
                let session = ConversationSession::create(
                    Arc::clone(&self.service),
                    store,
                    self.kind,
                    None,
                    self.options.clone(),
                )?;
                println!("Created new session.\n");
                session
            }
        };
        Ok(session)
    }

    pub(crate) async fn run(mut self, mut session: ConversationSession) -> Result<()> {
        println!(
            "Parley ({} strategy). Type /help for commands, /exit to quit.\n",
            session.strategy_kind().display_name()
        );

        loop {
            let prompt = format!("[{:.0}%] > ", session.check_token_limit().percent());
            let Some(line) = self.input.prompt(&prompt).await? else {
                break;
            };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let Some(raw) = line.strip_prefix('/') else {
                self.turn(&mut session, line).await;
                continue;
            };
            match self.command(&mut session, raw).await? {
                Flow::Continue => {}
                Flow::Exit => break,
                Flow::Switch(pick) => {
                    let store = session.into_store();
                    session = self.open_pick(store, pick)?;
                }
            }
        }

        println!("\nTokens reported by the API this run: {}", self.api_tokens);
        println!("Goodbye!");
        Ok(())
    }

    async fn turn(&mut self, session: &mut ConversationSession, input: &str) {
        let (tx, mut rx) = mpsc::channel::<StreamEvent>(64);
        let printer = tokio::spawn(async move {
            let mut out = io::stdout();
            while let Some(event) = rx.recv().await {
                match event {
                    StreamEvent::TextDelta(text) => {
                        let _ = write!(out, "{text}");
                        let _ = out.flush();
                    }
                    StreamEvent::Error(message) => {
                        let _ = writeln!(out, "\n[stream error: {message}]");
                    }
                    StreamEvent::Usage(_) | StreamEvent::Done => {}
                }
            }
        });

        println!();
        let outcome = tokio::select! {
            result = session.send(input, Some(tx)) => Some(result),
            _ = tokio::signal::ctrl_c() => None,
        };
        // The sender is gone once the turn future is, so the printer drains and ends.
        let _ = printer.await;
        println!();

        match outcome {
            None => println!("[Cancelled]\n"),
            Some(Err(e)) => {
                tracing::error!(session = %session.id(), error = %e, "Turn failed");
                println!("Error: {e}\n");
            }
            Some(Ok(report)) => {
                self.api_tokens += u64::from(report.usage.total());
                print_report(&report);
            }
        }
    }

    async fn command(&mut self, session: &mut ConversationSession, raw: &str) -> Result<Flow> {
        match Command::parse(raw) {
            Command::Exit => return Ok(Flow::Exit),
            Command::Empty => {}
            Command::Help => print_help(),
            Command::Unknown(cmd) => {
                println!("Unknown command /{cmd}. {}\n", command_help_summary());
            }
            Command::Clear => {
                if let Some(e) = session.clear_history() {
                    println!("Warning: {e}");
                }
                println!("[History cleared]\n");
            }
            Command::Sessions => {
                let records = session.list_sessions()?;
                match picker::pick_session(&records, &mut self.input).await? {
                    Pick::Cancel => println!("Staying in current session.\n"),
                    Pick::Load(id) if id == session.id() => {
                        println!("Already in this session.\n");
                    }
                    pick => return Ok(Flow::Switch(pick)),
                }
            }
            Command::Delete(arg) => self.delete(session, arg).await?,
            Command::Rename(None) => println!("Usage: /rename <name>\n"),
            Command::Rename(Some(name)) => match session.rename(name) {
                Ok(()) => println!("Renamed to '{}'.\n", session.name()),
                Err(e) => println!("Error: {e}\n"),
            },
            Command::Stats => print_stats(session),
            Command::Compression(arg) => compression(session, arg),
            Command::Facts(None) => print_facts(session),
            Command::Facts(Some("reset")) => reset_facts(session),
            Command::Facts(Some(_)) => println!("Usage: /facts [reset]\n"),
            Command::Checkpoint(name) => checkpoint(session, name),
            Command::Branch(cmd) => self.branch(session, cmd).await?,
            Command::Experts(None) => println!("Usage: /experts <question>\n"),
            Command::Experts(Some(question)) => {
                self.api_tokens += experts(session, question).await;
            }
        }
        Ok(Flow::Continue)
    }

    async fn delete(&mut self, session: &mut ConversationSession, arg: Option<&str>) -> Result<()> {
        let records = session.list_sessions()?;
        let target = match arg {
            Some(raw) => match picker::find_by_id(&records, raw) {
                Some(record) => picker::confirm_deletion(record, &mut self.input).await?,
                None => {
                    println!("No session with id {raw}.\n");
                    None
                }
            },
            None => picker::pick_for_deletion(&records, &mut self.input).await?,
        };
        let Some(record) = target else {
            return Ok(());
        };
        match session.delete_session(record.id) {
            Ok(true) => println!("Deleted session: {}\n", record.name),
            Ok(false) => println!("Session {} no longer exists.\n", record.id),
            Err(SessionError::ActiveSession(_)) => {
                println!("That is the open session. Switch with /sessions before deleting it.\n");
            }
            Err(e) => println!("Error: {e}\n"),
        }
        Ok(())
    }

    async fn branch(&mut self, session: &mut ConversationSession, cmd: BranchCommand<'_>) -> Result<()> {
        if session.strategy_kind() != StrategyKind::Branching {
            println!("Branching is not enabled for this session.\n");
            return Ok(());
        }
        match cmd {
            BranchCommand::List => print_branches(session),
            BranchCommand::Create { checkpoint, name } => {
                let name = match name {
                    Some(name) => name.to_string(),
                    None => self
                        .input
                        .prompt("Branch name: ")
                        .await?
                        .map(|n| n.trim().to_string())
                        .filter(|n| !n.is_empty())
                        .unwrap_or_else(|| "branch".to_string()),
                };
                match session.create_branch(checkpoint, &name) {
                    Ok(write) => {
                        let (id, error) = write.into_parts();
                        println!("Created branch '{name}' ({id}) from {checkpoint}\n");
                        if let Some(e) = error {
                            println!("Warning: {e}\n");
                        }
                    }
                    Err(e) => println!("Error: {e}\n"),
                }
            }
            BranchCommand::Switch("main" | "trunk") => {
                if let Some(e) = session.switch_to_trunk() {
                    println!("Warning: {e}");
                }
                println!("Switched to main\n");
            }
            BranchCommand::Switch(id) => match session.switch_branch(id) {
                Ok(error) => {
                    println!("Switched to branch {id}\n");
                    if let Some(e) = error {
                        println!("Warning: {e}\n");
                    }
                }
                Err(e) => println!("Error: {e}\n"),
            },
            BranchCommand::Invalid(_) => {
                println!("Usage:");
                println!("  /branch                              List branches");
                println!("  /branch create <checkpoint> [name]   Create a branch");
                println!("  /branch switch <branch|main>         Switch branch\n");
            }
        }
        Ok(())
    }
}

fn replay(session: &ConversationSession) {
    for message in session.transcript().iter().filter(|m| !m.is_system()) {
        match message.role() {
            Role::User => println!("> {}\n", message.content()),
            _ => println!("{}\n", message.content()),
        }
    }
}

fn print_report(report: &TurnReport) {
    println!(
        "\n[Tokens - Prompt: {} | History: {} | Response: {} | {}]",
        report.prompt_tokens, report.history_tokens, report.response_tokens, report.strategy
    );
    match &report.facts {
        Some(ExtractionOutcome::Rejected { lost }) => {
            println!("Fact update rejected, it would drop: {}", lost.join(", "));
        }
        Some(ExtractionOutcome::Failed { reason }) => {
            tracing::debug!(reason = %reason, "Fact extraction failed");
        }
        _ => {}
    }
    if let Some(title) = &report.new_title {
        println!("Session titled: {title}");
    }
    for warning in &report.warnings {
        println!("Warning: {warning}");
    }
    if report.budget.is_warning() {
        println!("Warning: context window at {}", report.budget);
        println!("Consider using /clear to reset conversation history.");
    }
    println!();
}

fn print_help() {
    println!("\n=== Commands ===");
    for spec in command_specs() {
        println!("  /{:<58} {}", spec.usage, spec.description);
    }
    println!();
}

fn print_stats(session: &ConversationSession) {
    let record = session.record();
    println!("\nSession:  {} [id {}]", record.name, record.id);
    println!("Model:    {}", session.model());
    println!("Strategy: {} ({})", session.strategy_kind(), session.stats());
    println!("Context:  {}", session.check_token_limit());
    println!(
        "Stored:   {} messages, {} tokens\n",
        record.message_count, record.total_tokens
    );
}

fn compression(session: &mut ConversationSession, arg: Option<CompressionArg>) {
    let Some(enabled) = session.compression_enabled() else {
        println!("Compression is only available with the sliding_window strategy.\n");
        return;
    };
    match arg {
        Some(CompressionArg::Status) => {
            println!(
                "\nCompression: {}",
                if enabled { "enabled" } else { "disabled" }
            );
            println!("  {}\n", session.stats());
        }
        Some(CompressionArg::On) => {
            session.set_compression(true);
            println!("Compression enabled\n");
        }
        Some(CompressionArg::Off) => {
            session.set_compression(false);
            println!("Compression disabled\n");
        }
        None => println!("Usage: /compression [on|off|status]\n"),
    }
}

fn print_facts(session: &ConversationSession) {
    let Some(facts) = session.facts() else {
        println!("Sticky facts are not enabled for this session.\n");
        return;
    };
    if facts.is_empty() {
        println!("No facts stored yet.\n");
        return;
    }
    println!("\n=== Sticky Facts ===");
    for (category, value) in facts.iter() {
        match value {
            FactValue::Text(text) => println!("  {category}: {text}"),
            FactValue::Entries(entries) => {
                println!("  {category}:");
                for (key, value) in entries {
                    println!("    {key}: {value}");
                }
            }
        }
    }
    println!();
}

fn reset_facts(session: &mut ConversationSession) {
    match session.reset_facts() {
        None => println!("Sticky facts are not enabled for this session.\n"),
        Some(write) => {
            println!("[Facts cleared]\n");
            if let Some(e) = write.store_error {
                println!("Warning: {e}\n");
            }
        }
    }
}

fn checkpoint(session: &mut ConversationSession, name: Option<&str>) {
    if session.strategy_kind() != StrategyKind::Branching {
        println!("Branching is not enabled for this session.\n");
        return;
    }
    let Some(name) = name else {
        let checkpoints = session.checkpoints();
        if checkpoints.is_empty() {
            println!("No checkpoints yet.\n");
            return;
        }
        println!("\n=== Checkpoints ===");
        for cp in checkpoints {
            println!("  {}: {} ({} messages)", cp.id, cp.name, cp.message_index);
        }
        println!();
        return;
    };
    if let Some(write) = session.create_checkpoint(name) {
        let (id, error) = write.into_parts();
        println!("Created checkpoint '{name}' ({id})\n");
        if let Some(e) = error {
            println!("Warning: {e}\n");
        }
    }
}

fn print_branches(session: &ConversationSession) {
    let branches = session.branches(None);
    if branches.is_empty() {
        println!("No branches yet.\n");
        return;
    }
    println!("\n=== Branches ===");
    for br in branches {
        let current = if br.is_current { " (current)" } else { "" };
        println!(
            "  {}: {} from {} ({} messages){current}",
            br.id, br.name, br.checkpoint_id, br.message_count
        );
    }
    println!();
}

/// Returns the tokens the panel used.
async fn experts(session: &ConversationSession, question: &str) -> u64 {
    println!("\nAsking {} experts...", EXPERTS.len());
    let service = Arc::clone(session.service());
    let answers = tokio::select! {
        answers = consult_experts(service.as_ref(), session.model(), question, &EXPERTS) => answers,
        _ = tokio::signal::ctrl_c() => {
            println!("[Cancelled]\n");
            return 0;
        }
    };
    let mut tokens = 0;
    for answer in answers {
        tokens += u64::from(answer.usage.total());
        println!("\n=== {} ===", answer.expert);
        match answer.answer {
            Ok(text) => println!("{text}"),
            Err(e) => println!("(failed: {e})"),
        }
    }
    println!();
    tokens
}
