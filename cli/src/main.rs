//! Parley CLI - binary entry point.
//!
//! ```text
//! parley start [strategy]   pick or create a session, then chat
//! parley sessions           list saved sessions
//! parley delete             delete a saved session
//! ```
//!
//! Logs go to `~/.parley/logs/parley.log` (falling back to
//! `./.parley/logs/parley.log`), never to the terminal the REPL writes to.

mod input;
mod picker;
mod repl;

use std::{
    env,
    fs::{self, OpenOptions},
    path::PathBuf,
    sync::{Arc, Mutex},
};

use anyhow::{Context, Result, bail};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use parley_config::{ParleyConfig, Settings, parley_home};
use parley_engine::{
    ApiConfig, ApiKey, CompletionService, CompressorConfig, OpenAiClient, PersistenceGateway,
    RetryConfig, SessionOptions, SqliteStore, StickyFactsConfig, StrategyConfig, StrategyKind,
};

use crate::input::Input;
use crate::repl::Repl;

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap_or_else(|_| EnvFilter::new("warn"));

    let (log_file, init_warnings) = open_log_file();

    if let Some((log_path, file)) = log_file {
        tracing_subscriber::registry()
            .with(fmt::layer().with_ansi(false).with_writer(Mutex::new(file)))
            .with(env_filter)
            .init();

        tracing::info!(path = %log_path.display(), "Logging initialized");
        for warning in init_warnings {
            tracing::warn!("{warning}");
        }
        return;
    }

    // No log file: stay silent rather than interleave with the REPL.
    tracing_subscriber::registry().with(env_filter).init();
}

fn open_log_file() -> (Option<(PathBuf, std::fs::File)>, Vec<String>) {
    let mut warnings = Vec::new();

    for candidate in log_file_candidates() {
        if let Some(parent) = candidate.parent()
            && let Err(e) = fs::create_dir_all(parent)
        {
            warnings.push(format!(
                "Failed to create log dir {}: {e}",
                parent.display()
            ));
            continue;
        }

        match OpenOptions::new().create(true).append(true).open(&candidate) {
            Ok(file) => return (Some((candidate, file)), warnings),
            Err(e) => {
                warnings.push(format!(
                    "Failed to open log file {}: {e}",
                    candidate.display()
                ));
            }
        }
    }

    (None, warnings)
}

fn log_file_candidates() -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(home) = parley_home() {
        candidates.push(home.join("logs").join("parley.log"));
    }
    candidates.push(PathBuf::from(".parley").join("logs").join("parley.log"));
    candidates
}

#[derive(Debug, PartialEq, Eq)]
enum CliCommand {
    Start(Option<StrategyKind>),
    Sessions,
    Delete,
    Help,
}

fn parse_args(args: &[String]) -> Result<CliCommand> {
    let Some((command, rest)) = args.split_first() else {
        return Ok(CliCommand::Help);
    };
    match command.as_str() {
        "start" => {
            let kind = rest
                .first()
                .map(|raw| raw.parse::<StrategyKind>())
                .transpose()?;
            Ok(CliCommand::Start(kind))
        }
        "sessions" => Ok(CliCommand::Sessions),
        "delete" => Ok(CliCommand::Delete),
        "help" | "-h" | "--help" => Ok(CliCommand::Help),
        other => bail!("unknown command '{other}' (expected start, sessions or delete)"),
    }
}

fn print_usage() {
    println!("Usage: parley <command> [strategy]\n");
    println!("Commands:");
    println!("  start [strategy]  Start chatting (pick or create a session)");
    println!("  sessions          List saved sessions");
    println!("  delete            Delete a saved session\n");
    println!("Strategies:");
    for kind in StrategyKind::ALL {
        println!("  {:<16}  {}", kind.as_str(), kind.display_name());
    }
}

fn session_options(settings: &Settings) -> SessionOptions {
    SessionOptions {
        model: settings.model.clone(),
        system_prompt: Some(settings.system_prompt.clone()),
        token_limit: settings.token_limit,
        warning_threshold: settings.warning_threshold,
        strategy: StrategyConfig {
            compressor: CompressorConfig {
                recent_window_size: settings.recent_window_size,
                summary_batch_size: settings.summary_batch_size,
                summary_max_tokens: settings.summary_max_tokens,
            },
            sticky_facts: StickyFactsConfig {
                fact_window: settings.fact_window,
                recent_messages: settings.sticky_recent_messages,
            },
        },
    }
}

fn completion_service(settings: &Settings) -> Result<Arc<dyn CompletionService>> {
    let Some(key) = settings.api_key.as_deref() else {
        bail!("no API key: set OPENAI_API_KEY or api.openai_key in ~/.parley/config.toml");
    };
    let config = ApiConfig::new(ApiKey::new(key), &settings.base_url)?
        .with_request_timeout(settings.request_timeout)
        .with_stream_idle_timeout(settings.stream_idle_timeout);
    let client = OpenAiClient::new(config)?.with_retry(RetryConfig {
        max_retries: settings.max_retries,
        ..RetryConfig::default()
    });
    Ok(Arc::new(client))
}

fn open_store(settings: &Settings) -> Result<SqliteStore> {
    SqliteStore::open(&settings.database_path).with_context(|| {
        format!(
            "failed to open session database {}",
            settings.database_path.display()
        )
    })
}

async fn start(settings: &Settings, kind: Option<StrategyKind>) -> Result<()> {
    let service = completion_service(settings)?;
    let store = open_store(settings)?;
    let kind = kind.unwrap_or(settings.default_strategy);

    let mut repl = Repl::new(service, session_options(settings), kind, Input::stdin());
    let Some(session) = repl.open(Box::new(store)).await? else {
        println!("Goodbye!");
        return Ok(());
    };
    tracing::info!(session = %session.id(), strategy = %session.strategy_kind(), "Session opened");
    repl.run(session).await
}

async fn delete(settings: &Settings) -> Result<()> {
    let mut store = open_store(settings)?;
    let records = store.list_sessions()?;
    let mut input = Input::stdin();
    if let Some(record) = picker::pick_for_deletion(&records, &mut input).await? {
        if store.delete_session(record.id)? {
            println!("Deleted session: {}", record.name);
        } else {
            println!("Session {} no longer exists.", record.id);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let command = match parse_args(&args) {
        Ok(command) => command,
        Err(e) => {
            eprintln!("Error: {e}\n");
            print_usage();
            std::process::exit(2);
        }
    };

    let config = match ParleyConfig::load() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Warning: {e}; using defaults");
            tracing::warn!(error = %e, "Ignoring unreadable config");
            None
        }
    };
    let settings = Settings::resolve(config.as_ref());
    tracing::debug!(?settings, "Resolved settings");

    match command {
        CliCommand::Help => print_usage(),
        CliCommand::Sessions => picker::print_sessions(&open_store(&settings)?.list_sessions()?),
        CliCommand::Delete => delete(&settings).await?,
        CliCommand::Start(kind) => start(&settings, kind).await?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{CliCommand, parse_args, session_options};
    use parley_config::Settings;
    use parley_engine::StrategyKind;

    fn args(raw: &[&str]) -> Vec<String> {
        raw.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn no_arguments_prints_help() {
        assert_eq!(parse_args(&[]).unwrap(), CliCommand::Help);
    }

    #[test]
    fn start_accepts_an_optional_strategy() {
        assert_eq!(parse_args(&args(&["start"])).unwrap(), CliCommand::Start(None));
        assert_eq!(
            parse_args(&args(&["start", "sticky-facts"])).unwrap(),
            CliCommand::Start(Some(StrategyKind::StickyFacts))
        );
        assert!(parse_args(&args(&["start", "magic"])).is_err());
    }

    #[test]
    fn other_commands() {
        assert_eq!(parse_args(&args(&["delete"])).unwrap(), CliCommand::Delete);
        assert_eq!(parse_args(&args(&["sessions"])).unwrap(), CliCommand::Sessions);
        assert!(parse_args(&args(&["frobnicate"])).is_err());
    }

    #[test]
    fn options_follow_settings() {
        let settings = Settings::resolve(None);
        let options = session_options(&settings);
        assert_eq!(options.model, settings.model);
        assert_eq!(options.token_limit, settings.token_limit);
        assert_eq!(
            options.strategy.compressor.recent_window_size,
            settings.recent_window_size
        );
        assert_eq!(
            options.strategy.sticky_facts.recent_messages,
            settings.sticky_recent_messages
        );
    }
}
