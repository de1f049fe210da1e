//! Whole sessions over HTTP and a SQLite file.

use std::sync::Arc;

use tempfile::TempDir;
use wiremock::MockServer;

use parley_engine::{
    CompletionService, CompressorConfig, ConversationSession, ExtractionOutcome, FactCategory,
    PersistenceGateway, SessionOptions, SqliteStore, StrategyKind,
};

use crate::common::{client, mount_replies, request_bodies, start_openai_mock};

struct Fixture {
    server: MockServer,
    service: Arc<dyn CompletionService>,
    _dir: TempDir,
    db: std::path::PathBuf,
}

async fn fixture() -> Fixture {
    let server = start_openai_mock().await;
    let service: Arc<dyn CompletionService> = Arc::new(client(&server));
    let dir = TempDir::new().unwrap();
    let db = dir.path().join("sessions.db");
    Fixture {
        server,
        service,
        _dir: dir,
        db,
    }
}

impl Fixture {
    fn store(&self) -> Box<dyn PersistenceGateway> {
        Box::new(SqliteStore::open(&self.db).unwrap())
    }
}

fn options() -> SessionOptions {
    SessionOptions::new("gpt-4o-mini").with_system_prompt("You are a helpful assistant.")
}

#[tokio::test]
async fn new_chat_is_titled_and_survives_reopen() {
    let fx = fixture().await;
    mount_replies(
        &fx.server,
        &["Lisbon is lovely in May.", "Title: \"Lisbon Trip\"", "Try the trams."],
    )
    .await;

    let mut session = ConversationSession::create(
        fx.service.clone(),
        fx.store(),
        StrategyKind::SlidingWindow,
        None,
        options(),
    )
    .unwrap();

    let first = session.send("When should I visit Lisbon?", None).await.unwrap();
    assert_eq!(first.reply, "Lisbon is lovely in May.");
    assert_eq!(first.new_title.as_deref(), Some("Lisbon Trip"));
    assert!(first.warnings.is_empty());

    let second = session.send("How do I get around?", None).await.unwrap();
    assert_eq!(second.reply, "Try the trams.");
    assert!(second.new_title.is_none());
    let id = session.id();
    drop(session);

    let records = fx.store().list_sessions().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "Lisbon Trip");
    assert_eq!(records[0].message_count, 4);

    let reopened = ConversationSession::load(fx.service.clone(), fx.store(), id, options()).unwrap();
    assert_eq!(reopened.strategy_kind(), StrategyKind::SlidingWindow);
    assert_eq!(reopened.transcript().len(), 5);
    assert_eq!(reopened.transcript()[4].content(), "Try the trams.");
}

#[tokio::test]
async fn sticky_facts_persist_across_reopen() {
    let fx = fixture().await;
    mount_replies(
        &fx.server,
        &[
            "Noted.",
            r#"{"goal": "launch the beta", "constraints": ["budget under 10k"]}"#,
        ],
    )
    .await;

    let mut session = ConversationSession::create(
        fx.service.clone(),
        fx.store(),
        StrategyKind::StickyFacts,
        Some("Launch"),
        options(),
    )
    .unwrap();
    let report = session
        .send("We need to launch the beta on a budget under 10k", None)
        .await
        .unwrap();
    assert!(matches!(report.facts, Some(ExtractionOutcome::Updated)));
    let id = session.id();
    drop(session);

    let reopened = ConversationSession::load(fx.service.clone(), fx.store(), id, options()).unwrap();
    let facts = reopened.facts().unwrap();
    assert!(facts.get(FactCategory::Goal).is_some());
    assert!(facts.get(FactCategory::Constraints).is_some());
}

#[tokio::test]
async fn old_turns_are_summarized_once_the_window_fills() {
    let fx = fixture().await;
    mount_replies(&fx.server, &["First answer.", "User asked a greeting.", "Second answer."]).await;

    let mut opts = options();
    opts.strategy.compressor = CompressorConfig {
        recent_window_size: 2,
        summary_batch_size: 2,
        summary_max_tokens: 50,
    };
    let mut session = ConversationSession::create(
        fx.service.clone(),
        fx.store(),
        StrategyKind::SlidingWindow,
        Some("Window"),
        opts,
    )
    .unwrap();

    session.send("Hello", None).await.unwrap();
    let report = session.send("Tell me more", None).await.unwrap();
    assert_eq!(report.reply, "Second answer.");

    let bodies = request_bodies(&fx.server).await;
    assert_eq!(bodies.len(), 3);
    let last = bodies[2]["messages"].as_array().unwrap();
    assert_eq!(last.len(), 4);
    assert_eq!(last[0]["role"], "system");
    assert_eq!(
        last[1]["content"],
        "Previous conversation summary: User asked a greeting."
    );
    assert_eq!(last[3]["content"], "Tell me more");

    // The full transcript is still kept and stored.
    assert_eq!(session.transcript().len(), 5);
    let stored = fx.store().load_messages(session.id()).unwrap();
    assert_eq!(stored.len(), 4);
}

#[tokio::test]
async fn deleting_a_session_removes_its_rows() {
    let fx = fixture().await;
    mount_replies(&fx.server, &["one", "two"]).await;

    let mut keep = ConversationSession::create(
        fx.service.clone(),
        fx.store(),
        StrategyKind::SlidingWindow,
        Some("Keep"),
        options(),
    )
    .unwrap();
    keep.send("hi", None).await.unwrap();

    let mut doomed = ConversationSession::create(
        fx.service.clone(),
        fx.store(),
        StrategyKind::SlidingWindow,
        Some("Doomed"),
        options(),
    )
    .unwrap();
    doomed.send("bye", None).await.unwrap();
    let doomed_id = doomed.id();
    drop(doomed);

    assert!(keep.delete_session(doomed_id).unwrap());
    let records = keep.list_sessions().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].name, "Keep");
    assert!(fx.store().load_messages(doomed_id).unwrap().is_empty());
    assert!(fx.store().load_session(doomed_id).is_err());
}
