//! Numbered session menus.

use anyhow::Result;
use chrono::{Local, TimeZone};

use parley_engine::{SessionId, SessionRecord};

use crate::input::Input;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pick {
    Create,
    Load(SessionId),
    Cancel,
}

fn format_timestamp(secs: i64) -> String {
    Local
        .timestamp_opt(secs, 0)
        .single()
        .map_or_else(|| secs.to_string(), |t| t.format("%Y-%m-%d %H:%M:%S").to_string())
}

pub(crate) fn session_line(index: usize, record: &SessionRecord) -> String {
    format!(
        "{index}. {} ({}) - {} messages, last updated {}",
        record.name,
        record.strategy,
        record.message_count,
        format_timestamp(record.last_updated)
    )
}

pub(crate) fn print_sessions(records: &[SessionRecord]) {
    if records.is_empty() {
        println!("No saved sessions.");
        return;
    }
    for (idx, record) in records.iter().enumerate() {
        println!("{}  [id {}]", session_line(idx + 1, record), record.id);
    }
}

/// `1..=n` loads, `n + 1` creates, `0` cancels.
pub(crate) fn parse_pick(raw: &str, records: &[SessionRecord]) -> Option<Pick> {
    let choice: usize = raw.trim().parse().ok()?;
    match choice {
        0 => Some(Pick::Cancel),
        n if n == records.len() + 1 => Some(Pick::Create),
        n => records.get(n - 1).map(|r| Pick::Load(r.id)),
    }
}

pub(crate) async fn pick_session(records: &[SessionRecord], input: &mut Input) -> Result<Pick> {
    println!("\n=== Sessions ===");
    if records.is_empty() {
        println!("No existing sessions found.");
    }
    for (idx, record) in records.iter().enumerate() {
        println!("{}", session_line(idx + 1, record));
    }
    println!("{}. Create new session", records.len() + 1);
    println!("0. Cancel");

    loop {
        let Some(raw) = input.prompt("\nSelect option: ").await? else {
            return Ok(Pick::Cancel);
        };
        match parse_pick(&raw, records) {
            Some(pick) => return Ok(pick),
            None => println!("Invalid choice, enter a number from the list."),
        }
    }
}

/// Ask which session to delete and confirm. `None` when cancelled.
pub(crate) async fn pick_for_deletion<'a>(
    records: &'a [SessionRecord],
    input: &mut Input,
) -> Result<Option<&'a SessionRecord>> {
    if records.is_empty() {
        println!("No sessions to delete.");
        return Ok(None);
    }
    println!("\n=== Delete Session ===");
    for (idx, record) in records.iter().enumerate() {
        println!("{}", session_line(idx + 1, record));
    }
    println!("0. Cancel");

    let Some(raw) = input.prompt("\nSelect session to delete: ").await? else {
        return Ok(None);
    };
    let Some(record) = raw
        .trim()
        .parse::<usize>()
        .ok()
        .and_then(|n| n.checked_sub(1))
        .and_then(|n| records.get(n))
    else {
        println!("Cancelled.");
        return Ok(None);
    };
    confirm_deletion(record, input).await
}

/// Find a session by its numeric id.
pub(crate) fn find_by_id<'a>(records: &'a [SessionRecord], raw: &str) -> Option<&'a SessionRecord> {
    let id: i64 = raw.trim().parse().ok()?;
    records.iter().find(|r| r.id.value() == id)
}

pub(crate) async fn confirm_deletion<'a>(
    record: &'a SessionRecord,
    input: &mut Input,
) -> Result<Option<&'a SessionRecord>> {
    let answer = input
        .prompt(&format!("Delete '{}'? (yes/no): ", record.name))
        .await?
        .unwrap_or_default();
    if answer.trim().eq_ignore_ascii_case("yes") {
        Ok(Some(record))
    } else {
        println!("Cancelled.");
        Ok(None)
    }
}
