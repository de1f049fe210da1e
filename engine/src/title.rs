//! Session titling after the first exchange.

use parley_providers::{CompletionRequest, CompletionService};
use parley_types::{Message, Role};

/// Name given to sessions until they are titled.
pub const DEFAULT_SESSION_NAME: &str = "New Chat";

const TITLE_PROMPT: &str = "Generate a short title (3-6 words) for a conversation that \
starts with the exchange below. Reply with the title only.";

const MAX_TITLE_CHARS: usize = 60;

/// Ask the model for a title. `None` on any failure.
pub async fn generate_title(
    service: &dyn CompletionService,
    model: &str,
    user: &Message,
    assistant: &Message,
) -> Option<String> {
    let exchange = format!(
        "User: {}\nAssistant: {}",
        user.content(),
        assistant.content()
    );
    let messages = vec![
        Message::try_new(Role::System, TITLE_PROMPT).ok()?,
        Message::try_user(exchange).ok()?,
    ];
    let request = CompletionRequest::new(model, &messages)
        .with_max_tokens(20)
        .with_temperature(0.3);

    match service.complete(request).await {
        Ok(completion) => clean_title(completion.text.as_str()),
        Err(e) => {
            tracing::warn!(error = %e, "Session title generation failed");
            None
        }
    }
}

/// First line, without surrounding quotes or trailing period, capped in length.
fn clean_title(raw: &str) -> Option<String> {
    let line = raw.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = line.strip_prefix("Title:").map_or(line, str::trim);
    let line = line
        .trim_matches(|c| matches!(c, '"' | '\'' | '*' | '`'))
        .trim_end_matches('.')
        .trim();
    if line.is_empty() {
        return None;
    }
    Some(line.chars().take(MAX_TITLE_CHARS).collect())
}

#[cfg(test)]
mod tests {
    use super::clean_title;

    #[test]
    fn strips_quotes_prefix_and_period() {
        assert_eq!(
            clean_title("\"Planning a Rust CLI.\"").as_deref(),
            Some("Planning a Rust CLI")
        );
        assert_eq!(
            clean_title("Title: Weekend Trip Ideas").as_deref(),
            Some("Weekend Trip Ideas")
        );
    }

    #[test]
    fn takes_first_non_empty_line() {
        assert_eq!(
            clean_title("\n\nSQLite Schema Review\nextra").as_deref(),
            Some("SQLite Schema Review")
        );
    }

    #[test]
    fn rejects_blank_and_caps_length() {
        assert!(clean_title("\"\"").is_none());
        let long = "word ".repeat(40);
        assert_eq!(clean_title(&long).unwrap().chars().count(), 60);
    }
}
