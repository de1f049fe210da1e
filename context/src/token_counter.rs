//! Token counting using tiktoken.
//!
//! Counts use the `cl100k_base` encoding. Chat framing is approximated with a
//! fixed overhead: 4 tokens per message (role marker and delimiters) and 2
//! tokens per request (reply priming). The numbers feed statistics and the
//! token budget warning, so an approximation is enough.

use std::sync::OnceLock;

use tiktoken_rs::{CoreBPE, cl100k_base};

use parley_types::Message;

/// Per-message framing overhead.
pub const MESSAGE_OVERHEAD: u32 = 4;
/// Per-request framing overhead.
pub const LIST_OVERHEAD: u32 = 2;

/// The tiktoken encoder is expensive to initialize (loads vocabulary data),
/// so we create it once and reuse it across all `TokenCounter` instances.
static ENCODER: OnceLock<Option<CoreBPE>> = OnceLock::new();

fn get_encoder() -> Option<&'static CoreBPE> {
    ENCODER.get_or_init(|| cl100k_base().ok()).as_ref()
}

/// Thread-safe approximate token counter.
///
/// Counting is a pure function of its input. If the encoder cannot be loaded
/// the counter falls back to byte length, which over-estimates but keeps the
/// budget warning conservative.
///
/// # Example
///
/// ```
/// use parley_context::TokenCounter;
///
/// let counter = TokenCounter::new();
/// assert!(counter.count("Hello, world!") > 0);
/// ```
#[derive(Clone, Copy)]
pub struct TokenCounter {
    encoder: Option<&'static CoreBPE>,
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter")
            .field("encoder", &self.encoder.as_ref().map(|_| "<CoreBPE>"))
            .finish()
    }
}

impl TokenCounter {
    #[must_use]
    pub fn new() -> Self {
        let encoder = get_encoder();
        if encoder.is_none() {
            tracing::error!(
                "Failed to initialize tiktoken cl100k_base encoder. Falling back to byte-length estimates."
            );
        }

        Self { encoder }
    }

    /// Counts the tokens in a string.
    #[must_use]
    pub fn count(&self, text: &str) -> u32 {
        let len = match self.encoder {
            Some(encoder) => encoder.encode_ordinary(text).len(),
            None => text.len(),
        };

        u32::try_from(len).unwrap_or(u32::MAX)
    }

    /// Tokens for one message: its content plus [`MESSAGE_OVERHEAD`].
    #[must_use]
    pub fn count_message(&self, msg: &Message) -> u32 {
        self.count(msg.content()).saturating_add(MESSAGE_OVERHEAD)
    }

    /// Tokens for a message list as it would be submitted.
    ///
    /// An empty list still costs [`LIST_OVERHEAD`].
    #[must_use]
    pub fn count_all(&self, messages: &[Message]) -> u32 {
        messages
            .iter()
            .map(|msg| self.count_message(msg))
            .fold(LIST_OVERHEAD, u32::saturating_add)
    }
}

impl Default for TokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use parley_types::{Message, Role};

    use super::{LIST_OVERHEAD, MESSAGE_OVERHEAD, TokenCounter};

    #[test]
    fn count_empty_string() {
        assert_eq!(TokenCounter::new().count(""), 0);
    }

    #[test]
    fn count_longer_text() {
        let counter = TokenCounter::new();
        let tokens = counter.count("The quick brown fox jumps over the lazy dog.");
        assert!(tokens >= 5);
        assert!(tokens <= 20);
    }

    #[test]
    fn count_message_adds_fixed_overhead() {
        let counter = TokenCounter::new();
        let msg = Message::try_user("Hello!").unwrap();
        assert_eq!(
            counter.count_message(&msg),
            counter.count("Hello!") + MESSAGE_OVERHEAD
        );
    }

    #[test]
    fn count_all_empty_list_is_list_overhead() {
        assert_eq!(TokenCounter::new().count_all(&[]), LIST_OVERHEAD);
    }

    #[test]
    fn count_all_sums_messages_plus_list_overhead() {
        let counter = TokenCounter::new();
        let messages = vec![
            Message::try_new(Role::System, "You are helpful.").unwrap(),
            Message::try_user("How are you today?").unwrap(),
            Message::try_new(Role::Assistant, "Fine, thanks.").unwrap(),
        ];

        let expected: u32 = messages
            .iter()
            .map(|m| counter.count(m.content()) + MESSAGE_OVERHEAD)
            .sum::<u32>()
            + LIST_OVERHEAD;
        assert_eq!(counter.count_all(&messages), expected);
    }

    #[test]
    fn counters_share_encoder_and_agree() {
        let a = TokenCounter::new();
        let b = TokenCounter::default();
        let text = "The quick brown fox";
        assert_eq!(a.count(text), b.count(text));
        assert_eq!(a.count(text), a.count(text));
    }
}
