//! Broker channel naming.
//!
//! Chat messages travel on one channel per chat (`chat-<chatId>`); typing
//! indicators share two fixed channels and carry the chat id in the payload.

/// Prefix of every per-chat message channel.
pub const CHAT_CHANNEL_PREFIX: &str = "chat-";

/// Pattern matching every per-chat message channel.
pub const CHAT_CHANNEL_PATTERN: &str = "chat-*";

/// Channel carrying `typing` envelopes for all chats.
pub const TYPING_CHANNEL: &str = "user_typing";

/// Channel carrying `stopped-typing` envelopes for all chats.
pub const STOPPED_TYPING_CHANNEL: &str = "user_stopped_typing";

/// Everything a gateway instance subscribes to at startup.
pub const SUBSCRIPTION_PATTERNS: [&str; 3] =
    [CHAT_CHANNEL_PATTERN, TYPING_CHANNEL, STOPPED_TYPING_CHANNEL];

/// Maximum chat id length.
pub const MAX_CHAT_ID_LENGTH: usize = 256;

/// Validate a chat id.
///
/// # Errors
///
/// Returns an error message if the chat id is invalid.
pub fn validate_chat_id(id: &str) -> Result<(), &'static str> {
    if id.is_empty() {
        return Err("Chat id cannot be empty");
    }
    if id.len() > MAX_CHAT_ID_LENGTH {
        return Err("Chat id too long");
    }
    if !id.chars().all(|c| c.is_ascii() && !c.is_ascii_control()) {
        return Err("Chat id contains invalid characters");
    }
    // A chat id must never widen a pattern subscription.
    if id.contains(|c: char| matches!(c, '*' | '?' | '[' | ']')) {
        return Err("Chat id contains pattern characters");
    }
    Ok(())
}

/// Build the broker channel name for a chat.
#[must_use]
pub fn chat_channel(chat_id: &str) -> String {
    format!("{CHAT_CHANNEL_PREFIX}{chat_id}")
}

/// Extract the chat id from a per-chat channel name.
///
/// Returns `None` for channels outside the `chat-` namespace or with an
/// empty id.
#[must_use]
pub fn chat_id_from_channel(channel: &str) -> Option<&str> {
    channel
        .strip_prefix(CHAT_CHANNEL_PREFIX)
        .filter(|id| !id.is_empty())
}

/// Check whether a channel matches a subscription pattern.
///
/// Supports `*` (any run of characters) and `?` (exactly one character),
/// the subset used by [`SUBSCRIPTION_PATTERNS`].
#[must_use]
pub fn matches_pattern(pattern: &str, channel: &str) -> bool {
    let pattern = pattern.as_bytes();
    let channel = channel.as_bytes();

    let (mut p, mut c) = (0, 0);
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while c < channel.len() {
        if p < pattern.len() && (pattern[p] == b'?' || pattern[p] == channel[c]) {
            p += 1;
            c += 1;
        } else if p < pattern.len() && pattern[p] == b'*' {
            star = Some(p);
            resume = c;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            resume += 1;
            c = resume;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}
