//! Relay text frames.

pub const AI_PREFIX: &str = "AI: ";
pub const USER_PREFIX: &str = "User: ";

/// Frame carrying a generated reply back to the sender.
pub fn ai_frame(reply: &str) -> String {
    format!("{}{}", AI_PREFIX, reply)
}

/// Frame carrying another client's message.
pub fn user_frame(text: &str) -> String {
    format!("{}{}", USER_PREFIX, text)
}

/// A received frame split by its prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayLine<'a> {
    Ai(&'a str),
    User(&'a str),
    Other(&'a str),
}

pub fn parse_frame(frame: &str) -> RelayLine<'_> {
    if let Some(rest) = frame.strip_prefix(AI_PREFIX) {
        RelayLine::Ai(rest)
    } else if let Some(rest) = frame.strip_prefix(USER_PREFIX) {
        RelayLine::User(rest)
    } else {
        RelayLine::Other(frame)
    }
}
