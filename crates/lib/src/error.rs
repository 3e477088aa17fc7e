//! Error taxonomy of the chat session controller.

/// Conditions surfaced by the session controller.
///
/// `send` only returns `Busy` and `EmptyInput` as errors; everything else is
/// caught at the request boundary and reported through the request outcome
/// and the status line.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// The engine's runtime is missing or unreachable. The session stays usable.
    #[error("generation engine unavailable: {0}")]
    EngineUnavailable(String),
    #[error("engine initialization failed: {0}")]
    EngineInitFailed(String),
    /// Failure reported by the engine while opening or consuming a stream.
    #[error("generation failed: {0}")]
    Generation(String),
    /// User-initiated stop. Not a fault. `ensure_engine` returns it when `cancel`
    /// interrupts a model load; `send` reports the same stop as `RequestOutcome::Cancelled`.
    #[error("generation stopped")]
    Cancelled,
    #[error("invalid chat import: {0}")]
    InvalidImport(String),
    #[error("a generation request is already active")]
    Busy,
    #[error("message is empty")]
    EmptyInput,
}

impl ChatError {
    /// True for user-initiated cancellation, which is reported as "stopped" rather than "error".
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatError::Cancelled)
    }
}
