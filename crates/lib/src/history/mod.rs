//! Durable chat history: a key-value byte store and the ordered message log on top of it.

mod storage;
mod store;

pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use store::{export_file_name, parse_import, HistoryError, HistoryStore, MessageId};

/// Key under which the message history is stored.
pub const HISTORY_KEY: &str = "local-ai-chat-history-v1";

/// Key under which the selected model id is stored.
pub const MODEL_KEY: &str = "local-ai-chat-model";
