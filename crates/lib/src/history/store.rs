//! Ordered message history persisted as a single JSON blob.
//!
//! Every mutation rewrites the whole blob. Loading never fails: a missing,
//! unreadable, or malformed blob is treated as an empty history.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::storage::KeyValueStore;
use crate::error::ChatError;
use crate::message::{now_ms, Message};

/// Index of a message in the history; valid until the next clear or import.
pub type MessageId = usize;

#[derive(Debug, thiserror::Error)]
pub enum HistoryError {
    #[error("history storage failed: {0}")]
    Storage(#[from] std::io::Error),
    #[error("history serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// In-memory history mirrored to a key in a [`KeyValueStore`].
pub struct HistoryStore {
    store: Arc<dyn KeyValueStore>,
    key: String,
    messages: Vec<Message>,
}

impl HistoryStore {
    /// Load history from `key`; absent, unreadable, or non-array data yields an empty history.
    pub fn load(store: Arc<dyn KeyValueStore>, key: impl Into<String>) -> Self {
        let key = key.into();
        let messages = match store.get(&key) {
            Ok(Some(bytes)) => match serde_json::from_slice::<Vec<Message>>(&bytes) {
                Ok(messages) => messages,
                Err(e) => {
                    log::warn!("history: ignoring unparseable history under {}: {}", key, e);
                    Vec::new()
                }
            },
            Ok(None) => Vec::new(),
            Err(e) => {
                log::warn!("history: reading {} failed, starting empty: {}", key, e);
                Vec::new()
            }
        };
        log::debug!("history: loaded {} message(s)", messages.len());
        Self {
            store,
            key,
            messages,
        }
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn get(&self, id: MessageId) -> Option<&Message> {
        self.messages.get(id)
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Serialize the full sequence and overwrite the backing value.
    pub fn persist(&self) -> Result<(), HistoryError> {
        let bytes = serde_json::to_vec(&self.messages)?;
        self.store.set(&self.key, &bytes)?;
        Ok(())
    }

    fn flush(&self) {
        if let Err(e) = self.persist() {
            log::warn!("history: persist failed: {}", e);
        }
    }

    /// Append a message, stamping it with the current time if it has none.
    pub fn append(&mut self, mut message: Message) -> MessageId {
        if message.ts.is_none() {
            message.ts = Some(now_ms());
        }
        self.messages.push(message);
        self.flush();
        self.messages.len() - 1
    }

    /// Overwrite the content of a message in place. Returns false if `id` is stale.
    pub fn set_content(&mut self, id: MessageId, content: &str) -> bool {
        let Some(m) = self.messages.get_mut(id) else {
            return false;
        };
        m.content.clear();
        m.content.push_str(content);
        self.flush();
        true
    }

    /// Stamp a message with the current time (completion of a streamed reply).
    pub fn touch(&mut self, id: MessageId) -> bool {
        let Some(m) = self.messages.get_mut(id) else {
            return false;
        };
        m.ts = Some(now_ms());
        self.flush();
        true
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.flush();
    }

    /// Swap in a new sequence wholesale.
    pub fn replace(&mut self, messages: Vec<Message>) {
        self.messages = messages;
        self.flush();
    }

    /// Pretty-printed JSON array of the full history.
    pub fn export(&self) -> Result<String, HistoryError> {
        Ok(serde_json::to_string_pretty(&self.messages)?)
    }

    /// Replace the history with an exported payload. On any validation failure
    /// the current history is left untouched.
    pub fn import(&mut self, bytes: &[u8]) -> Result<usize, ChatError> {
        let messages = parse_import(bytes)?;
        let count = messages.len();
        self.replace(messages);
        log::info!("history: imported {} message(s)", count);
        Ok(count)
    }
}

/// Validate an import payload: must be a JSON array of message records.
pub fn parse_import(bytes: &[u8]) -> Result<Vec<Message>, ChatError> {
    let value: serde_json::Value = serde_json::from_slice(bytes)
        .map_err(|e| ChatError::InvalidImport(format!("failed to parse chat JSON: {}", e)))?;
    if !value.is_array() {
        return Err(ChatError::InvalidImport(
            "expected an array of messages".to_string(),
        ));
    }
    serde_json::from_value(value)
        .map_err(|e| ChatError::InvalidImport(format!("invalid message record: {}", e)))
}

/// File name offered for an export taken at `at`, e.g. `chat-2024-05-01T10-20-30-123Z.json`.
pub fn export_file_name(at: DateTime<Utc>) -> String {
    let stamp = at
        .to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
        .replace([':', '.'], "-");
    format!("chat-{}.json", stamp)
}
