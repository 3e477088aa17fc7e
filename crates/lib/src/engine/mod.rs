//! Generation engine abstraction and the Ollama-backed implementation.
//!
//! An engine creates handles bound to one model; a handle turns a conversation
//! into a lazy, finite, non-restartable stream of text increments.

mod binding;
mod ollama;

pub use binding::EngineBinding;
pub use ollama::{
    pull_fraction, OllamaClient, OllamaEngine, OllamaError, OllamaModel, PullEvent,
    DEFAULT_BASE_URL,
};

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::message::{Message, Role};

/// Stream of text increments produced by one completion request.
pub type DeltaStream = BoxStream<'static, Result<String, EngineError>>;

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("engine unavailable: {0}")]
    Unavailable(String),
    #[error("engine request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("engine api error: {0}")]
    Api(String),
    #[error("engine stream error: {0}")]
    Stream(String),
}

/// Acquisition progress: completion fraction in [0, 1] and a human-readable stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    pub fraction: f32,
    pub stage: String,
}

impl Progress {
    pub fn new(fraction: f32, stage: impl Into<String>) -> Self {
        Self {
            fraction,
            stage: stage.into(),
        }
    }
}

/// Sampling parameters for a completion request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_tokens: 1024,
        }
    }
}

/// Message as sent to an engine (role + content, no timestamp).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    #[serde(default)]
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

impl From<&Message> for ChatMessage {
    fn from(m: &Message) -> Self {
        Self {
            role: m.role,
            content: m.content.clone(),
        }
    }
}

/// Factory for engine handles.
#[async_trait]
pub trait GenerationEngine: Send + Sync {
    /// Ok when the runtime needed to create handles is present. The error text explains what is missing.
    async fn check_available(&self) -> Result<(), EngineError>;

    /// Model ids this engine can load, in preference order.
    async fn catalog(&self) -> Result<Vec<String>, EngineError>;

    /// Load `model_id` and return a ready handle, reporting progress along the way.
    async fn create(
        &self,
        model_id: &str,
        on_progress: &mut (dyn FnMut(Progress) + Send),
    ) -> Result<Box<dyn EngineHandle>, EngineError>;
}

/// A loaded engine instance bound to one model.
#[async_trait]
pub trait EngineHandle: Send + Sync {
    fn model_id(&self) -> &str;

    /// Start a streaming completion over `messages`.
    async fn completions(
        &self,
        messages: Vec<ChatMessage>,
        params: &GenerationParams,
    ) -> Result<DeltaStream, EngineError>;

    /// Free the resources held by this handle.
    async fn release(&self) -> Result<(), EngineError>;
}
