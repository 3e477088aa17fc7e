//! Presentation of a chat session: transcript rendering, status line, and send/stop controls.
//!
//! The session drives a [`ChatView`]; callers pick the surface (terminal, in-memory
//! [`Transcript`], anything else). Callers must append a message to the history
//! before rendering it so "last rendered" and "last stored" stay the same message.

use std::fmt;

use chrono::{Local, TimeZone};

use crate::engine::Progress;
use crate::message::{Message, Role};

/// Operator-facing status line.
#[derive(Debug, Clone, PartialEq)]
pub enum Status {
    Idle,
    ModelSelected(String),
    Initializing(String),
    Loading { model: String, progress: Progress },
    Ready(String),
    Generating,
    Done,
    Stopped,
    Error(String),
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Idle => write!(f, "Idle"),
            Status::ModelSelected(model) => write!(
                f,
                "Model set to {}. It will initialize on next message.",
                model
            ),
            Status::Initializing(model) => write!(f, "Initializing model {}", model),
            Status::Loading { model, progress } => write!(
                f,
                "Loading {}: {:.0}% - {}",
                model,
                progress.fraction * 100.0,
                progress.stage
            ),
            Status::Ready(model) => write!(f, "Model {} ready.", model),
            Status::Generating => write!(f, "Generating response"),
            Status::Done => write!(f, "Done"),
            Status::Stopped => write!(f, "Generation stopped"),
            Status::Error(msg) => write!(f, "Error: {}", msg),
        }
    }
}

/// Send/stop affordances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Controls {
    pub send_enabled: bool,
    pub stop_enabled: bool,
}

impl Controls {
    pub const IDLE: Controls = Controls {
        send_enabled: true,
        stop_enabled: false,
    };
    pub const GENERATING: Controls = Controls {
        send_enabled: false,
        stop_enabled: true,
    };
}

impl Default for Controls {
    fn default() -> Self {
        Controls::IDLE
    }
}

/// Surface a session renders into.
pub trait ChatView: Send {
    /// Rebuild the whole transcript from `messages`.
    fn render_all(&mut self, messages: &[Message]);
    /// Append one message to the transcript.
    fn render_message(&mut self, message: &Message);
    /// Replace the content of the last rendered message.
    fn render_increment(&mut self, content: &str);
    fn set_status(&mut self, _status: &Status) {}
    fn set_controls(&mut self, _controls: Controls) {}
}

/// `role • local time` caption shown under a message.
pub fn meta_line(message: &Message) -> String {
    let when = message
        .ts
        .and_then(|ms| Local.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Local::now);
    format!("{} • {}", message.role, when.format("%Y-%m-%d %H:%M:%S"))
}

/// Single-letter avatar for a role.
pub fn avatar(role: Role) -> char {
    match role {
        Role::User => 'U',
        Role::Assistant => 'A',
        Role::System => 'S',
    }
}

/// One rendered transcript row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscriptEntry {
    pub role: Role,
    pub content: String,
    pub meta: String,
}

impl From<&Message> for TranscriptEntry {
    fn from(m: &Message) -> Self {
        Self {
            role: m.role,
            content: m.content.clone(),
            meta: meta_line(m),
        }
    }
}

/// In-memory projection of a session: rows, latest status, and control state.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    status: Option<Status>,
    controls: Controls,
    full_renders: usize,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn last(&self) -> Option<&TranscriptEntry> {
        self.entries.last()
    }

    pub fn status(&self) -> Option<&Status> {
        self.status.as_ref()
    }

    pub fn controls(&self) -> Controls {
        self.controls
    }

    /// Number of full rebuilds so far.
    pub fn full_renders(&self) -> usize {
        self.full_renders
    }
}

impl ChatView for Transcript {
    fn render_all(&mut self, messages: &[Message]) {
        self.entries = messages.iter().map(TranscriptEntry::from).collect();
        self.full_renders += 1;
    }

    fn render_message(&mut self, message: &Message) {
        self.entries.push(TranscriptEntry::from(message));
    }

    fn render_increment(&mut self, content: &str) {
        if let Some(last) = self.entries.last_mut() {
            last.content.clear();
            last.content.push_str(content);
        }
    }

    fn set_status(&mut self, status: &Status) {
        self.status = Some(status.clone());
    }

    fn set_controls(&mut self, controls: Controls) {
        self.controls = controls;
    }
}
