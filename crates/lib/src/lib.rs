//! Ember core library: chat session controller, history persistence, engine
//! adapters, and the WebSocket relay, shared by the CLI.

pub mod config;
pub mod engine;
pub mod error;
pub mod history;
pub mod init;
pub mod message;
pub mod relay;
pub mod session;
pub mod view;
