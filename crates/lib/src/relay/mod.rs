//! Relay: HTTP + WebSocket server that fans chat text out to connected clients.
//!
//! Single port serves HTTP and WebSocket. Frames are plain text: a client sends its
//! message, other clients receive `User: <text>`, the sender receives `AI: <reply>`.

mod protocol;
mod server;

pub use protocol::{ai_frame, parse_frame, user_frame, RelayLine, AI_PREFIX, USER_PREFIX};
pub use server::{run_relay, serve, RelayState};
