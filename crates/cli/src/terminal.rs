//! Terminal rendering for the chat REPL.
//!
//! Replies stream to stdout; status lines go to stderr so a piped transcript stays clean.

use std::io::{self, Write};

use lib::message::{Message, Role};
use lib::view::{avatar, meta_line, ChatView, Status};

/// ANSI: carriage return + clear line, for progress that overwrites itself.
const CLEAR_LINE: &str = "\r\x1b[2K";

#[derive(Default)]
pub struct TerminalView {
    /// Bytes of the current reply already written.
    printed: usize,
    /// An assistant row was opened but its header is not printed yet.
    pending_header: bool,
    /// Something of the current reply is on screen without a trailing newline.
    mid_line: bool,
    /// A progress line is on stderr.
    progress_shown: bool,
}

impl TerminalView {
    pub fn new() -> Self {
        Self::default()
    }

    fn end_line(&mut self) {
        if self.mid_line {
            println!();
            self.mid_line = false;
        }
    }

    fn clear_progress(&mut self) {
        if self.progress_shown {
            eprint!("{}", CLEAR_LINE);
            self.progress_shown = false;
        }
    }
}

fn write_out(text: &str) {
    let mut out = io::stdout().lock();
    let _ = out.write_all(text.as_bytes());
    let _ = out.flush();
}

impl ChatView for TerminalView {
    fn render_all(&mut self, messages: &[Message]) {
        self.end_line();
        if messages.is_empty() {
            eprintln!("(history is empty)");
            return;
        }
        for m in messages {
            println!("{} [{}]", avatar(m.role), meta_line(m));
            println!("{}", m.content);
            println!();
        }
    }

    fn render_message(&mut self, message: &Message) {
        // The user's own line is already on screen.
        if message.role == Role::Assistant {
            self.printed = 0;
            self.pending_header = true;
        }
    }

    fn render_increment(&mut self, content: &str) {
        self.clear_progress();
        if self.pending_header {
            write_out(&format!("{} ", avatar(Role::Assistant)));
            self.pending_header = false;
            self.mid_line = true;
        }
        match content.get(self.printed..) {
            Some(suffix) => write_out(suffix),
            None => {
                write_out("\n");
                write_out(content);
            }
        }
        self.printed = content.len();
        self.mid_line = true;
    }

    fn set_status(&mut self, status: &Status) {
        match status {
            Status::Initializing(_) | Status::Loading { .. } => {
                eprint!("{}{}", CLEAR_LINE, status);
                self.progress_shown = true;
            }
            Status::Ready(_) => {
                eprintln!("{}{}", CLEAR_LINE, status);
                self.progress_shown = false;
            }
            Status::ModelSelected(_) => eprintln!("{}", status),
            Status::Done => self.end_line(),
            Status::Stopped | Status::Error(_) => {
                self.clear_progress();
                self.end_line();
                eprintln!("[{}]", status);
            }
            Status::Idle | Status::Generating => {}
        }
    }
}
