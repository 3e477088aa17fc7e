mod terminal;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use lib::config::{self, Config};
use lib::engine::{GenerationEngine, OllamaEngine};
use lib::error::ChatError;
use lib::history::{export_file_name, FileStore};
use lib::relay::{self, RelayLine};
use lib::session::{ChatSession, RequestOutcome, SessionOptions};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_tungstenite::tungstenite::Message;

use crate::terminal::TerminalView;

#[derive(Parser)]
#[command(name = "ember")]
#[command(about = "Ember CLI: chat with a local model", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Create the configuration directory and default files (config and history directory).
    Init {
        /// Config file path (default: EMBER_CONFIG_PATH or ~/.ember/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Chat with a local model (interactive). Ctrl+C stops the reply being generated; /help lists commands.
    Chat {
        /// Config file path (default: EMBER_CONFIG_PATH or ~/.ember/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// Model to use for this and later sessions (saved as the selected model).
        #[arg(long, short, value_name = "ID")]
        model: Option<String>,
    },

    /// List the models the engine offers.
    Models {
        /// Config file path (default: EMBER_CONFIG_PATH or ~/.ember/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,
    },

    /// Run the relay (HTTP + WebSocket): clients' messages are shared and answered by the model.
    Relay {
        /// Config file path (default: EMBER_CONFIG_PATH or ~/.ember/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<PathBuf>,

        /// WebSocket and HTTP port (default from PORT, config, or 3000)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Connect to a relay and exchange lines (interactive).
    Connect {
        /// Relay WebSocket URL (default built from the relay config)
        #[arg(long, value_name = "URL")]
        url: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    let result = match cli.command {
        Some(Commands::Version) => {
            println!("ember {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Some(Commands::Init { config }) => run_init(config).context("init failed"),
        Some(Commands::Chat { config, model }) => run_chat(config, model).await.context("chat failed"),
        Some(Commands::Models { config }) => run_models(config).await.context("models failed"),
        Some(Commands::Relay { config, port }) => run_relay(config, port).await.context("relay failed"),
        Some(Commands::Connect { url }) => run_connect(url).await.context("connect failed"),
        None => {
            println!("Run with --help for usage");
            Ok(())
        }
    };
    if let Err(e) = result {
        log::error!("{:#}", e);
        eprintln!("error: {:#}", e);
        std::process::exit(1);
    }
}

fn run_init(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(config::default_config_path);
    let dir = lib::init::init_config_dir(&path)?;
    println!("initialized configuration at {}", dir.display());
    Ok(())
}

fn engine_for(config: &Config) -> Arc<dyn GenerationEngine> {
    Arc::new(OllamaEngine::from_config(&config.engine))
}

async fn run_models(config_path: Option<PathBuf>) -> anyhow::Result<()> {
    let (config, _) = config::load_config(config_path)?;
    let models = engine_for(&config)
        .catalog()
        .await
        .context("listing engine models")?;
    if models.is_empty() {
        eprintln!("no models installed");
    }
    for m in models {
        println!("{}", m);
    }
    Ok(())
}

async fn run_relay(config_path: Option<PathBuf>, port: Option<u16>) -> anyhow::Result<()> {
    let (mut config, _) = config::load_config(config_path)?;
    config.relay.port = port.unwrap_or_else(|| config::resolve_relay_port(&config));
    log::info!("starting relay on {}:{}", config.relay.bind, config.relay.port);
    let engine = engine_for(&config);
    relay::run_relay(config, engine).await
}

const CHAT_HELP: &str = "\
commands:
  /help            show this help
  /models          list installed models
  /model [ID]      show or change the selected model
  /clear           delete the chat history
  /export [PATH]   write the history as JSON
  /import PATH     replace the history with an exported file
  /history         print the whole history
  /exit, /quit     leave
Ctrl+C stops a reply while it is being generated.";

async fn run_chat(config_path: Option<PathBuf>, model: Option<String>) -> anyhow::Result<()> {
    let (config, path) = config::load_config(config_path)?;
    let history_dir = config::resolve_history_dir(&config, &path);
    let store = FileStore::open(&history_dir)
        .with_context(|| format!("opening history directory {}", history_dir.display()))?;
    let session = ChatSession::open(
        engine_for(&config),
        Arc::new(store),
        SessionOptions::from_config(&config),
    )
    .await;

    let mut view = TerminalView::new();
    if let Some(m) = model.as_deref().map(str::trim).filter(|m| !m.is_empty()) {
        session.select_model(m, &mut view);
    }
    if !session.messages().is_empty() {
        session.render(&mut view);
    }
    let selected = session.selected_model();
    if selected.is_empty() {
        eprintln!("no model selected; install one with `ollama pull` or use /model ID");
    } else {
        eprintln!("model: {} (type /help for commands)", selected);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        eprint!("> ");
        let line = tokio::select! {
            line = lines.next_line() => line.context("reading stdin")?,
            _ = tokio::signal::ctrl_c() => {
                eprintln!();
                break;
            }
        };
        let Some(line) = line else { break };
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.starts_with('/') {
            match run_command(&session, &mut view, input).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    eprintln!("{:#}", e);
                    continue;
                }
            }
        }
        if let Err(e) = send_with_interrupt(&session, &mut view, input).await {
            eprintln!("{}", e);
        }
    }
    Ok(())
}

/// Send `input`, cancelling the request on Ctrl+C.
async fn send_with_interrupt(
    session: &ChatSession,
    view: &mut TerminalView,
    input: &str,
) -> Result<RequestOutcome, ChatError> {
    let send = session.send(input, view);
    tokio::pin!(send);
    loop {
        tokio::select! {
            outcome = &mut send => return outcome,
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    log::warn!("failed to listen for Ctrl+C: {}", e);
                    return (&mut send).await;
                }
                session.cancel();
            }
        }
    }
}

/// Run a slash command. Returns false when the REPL should exit.
async fn run_command(
    session: &ChatSession,
    view: &mut TerminalView,
    input: &str,
) -> anyhow::Result<bool> {
    let (cmd, arg) = match input.split_once(char::is_whitespace) {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (input, ""),
    };
    match cmd.to_ascii_lowercase().as_str() {
        "/exit" | "/quit" => return Ok(false),
        "/help" => println!("{}", CHAT_HELP),
        "/models" => {
            let selected = session.selected_model();
            for m in session.models().await? {
                let mark = if m == selected { '*' } else { ' ' };
                println!("{} {}", mark, m);
            }
        }
        "/model" => {
            if arg.is_empty() {
                println!("{}", session.selected_model());
            } else {
                session.select_model(arg, view);
            }
        }
        "/clear" => {
            session.clear(view)?;
            eprintln!("history cleared");
        }
        "/export" => {
            let target = if arg.is_empty() {
                PathBuf::from(export_file_name(chrono::Utc::now()))
            } else {
                PathBuf::from(arg)
            };
            let json = session.export()?;
            std::fs::write(&target, json)
                .with_context(|| format!("writing {}", target.display()))?;
            eprintln!("exported {} message(s) to {}", session.messages().len(), target.display());
        }
        "/import" => {
            if arg.is_empty() {
                anyhow::bail!("usage: /import PATH");
            }
            let bytes = std::fs::read(Path::new(arg))
                .with_context(|| format!("reading {}", arg))?;
            let count = session.import(&bytes, view)?;
            eprintln!("imported {} message(s)", count);
        }
        "/history" => session.render(view),
        other => eprintln!("unknown command {} (try /help)", other),
    }
    Ok(true)
}

/// Default relay URL from the default config (relay bind and port).
fn default_relay_url() -> anyhow::Result<String> {
    let (config, _) = config::load_config(None)?;
    let host = match config.relay.bind.trim() {
        "0.0.0.0" | "::" | "" => "127.0.0.1",
        bind => bind,
    };
    Ok(format!("ws://{}:{}/ws", host, config::resolve_relay_port(&config)))
}

async fn run_connect(url: Option<String>) -> anyhow::Result<()> {
    let url = match url {
        Some(u) => u,
        None => default_relay_url()?,
    };
    let (ws, _) = tokio_tungstenite::connect_async(&url)
        .await
        .with_context(|| format!("connecting to {}", url))?;
    eprintln!("connected to {} (Ctrl+C to leave)", url);
    let (mut sink, mut frames) = ws.split();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            frame = frames.next() => {
                let Some(frame) = frame else { break };
                match frame.context("reading from relay")? {
                    Message::Text(text) => match relay::parse_frame(&text) {
                        RelayLine::Ai(reply) => println!("AI › {}", reply),
                        RelayLine::User(msg) => println!("User › {}", msg),
                        RelayLine::Other(raw) => println!("{}", raw),
                    },
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            line = lines.next_line() => {
                let Some(line) = line.context("reading stdin")? else { break };
                let text = line.trim();
                if !text.is_empty() {
                    sink.send(Message::Text(text.to_string()))
                        .await
                        .context("sending to relay")?;
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    let _ = sink.close().await;
    eprintln!("disconnected");
    Ok(())
}
