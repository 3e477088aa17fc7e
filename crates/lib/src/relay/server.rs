//! Relay HTTP + WebSocket server (single port).

use std::future::Future;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
    routing::get,
    Json, Router,
};
use futures_util::StreamExt;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::{ai_frame, user_frame};
use crate::config::{self, Config};
use crate::engine::{ChatMessage, EngineBinding, GenerationEngine, GenerationParams, Progress};
use crate::error::ChatError;
use crate::session::ERROR_MARKER;

/// A frame fanned out to every client except its sender.
#[derive(Debug, Clone)]
struct RelayFrame {
    from: Uuid,
    text: String,
}

/// Shared state for the relay (engine binding, model, fan-out channel).
#[derive(Clone)]
pub struct RelayState {
    port: u16,
    model: Arc<String>,
    params: GenerationParams,
    /// One handle for all clients; replies are generated one at a time.
    binding: Arc<tokio::sync::Mutex<EngineBinding>>,
    frames_tx: broadcast::Sender<RelayFrame>,
    shutdown: CancellationToken,
}

impl RelayState {
    /// Model is `engine.defaultModel` when set, otherwise the first model the engine lists.
    pub async fn new(config: &Config, engine: Arc<dyn GenerationEngine>) -> Self {
        let configured = config
            .engine
            .default_model
            .as_ref()
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty());
        let model = match configured {
            Some(m) => m,
            None => match engine.catalog().await {
                Ok(list) => list.into_iter().next().unwrap_or_default(),
                Err(e) => {
                    log::warn!("relay: model catalog unavailable: {}", e);
                    String::new()
                }
            },
        };
        if model.is_empty() {
            log::warn!("relay: no model configured or installed; replies will fail");
        }
        let (frames_tx, _) = broadcast::channel(64);
        Self {
            port: config.relay.port,
            model: Arc::new(model),
            params: GenerationParams {
                temperature: config.engine.temperature,
                max_tokens: config.relay.max_new_tokens,
            },
            binding: Arc::new(tokio::sync::Mutex::new(EngineBinding::new(engine))),
            frames_tx,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate a reply using only `text` as context.
    pub async fn generate_reply(&self, text: &str) -> Result<String, ChatError> {
        let model = self.model.as_str();
        let mut binding = self.binding.lock().await;
        let mut on_progress = |p: Progress| {
            log::debug!(
                "relay: loading {}: {:.0}% {}",
                model,
                p.fraction * 100.0,
                p.stage
            )
        };
        let handle = binding.ensure(model, &mut on_progress).await?;
        let mut stream = handle
            .completions(vec![ChatMessage::user(text)], &self.params)
            .await
            .map_err(|e| ChatError::Generation(e.to_string()))?;
        let mut reply = String::new();
        while let Some(delta) = stream.next().await {
            let delta = delta.map_err(|e| ChatError::Generation(e.to_string()))?;
            reply.push_str(&delta);
        }
        Ok(reply)
    }
}

/// Run the relay server; binds to config.relay.bind:config.relay.port.
/// Blocks until shutdown (Ctrl+C or SIGTERM), then releases the loaded model.
pub async fn run_relay(config: Config, engine: Arc<dyn GenerationEngine>) -> Result<()> {
    let bind = config.relay.bind.trim();
    if !config::is_loopback_bind(bind) {
        log::warn!(
            "relay bound to non-loopback address {}; any client that can reach it can use the engine",
            bind
        );
    }
    let state = RelayState::new(&config, engine).await;
    let binding = state.binding.clone();

    let bind_addr = format!("{}:{}", bind, config.relay.port);
    let listener = TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("relay listening on {} (model {})", bind_addr, state.model());

    serve(listener, state, shutdown_signal()).await?;
    binding.lock().await.release().await;
    log::info!("relay stopped");
    Ok(())
}

/// Serve the relay on `listener` until `shutdown` completes. Open sockets are closed on shutdown.
pub async fn serve<F>(listener: TcpListener, mut state: RelayState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    state.port = listener
        .local_addr()
        .context("reading relay listener address")?
        .port();
    let token = state.shutdown.clone();
    let app = Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler))
        .with_state(state);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.await;
            token.cancel();
        })
        .await
        .context("relay server exited")?;
    Ok(())
}

/// Future that completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, closing relay connections");
}

/// GET / returns a simple health JSON.
async fn health_http(State(state): State<RelayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "port": state.port,
    }))
}

/// GET /ws upgrades to WebSocket.
async fn ws_handler(State(state): State<RelayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(mut socket: WebSocket, state: RelayState) {
    let id = Uuid::new_v4();
    let mut frames_rx = state.frames_tx.subscribe();
    log::info!("relay: client {} connected", id);

    loop {
        tokio::select! {
            biased;

            _ = state.shutdown.cancelled() => {
                let _ = socket.send(Message::Close(None)).await;
                break;
            }
            frame = frames_rx.recv() => {
                if !forward(&mut socket, id, frame).await {
                    break;
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let text = match msg {
                    Message::Text(text) => text,
                    Message::Close(_) => break,
                    _ => continue,
                };
                if text.trim().is_empty() {
                    continue;
                }
                log::debug!("relay: client {} sent {} byte(s)", id, text.len());
                let _ = state.frames_tx.send(RelayFrame {
                    from: id,
                    text: user_frame(&text),
                });

                // Other clients' frames keep flowing while the reply is generated.
                let generation = state.generate_reply(&text);
                tokio::pin!(generation);
                let reply = loop {
                    tokio::select! {
                        biased;

                        _ = state.shutdown.cancelled() => break None,
                        reply = &mut generation => break Some(reply),
                        frame = frames_rx.recv() => {
                            if !forward(&mut socket, id, frame).await {
                                log::info!("relay: client {} disconnected", id);
                                return;
                            }
                        }
                    }
                };
                let reply = match reply {
                    Some(Ok(reply)) => reply,
                    Some(Err(e)) => {
                        log::warn!("relay: generation for client {} failed: {}", id, e);
                        ERROR_MARKER.to_string()
                    }
                    None => {
                        log::debug!("relay: dropping reply for client {} on shutdown", id);
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                };
                if socket.send(Message::Text(ai_frame(&reply))).await.is_err() {
                    break;
                }
            }
        }
    }
    log::info!("relay: client {} disconnected", id);
}

/// Send a fanned-out frame to `socket` unless `id` sent it. False when the socket should close.
async fn forward(
    socket: &mut WebSocket,
    id: Uuid,
    frame: Result<RelayFrame, broadcast::error::RecvError>,
) -> bool {
    match frame {
        Ok(frame) => frame.from == id || socket.send(Message::Text(frame.text)).await.is_ok(),
        Err(broadcast::error::RecvError::Lagged(n)) => {
            log::debug!("relay: client {} lagged {} frame(s)", id, n);
            true
        }
        Err(broadcast::error::RecvError::Closed) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DeltaStream, EngineError, EngineHandle};
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[derive(Default)]
    struct EchoEngine {
        seen: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
        max_tokens: Arc<Mutex<Vec<u32>>>,
    }

    struct EchoHandle {
        model: String,
        seen: Arc<Mutex<Vec<Vec<ChatMessage>>>>,
        max_tokens: Arc<Mutex<Vec<u32>>>,
    }

    #[async_trait]
    impl GenerationEngine for EchoEngine {
        async fn check_available(&self) -> Result<(), EngineError> {
            Ok(())
        }

        async fn catalog(&self) -> Result<Vec<String>, EngineError> {
            Ok(vec!["first".into(), "second".into()])
        }

        async fn create(
            &self,
            model_id: &str,
            _on_progress: &mut (dyn FnMut(Progress) + Send),
        ) -> Result<Box<dyn EngineHandle>, EngineError> {
            Ok(Box::new(EchoHandle {
                model: model_id.to_string(),
                seen: self.seen.clone(),
                max_tokens: self.max_tokens.clone(),
            }))
        }
    }

    #[async_trait]
    impl EngineHandle for EchoHandle {
        fn model_id(&self) -> &str {
            &self.model
        }

        async fn completions(
            &self,
            messages: Vec<ChatMessage>,
            params: &GenerationParams,
        ) -> Result<DeltaStream, EngineError> {
            let last = messages.last().map(|m| m.content.clone()).unwrap_or_default();
            self.seen.lock().unwrap().push(messages);
            self.max_tokens.lock().unwrap().push(params.max_tokens);
            let parts = vec![Ok(format!("{} ", self.model)), Ok(last)];
            Ok(futures_util::stream::iter(parts).boxed())
        }

        async fn release(&self) -> Result<(), EngineError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn model_falls_back_to_first_catalog_entry() {
        let state = RelayState::new(&Config::default(), Arc::new(EchoEngine::default())).await;
        assert_eq!(state.model(), "first");

        let mut config = Config::default();
        config.engine.default_model = Some(" second ".into());
        let state = RelayState::new(&config, Arc::new(EchoEngine::default())).await;
        assert_eq!(state.model(), "second");
    }

    #[tokio::test]
    async fn reply_uses_only_the_frame_as_context() {
        let engine = Arc::new(EchoEngine::default());
        let state = RelayState::new(&Config::default(), engine.clone()).await;
        assert_eq!(state.generate_reply("one").await.unwrap(), "first one");
        assert_eq!(state.generate_reply("two").await.unwrap(), "first two");

        let seen = engine.seen.lock().unwrap();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[1], vec![ChatMessage::user("two")]);
        assert_eq!(*engine.max_tokens.lock().unwrap(), vec![50, 50]);
    }
}
