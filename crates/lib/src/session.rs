//! Chat session controller: history, engine binding, and the generation request lifecycle.
//!
//! A request moves `Idle → Requesting → Streaming` and ends `Completed`, `Cancelled`,
//! or `Failed`, after which the session is `Idle` again. Only one request may be
//! active; a second `send` is rejected with [`ChatError::Busy`] instead of queued,
//! because streaming always writes into the last history entry.
//!
//! The session is shared by reference (or `Arc`) so `cancel` can be called from
//! another task while `send` is running.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::engine::{
    ChatMessage, DeltaStream, EngineBinding, EngineHandle, GenerationEngine, GenerationParams,
    Progress,
};
use crate::error::ChatError;
use crate::history::{
    HistoryError, HistoryStore, KeyValueStore, MessageId, HISTORY_KEY, MODEL_KEY,
};
use crate::message::Message;
use crate::view::{ChatView, Controls, Status};

/// Placeholder content for a reply that failed before producing any text.
pub const ERROR_MARKER: &str = "[Error generating response]";

/// Options for opening a session.
#[derive(Debug, Clone, Default)]
pub struct SessionOptions {
    /// Used when the engine catalog is empty or unreachable and nothing was saved.
    pub default_model: Option<String>,
    pub params: GenerationParams,
}

impl SessionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            default_model: config
                .engine
                .default_model
                .as_ref()
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            params: GenerationParams {
                temperature: config.engine.temperature,
                max_tokens: config.engine.max_tokens,
            },
        }
    }
}

/// Phase of the active request, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestPhase {
    Idle,
    Requesting,
    Streaming,
}

/// How a request ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestOutcome {
    /// The stream ran to its end.
    Completed { content: String },
    /// Stopped by the user; `partial` is what had been applied and stays committed.
    Cancelled { partial: String },
    /// Binding or streaming failed; `content` is what was committed for the reply.
    Failed { error: ChatError, content: String },
}

struct Activity {
    phase: RequestPhase,
    cancel: Option<CancellationToken>,
}

/// Returns the session to `Idle` when the request ends, however it ends.
struct ActiveRequest<'a> {
    session: &'a ChatSession,
    cancel: CancellationToken,
}

impl ActiveRequest<'_> {
    fn set_phase(&self, phase: RequestPhase) {
        self.session.activity().phase = phase;
    }
}

impl Drop for ActiveRequest<'_> {
    fn drop(&mut self) {
        let mut activity = self.session.activity();
        activity.phase = RequestPhase::Idle;
        activity.cancel = None;
    }
}

/// Holds the view's controls at `GENERATING` and puts them back to `IDLE` on drop,
/// including when the `send` future is dropped mid-request.
struct ControlsGuard<'v> {
    view: &'v mut dyn ChatView,
}

impl<'v> ControlsGuard<'v> {
    fn engage(view: &'v mut dyn ChatView) -> Self {
        view.set_controls(Controls::GENERATING);
        Self { view }
    }
}

impl Drop for ControlsGuard<'_> {
    fn drop(&mut self) {
        self.view.set_controls(Controls::IDLE);
    }
}

/// A chat session: message history, selected model, and the engine bound to it.
pub struct ChatSession {
    engine: Arc<dyn GenerationEngine>,
    store: Arc<dyn KeyValueStore>,
    history: Mutex<HistoryStore>,
    selected_model: Mutex<String>,
    binding: tokio::sync::Mutex<EngineBinding>,
    activity: Mutex<Activity>,
    params: GenerationParams,
}

impl ChatSession {
    /// Open a session over `store`: load history and resolve the selected model.
    ///
    /// The saved model wins when the engine still lists it; otherwise the first
    /// catalog entry, then `options.default_model`, then whatever was saved.
    pub async fn open(
        engine: Arc<dyn GenerationEngine>,
        store: Arc<dyn KeyValueStore>,
        options: SessionOptions,
    ) -> Self {
        let history = HistoryStore::load(store.clone(), HISTORY_KEY);
        let saved = match store.get(MODEL_KEY) {
            Ok(bytes) => bytes
                .and_then(|b| String::from_utf8(b).ok())
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty()),
            Err(e) => {
                log::warn!("session: reading saved model failed: {}", e);
                None
            }
        };
        let catalog = match engine.catalog().await {
            Ok(list) => list,
            Err(e) => {
                log::warn!("session: model catalog unavailable: {}", e);
                Vec::new()
            }
        };
        let selected = resolve_selected_model(saved, &catalog, options.default_model.as_deref());
        log::info!(
            "session: {} message(s) in history, model {}",
            history.len(),
            if selected.is_empty() { "<none>" } else { selected.as_str() }
        );
        Self {
            engine: engine.clone(),
            store,
            history: Mutex::new(history),
            selected_model: Mutex::new(selected),
            binding: tokio::sync::Mutex::new(EngineBinding::new(engine)),
            activity: Mutex::new(Activity {
                phase: RequestPhase::Idle,
                cancel: None,
            }),
            params: options.params,
        }
    }

    fn history(&self) -> MutexGuard<'_, HistoryStore> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn activity(&self) -> MutexGuard<'_, Activity> {
        self.activity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Snapshot of the history.
    pub fn messages(&self) -> Vec<Message> {
        self.history().messages().to_vec()
    }

    pub fn phase(&self) -> RequestPhase {
        self.activity().phase
    }

    pub fn is_busy(&self) -> bool {
        self.phase() != RequestPhase::Idle
    }

    pub fn selected_model(&self) -> String {
        self.selected_model
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Model ids the engine currently offers.
    pub async fn models(&self) -> Result<Vec<String>, ChatError> {
        self.engine
            .catalog()
            .await
            .map_err(|e| ChatError::EngineUnavailable(e.to_string()))
    }

    /// Record a new model choice. Nothing is loaded until the next request or `ensure_engine`.
    pub fn select_model(&self, model_id: &str, view: &mut dyn ChatView) {
        let model_id = model_id.trim().to_string();
        if let Err(e) = self.store.set(MODEL_KEY, model_id.as_bytes()) {
            log::warn!("session: saving selected model failed: {}", e);
        }
        *self
            .selected_model
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = model_id.clone();
        view.set_status(&Status::ModelSelected(model_id));
    }

    /// Rebuild `view` from the stored history.
    pub fn render(&self, view: &mut dyn ChatView) {
        let history = self.history();
        view.render_all(history.messages());
    }

    /// Empty the history. Rejected while a request is active.
    pub fn clear(&self, view: &mut dyn ChatView) -> Result<(), ChatError> {
        let activity = self.activity();
        if activity.phase != RequestPhase::Idle {
            return Err(ChatError::Busy);
        }
        let mut history = self.history();
        history.clear();
        view.render_all(history.messages());
        drop(activity);
        Ok(())
    }

    /// Pretty-printed JSON of the full history.
    pub fn export(&self) -> Result<String, HistoryError> {
        self.history().export()
    }

    /// Replace the history with an exported payload. Rejected while a request is active;
    /// invalid payloads leave the history untouched.
    pub fn import(&self, bytes: &[u8], view: &mut dyn ChatView) -> Result<usize, ChatError> {
        let activity = self.activity();
        if activity.phase != RequestPhase::Idle {
            return Err(ChatError::Busy);
        }
        let mut history = self.history();
        let count = history.import(bytes)?;
        view.render_all(history.messages());
        drop(activity);
        Ok(count)
    }

    /// Load the selected model ahead of the first request. Rejected while a request is active.
    ///
    /// `cancel` abandons the load and returns [`ChatError::Cancelled`]; the engine stays unbound.
    pub async fn ensure_engine(&self, view: &mut dyn ChatView) -> Result<(), ChatError> {
        let request = self.begin()?;
        let model = self.selected_model();
        let result = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => Err(ChatError::Cancelled),
            bound = async {
                let mut binding = self.binding.lock().await;
                bind(&mut binding, &model, &mut *view).await.map(|_| ())
            } => bound,
        };
        drop(request);
        match result {
            Err(ref e) if e.is_cancelled() => view.set_status(&Status::Stopped),
            Err(ref e) => view.set_status(&Status::Error(e.to_string())),
            Ok(()) => {}
        }
        result
    }

    /// Request cancellation of the active request. Returns false when nothing is running.
    pub fn cancel(&self) -> bool {
        match &self.activity().cancel {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    fn begin(&self) -> Result<ActiveRequest<'_>, ChatError> {
        let mut activity = self.activity();
        if activity.phase != RequestPhase::Idle {
            return Err(ChatError::Busy);
        }
        let cancel = CancellationToken::new();
        activity.phase = RequestPhase::Requesting;
        activity.cancel = Some(cancel.clone());
        Ok(ActiveRequest {
            session: self,
            cancel,
        })
    }

    /// Send `input` and stream the reply into the history and `view`.
    ///
    /// Returns `Err` only when the request was rejected without side effects
    /// (`EmptyInput`, `Busy`). Engine failures and cancellation are reported
    /// through the outcome and the status line.
    pub async fn send(
        &self,
        input: &str,
        view: &mut dyn ChatView,
    ) -> Result<RequestOutcome, ChatError> {
        let text = input.trim();
        if text.is_empty() {
            return Err(ChatError::EmptyInput);
        }
        let request = self.begin()?;
        let controls = ControlsGuard::engage(view);
        let outcome = self.run(&request, text, &mut *controls.view).await;
        drop(controls);
        drop(request);
        Ok(outcome)
    }

    async fn run(
        &self,
        request: &ActiveRequest<'_>,
        text: &str,
        view: &mut dyn ChatView,
    ) -> RequestOutcome {
        let (placeholder, context) = {
            let mut history = self.history();
            let user = history.append(Message::user(text));
            if let Some(m) = history.get(user) {
                view.render_message(m);
            }
            let context: Vec<ChatMessage> =
                history.messages().iter().map(ChatMessage::from).collect();
            let placeholder = history.append(Message::assistant(""));
            if let Some(m) = history.get(placeholder) {
                view.render_message(m);
            }
            (placeholder, context)
        };

        let model = self.selected_model();
        let mut binding = self.binding.lock().await;
        let opened = tokio::select! {
            biased;
            _ = request.cancel.cancelled() => Err(ChatError::Cancelled),
            opened = open_stream(&mut binding, &model, context, &self.params, view) => opened,
        };
        let mut stream = match opened {
            Ok(stream) => stream,
            Err(error) if error.is_cancelled() => return stopped(String::new(), view),
            Err(error) => return self.fail(placeholder, String::new(), error, view),
        };

        request.set_phase(RequestPhase::Streaming);
        view.set_status(&Status::Generating);
        let cancel = &request.cancel;
        let mut acc = String::new();
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(delta)) => {
                    if cancel.is_cancelled() {
                        break;
                    }
                    if delta.is_empty() {
                        continue;
                    }
                    acc.push_str(&delta);
                    self.history().set_content(placeholder, &acc);
                    view.render_increment(&acc);
                }
                Some(Err(e)) => {
                    let error = ChatError::Generation(e.to_string());
                    return self.fail(placeholder, acc, error, view);
                }
                None => {
                    self.history().touch(placeholder);
                    view.set_status(&Status::Done);
                    return RequestOutcome::Completed { content: acc };
                }
            }
        }

        stopped(acc, view)
    }

    /// Commit a failed request: an empty reply becomes [`ERROR_MARKER`], partial text is kept.
    fn fail(
        &self,
        placeholder: MessageId,
        acc: String,
        error: ChatError,
        view: &mut dyn ChatView,
    ) -> RequestOutcome {
        log::warn!("session: request failed: {}", error);
        let content = if acc.is_empty() {
            self.history().set_content(placeholder, ERROR_MARKER);
            view.render_increment(ERROR_MARKER);
            ERROR_MARKER.to_string()
        } else {
            acc
        };
        view.set_status(&Status::Error(error.to_string()));
        RequestOutcome::Failed { error, content }
    }
}

/// End a cancelled request; `partial` is already committed.
fn stopped(partial: String, view: &mut dyn ChatView) -> RequestOutcome {
    log::info!("session: generation stopped after {} byte(s)", partial.len());
    view.set_status(&Status::Stopped);
    RequestOutcome::Cancelled { partial }
}

/// Bind `model` and open its completion stream over `context`.
async fn open_stream(
    binding: &mut EngineBinding,
    model: &str,
    context: Vec<ChatMessage>,
    params: &GenerationParams,
    view: &mut dyn ChatView,
) -> Result<DeltaStream, ChatError> {
    let handle = bind(binding, model, view).await?;
    handle
        .completions(context, params)
        .await
        .map_err(|e| ChatError::Generation(e.to_string()))
}

/// Ensure `binding` serves `model`, reporting load progress on `view`.
async fn bind<'b>(
    binding: &'b mut EngineBinding,
    model: &str,
    view: &mut dyn ChatView,
) -> Result<&'b dyn EngineHandle, ChatError> {
    let fresh = binding.bound_model() != Some(model);
    if fresh {
        view.set_status(&Status::Initializing(model.to_string()));
    }
    let handle = {
        let mut on_progress = |progress: Progress| {
            view.set_status(&Status::Loading {
                model: model.to_string(),
                progress,
            })
        };
        binding.ensure(model, &mut on_progress).await?
    };
    if fresh {
        view.set_status(&Status::Ready(model.to_string()));
    }
    Ok(handle)
}

/// Pick the model for a new session.
pub fn resolve_selected_model(
    saved: Option<String>,
    catalog: &[String],
    default_model: Option<&str>,
) -> String {
    if let Some(ref s) = saved {
        if catalog.iter().any(|m| m == s) {
            return s.clone();
        }
    }
    catalog
        .first()
        .cloned()
        .or_else(|| default_model.map(str::to_string))
        .or(saved)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn catalog() -> Vec<String> {
        vec!["a".to_string(), "b".to_string()]
    }

    #[test]
    fn saved_model_wins_when_listed() {
        assert_eq!(resolve_selected_model(Some("b".into()), &catalog(), Some("x")), "b");
    }

    #[test]
    fn unlisted_saved_model_falls_back_to_first() {
        assert_eq!(resolve_selected_model(Some("z".into()), &catalog(), Some("x")), "a");
    }

    #[test]
    fn empty_catalog_uses_default_then_saved() {
        assert_eq!(resolve_selected_model(Some("z".into()), &[], Some("x")), "x");
        assert_eq!(resolve_selected_model(Some("z".into()), &[], None), "z");
        assert_eq!(resolve_selected_model(None, &[], None), "");
    }
}
