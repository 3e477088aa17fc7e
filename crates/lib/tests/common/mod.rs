//! Shared helpers for integration tests: a scripted in-process engine and small utilities.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use lib::engine::{
    ChatMessage, DeltaStream, EngineError, EngineHandle, GenerationEngine, GenerationParams,
    Progress,
};
use lib::message::Message;
use lib::view::{ChatView, Controls, Status, Transcript};
use tokio::sync::mpsc;

/// What the next `completions` call produces.
pub enum Script {
    /// Yield these items in order; `Err` items become stream errors.
    Deltas(Vec<Result<String, String>>),
    /// Yield whatever the test pushes, until the sender is dropped.
    Channel(mpsc::UnboundedReceiver<Result<String, String>>),
    /// Fail to open the stream.
    Refuse(String),
}

impl Script {
    pub fn text(parts: &[&str]) -> Self {
        Script::Deltas(parts.iter().map(|p| Ok(p.to_string())).collect())
    }
}

#[derive(Default)]
struct Shared {
    scripts: Mutex<VecDeque<Script>>,
    contexts: Mutex<Vec<Vec<ChatMessage>>>,
    releases: AtomicUsize,
}

/// Engine whose replies are queued by the test.
pub struct ScriptedEngine {
    catalog: Vec<String>,
    shared: Arc<Shared>,
    pub available: AtomicBool,
    pub fail_create: AtomicBool,
    /// While set, `create` reports some progress and then never finishes.
    pub stall_create: AtomicBool,
    creates: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(catalog: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            catalog: catalog.iter().map(|s| s.to_string()).collect(),
            shared: Arc::new(Shared::default()),
            available: AtomicBool::new(true),
            fail_create: AtomicBool::new(false),
            stall_create: AtomicBool::new(false),
            creates: AtomicUsize::new(0),
        })
    }

    pub fn push(&self, script: Script) {
        self.shared.scripts.lock().unwrap().push_back(script);
    }

    /// Queue a channel-driven reply and return its sender.
    pub fn push_channel(&self) -> mpsc::UnboundedSender<Result<String, String>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.push(Script::Channel(rx));
        tx
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.shared.releases.load(Ordering::SeqCst)
    }

    /// Conversations passed to `completions`, in call order.
    pub fn contexts(&self) -> Vec<Vec<ChatMessage>> {
        self.shared.contexts.lock().unwrap().clone()
    }
}

#[async_trait]
impl GenerationEngine for ScriptedEngine {
    async fn check_available(&self) -> Result<(), EngineError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::Unavailable("runtime missing".into()))
        }
    }

    async fn catalog(&self) -> Result<Vec<String>, EngineError> {
        Ok(self.catalog.clone())
    }

    async fn create(
        &self,
        model_id: &str,
        on_progress: &mut (dyn FnMut(Progress) + Send),
    ) -> Result<Box<dyn EngineHandle>, EngineError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        on_progress(Progress::new(0.5, "fetching"));
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(EngineError::Api("out of memory".into()));
        }
        if self.stall_create.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        on_progress(Progress::new(1.0, "ready"));
        Ok(Box::new(ScriptedHandle {
            model: model_id.to_string(),
            shared: self.shared.clone(),
        }))
    }
}

struct ScriptedHandle {
    model: String,
    shared: Arc<Shared>,
}

#[async_trait]
impl EngineHandle for ScriptedHandle {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn completions(
        &self,
        messages: Vec<ChatMessage>,
        _params: &GenerationParams,
    ) -> Result<DeltaStream, EngineError> {
        self.shared.contexts.lock().unwrap().push(messages);
        let script = self
            .shared
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Script::Deltas(Vec::new()));
        let to_engine = |item: Result<String, String>| item.map_err(EngineError::Stream);
        match script {
            Script::Deltas(items) => Ok(futures_util::stream::iter(items).map(to_engine).boxed()),
            Script::Channel(rx) => Ok(futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            })
            .map(to_engine)
            .boxed()),
            Script::Refuse(msg) => Err(EngineError::Api(msg)),
        }
    }

    async fn release(&self) -> Result<(), EngineError> {
        self.shared.releases.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A `Transcript` the test can read while a spawned `send` is still writing to it.
#[derive(Clone, Default)]
pub struct SharedView(Arc<Mutex<Transcript>>);

impl SharedView {
    pub fn snapshot(&self) -> Transcript {
        self.0.lock().unwrap().clone()
    }
}

impl ChatView for SharedView {
    fn render_all(&mut self, messages: &[Message]) {
        self.0.lock().unwrap().render_all(messages);
    }

    fn render_message(&mut self, message: &Message) {
        self.0.lock().unwrap().render_message(message);
    }

    fn render_increment(&mut self, content: &str) {
        self.0.lock().unwrap().render_increment(content);
    }

    fn set_status(&mut self, status: &Status) {
        self.0.lock().unwrap().set_status(status);
    }

    fn set_controls(&mut self, controls: Controls) {
        self.0.lock().unwrap().set_controls(controls);
    }
}

/// Poll `check` every 10ms for up to 5s.
pub async fn wait_for(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within 5s");
}

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}
