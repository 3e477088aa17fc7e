//! Ollama API client (http://127.0.0.1:11434 by default) and the engine built on it.
//! Streaming endpoints (`/api/pull`, `/api/chat`) answer with NDJSON.

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::{Stream, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::{
    ChatMessage, DeltaStream, EngineError, EngineHandle, GenerationEngine, GenerationParams,
    Progress,
};
use crate::config::EngineConfig;

pub const DEFAULT_BASE_URL: &str = "http://127.0.0.1:11434";

/// How long Ollama keeps a model resident after the warm-up request.
const KEEP_ALIVE: &str = "5m";

/// Client for Ollama HTTP API.
#[derive(Clone)]
pub struct OllamaClient {
    base_url: String,
    client: reqwest::Client,
}

#[derive(Debug, thiserror::Error)]
pub enum OllamaError {
    #[error("ollama request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("ollama api error: {0}")]
    Api(String),
    #[error("malformed ollama stream line: {0}")]
    Decode(#[from] serde_json::Error),
}

impl From<OllamaError> for EngineError {
    fn from(e: OllamaError) -> Self {
        match e {
            OllamaError::Request(e) => EngineError::Request(e),
            OllamaError::Api(msg) => EngineError::Api(msg),
            OllamaError::Decode(e) => EngineError::Stream(e.to_string()),
        }
    }
}

impl OllamaClient {
    pub fn new(base_url: Option<String>) -> Self {
        let base_url = base_url
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        Self {
            base_url,
            client: reqwest::Client::new(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn checked(res: reqwest::Response) -> Result<reqwest::Response, OllamaError> {
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(OllamaError::Api(format!("{} {}", status, body)));
        }
        Ok(res)
    }

    /// GET /api/version: reachability check.
    pub async fn version(&self) -> Result<String, OllamaError> {
        let url = format!("{}/api/version", self.base_url);
        let res = Self::checked(self.client.get(&url).send().await?).await?;
        let data: VersionResponse = res.json().await?;
        Ok(data.version)
    }

    /// GET /api/tags: list available models.
    pub async fn list_models(&self) -> Result<Vec<OllamaModel>, OllamaError> {
        let url = format!("{}/api/tags", self.base_url);
        let res = Self::checked(self.client.get(&url).send().await?).await?;
        let data: TagsResponse = res.json().await?;
        Ok(data.models.unwrap_or_default())
    }

    /// POST /api/pull with stream: true. Calls `on_event` for each status line; fails on an `error` line.
    pub async fn pull(
        &self,
        model: &str,
        on_event: &mut (dyn FnMut(&PullEvent) + Send),
    ) -> Result<(), OllamaError> {
        let url = format!("{}/api/pull", self.base_url);
        let body = PullRequest {
            model: model.to_string(),
            stream: true,
        };
        let res = Self::checked(self.client.post(&url).json(&body).send().await?).await?;
        let mut events = ndjson_stream::<PullEvent>(res);
        while let Some(event) = events.next().await {
            let event = match event {
                Ok(event) => event,
                Err(OllamaError::Decode(e)) => {
                    log::warn!("ollama: skipping malformed pull status line: {}", e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            if let Some(err) = event.error {
                return Err(OllamaError::Api(err));
            }
            on_event(&event);
        }
        Ok(())
    }

    /// POST /api/generate without a prompt: loads the model (or unloads it when keep_alive is 0).
    pub async fn set_keep_alive(
        &self,
        model: &str,
        keep_alive: serde_json::Value,
    ) -> Result<(), OllamaError> {
        let url = format!("{}/api/generate", self.base_url);
        let body = KeepAliveRequest {
            model: model.to_string(),
            keep_alive,
            stream: false,
        };
        Self::checked(self.client.post(&url).json(&body).send().await?).await?;
        Ok(())
    }

    /// POST /api/chat with stream: true. Yields non-empty content deltas in arrival order.
    /// A malformed line ends the stream with an error.
    pub async fn chat_stream(
        &self,
        model: &str,
        messages: Vec<ChatMessage>,
        params: &GenerationParams,
    ) -> Result<DeltaStream, OllamaError> {
        let url = format!("{}/api/chat", self.base_url);
        let body = ChatRequest {
            model: model.to_string(),
            messages,
            stream: true,
            options: ChatOptions {
                temperature: params.temperature,
                num_predict: params.max_tokens,
            },
        };
        let res = Self::checked(self.client.post(&url).json(&body).send().await?).await?;
        let deltas = ndjson_stream::<ChatStreamEvent>(res).filter_map(|event| {
            let item = match event {
                Ok(event) => event.into_delta(),
                Err(e) => Some(Err(EngineError::from(e))),
            };
            futures_util::future::ready(item)
        });
        Ok(deltas.boxed())
    }
}

fn ndjson_stream<T>(res: reqwest::Response) -> BoxStream<'static, Result<T, OllamaError>>
where
    T: DeserializeOwned + Send + 'static,
{
    ndjson_lines(res.bytes_stream())
}

/// Split a byte stream into newline-delimited JSON values.
///
/// A line that does not parse yields `OllamaError::Decode` and the following lines are
/// still read; callers decide whether that ends their stream.
fn ndjson_lines<T, S, B>(bytes: S) -> BoxStream<'static, Result<T, OllamaError>>
where
    T: DeserializeOwned + Send + 'static,
    S: Stream<Item = Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let bytes = bytes.boxed();
    stream::unfold(
        (bytes, Vec::<u8>::new(), false),
        |(mut bytes, mut buffer, mut finished)| async move {
            loop {
                let line = if let Some(i) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=i).collect();
                    line
                } else if finished {
                    if buffer.is_empty() {
                        return None;
                    }
                    std::mem::take(&mut buffer)
                } else {
                    match bytes.next().await {
                        Some(Ok(chunk)) => buffer.extend_from_slice(chunk.as_ref()),
                        Some(Err(e)) => {
                            return Some((Err(OllamaError::Request(e)), (bytes, Vec::new(), true)));
                        }
                        None => finished = true,
                    }
                    continue;
                };
                let text = String::from_utf8_lossy(&line);
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                let item = serde_json::from_str::<T>(text).map_err(OllamaError::Decode);
                return Some((item, (bytes, buffer, finished)));
            }
        },
    )
    .boxed()
}

/// Completion fraction for a pull status line, when it carries byte counts.
pub fn pull_fraction(event: &PullEvent) -> Option<f32> {
    match (event.completed, event.total) {
        (Some(done), Some(total)) if total > 0 => Some((done as f64 / total as f64) as f32),
        _ if event.status == "success" => Some(1.0),
        _ => None,
    }
}

/// Engine backed by a local Ollama server.
#[derive(Clone)]
pub struct OllamaEngine {
    client: OllamaClient,
    pull_on_load: bool,
}

impl OllamaEngine {
    pub fn new(client: OllamaClient, pull_on_load: bool) -> Self {
        Self {
            client,
            pull_on_load,
        }
    }

    pub fn from_config(engine: &EngineConfig) -> Self {
        let base_url = crate::config::resolve_engine_base_url(engine);
        Self::new(OllamaClient::new(base_url), engine.pull_on_load)
    }

}

#[async_trait]
impl GenerationEngine for OllamaEngine {
    async fn check_available(&self) -> Result<(), EngineError> {
        match self.client.version().await {
            Ok(version) => {
                log::debug!("ollama: server version {}", version);
                Ok(())
            }
            Err(e) => Err(EngineError::Unavailable(format!(
                "ollama not reachable at {} ({})",
                self.client.base_url(),
                e
            ))),
        }
    }

    async fn catalog(&self) -> Result<Vec<String>, EngineError> {
        let models = self.client.list_models().await?;
        Ok(models.into_iter().map(|m| m.name).collect())
    }

    async fn create(
        &self,
        model_id: &str,
        on_progress: &mut (dyn FnMut(Progress) + Send),
    ) -> Result<Box<dyn EngineHandle>, EngineError> {
        on_progress(Progress::new(0.0, "starting"));
        if self.pull_on_load {
            let mut last = 0.0_f32;
            let mut on_event = |event: &PullEvent| {
                if let Some(f) = pull_fraction(event) {
                    last = f;
                }
                on_progress(Progress::new(last, event.status.clone()));
            };
            self.client.pull(model_id, &mut on_event).await?;
        }
        on_progress(Progress::new(1.0, "loading model into memory"));
        self.client
            .set_keep_alive(model_id, serde_json::Value::String(KEEP_ALIVE.to_string()))
            .await?;
        on_progress(Progress::new(1.0, "ready"));
        Ok(Box::new(OllamaHandle {
            client: self.client.clone(),
            model: model_id.to_string(),
        }))
    }
}

/// Handle for one Ollama model; the model stays resident until released.
struct OllamaHandle {
    client: OllamaClient,
    model: String,
}

#[async_trait]
impl EngineHandle for OllamaHandle {
    fn model_id(&self) -> &str {
        &self.model
    }

    async fn completions(
        &self,
        messages: Vec<ChatMessage>,
        params: &GenerationParams,
    ) -> Result<DeltaStream, EngineError> {
        Ok(self.client.chat_stream(&self.model, messages, params).await?)
    }

    async fn release(&self) -> Result<(), EngineError> {
        self.client
            .set_keep_alive(&self.model, serde_json::Value::from(0))
            .await?;
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaModel {
    pub name: String,
    #[serde(default)]
    pub size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    models: Option<Vec<OllamaModel>>,
}

#[derive(Debug, Deserialize)]
struct VersionResponse {
    #[serde(default)]
    version: String,
}

/// One status line from `/api/pull`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PullEvent {
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub completed: Option<u64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
struct PullRequest {
    model: String,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct KeepAliveRequest {
    model: String,
    keep_alive: serde_json::Value,
    stream: bool,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct ChatStreamEvent {
    #[serde(default)]
    message: Option<ChatStreamMessage>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamMessage {
    #[serde(default)]
    content: String,
}

impl ChatStreamEvent {
    /// Content delta of this line, an error, or nothing (e.g. the final `done` line).
    fn into_delta(self) -> Option<Result<String, EngineError>> {
        if let Some(err) = self.error {
            return Some(Err(EngineError::Stream(err)));
        }
        self.message
            .map(|m| m.content)
            .filter(|c| !c.is_empty())
            .map(Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_trims_trailing_slash() {
        let c = OllamaClient::new(Some("http://host:1234/".to_string()));
        assert_eq!(c.base_url(), "http://host:1234");
        assert_eq!(OllamaClient::new(None).base_url(), DEFAULT_BASE_URL);
    }

    #[test]
    fn pull_fraction_uses_byte_counts() {
        let ev: PullEvent =
            serde_json::from_str(r#"{"status":"pulling abc","total":200,"completed":50}"#).unwrap();
        assert_eq!(pull_fraction(&ev), Some(0.25));

        let ev: PullEvent = serde_json::from_str(r#"{"status":"pulling manifest"}"#).unwrap();
        assert_eq!(pull_fraction(&ev), None);

        let ev: PullEvent = serde_json::from_str(r#"{"status":"success"}"#).unwrap();
        assert_eq!(pull_fraction(&ev), Some(1.0));

        let ev: PullEvent =
            serde_json::from_str(r#"{"status":"pulling abc","total":0,"completed":0}"#).unwrap();
        assert_eq!(pull_fraction(&ev), None);
    }

    #[test]
    fn chat_stream_event_to_delta() {
        let ev: ChatStreamEvent = serde_json::from_str(
            r#"{"model":"m","message":{"role":"assistant","content":"Hel"},"done":false}"#,
        )
        .unwrap();
        assert_eq!(ev.into_delta().unwrap().unwrap(), "Hel");

        let ev: ChatStreamEvent = serde_json::from_str(
            r#"{"model":"m","message":{"role":"assistant","content":""},"done":true}"#,
        )
        .unwrap();
        assert!(ev.into_delta().is_none());

        let ev: ChatStreamEvent = serde_json::from_str(r#"{"error":"model crashed"}"#).unwrap();
        assert!(matches!(ev.into_delta(), Some(Err(EngineError::Stream(_)))));
    }

    fn chunks(parts: &[&str]) -> impl Stream<Item = Result<Vec<u8>, reqwest::Error>> {
        let parts: Vec<_> = parts.iter().map(|p| Ok(p.as_bytes().to_vec())).collect();
        stream::iter(parts)
    }

    #[tokio::test]
    async fn ndjson_lines_joins_split_chunks() {
        let lines = ndjson_lines::<PullEvent, _, _>(chunks(&[
            "{\"status\":\"pul",
            "ling\"}\n\n{\"status\":\"success\"}",
        ]));
        let events: Vec<_> = lines.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].as_ref().unwrap().status, "pulling");
        assert_eq!(events[1].as_ref().unwrap().status, "success");
    }

    #[tokio::test]
    async fn malformed_chat_line_surfaces_as_stream_error() {
        let lines = ndjson_lines::<ChatStreamEvent, _, _>(chunks(&[
            "{\"message\":{\"content\":\"Hel\"}}\n",
            "{\"message\":{\"cont\n",
            "{\"message\":{\"content\":\"lo\"}}\n",
        ]));
        let items: Vec<_> = lines.collect().await;
        assert_eq!(items.len(), 3);
        assert!(items[0].is_ok());
        assert!(matches!(items[1], Err(OllamaError::Decode(_))));
        assert!(items[2].is_ok());

        let mapped = match items.into_iter().nth(1) {
            Some(Err(e)) => EngineError::from(e),
            _ => unreachable!(),
        };
        assert!(matches!(mapped, EngineError::Stream(_)));
    }

    #[test]
    fn chat_request_shape() {
        let body = ChatRequest {
            model: "smollm".to_string(),
            messages: vec![ChatMessage::user("hi")],
            stream: true,
            options: ChatOptions {
                temperature: 0.5,
                num_predict: 64,
            },
        };
        let v = serde_json::to_value(&body).unwrap();
        assert_eq!(v["messages"][0]["role"], "user");
        assert_eq!(v["options"]["num_predict"], 64);
        assert_eq!(v["stream"], true);
    }
}
