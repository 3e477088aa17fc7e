//! Lazily-acquired engine handle keyed by model id.

use std::sync::Arc;

use super::{EngineHandle, GenerationEngine, Progress};
use crate::error::ChatError;

/// Holds at most one live engine handle and swaps it when a different model is requested.
pub struct EngineBinding {
    engine: Arc<dyn GenerationEngine>,
    handle: Option<Box<dyn EngineHandle>>,
}

impl EngineBinding {
    pub fn new(engine: Arc<dyn GenerationEngine>) -> Self {
        Self {
            engine,
            handle: None,
        }
    }

    /// Model id of the live handle, if any.
    pub fn bound_model(&self) -> Option<&str> {
        self.handle.as_deref().map(|h| h.model_id())
    }

    /// Return a handle bound to `model_id`, acquiring one if needed.
    ///
    /// Reuses the live handle when it already serves `model_id`. Otherwise checks
    /// engine availability (leaving the current handle alone on failure), releases
    /// the current handle, and acquires a new one. Progress passed to `on_progress`
    /// is clamped to [0, 1] and never decreases. If acquisition fails the binding
    /// stays empty.
    pub async fn ensure(
        &mut self,
        model_id: &str,
        on_progress: &mut (dyn FnMut(Progress) + Send),
    ) -> Result<&dyn EngineHandle, ChatError> {
        let reuse = matches!(&self.handle, Some(h) if h.model_id() == model_id);
        if !reuse {
            if model_id.trim().is_empty() {
                return Err(ChatError::EngineInitFailed("no model selected".to_string()));
            }
            self.engine
                .check_available()
                .await
                .map_err(|e| ChatError::EngineUnavailable(e.to_string()))?;

            self.release().await;

            log::info!("engine: acquiring model {}", model_id);
            let mut high = 0.0_f32;
            let mut report = |p: Progress| {
                let fraction = p.fraction.clamp(0.0, 1.0).max(high);
                high = fraction;
                on_progress(Progress {
                    fraction,
                    stage: p.stage,
                });
            };
            let handle = self
                .engine
                .create(model_id, &mut report)
                .await
                .map_err(|e| ChatError::EngineInitFailed(e.to_string()))?;
            log::info!("engine: model {} ready", model_id);
            self.handle = Some(handle);
        }
        self.handle
            .as_deref()
            .ok_or_else(|| ChatError::EngineInitFailed("engine handle missing".to_string()))
    }

    /// Drop the live handle, releasing it best-effort. Release errors are logged.
    pub async fn release(&mut self) {
        if let Some(old) = self.handle.take() {
            if let Err(e) = old.release().await {
                log::warn!("engine: releasing model {} failed: {}", old.model_id(), e);
            } else {
                log::debug!("engine: released model {}", old.model_id());
            }
        }
    }
}
