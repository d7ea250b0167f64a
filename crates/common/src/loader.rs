//! Lazy, failure-aware loading of in-process models
//!
//! A model is loaded on first use and kept for the life of the owning client.
//! A failed load is remembered and fails fast until a cooldown elapses, after
//! which the next caller re-attempts the load. This keeps a structurally
//! broken backend (missing GPU, bad weights) from being hammered on every
//! request while still recovering from transient failures without a restart.

use crate::errors::{AppError, Result};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{error, info};

enum LoadState<T> {
    Empty,
    Ready(Arc<T>),
    Failed { reason: String, at: Instant },
}

/// One-time initialisation guard with a retry cooldown
pub struct ModelLoader<T> {
    name: String,
    cooldown: Duration,
    state: Mutex<LoadState<T>>,
}

impl<T: Send + Sync + 'static> ModelLoader<T> {
    pub fn new(name: impl Into<String>, cooldown: Duration) -> Self {
        Self {
            name: name.into(),
            cooldown,
            state: Mutex::new(LoadState::Empty),
        }
    }

    /// Model name used in logs and errors
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Return the loaded model, loading it with `load` if needed.
    ///
    /// `load` runs on the blocking pool. Concurrent callers wait for a single
    /// in-flight load instead of starting their own.
    pub async fn get_or_load<F>(&self, load: F) -> Result<Arc<T>>
    where
        F: FnOnce() -> anyhow::Result<T> + Send + 'static,
    {
        let mut state = self.state.lock().await;

        match &*state {
            LoadState::Ready(model) => return Ok(model.clone()),
            LoadState::Failed { reason, at } => {
                let elapsed = at.elapsed();
                if elapsed < self.cooldown {
                    return Err(AppError::ModelUnavailable {
                        model: self.name.clone(),
                        reason: reason.clone(),
                        retry_in_secs: (self.cooldown - elapsed).as_secs().max(1),
                    });
                }
                info!(model = %self.name, "Load cooldown elapsed, retrying model load");
            }
            LoadState::Empty => {}
        }

        info!(model = %self.name, "Loading model");
        let outcome = tokio::task::spawn_blocking(load)
            .await
            .map_err(|e| anyhow::anyhow!("model load task panicked: {}", e))
            .and_then(|r| r);

        match outcome {
            Ok(model) => {
                let model = Arc::new(model);
                *state = LoadState::Ready(model.clone());
                info!(model = %self.name, "Model loaded");
                Ok(model)
            }
            Err(e) => {
                let reason = e.to_string();
                error!(
                    model = %self.name,
                    error = %reason,
                    cooldown_secs = self.cooldown.as_secs(),
                    "Model failed to load"
                );
                *state = LoadState::Failed {
                    reason: reason.clone(),
                    at: Instant::now(),
                };
                Err(AppError::ModelUnavailable {
                    model: self.name.clone(),
                    reason,
                    retry_in_secs: self.cooldown.as_secs(),
                })
            }
        }
    }

    /// Drop the loaded model so its memory can be reclaimed; the next call
    /// reloads it. A cached failure is kept.
    pub async fn release(&self) {
        let mut state = self.state.lock().await;
        if matches!(&*state, LoadState::Ready(_)) {
            *state = LoadState::Empty;
            info!(model = %self.name, "Model released");
        }
    }

    /// Whether a model is currently resident
    pub async fn is_loaded(&self) -> bool {
        matches!(&*self.state.lock().await, LoadState::Ready(_))
    }
}
