//! Inference session state machine
//!
//! An [`InferenceSession`] exclusively owns one runtime handle. The handle is
//! present exactly while the session is Ready, Generating or Stopped; `release`
//! moves it into the runtime's `free` and leaves `None` behind, so a second
//! release has nothing to free.
//!
//! ```text
//! open ──> Ready ──generate_next──> Generating ──> Ready
//!            │  ^
//!   request_stop  reset_context
//!            v  │
//!          Stopped ──release──> Released
//! ```
//!
//! The stop flag itself is an atomic shared with every [`StopSignal`], so a
//! loop on one thread can be stopped from another. The flag is sticky: it is
//! only cleared by `reset_context` or `release`.

use crate::config::EngineConfiguration;
use crate::error::{EngineError, Result};
use crate::runtime::InferenceRuntime;
use std::fmt;
use std::fs;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Externally visible lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// No session has been opened in this slot
    Uninitialized,
    Ready,
    /// A `generate_next` call is in progress
    Generating,
    /// A stop was requested through the session, or observed at the start of
    /// a step, and not yet cleared by `reset_context`
    Stopped,
    Released,
}

/// Lifecycle of a session that has been opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Lifecycle {
    Ready,
    Generating,
    Stopped,
    Released,
}

/// Cross-thread handle to a session's cancellation flag.
///
/// Cloning is cheap. Stopping through a signal whose session is already
/// released has no observable effect.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn request_stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}

/// One loaded model context and its generation state
pub struct InferenceSession<R: InferenceRuntime> {
    pub(crate) runtime: Arc<R>,
    pub(crate) handle: Option<R::Handle>,
    pub(crate) config: EngineConfiguration,
    pub(crate) lifecycle: Lifecycle,
    pub(crate) stop: StopSignal,
    pub(crate) prompt_tokens: usize,
    pub(crate) tokens_generated: usize,
    pub(crate) context_used: usize,
}

impl<R: InferenceRuntime> InferenceSession<R> {
    /// Validate `config`, load the model and warm it up.
    ///
    /// Blocks for the duration of the model load. Every failure is reported as
    /// [`EngineError::Initialization`] and leaves nothing allocated.
    pub fn open(runtime: Arc<R>, config: EngineConfiguration) -> Result<Self> {
        config.validate()?;

        if let Err(err) = fs::metadata(&config.model_path) {
            return Err(EngineError::initialization(format!(
                "model path {} cannot be opened: {}",
                config.model_path.display(),
                err
            )));
        }

        if !runtime.supports(config.backend) {
            return Err(EngineError::initialization(format!(
                "backend {} is not available",
                config.backend
            )));
        }

        info!(
            model = %config.model_path.display(),
            backend = %config.backend,
            gpu_layers = config.effective_gpu_layers(),
            context_size = config.context_size,
            batch_size = config.batch_size,
            threads = config.threads,
            flash_attention = config.use_flash_attention,
            kv_cache = %config.kv_cache_precision,
            "opening inference session"
        );

        let mut handle = runtime
            .load(&config)
            .map_err(|err| EngineError::initialization(err.to_string()))?;

        if let Err(err) = runtime.warm_up(&mut handle) {
            runtime.free(handle);
            return Err(EngineError::initialization(format!("warm-up failed: {err}")));
        }

        info!("inference session ready");

        Ok(Self {
            runtime,
            handle: Some(handle),
            config,
            lifecycle: Lifecycle::Ready,
            stop: StopSignal::default(),
            prompt_tokens: 0,
            tokens_generated: 0,
            context_used: 0,
        })
    }

    pub fn config(&self) -> &EngineConfiguration {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        match self.lifecycle {
            Lifecycle::Ready => Phase::Ready,
            Lifecycle::Generating => Phase::Generating,
            Lifecycle::Stopped => Phase::Stopped,
            Lifecycle::Released => Phase::Released,
        }
    }

    pub fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    /// Signal another thread can use to stop this session's generation
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_stop_requested()
    }

    /// Prompt tokens ingested since open or the last reset
    pub fn prompt_tokens(&self) -> usize {
        self.prompt_tokens
    }

    /// Fragments returned since open or the last reset
    pub fn tokens_generated(&self) -> usize {
        self.tokens_generated
    }

    /// Context positions consumed (prompt plus sampled tokens)
    pub fn context_used(&self) -> usize {
        self.context_used
    }

    /// Positions left in the context window
    pub fn context_remaining(&self) -> usize {
        (self.config.context_size as usize).saturating_sub(self.context_used)
    }

    /// Tokenize `text` into the running context. Does not start generation.
    pub fn ingest_prompt(&mut self, text: &str) -> Result<usize> {
        let handle = self.handle.as_mut().ok_or(EngineError::NotInitialized)?;

        let count = self.runtime.prefill(handle, text)?;
        self.prompt_tokens += count;
        self.context_used = self
            .runtime
            .context_used(handle)
            .unwrap_or(self.context_used + count);

        debug!(
            tokens = count,
            context_used = self.context_used,
            "prompt ingested"
        );
        Ok(count)
    }

    /// Make every following `generate_next` return the sentinel until
    /// `reset_context`. Idempotent; ignored once the session is released.
    ///
    /// A loop running on another thread is stopped through
    /// [`stop_signal`](Self::stop_signal) instead.
    pub fn request_stop(&mut self) {
        if self.handle.is_none() {
            return;
        }
        if !self.stop.is_stop_requested() {
            self.stop.request_stop();
            info!("generation stop requested");
        }
        self.lifecycle = Lifecycle::Stopped;
    }

    /// Clear the stop flag and the KV cache; the session returns to Ready
    pub fn reset_context(&mut self) -> Result<()> {
        let handle = self.handle.as_mut().ok_or(EngineError::NotInitialized)?;

        self.runtime.reset_cache(handle)?;
        self.stop.clear();
        self.lifecycle = Lifecycle::Ready;
        self.prompt_tokens = 0;
        self.tokens_generated = 0;
        self.context_used = 0;

        info!("context reset");
        Ok(())
    }

    /// Free the native handle. Safe to call any number of times.
    pub fn release(&mut self) {
        let Some(handle) = self.handle.take() else {
            return;
        };

        if self.lifecycle == Lifecycle::Generating {
            warn!("releasing a session that was mid-generation");
        }

        self.runtime.free(handle);
        self.lifecycle = Lifecycle::Released;
        self.stop.clear();
        info!("inference session released");
    }
}

impl<R: InferenceRuntime> Drop for InferenceSession<R> {
    fn drop(&mut self) {
        self.release();
    }
}

impl<R: InferenceRuntime> fmt::Debug for InferenceSession<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InferenceSession")
            .field("phase", &self.phase())
            .field("config", &self.config)
            .field("prompt_tokens", &self.prompt_tokens)
            .field("tokens_generated", &self.tokens_generated)
            .field("context_used", &self.context_used)
            .finish_non_exhaustive()
    }
}
