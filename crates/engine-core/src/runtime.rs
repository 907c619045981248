//! Inference runtime abstraction
//!
//! This module defines the boundary between the session state machine and the
//! engine that actually executes the model. The session never sees kernels or
//! tensors, only this contract.

use crate::backend::HardwareBackend;
use crate::config::EngineConfiguration;
use crate::generation::Token;
use crate::sampling::{SamplingError, SamplingParams};

/// Failures reported by a runtime
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("failed to load model: {0}")]
    Load(String),

    /// The runtime cannot honor a configuration value
    #[error("unsupported configuration: {0}")]
    Unsupported(String),

    #[error("tokenization failed: {0}")]
    Tokenize(String),

    #[error("decode failed: {0}")]
    Decode(String),

    #[error("context window exhausted: {requested} tokens requested, {available} available")]
    ContextOverflow { requested: usize, available: usize },

    #[error("sampling failed: {0}")]
    Sampling(#[from] SamplingError),
}

/// Compiled model + runtime capability.
///
/// Implementors own whatever process-level state the engine needs; each
/// [`Handle`](InferenceRuntime::Handle) is one loaded model context. A handle is
/// moved into [`free`](InferenceRuntime::free) exactly once, so double-free is
/// impossible by construction.
pub trait InferenceRuntime {
    type Handle;

    /// Whether `backend` can run in this process
    fn supports(&self, backend: HardwareBackend) -> bool;

    /// Load the model and build a context for `config`. Blocking.
    fn load(&self, config: &EngineConfiguration) -> Result<Self::Handle, RuntimeError>;

    /// Exercise the execution path once so the first real step is not slow
    fn warm_up(&self, _handle: &mut Self::Handle) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Tokenize `text` and feed it into the context. Returns the token count.
    fn prefill(&self, handle: &mut Self::Handle, text: &str) -> Result<usize, RuntimeError>;

    /// Context positions `handle` currently occupies.
    ///
    /// A step may decode more or fewer positions than the one token it
    /// returns. Runtimes that know their exact position report it here; `None`
    /// leaves the session to count one position per prompt token and fragment.
    fn context_used(&self, _handle: &Self::Handle) -> Option<usize> {
        None
    }

    /// Draw exactly one token from the current distribution.
    ///
    /// [`RuntimeError::ContextOverflow`] here means the window filled up
    /// during the step; the session turns it into end-of-sequence.
    fn sample_one_token(
        &self,
        handle: &mut Self::Handle,
        params: &SamplingParams,
    ) -> Result<Token, RuntimeError>;

    /// Drop all cached key/value state and restart the sampler stream
    fn reset_cache(&self, handle: &mut Self::Handle) -> Result<(), RuntimeError>;

    fn free(&self, handle: Self::Handle);
}
