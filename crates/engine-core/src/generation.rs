//! Generation controller
//!
//! [`InferenceSession::generate_next`] draws exactly one token per call. It
//! never loops; the caller decides when to stop, which keeps cancellation
//! responsive at every step boundary. [`TokenStream`] is a caller-side loop
//! for the common case.

use crate::error::{EngineError, Result};
use crate::runtime::{InferenceRuntime, RuntimeError};
use crate::sampling::SamplingParams;
use crate::session::{InferenceSession, Lifecycle};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Smallest unit returned by the generation step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Non-empty text fragment, always whole UTF-8 characters
    Fragment(String),
    /// No more output: the model finished, or cancellation was observed
    EndOfSequence,
}

impl Token {
    pub fn is_end_of_sequence(&self) -> bool {
        matches!(self, Self::EndOfSequence)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Fragment(text) => Some(text),
            Self::EndOfSequence => None,
        }
    }

    pub fn into_text(self) -> Option<String> {
        match self {
            Self::Fragment(text) => Some(text),
            Self::EndOfSequence => None,
        }
    }
}

/// Parameters for one generation loop
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    /// Upper bound on `generate_next` calls for this loop
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    /// `0` disables top-k
    pub top_k: u32,
    pub repeat_penalty: f32,
    /// Governs every stochastic sampling choice
    pub seed: u64,
}

impl Default for GenerationRequest {
    fn default() -> Self {
        let sampling = SamplingParams::default();
        Self {
            max_tokens: 256,
            temperature: sampling.temperature,
            top_p: sampling.top_p,
            top_k: sampling.top_k,
            repeat_penalty: sampling.repeat_penalty,
            seed: sampling.seed,
        }
    }
}

impl GenerationRequest {
    pub fn new(max_tokens: u32) -> Self {
        Self {
            max_tokens,
            ..Default::default()
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = top_p;
        self
    }

    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = top_k;
        self
    }

    pub fn with_repeat_penalty(mut self, repeat_penalty: f32) -> Self {
        self.repeat_penalty = repeat_penalty;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_tokens == 0 {
            return Err(EngineError::InvalidRequest(
                "max_tokens must be greater than zero".into(),
            ));
        }
        if !(self.temperature >= 0.0 && self.temperature.is_finite()) {
            return Err(EngineError::InvalidRequest(format!(
                "temperature must be a finite value >= 0 (got {})",
                self.temperature
            )));
        }
        if !(0.0..=1.0).contains(&self.top_p) {
            return Err(EngineError::InvalidRequest(format!(
                "top_p must be within [0, 1] (got {})",
                self.top_p
            )));
        }
        if !(self.repeat_penalty >= 0.0 && self.repeat_penalty.is_finite()) {
            return Err(EngineError::InvalidRequest(format!(
                "repeat_penalty must be a finite value >= 0 (got {})",
                self.repeat_penalty
            )));
        }
        Ok(())
    }

    /// The per-step view handed to the runtime
    pub fn sampling_params(&self) -> SamplingParams {
        SamplingParams {
            temperature: self.temperature,
            top_p: self.top_p,
            top_k: self.top_k,
            repeat_penalty: self.repeat_penalty,
            seed: self.seed,
        }
    }
}

impl<R: InferenceRuntime> InferenceSession<R> {
    /// Draw one token.
    ///
    /// Returns [`Token::EndOfSequence`] without touching the runtime when the
    /// session is released, a stop was requested, or the context window is
    /// full. A window that fills up during the step also ends the sequence
    /// instead of failing. A stop observed while the runtime was sampling yields the
    /// sentinel and discards the drawn token, but leaves the phase at Ready;
    /// only a stop seen on entry moves the session to Stopped.
    pub fn generate_next(&mut self, request: &GenerationRequest) -> Result<Token> {
        let Some(handle) = self.handle.as_mut() else {
            return Ok(Token::EndOfSequence);
        };

        if self.stop.is_stop_requested() {
            debug!("generation step skipped: stop requested");
            self.lifecycle = Lifecycle::Stopped;
            return Ok(Token::EndOfSequence);
        }

        request.validate()?;

        if self.context_used >= self.config.context_size as usize {
            debug!(
                context_used = self.context_used,
                context_size = self.config.context_size,
                "context window full"
            );
            return Ok(Token::EndOfSequence);
        }

        self.lifecycle = Lifecycle::Generating;
        let sampled = self
            .runtime
            .sample_one_token(handle, &request.sampling_params());
        self.lifecycle = Lifecycle::Ready;

        let token = match sampled {
            Ok(token) => token,
            Err(RuntimeError::ContextOverflow { .. }) => {
                debug!(
                    context_size = self.config.context_size,
                    "context window filled during step"
                );
                self.context_used = self.config.context_size as usize;
                return Ok(Token::EndOfSequence);
            }
            Err(err) => return Err(err.into()),
        };
        self.context_used = match self.runtime.context_used(handle) {
            Some(used) => used,
            None if token.is_end_of_sequence() => self.context_used,
            None => self.context_used + 1,
        };

        if self.stop.is_stop_requested() {
            debug!("stop observed mid-step, token discarded");
            return Ok(Token::EndOfSequence);
        }

        match &token {
            Token::Fragment(text) => {
                debug_assert!(!text.is_empty(), "runtime returned an empty fragment");
                self.tokens_generated += 1;
            }
            Token::EndOfSequence => {
                debug!(
                    tokens_generated = self.tokens_generated,
                    "end of sequence"
                );
            }
        }

        Ok(token)
    }

    /// Caller-side loop over [`generate_next`](Self::generate_next)
    pub fn stream(&mut self, request: GenerationRequest) -> TokenStream<'_, R> {
        TokenStream {
            session: self,
            request,
            steps: 0,
            finished: false,
        }
    }
}

/// Iterator calling `generate_next` once per item. Ends at the sentinel, after
/// `max_tokens` steps, or after the first error.
pub struct TokenStream<'s, R: InferenceRuntime> {
    session: &'s mut InferenceSession<R>,
    request: GenerationRequest,
    steps: u32,
    finished: bool,
}

impl<R: InferenceRuntime> TokenStream<'_, R> {
    /// Steps taken so far
    pub fn steps(&self) -> u32 {
        self.steps
    }
}

impl<R: InferenceRuntime> Iterator for TokenStream<'_, R> {
    type Item = Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished || self.steps >= self.request.max_tokens {
            return None;
        }
        self.steps += 1;

        match self.session.generate_next(&self.request) {
            Ok(Token::Fragment(text)) => Some(Ok(text)),
            Ok(Token::EndOfSequence) => {
                self.finished = true;
                None
            }
            Err(err) => {
                self.finished = true;
                Some(Err(err))
            }
        }
    }
}
