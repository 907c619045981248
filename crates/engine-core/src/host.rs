//! Single-slot session host
//!
//! [`EngineHost`] holds at most one [`InferenceSession`]. Every successful
//! `open` mints a fresh [`SessionHandle`]; opening again releases the current
//! session first, which invalidates every handle the caller still holds.
//! Operations on a stale handle never reach the runtime.

use crate::backend::{HardwareBackend, KvCachePrecision};
use crate::config::EngineConfiguration;
use crate::error::{EngineError, Result};
use crate::generation::{GenerationRequest, Token};
use crate::runtime::InferenceRuntime;
use crate::session::{InferenceSession, Phase, StopSignal};
use std::fmt;
use std::num::NonZeroU64;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Typed capability for one opened session.
///
/// Handles are never reused within a host, so a handle from a superseded or
/// released session can never alias a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionHandle(NonZeroU64);

impl SessionHandle {
    /// Integer form for callers across a flat boundary
    pub fn to_raw(self) -> u64 {
        self.0.get()
    }

    /// `0` is never a valid handle
    pub fn from_raw(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(Self)
    }
}

impl fmt::Display for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session#{}", self.0)
    }
}

pub struct EngineHost<R: InferenceRuntime> {
    runtime: Arc<R>,
    current: Option<(SessionHandle, InferenceSession<R>)>,
    last_id: u64,
}

impl<R: InferenceRuntime> EngineHost<R> {
    pub fn new(runtime: R) -> Self {
        Self::with_shared(Arc::new(runtime))
    }

    pub fn with_shared(runtime: Arc<R>) -> Self {
        Self {
            runtime,
            current: None,
            last_id: 0,
        }
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Open a session, releasing any session already in the slot.
    ///
    /// The previous session is released before the new model loads, so both
    /// are never resident at once. If the new open fails the slot is left
    /// released and the host can be retried.
    pub fn open(&mut self, config: EngineConfiguration) -> Result<SessionHandle> {
        if let Some((old, session)) = self.current.as_mut() {
            if session.is_open() {
                warn!(handle = %old, "open supersedes the current session");
            }
            session.release();
        }

        let session = InferenceSession::open(Arc::clone(&self.runtime), config)?;

        self.last_id += 1;
        let handle = SessionHandle::from_raw(self.last_id)
            .ok_or_else(|| EngineError::initialization("session handle space exhausted"))?;
        self.current = Some((handle, session));

        debug!(%handle, "session handle issued");
        Ok(handle)
    }

    /// Flat-argument form of [`open`](Self::open). Enum arguments are the
    /// integer codes of [`HardwareBackend`] and [`KvCachePrecision`].
    #[allow(clippy::too_many_arguments)]
    pub fn open_with(
        &mut self,
        model_path: impl Into<PathBuf>,
        backend: i32,
        gpu_layers: i32,
        context_size: i32,
        batch_size: i32,
        threads: i32,
        use_flash_attention: bool,
        kv_cache_precision: i32,
    ) -> Result<SessionHandle> {
        let backend = HardwareBackend::try_from(backend)
            .map_err(|err| EngineError::initialization(err.to_string()))?;
        let kv_cache_precision = KvCachePrecision::try_from(kv_cache_precision)
            .map_err(|err| EngineError::initialization(err.to_string()))?;

        let config = EngineConfiguration::new(model_path)
            .with_backend(backend)
            .with_gpu_layers(non_negative("gpu_layers", gpu_layers)?)
            .with_context_size(non_negative("context_size", context_size)?)
            .with_batch_size(non_negative("batch_size", batch_size)?)
            .with_threads(non_negative("threads", threads)?)
            .with_flash_attention(use_flash_attention)
            .with_kv_cache_precision(kv_cache_precision);

        self.open(config)
    }

    /// Handle of the live session, if any
    pub fn current(&self) -> Option<SessionHandle> {
        match &self.current {
            Some((handle, session)) if session.is_open() => Some(*handle),
            _ => None,
        }
    }

    /// Phase of the slot. A stale handle is not consulted here.
    pub fn phase(&self) -> Phase {
        match &self.current {
            Some((_, session)) => session.phase(),
            None => Phase::Uninitialized,
        }
    }

    pub fn ingest_prompt(&mut self, handle: SessionHandle, text: &str) -> Result<usize> {
        self.session_mut(handle)
            .ok_or(EngineError::NotInitialized)?
            .ingest_prompt(text)
    }

    /// Stale handles yield the sentinel, like a released session
    pub fn generate_next(
        &mut self,
        handle: SessionHandle,
        request: &GenerationRequest,
    ) -> Result<Token> {
        match self.session_mut(handle) {
            Some(session) => session.generate_next(request),
            None => Ok(Token::EndOfSequence),
        }
    }

    /// No-op for stale handles
    pub fn request_stop(&mut self, handle: SessionHandle) {
        if let Some(session) = self.session_mut(handle) {
            session.request_stop();
        }
    }

    /// Cross-thread stop for the session behind `handle`
    pub fn stop_signal(&self, handle: SessionHandle) -> Option<StopSignal> {
        self.session(handle).map(InferenceSession::stop_signal)
    }

    pub fn reset_context(&mut self, handle: SessionHandle) -> Result<()> {
        self.session_mut(handle)
            .ok_or(EngineError::NotInitialized)?
            .reset_context()
    }

    /// No-op for stale handles and already released sessions
    pub fn release(&mut self, handle: SessionHandle) {
        if let Some(session) = self.session_mut(handle) {
            session.release();
        }
    }

    pub fn session(&self, handle: SessionHandle) -> Option<&InferenceSession<R>> {
        match &self.current {
            Some((current, session)) if *current == handle && session.is_open() => Some(session),
            _ => None,
        }
    }

    pub fn session_mut(&mut self, handle: SessionHandle) -> Option<&mut InferenceSession<R>> {
        match &mut self.current {
            Some((current, session)) if *current == handle && session.is_open() => Some(session),
            _ => None,
        }
    }
}

impl<R: InferenceRuntime> fmt::Debug for EngineHost<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineHost")
            .field("current", &self.current())
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

fn non_negative(field: &'static str, value: i32) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| EngineError::initialization(format!("{field} must not be negative (got {value})")))
}
