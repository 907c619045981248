//! # engine-core
//!
//! Lifecycle and interaction protocol for a locally hosted LLM inference engine,
//! with no dependency on FFI or on a particular model runtime.
//!
//! This crate provides:
//! - Backend selection and capability probing with CPU fallback
//! - A validated engine configuration, loadable from YAML or JSON
//! - The session state machine with a cross-thread stop flag
//! - A single-step generation controller with seeded sampling
//! - A single-slot host issuing generation-counted session handles
//!
//! The model itself sits behind [`InferenceRuntime`]; `engine-native` provides
//! the llama.cpp implementation.

#![forbid(unsafe_code)]

pub mod backend;
pub mod config;
pub mod error;
pub mod generation;
pub mod host;
pub mod probe;
pub mod runtime;
pub mod sampling;
pub mod session;

#[cfg(test)]
mod testing;

// Re-export commonly used types
pub use backend::{HardwareBackend, KvCachePrecision, UnknownVariant};
pub use config::{ConfigError, EngineConfiguration};
pub use error::{EngineError, Result};
pub use generation::{GenerationRequest, Token, TokenStream};
pub use host::{EngineHost, SessionHandle};
pub use probe::{CapabilityProber, CapabilityReport, LibraryLoader};
pub use runtime::{InferenceRuntime, RuntimeError};
pub use sampling::{Sampler, SamplingError, SamplingParams};
pub use session::{InferenceSession, Phase, StopSignal};
