//! Engine error taxonomy
//!
//! End-of-sequence and cancellation are not errors: both surface as
//! [`Token::EndOfSequence`](crate::generation::Token::EndOfSequence).
//! Backend absence is not an error either; probes answer with a boolean.

use crate::config::ConfigError;
use crate::runtime::RuntimeError;

/// Errors returned by session and host operations
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The attempted `open` failed. The host stays usable for a retry with a
    /// different configuration.
    #[error("failed to initialize engine: {reason}")]
    Initialization { reason: String },

    /// The operation needs an open session and there is none (never opened,
    /// released, or superseded by a newer `open`).
    #[error("no inference session is open")]
    NotInitialized,

    #[error("invalid generation request: {0}")]
    InvalidRequest(String),

    /// The runtime failed on a live session (tokenizer or decode failure)
    #[error("inference runtime failure: {0}")]
    Runtime(#[from] RuntimeError),
}

impl EngineError {
    pub fn initialization(reason: impl Into<String>) -> Self {
        Self::Initialization {
            reason: reason.into(),
        }
    }

    pub fn is_not_initialized(&self) -> bool {
        matches!(self, Self::NotInitialized)
    }
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        Self::initialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
