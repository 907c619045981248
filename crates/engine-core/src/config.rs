//! Engine configuration
//!
//! An [`EngineConfiguration`] is a plain value. A session copies it at `open`
//! and never hands out a mutable reference, so it is immutable for the
//! session's lifetime.

use crate::backend::{HardwareBackend, KvCachePrecision};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// How a session should run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfiguration {
    /// Compiled model file or directory
    pub model_path: PathBuf,

    #[serde(default)]
    pub backend: HardwareBackend,

    /// Layers offloaded to the accelerator (ignored on CPU)
    #[serde(default)]
    pub gpu_layers: u32,

    /// Context window, in tokens
    #[serde(default = "default_context_size")]
    pub context_size: u32,

    /// Maximum tokens submitted to the runtime per decode call
    #[serde(default = "default_batch_size")]
    pub batch_size: u32,

    #[serde(default = "default_threads")]
    pub threads: u32,

    #[serde(default = "default_use_flash_attention")]
    pub use_flash_attention: bool,

    #[serde(default)]
    pub kv_cache_precision: KvCachePrecision,
}

const fn default_context_size() -> u32 {
    4096
}

const fn default_batch_size() -> u32 {
    512
}

const fn default_threads() -> u32 {
    4
}

const fn default_use_flash_attention() -> bool {
    true
}

/// Errors while building or loading a configuration
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("model path is empty")]
    EmptyModelPath,
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("failed to parse JSON config: {0}")]
    Json(#[from] serde_json::Error),
}

impl EngineConfiguration {
    /// Configuration with the reference defaults for `model_path`
    pub fn new(model_path: impl Into<PathBuf>) -> Self {
        Self {
            model_path: model_path.into(),
            backend: HardwareBackend::default(),
            gpu_layers: 0,
            context_size: default_context_size(),
            batch_size: default_batch_size(),
            threads: default_threads(),
            use_flash_attention: default_use_flash_attention(),
            kv_cache_precision: KvCachePrecision::default(),
        }
    }

    pub fn with_backend(mut self, backend: HardwareBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn with_gpu_layers(mut self, gpu_layers: u32) -> Self {
        self.gpu_layers = gpu_layers;
        self
    }

    pub fn with_context_size(mut self, context_size: u32) -> Self {
        self.context_size = context_size;
        self
    }

    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_threads(mut self, threads: u32) -> Self {
        self.threads = threads;
        self
    }

    pub fn with_flash_attention(mut self, enabled: bool) -> Self {
        self.use_flash_attention = enabled;
        self
    }

    pub fn with_kv_cache_precision(mut self, precision: KvCachePrecision) -> Self {
        self.kv_cache_precision = precision;
        self
    }

    /// Check the numeric ranges. Does not touch the filesystem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.model_path.as_os_str().is_empty() {
            return Err(ConfigError::EmptyModelPath);
        }
        if self.context_size == 0 {
            return Err(ConfigError::Zero {
                field: "context_size",
            });
        }
        if self.batch_size == 0 {
            return Err(ConfigError::Zero {
                field: "batch_size",
            });
        }
        if self.threads == 0 {
            return Err(ConfigError::Zero { field: "threads" });
        }
        Ok(())
    }

    /// Layers to offload given the selected backend
    pub fn effective_gpu_layers(&self) -> u32 {
        if self.backend.is_accelerated() {
            self.gpu_layers
        } else {
            0
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a config file. `.json` files are parsed as JSON, anything else as YAML.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_json = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

        if is_json {
            Self::from_json_str(&content)
        } else {
            Self::from_yaml_str(&content)
        }
    }
}
