//! Hardware backend and KV cache precision selectors
//!
//! Both enums carry stable integer codes so hosts that speak in plain integers
//! (the historical native bridge did) can round-trip them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Compute path a session runs on. Exactly one is active per session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HardwareBackend {
    #[default]
    Cpu,
    #[serde(alias = "vulkan")]
    VulkanGpu,
    #[serde(alias = "opencl")]
    OpenclGpu,
    #[serde(alias = "hexagon")]
    NpuHexagon,
    #[serde(alias = "mediatek")]
    NpuMediatek,
    #[serde(alias = "metal")]
    MetalGpu,
}

impl HardwareBackend {
    /// All variants in code order
    pub const ALL: [HardwareBackend; 6] = [
        Self::Cpu,
        Self::VulkanGpu,
        Self::OpenclGpu,
        Self::NpuHexagon,
        Self::NpuMediatek,
        Self::MetalGpu,
    ];

    /// Integer code used at the host boundary
    pub fn code(self) -> i32 {
        match self {
            Self::Cpu => 0,
            Self::VulkanGpu => 1,
            Self::OpenclGpu => 2,
            Self::NpuHexagon => 3,
            Self::NpuMediatek => 4,
            Self::MetalGpu => 5,
        }
    }

    /// Short name used in config files and on the command line
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cpu => "cpu",
            Self::VulkanGpu => "vulkan",
            Self::OpenclGpu => "opencl",
            Self::NpuHexagon => "hexagon",
            Self::NpuMediatek => "mediatek",
            Self::MetalGpu => "metal",
        }
    }

    /// Whether this backend offloads layers to an accelerator
    pub fn is_accelerated(self) -> bool {
        !matches!(self, Self::Cpu)
    }
}

impl fmt::Display for HardwareBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for HardwareBackend {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "cpu" => Ok(Self::Cpu),
            "vulkan" | "vulkan_gpu" => Ok(Self::VulkanGpu),
            "opencl" | "opencl_gpu" => Ok(Self::OpenclGpu),
            "hexagon" | "npu_hexagon" => Ok(Self::NpuHexagon),
            "mediatek" | "npu_mediatek" => Ok(Self::NpuMediatek),
            "metal" | "metal_gpu" => Ok(Self::MetalGpu),
            _ => Err(UnknownVariant::new("backend", s)),
        }
    }
}

impl TryFrom<i32> for HardwareBackend {
    type Error = UnknownVariant;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|backend| backend.code() == code)
            .ok_or_else(|| UnknownVariant::new("backend code", code.to_string()))
    }
}

/// Numeric format of the attention key/value cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KvCachePrecision {
    F32,
    #[default]
    F16,
    Q8_0,
    Q4_0,
}

impl KvCachePrecision {
    pub const ALL: [KvCachePrecision; 4] = [Self::F32, Self::F16, Self::Q8_0, Self::Q4_0];

    pub fn code(self) -> i32 {
        match self {
            Self::F32 => 0,
            Self::F16 => 1,
            Self::Q8_0 => 2,
            Self::Q4_0 => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::Q8_0 => "q8_0",
            Self::Q4_0 => "q4_0",
        }
    }

    /// Storage cost per cached element, in bits. Quantized formats include
    /// their per-block scale (32 elements per block).
    pub fn bits_per_element(self) -> f32 {
        match self {
            Self::F32 => 32.0,
            Self::F16 => 16.0,
            Self::Q8_0 => 8.5,
            Self::Q4_0 => 4.5,
        }
    }
}

impl fmt::Display for KvCachePrecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

impl FromStr for KvCachePrecision {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" => Ok(Self::F32),
            "f16" => Ok(Self::F16),
            "q8_0" | "q8" => Ok(Self::Q8_0),
            "q4_0" | "q4" => Ok(Self::Q4_0),
            _ => Err(UnknownVariant::new("kv cache precision", s)),
        }
    }
}

impl TryFrom<i32> for KvCachePrecision {
    type Error = UnknownVariant;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Self::ALL
            .into_iter()
            .find(|precision| precision.code() == code)
            .ok_or_else(|| UnknownVariant::new("kv cache precision code", code.to_string()))
    }
}

/// A name or code that does not map to any variant
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind}: '{value}'")]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: impl Into<String>) -> Self {
        Self {
            kind,
            value: value.into(),
        }
    }
}
