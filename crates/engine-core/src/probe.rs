//! Hardware capability probing
//!
//! A probe answers one question: can the system loader open the backend's
//! runtime library? The library is unloaded as soon as the answer is known.
//! Absence is an ordinary `false`, never an error.

use crate::backend::HardwareBackend;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Vulkan loader names, most portable first
pub const VULKAN_LIBRARIES: &[&str] = &["libvulkan.so", "libvulkan.so.1"];

/// OpenCL loader names. The last entry is the Qualcomm vendor location.
pub const OPENCL_LIBRARIES: &[&str] = &[
    "libOpenCL.so",
    "libOpenCL.so.1",
    "/system/vendor/lib64/libOpenCL.so",
];

/// Opens shared libraries for probing.
///
/// The returned value must unload the library when dropped; holding it is the
/// only way to keep the library mapped.
pub trait LibraryLoader {
    type Library;

    fn open(&self, name: &str) -> Option<Self::Library>;
}

/// Probes backend libraries through a [`LibraryLoader`]
#[derive(Debug, Clone, Default)]
pub struct CapabilityProber<L> {
    loader: L,
}

impl<L: LibraryLoader> CapabilityProber<L> {
    pub fn new(loader: L) -> Self {
        Self { loader }
    }

    pub fn probe_vulkan(&self) -> bool {
        self.probe("vulkan", VULKAN_LIBRARIES)
    }

    /// Tries the standard loader names before the vendor path
    pub fn probe_opencl(&self) -> bool {
        self.probe("opencl", OPENCL_LIBRARIES)
    }

    pub fn report(&self) -> CapabilityReport {
        CapabilityReport {
            vulkan: self.probe_vulkan(),
            opencl: self.probe_opencl(),
        }
    }

    fn probe(&self, backend: &str, candidates: &[&str]) -> bool {
        for name in candidates {
            if let Some(library) = self.loader.open(name) {
                drop(library);
                info!(backend, library = name, "backend runtime available");
                return true;
            }
            debug!(backend, library = name, "library not loadable");
        }
        info!(backend, "backend runtime not available");
        false
    }
}

/// Snapshot of which accelerator runtimes are loadable
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CapabilityReport {
    pub vulkan: bool,
    pub opencl: bool,
}

impl CapabilityReport {
    pub fn supports(&self, backend: HardwareBackend) -> bool {
        match backend {
            HardwareBackend::Cpu => true,
            HardwareBackend::VulkanGpu => self.vulkan,
            HardwareBackend::OpenclGpu => self.opencl,
            HardwareBackend::MetalGpu => cfg!(target_vendor = "apple"),
            HardwareBackend::NpuHexagon | HardwareBackend::NpuMediatek => false,
        }
    }

    /// Backends usable on this system, CPU first
    pub fn available(&self) -> Vec<HardwareBackend> {
        HardwareBackend::ALL
            .into_iter()
            .filter(|backend| self.supports(*backend))
            .collect()
    }

    /// `requested` if it is usable here, otherwise CPU
    pub fn resolve(&self, requested: HardwareBackend) -> HardwareBackend {
        if self.supports(requested) {
            requested
        } else {
            warn!(requested = %requested, "backend unavailable, falling back to cpu");
            HardwareBackend::Cpu
        }
    }

    /// Best accelerated backend, or CPU when none is available
    pub fn preferred(&self) -> HardwareBackend {
        [
            HardwareBackend::MetalGpu,
            HardwareBackend::VulkanGpu,
            HardwareBackend::OpenclGpu,
        ]
        .into_iter()
        .find(|backend| self.supports(*backend))
        .unwrap_or(HardwareBackend::Cpu)
    }
}
