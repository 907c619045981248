//! System library loader for capability probing

use engine_core::probe::{CapabilityProber, LibraryLoader};
use libloading::Library;
use tracing::trace;

/// Loads libraries through the platform dynamic loader.
///
/// Dropping the returned [`Library`] unloads it.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemLoader;

impl LibraryLoader for SystemLoader {
    type Library = Library;

    fn open(&self, name: &str) -> Option<Library> {
        // SAFETY: probed libraries are driver loaders whose initializers are
        // safe to run; no symbol is ever looked up.
        match unsafe { open_now(name) } {
            Ok(library) => Some(library),
            Err(err) => {
                trace!(library = name, error = %err, "dlopen failed");
                None
            }
        }
    }
}

/// Resolve every symbol up front so a broken driver fails the probe
#[cfg(unix)]
unsafe fn open_now(name: &str) -> Result<Library, libloading::Error> {
    use libloading::os::unix::{Library as UnixLibrary, RTLD_LOCAL, RTLD_NOW};
    UnixLibrary::open(Some(name), RTLD_NOW | RTLD_LOCAL).map(Library::from)
}

#[cfg(not(unix))]
unsafe fn open_now(name: &str) -> Result<Library, libloading::Error> {
    Library::new(name)
}

pub fn system_prober() -> CapabilityProber<SystemLoader> {
    CapabilityProber::new(SystemLoader)
}
