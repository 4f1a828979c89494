//! The OS loader primitive the coordinator drives.
//!
//! The coordinator never parses or relocates libraries itself; it asks a
//! [`LibraryMapper`] to map one at a chosen address and hand back the
//! resulting layout. Loaders with richer capabilities (fixed-address
//! placement, extension-aware loading) implement the trait over whatever
//! the platform offers; [`SystemMapper`] wraps the ordinary system dynamic
//! loader, which picks its own addresses.

use crate::error::load_error;
use crate::os;
use crate::Result;
use std::sync::Mutex;

/// The memory layout of one mapped library. All fields are page-aligned;
/// a library without a RELRO segment reports a zero-sized span.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MappedLibrary {
    /// Virtual address where the library's segments start.
    pub load_address: usize,
    /// Total byte span of the mapped segments.
    pub load_size: usize,
    /// Start of the read-only-after-relocation subregion.
    pub relro_start: usize,
    /// Byte length of the read-only-after-relocation subregion.
    pub relro_size: usize,
}

/// Maps native shared libraries into the process's address space.
///
/// Implementations must treat `address` as a requirement, not a hint: when
/// an address is supplied and the range cannot be used, the call fails and
/// the caller falls back to an unconstrained load. Returned spans are
/// page-aligned.
pub trait LibraryMapper {
    /// Maps the library at `path`, at `address` if one is supplied,
    /// otherwise wherever the loader chooses. Relocations are applied
    /// before this returns; static initializers may run, but nothing else
    /// from the library has executed.
    fn map_library(&self, path: &str, address: Option<usize>) -> Result<MappedLibrary>;
}

/// A [`LibraryMapper`] backed by the ordinary system dynamic loader.
///
/// The system loader offers no control over placement, so any request for a
/// fixed address fails and loads degrade to unshared ones. Loaded libraries
/// are kept open for the lifetime of the mapper; the system loader does not
/// support re-randomizing a library's address within one process anyway.
pub struct SystemMapper {
    handles: Mutex<Vec<libloading::Library>>,
}

impl SystemMapper {
    pub fn new() -> Self {
        SystemMapper {
            handles: Mutex::new(Vec::new()),
        }
    }
}

impl Default for SystemMapper {
    fn default() -> Self {
        SystemMapper::new()
    }
}

impl LibraryMapper for SystemMapper {
    fn map_library(&self, path: &str, address: Option<usize>) -> Result<MappedLibrary> {
        if address.is_some() {
            return Err(load_error(
                "the system loader cannot map at a fixed address",
            ));
        }
        let library = unsafe { libloading::Library::new(path) }
            .map_err(|err| load_error(format!("dlopen of {path} failed: {err}")))?;
        let file_name = path.rsplit('/').next().unwrap_or(path);
        let layout = os::loaded_library_layout(file_name)
            .ok_or_else(|| load_error(format!("no loaded segments found for {path}")))?;
        self.handles.lock().unwrap().push(library);
        Ok(layout)
    }
}
