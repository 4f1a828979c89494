//! The externally visible entry point of the coordinated loader.
//!
//! A [`Linker`] is constructed exactly once at process startup and passed
//! to every call site; it fixes a capability-appropriate implementation for
//! the lifetime of the process and forwards the lifecycle operations to the
//! coordinator. Test binaries may force an implementation and register a
//! post-load verification routine; production code never does either.

use crate::coordinator::{RelroCoordinator, Role};
use crate::error::{state_error, test_runner_error};
use crate::mapper::{LibraryMapper, MappedLibrary};
use crate::mmap::{DefaultMmap, Mmap};
use crate::os;
use crate::record::RelroPackage;
use crate::Result;
use delegate::delegate;
use std::sync::Mutex;

/// Which loading implementation backs the process.
///
/// Chosen once, by probing what the platform offers; hot paths never
/// re-examine the platform.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Implementation {
    /// Manual fallback for platforms without sealed shared memory regions:
    /// RELRO regions are backed by unlinked read-only files, and a consumer
    /// byte-compares the shared content against its private copy before
    /// swapping the mapping.
    Legacy,
    /// Uses sealed shared memory regions and replaces RELRO mappings with a
    /// single atomic remap, on both the producer and consumer sides.
    Modern,
}

impl Implementation {
    fn select() -> Self {
        if os::capabilities().sealed_regions {
            Implementation::Modern
        } else {
            Implementation::Legacy
        }
    }
}

/// Runtime checks executed after loading completes, in controlled test
/// runs only. Registered through [`Linker::set_test_runner`]; production
/// processes never register one.
pub trait TestRunner: Send {
    /// Runs the checks and returns `true` if they all pass.
    fn run_checks(&self, in_producer_role: bool) -> bool;
}

/// Lifecycle facade over the per-process [`RelroCoordinator`].
pub struct Linker<L: LibraryMapper, M: Mmap = DefaultMmap> {
    coordinator: RelroCoordinator<L, M>,
    test_runner: Mutex<Option<Box<dyn TestRunner>>>,
}

impl<L: LibraryMapper, M: Mmap> Linker<L, M> {
    /// Creates the process's linker over `mapper`, selecting the
    /// implementation the platform supports.
    pub fn new(mapper: L) -> Self {
        let implementation = Implementation::select();
        log::info!("using linker implementation: {implementation:?}");
        Linker {
            coordinator: RelroCoordinator::new(mapper, implementation),
            test_runner: Mutex::new(None),
        }
    }

    /// Creates a linker with a forced implementation. For test setups; the
    /// choice is still fixed for the linker's lifetime. Fails if the
    /// platform cannot back the requested implementation.
    pub fn with_implementation(mapper: L, implementation: Implementation) -> Result<Self> {
        if implementation == Implementation::Modern && !os::capabilities().sealed_regions {
            return Err(state_error(
                "the modern implementation is unsupported on this platform",
            ));
        }
        log::info!("forced linker implementation: {implementation:?}");
        Ok(Linker {
            coordinator: RelroCoordinator::new(mapper, implementation),
            test_runner: Mutex::new(None),
        })
    }

    /// Registers the post-load verification routine. May only be called
    /// during setup, before loading finishes.
    pub fn set_test_runner(&self, runner: Box<dyn TestRunner>) -> Result<()> {
        if self.coordinator.is_ready() {
            return Err(state_error("loading already finished in this process"));
        }
        *self.test_runner.lock().unwrap() = Some(runner);
        Ok(())
    }

    /// Loads a native shared library, at a planned fixed address when the
    /// role provides one.
    pub fn load_library(&self, path: &str) -> Result<()> {
        self.coordinator.load_library(path, true)
    }

    /// Loads a native shared library, ignoring any planned fixed address.
    /// The library is never RELRO-shareable.
    pub fn load_library_no_fixed_address(&self, path: &str) -> Result<()> {
        self.coordinator.load_library(path, false)
    }

    /// Completes loading; see [`RelroCoordinator::finish_load`]. Runs the
    /// registered post-load checks, if any, after the first completion and
    /// before any library code beyond static initializers executes.
    pub fn finish_load(&self) -> Result<()> {
        if !self.coordinator.finish_load()? {
            return Ok(());
        }
        let runner = self.test_runner.lock().unwrap();
        if let Some(runner) = runner.as_ref() {
            let in_producer_role = self.coordinator.role() == Role::Producer;
            if !runner.run_checks(in_producer_role) {
                return Err(test_runner_error("post-load checks failed in this process"));
            }
            log::info!("all post-load checks passed");
        }
        Ok(())
    }

    delegate! {
        to self.coordinator {
            /// Prepares this process for library loads; see
            /// [`RelroCoordinator::prepare_load`].
            pub fn prepare_load(&self) -> Result<()>;
            /// Declares this process a consumer; see
            /// [`RelroCoordinator::init_service_process`].
            pub fn init_service_process(&self, base_load_address: usize) -> Result<()>;
            /// Turns shared RELROs off for this process, forever.
            pub fn disable_shared_relros(&self) -> Result<()>;
            /// Delivers the producer's package to this consumer; see
            /// [`RelroCoordinator::use_shared_relros`].
            pub fn use_shared_relros(&self, package: RelroPackage) -> Result<()>;
            /// Gives up waiting for a shared-RELRO package.
            pub fn abandon_shared_relros(&self);
            /// Snapshots the producer's records for transfer; see
            /// [`RelroCoordinator::get_shared_relros`].
            pub fn get_shared_relros(&self) -> Option<RelroPackage>;
            /// The common base load address, or `0` when sharing is off.
            pub fn base_load_address(&self) -> usize;
            /// The process's current role.
            pub fn role(&self) -> Role;
            /// The implementation backing this linker.
            pub fn implementation(&self) -> Implementation;
            /// The layout recorded for a loaded library.
            pub fn library_layout(&self, name: &str) -> Option<MappedLibrary>;
            /// Whether the record for `name` currently owns a shared RELRO
            /// handle.
            pub fn has_relro_handle(&self, name: &str) -> bool;
            /// The loader primitive this linker drives.
            pub fn mapper(&self) -> &L;
        }
    }
}
