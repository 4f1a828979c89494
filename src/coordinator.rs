//! The stateful core coordinating loads and shared RELRO regions.
//!
//! One coordinator exists per process. It tracks the process's role, the
//! common base load address, and every library loaded through it, and it
//! drives the producer/consumer handshake: a producer snapshots each
//! library's RELRO into a shared region after loading it; a consumer loads
//! at the addresses the producer planned and blocks in [`finish_load`]
//! until the producer's package arrives, then swaps its private RELRO
//! mappings for shared read-only ones.
//!
//! All state lives behind one mutex. Library loads are serialized by it;
//! the load cursor is not otherwise safe to advance concurrently.
//!
//! [`finish_load`]: RelroCoordinator::finish_load

use crate::address;
use crate::error::{adopt_error, state_error};
use crate::linker::Implementation;
use crate::mapper::{LibraryMapper, MappedLibrary};
use crate::mmap::{DefaultMmap, Mmap, PAGE_SIZE, page_end};
use crate::os;
use crate::record::{LibraryRecord, RelroPackage};
use crate::region::RelroHandle;
use crate::Result;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::{Condvar, Mutex, MutexGuard};

/// The process's role in a shared-RELRO group.
///
/// The role is fixed by the first of [`init_service_process`],
/// [`disable_shared_relros`], or an initial load (which implies
/// `Producer`); transitions are one-directional. `Producer` degrades to
/// `Disabled` only when no base address could be negotiated.
///
/// [`init_service_process`]: RelroCoordinator::init_service_process
/// [`disable_shared_relros`]: RelroCoordinator::disable_shared_relros
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Role {
    /// No role chosen yet; the default at process start.
    Uninitialized,
    /// This process creates shared RELRO regions for its group.
    Producer,
    /// This process waits to receive and adopt shared RELRO regions.
    Consumer,
    /// Sharing is off; loads behave like ordinary unshared loads.
    Disabled,
}

struct CoordinatorState {
    role: Role,
    ready: bool,
    bridge_ready: bool,
    base_load_address: Option<usize>,
    current_load_address: Option<usize>,
    pending_consumer_wait: bool,
    adopted: bool,
    incoming: Option<RelroPackage>,
    loaded: HashMap<String, LibraryRecord>,
}

/// Coordinates library loads and the shared-RELRO lifecycle for one
/// process. Generic over the loader primitive `L` and the mapping backend
/// `M`.
pub struct RelroCoordinator<L: LibraryMapper, M: Mmap = DefaultMmap> {
    mapper: L,
    implementation: Implementation,
    state: Mutex<CoordinatorState>,
    relro_arrived: Condvar,
    _mmap: PhantomData<M>,
}

impl<L: LibraryMapper, M: Mmap> RelroCoordinator<L, M> {
    pub(crate) fn new(mapper: L, implementation: Implementation) -> Self {
        RelroCoordinator {
            mapper,
            implementation,
            state: Mutex::new(CoordinatorState {
                role: Role::Uninitialized,
                ready: false,
                bridge_ready: false,
                base_load_address: None,
                current_load_address: None,
                pending_consumer_wait: false,
                adopted: false,
                incoming: None,
                loaded: HashMap::new(),
            }),
            relro_arrived: Condvar::new(),
            _mmap: PhantomData,
        }
    }

    fn state(&self) -> MutexGuard<'_, CoordinatorState> {
        self.state.lock().unwrap()
    }

    fn ensure_bridge_locked(&self, state: &mut CoordinatorState) -> Result<()> {
        if state.bridge_ready {
            return Ok(());
        }
        if os::native_page_size() != PAGE_SIZE {
            return Err(state_error("unsupported native page size"));
        }
        state.bridge_ready = true;
        log::debug!(
            "platform bridge initialized, {:?} implementation",
            self.implementation
        );
        Ok(())
    }

    fn ensure_prepared_locked(&self, state: &mut CoordinatorState) -> Result<()> {
        self.ensure_bridge_locked(state)?;
        if state.role == Role::Uninitialized {
            // Neither init_service_process nor disable_shared_relros ran
            // early, so this is the privileged process of its group.
            state.role = Role::Producer;
        }
        if state.role == Role::Producer && state.base_load_address.is_none() {
            let base = address::reserve_base_address::<M>();
            if base == 0 {
                log::warn!("disabling shared RELROs due to address space pressure");
                state.role = Role::Disabled;
            } else {
                state.base_load_address = Some(base);
                state.current_load_address = Some(base);
            }
        }
        Ok(())
    }

    /// Prepares this process for library loads: initializes the platform
    /// bridge exactly once and, in a producer, lazily negotiates the common
    /// base load address. Idempotent.
    pub fn prepare_load(&self) -> Result<()> {
        let mut state = self.state();
        self.ensure_prepared_locked(&mut state)
    }

    /// Declares this process a consumer that will reuse shared RELRO
    /// regions created elsewhere, loading at addresses derived from
    /// `base_load_address`. Must be called before the first load.
    pub fn init_service_process(&self, base_load_address: usize) -> Result<()> {
        let mut state = self.state();
        self.ensure_bridge_locked(&mut state)?;
        if state.role != Role::Uninitialized {
            return Err(state_error("role is already fixed for this process"));
        }
        if base_load_address == 0 {
            // The producer could not negotiate an address; nothing to wait
            // for.
            log::warn!("no base load address supplied, shared RELROs are off");
            state.role = Role::Disabled;
            return Ok(());
        }
        state.role = Role::Consumer;
        state.base_load_address = Some(base_load_address);
        state.current_load_address = Some(base_load_address);
        state.pending_consumer_wait = true;
        log::debug!("consumer initialized with base 0x{base_load_address:x}");
        Ok(())
    }

    /// Turns shared RELROs off for this process, forever. Subsequent loads
    /// use system-chosen addresses, capture nothing, and never block. Must
    /// be called before the first load.
    pub fn disable_shared_relros(&self) -> Result<()> {
        let mut state = self.state();
        self.ensure_bridge_locked(&mut state)?;
        match state.role {
            Role::Uninitialized => {
                state.role = Role::Disabled;
                Ok(())
            }
            Role::Disabled => Ok(()),
            _ => Err(state_error(
                "cannot disable shared RELROs after the role is fixed",
            )),
        }
    }

    /// Loads the library at `path`.
    ///
    /// With `allow_fixed`, a producer or consumer with a planned address
    /// maps the library there; when the planned address cannot be used the
    /// load falls back to a system-chosen address and the library is not
    /// RELRO-shareable. A producer captures the library's RELRO bytes into
    /// a freshly created shared region right after a planned-address load.
    ///
    /// Failure to map at any address is fatal for that library and
    /// surfaced to the caller; the library is then absent from the loaded
    /// set.
    pub fn load_library(&self, path: &str, allow_fixed: bool) -> Result<()> {
        let mut state = self.state();
        self.ensure_prepared_locked(&mut state)?;
        if state.ready {
            return Err(state_error("loads are already finished in this process"));
        }
        if state.loaded.contains_key(path) {
            return Err(state_error("library is already loaded"));
        }

        let planned = state.current_load_address.filter(|_| allow_fixed);
        let (layout, at_planned) = match planned {
            Some(want) => match self.mapper.map_library(path, Some(want)) {
                Ok(layout) => {
                    debug_assert_eq!(layout.load_address, want);
                    (layout, true)
                }
                Err(err) => {
                    log::warn!(
                        "failed to map {path} at 0x{want:x} ({err}), \
                         retrying at a system-chosen address"
                    );
                    (self.mapper.map_library(path, None)?, false)
                }
            },
            None => (self.mapper.map_library(path, None)?, false),
        };
        log::info!(
            "loaded {path} at 0x{:x}, length 0x{:x}",
            layout.load_address,
            layout.load_size
        );

        // The cursor advances past the planned span even for a fallback
        // load; later libraries keep their originally planned addresses.
        if let Some(cursor) = state.current_load_address {
            let next = cursor + page_end(layout.load_size);
            if let Some(base) = state.base_load_address
                && next - base > address::ADDRESS_SPACE_RESERVATION
            {
                log::warn!("planned load addresses exceed the probed reservation");
            }
            state.current_load_address = Some(next);
        }

        let mut record = LibraryRecord::new(layout);
        if state.role == Role::Producer && at_planned && layout.relro_size != 0 {
            self.capture_relro(path, layout, &mut record);
        }
        state.loaded.insert(path.to_owned(), record);
        Ok(())
    }

    fn capture_relro(&self, path: &str, layout: MappedLibrary, record: &mut LibraryRecord) {
        let seal = self.implementation == Implementation::Modern;
        match unsafe { RelroHandle::capture(layout.relro_start, layout.relro_size, seal) } {
            Ok(handle) => {
                if self.implementation == Implementation::Modern {
                    // The producer's own private pages are replaced with the
                    // shared copy as well.
                    if let Err(err) =
                        handle.map_fixed_over::<M>(layout.relro_start, layout.relro_size)
                    {
                        log::warn!("could not back {path} RELRO with the shared region: {err}");
                    }
                }
                record.set_relro_handle(handle);
            }
            Err(err) => log::warn!("could not create a shared RELRO region for {path}: {err}"),
        }
    }

    /// Completes loading for this process. A consumer that has not yet
    /// received its shared-RELRO package blocks here until another thread
    /// delivers one via [`use_shared_relros`] or abandons the wait, then
    /// adopts whatever arrived. Must be the last coordinator call before
    /// any library code beyond static initializers runs.
    ///
    /// Returns whether this call performed the completion; repeated calls
    /// return `Ok(false)`.
    ///
    /// [`use_shared_relros`]: RelroCoordinator::use_shared_relros
    pub fn finish_load(&self) -> Result<bool> {
        let mut state = self.state();
        if state.ready {
            return Ok(false);
        }
        if state.role == Role::Consumer && state.pending_consumer_wait {
            while state.pending_consumer_wait && state.incoming.is_none() {
                log::debug!("waiting for shared RELROs");
                state = self.relro_arrived.wait(state).unwrap();
            }
            if let Some(package) = state.incoming.take() {
                self.adopt_locked(&mut state, package);
                state.adopted = true;
            } else {
                log::warn!("wait abandoned, proceeding without shared RELROs");
            }
            state.pending_consumer_wait = false;
        }
        state.ready = true;
        Ok(true)
    }

    fn adopt_locked(&self, state: &mut CoordinatorState, mut package: RelroPackage) {
        for (name, record) in state.loaded.iter_mut() {
            let Some(mut envelope) = package.take(name) else {
                log::debug!("no shared RELRO received for {name}, keeping the private copy");
                continue;
            };
            let local = record.layout();
            if envelope.layout() != local {
                log::warn!(
                    "shared RELRO for {name} describes a different layout, \
                     keeping the private copy"
                );
                continue;
            }
            if local.relro_size == 0 {
                continue;
            }
            let Some(handle) = envelope.take_relro_handle() else {
                continue;
            };
            let outcome = match self.implementation {
                Implementation::Modern => {
                    handle.map_fixed_over::<M>(local.relro_start, local.relro_size)
                }
                Implementation::Legacy => {
                    match handle.matches_memory::<M>(local.relro_start, local.relro_size) {
                        Ok(true) => handle.map_fixed_over::<M>(local.relro_start, local.relro_size),
                        Ok(false) => Err(adopt_error(
                            "shared RELRO content differs from the private copy",
                        )),
                        Err(err) => Err(err),
                    }
                }
            };
            match outcome {
                // The descriptor is closed on drop; the mapping outlives it.
                Ok(()) => log::debug!("adopted shared RELRO for {name}"),
                Err(err) => log::warn!("could not adopt shared RELRO for {name}: {err}"),
            }
        }
        // Entries for libraries this process never loaded are dropped with
        // the package, closing their descriptors.
    }

    /// Delivers the producer's package to this consumer, waking a
    /// [`finish_load`] blocked on it. May be called from any thread, before
    /// or after the consumer reaches `finish_load`. Duplicate deliveries
    /// after adoption are ignored.
    ///
    /// [`finish_load`]: RelroCoordinator::finish_load
    pub fn use_shared_relros(&self, package: RelroPackage) -> Result<()> {
        let mut state = self.state();
        if state.role != Role::Consumer {
            log::warn!("ignoring shared RELROs delivered to a non-consumer process");
            return Ok(());
        }
        if state.adopted {
            log::debug!("shared RELROs already adopted, ignoring duplicate delivery");
            return Ok(());
        }
        if state.ready {
            // Library code may already be running; swapping now would break
            // the ordering guarantee.
            log::warn!("shared RELROs arrived after loading finished, ignoring");
            return Ok(());
        }
        log::debug!("received a package of {} shared RELROs", package.len());
        state.incoming = Some(package);
        self.relro_arrived.notify_all();
        Ok(())
    }

    /// Gives up waiting for a shared-RELRO package. A consumer blocked in
    /// [`finish_load`] proceeds with its private RELRO mappings, losing the
    /// memory sharing but preserving forward progress.
    ///
    /// [`finish_load`]: RelroCoordinator::finish_load
    pub fn abandon_shared_relros(&self) {
        let mut state = self.state();
        if state.pending_consumer_wait {
            log::warn!("abandoning the wait for shared RELROs");
            state.pending_consumer_wait = false;
            self.relro_arrived.notify_all();
        }
    }

    /// Returns a transport-ready snapshot of every loaded library, with
    /// each record's handle moved into the package. Returns `None` unless
    /// this process is a producer.
    pub fn get_shared_relros(&self) -> Option<RelroPackage> {
        let mut state = self.state();
        if state.role != Role::Producer {
            return None;
        }
        let mut names: Vec<String> = state.loaded.keys().cloned().collect();
        names.sort();
        let mut package = RelroPackage::new();
        for name in names {
            let record = state.loaded.get_mut(&name).unwrap();
            package.insert(name, record.serialize());
        }
        Some(package)
    }

    /// The common base load address of this process's group, or `0` when
    /// sharing is disabled or no address has been negotiated yet.
    pub fn base_load_address(&self) -> usize {
        self.state().base_load_address.unwrap_or(0)
    }

    /// The process's current role.
    pub fn role(&self) -> Role {
        self.state().role
    }

    /// Whether [`finish_load`](RelroCoordinator::finish_load) has completed.
    pub fn is_ready(&self) -> bool {
        self.state().ready
    }

    /// The implementation this coordinator was built with.
    pub fn implementation(&self) -> Implementation {
        self.implementation
    }

    /// The layout recorded for a loaded library.
    pub fn library_layout(&self, name: &str) -> Option<MappedLibrary> {
        self.state().loaded.get(name).map(|record| record.layout())
    }

    /// Whether the record for `name` currently owns a shared RELRO handle.
    pub fn has_relro_handle(&self, name: &str) -> bool {
        self.state()
            .loaded
            .get(name)
            .is_some_and(|record| record.relro_handle().is_some())
    }

    /// The loader primitive this coordinator drives.
    pub fn mapper(&self) -> &L {
        &self.mapper
    }
}
