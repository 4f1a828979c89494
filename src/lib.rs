//! # relro_linker
//! Load native shared libraries with cross-process shared RELRO regions.
//!
//! When two processes load the same native library at the _same_ memory
//! address, the content of their RELRO segments (vtables and any constants
//! containing pointers, fixed up at load time and read-only afterwards) is
//! largely identical. By default every process still backs that segment
//! with its own private RAM, which adds up quickly across a group of worker
//! processes. This crate saves that RAM: one process copies its RELRO
//! content into a shared memory region, and every other process in the
//! group swaps its private RELRO mapping for a shared, read-only mapping of
//! the same region.
//!
//! Doing that correctly requires the pieces this crate provides:
//! - deterministic cross-process address agreement, seeded by probing ASLR
//!   for a free range ([`address`]);
//! - a coordinator that places libraries contiguously from the agreed base,
//!   snapshots RELRO content in the producer process, and blocks the
//!   consumer until its package arrives ([`RelroCoordinator`]);
//! - move-only ownership of the shared region descriptors, so exactly one
//!   live owner holds each handle at any instant ([`RelroHandle`],
//!   [`LibraryRecord`]);
//! - a transport format for sending the records, descriptors attached,
//!   across the process boundary ([`RelroPackage`]).
//!
//! ## Usage
//! The privileged process of a group (the producer) loads its libraries and
//! packages the shared regions:
//! ```no_run
//! use relro_linker::{Linker, SystemMapper};
//!
//! # fn main() -> relro_linker::Result<()> {
//! let linker = Linker::<SystemMapper>::new(SystemMapper::new());
//! linker.prepare_load()?;
//! linker.load_library("libfoo.so")?;
//! linker.finish_load()?;
//! let package = linker.get_shared_relros();
//! // send `package` and `linker.base_load_address()` to each worker
//! # Ok(())
//! # }
//! ```
//! A sandboxed worker (a consumer) receives the base address out-of-band
//! before loading, and the package from any thread, typically the one
//! servicing the process channel:
//! ```no_run
//! # use relro_linker::{Linker, RelroPackage, SystemMapper};
//! # fn receive_package() -> RelroPackage { unimplemented!() }
//! # fn main() -> relro_linker::Result<()> {
//! # let base_load_address = 0x7000_0000;
//! let linker = Linker::<SystemMapper>::new(SystemMapper::new());
//! linker.init_service_process(base_load_address)?;
//! linker.load_library("libfoo.so")?;
//! linker.use_shared_relros(receive_package())?;
//! // blocks until the package above is adopted
//! linker.finish_load()?;
//! # Ok(())
//! # }
//! ```
//! `finish_load` must be the last linker call before any library code
//! beyond static initializers runs: swapping a RELRO mapping is only safe
//! while nothing executes code that reads it.
//!
//! ## Security
//! A shared RELRO region is forced read-only at creation (sealed against
//! writes where the platform supports it, backed by a read-only descriptor
//! otherwise), so a compromised worker cannot remap it writable and alter
//! the content its siblings observe. Per-library failures (an occupied
//! fixed address, a region that cannot be created or adopted) degrade that
//! library to an ordinary unshared load; they are never fatal to the group.

#[cfg(not(unix))]
compile_error!("relro_linker only supports unix targets");

pub mod address;
mod coordinator;
mod error;
mod linker;
pub mod mapper;
pub mod mmap;
pub mod os;
pub mod record;
pub mod region;

pub use coordinator::{RelroCoordinator, Role};
pub use error::Error;
pub use linker::{Implementation, Linker, TestRunner};
pub use mapper::{LibraryMapper, MappedLibrary, SystemMapper};
pub use record::{LibraryRecord, RecordEnvelope, RelroPackage};
pub use region::RelroHandle;

pub type Result<T> = core::result::Result<T, Error>;
