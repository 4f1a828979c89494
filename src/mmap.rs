//! Memory mapping operations for the coordinated loader.
//!
//! This module provides the trait and flag types for the memory mapping
//! operations the loader relies on: reserving address ranges, mapping shared
//! memory regions over private pages, and protecting RELRO spans. It
//! abstracts the platform so that the coordination logic never calls the OS
//! directly, which also lets tests substitute failing or instrumented
//! backends.
//!
//! # Safety
//! Memory mapping manipulates the process's address space directly.
//! Incorrect usage can cause crashes, data corruption, or security issues.

pub use crate::os::DefaultMmap;

use crate::Result;
use bitflags::bitflags;
use std::ffi::{c_int, c_void};
use std::os::fd::BorrowedFd;
use std::ptr::NonNull;

/// Size of a virtual memory page. The coordinated loader only runs on
/// targets with 4 KiB pages; the platform bridge verifies this at startup.
pub const PAGE_SIZE: usize = 0x1000;
pub(crate) const MASK: usize = !(PAGE_SIZE - 1);

/// Rounds `addr` down to the start of its page.
#[inline]
pub(crate) const fn page_start(addr: usize) -> usize {
    addr & MASK
}

/// Rounds `addr` up to the next page boundary.
#[inline]
pub(crate) const fn page_end(addr: usize) -> usize {
    page_start(addr + PAGE_SIZE - 1)
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    /// Memory protection flags for controlling access permissions.
    pub struct ProtFlags: c_int {
        /// No access allowed. Useful for reserving address space.
        const PROT_NONE = 0;

        /// Allow reading from the memory region.
        const PROT_READ = 1;

        /// Allow writing to the memory region.
        const PROT_WRITE = 2;

        /// Allow executing code in the memory region.
        const PROT_EXEC = 4;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Memory mapping configuration flags.
    pub struct MapFlags: c_int {
        /// Share the mapping with every process mapping the same region.
        /// Used for adopted RELRO mappings so physical pages are shared.
        const MAP_SHARED = 1;

        /// Create a private copy-on-write mapping.
        const MAP_PRIVATE = 2;

        /// Place the mapping at exactly the specified address, replacing any
        /// existing mapping in the range. The replacement is atomic from the
        /// perspective of other threads.
        const MAP_FIXED = 16;

        /// Create an anonymous mapping not backed by any file.
        const MAP_ANONYMOUS = 32;
    }
}

/// A trait for the low-level memory mapping operations the coordinator
/// performs itself (address reservation, RELRO capture and swap). Library
/// mapping proper goes through [`LibraryMapper`](crate::mapper::LibraryMapper).
///
/// # Safety
/// All methods manipulate the process's virtual address space. Improper use
/// can cause memory corruption, crashes, or security vulnerabilities.
pub trait Mmap {
    /// Maps a file-backed region into memory.
    ///
    /// # Arguments
    /// * `addr` - Preferred starting address (page-aligned). `None` lets the
    ///   system choose. Combined with [`MapFlags::MAP_FIXED`], the mapping
    ///   replaces whatever occupied the range.
    /// * `len` - Size of the mapping in bytes (rounded up to page size).
    /// * `prot` - Memory protection flags.
    /// * `flags` - Mapping configuration flags.
    /// * `fd` - Descriptor of the backing file or shared memory region.
    /// * `offset` - Page-aligned offset into the backing object.
    ///
    /// # Safety
    /// `addr` must be page-aligned if specified, and `len` and `offset` must
    /// be valid for the backing object.
    unsafe fn mmap_fd(
        addr: Option<usize>,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: BorrowedFd<'_>,
        offset: usize,
    ) -> Result<NonNull<c_void>>;

    /// Creates an anonymous memory mapping.
    ///
    /// # Safety
    /// Manipulates address space. Ensure `addr` is page-aligned if specified.
    unsafe fn mmap_anonymous(
        addr: Option<usize>,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<NonNull<c_void>>;

    /// Unmaps a memory region, releasing the associated resources.
    ///
    /// # Safety
    /// Ensure `addr` and `len` match an existing mapping. Do not access the
    /// region after unmapping.
    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()>;

    /// Changes the protection of a memory region.
    ///
    /// # Safety
    /// Changing permissions can affect running code. `addr` must be
    /// page-aligned.
    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()>;

    /// Reserves a region of virtual address space without committing
    /// physical memory.
    ///
    /// The default implementation maps anonymous `PROT_NONE` pages at a
    /// system-chosen address, which is how the address negotiator probes for
    /// a free range.
    ///
    /// # Safety
    /// The reserved region must not be accessed until properly mapped.
    unsafe fn mmap_reserve(len: usize) -> Result<NonNull<c_void>> {
        unsafe {
            Self::mmap_anonymous(
                None,
                len,
                ProtFlags::PROT_NONE,
                MapFlags::MAP_PRIVATE | MapFlags::MAP_ANONYMOUS,
            )
        }
    }
}
