//! Ownership and mapping of shared RELRO regions.
//!
//! A [`RelroHandle`] is the exclusive owner of the descriptor referencing a
//! read-only copy of one library's RELRO bytes. The type is deliberately not
//! `Clone`: moving the handle into a transport envelope or another record is
//! the only way ownership changes hands, and dropping the last holder closes
//! the descriptor.

use crate::error::adopt_error;
use crate::mmap::{MapFlags, Mmap, ProtFlags};
use crate::os;
use crate::Result;
use std::os::fd::{AsFd, OwnedFd};
use std::ptr::NonNull;

/// Exclusive ownership of a shared memory region holding RELRO bytes.
pub struct RelroHandle {
    fd: OwnedFd,
}

impl From<OwnedFd> for RelroHandle {
    fn from(fd: OwnedFd) -> Self {
        RelroHandle { fd }
    }
}

impl From<RelroHandle> for OwnedFd {
    fn from(handle: RelroHandle) -> Self {
        handle.fd
    }
}

impl std::fmt::Debug for RelroHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelroHandle").field("fd", &self.fd).finish()
    }
}

impl RelroHandle {
    /// Snapshots `relro_size` bytes of the current process's memory at
    /// `relro_start` into a freshly created shared region.
    ///
    /// With `seal` the region is sealed against all future writes at
    /// creation; otherwise it is backed by an unlinked read-only file. Either
    /// way no later holder can alter the bytes other processes observe.
    ///
    /// # Safety
    /// `[relro_start, relro_start + relro_size)` must be mapped readable in
    /// the current process.
    pub(crate) unsafe fn capture(relro_start: usize, relro_size: usize, seal: bool) -> Result<Self> {
        let bytes = unsafe { std::slice::from_raw_parts(relro_start as *const u8, relro_size) };
        let fd = if seal {
            os::sealed_region_from_bytes(bytes)?
        } else {
            os::file_region_from_bytes(bytes)?
        };
        Ok(RelroHandle { fd })
    }

    /// Replaces whatever is mapped at `[addr, addr + len)` with a shared
    /// read-only mapping of this region, in one operation that is atomic
    /// from the perspective of any other thread.
    pub(crate) fn map_fixed_over<M: Mmap>(&self, addr: usize, len: usize) -> Result<()> {
        let ptr = unsafe {
            M::mmap_fd(
                Some(addr),
                len,
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED | MapFlags::MAP_FIXED,
                self.fd.as_fd(),
                0,
            )
        }?;
        if ptr.as_ptr() as usize != addr {
            let _ = unsafe { M::munmap(ptr, len) };
            return Err(adopt_error("fixed remap landed at the wrong address"));
        }
        log::trace!("[Relro] shared mapping installed at 0x{addr:x}, length: {len}");
        Ok(())
    }

    /// Compares this region's content against `len` bytes of the current
    /// process's memory at `addr`, through a scratch mapping.
    pub(crate) fn matches_memory<M: Mmap>(&self, addr: usize, len: usize) -> Result<bool> {
        let scratch = self.map_scratch::<M>(len)?;
        let equal = unsafe {
            let shared = std::slice::from_raw_parts(scratch.as_ptr().cast::<u8>(), len);
            let private = std::slice::from_raw_parts(addr as *const u8, len);
            shared == private
        };
        unsafe { M::munmap(scratch, len) }?;
        Ok(equal)
    }

    /// Copies the region's first `len` bytes out through a scratch mapping.
    pub fn read_to_vec<M: Mmap>(&self, len: usize) -> Result<Vec<u8>> {
        let scratch = self.map_scratch::<M>(len)?;
        let bytes =
            unsafe { std::slice::from_raw_parts(scratch.as_ptr().cast::<u8>(), len) }.to_vec();
        unsafe { M::munmap(scratch, len) }?;
        Ok(bytes)
    }

    fn map_scratch<M: Mmap>(&self, len: usize) -> Result<NonNull<std::ffi::c_void>> {
        unsafe {
            M::mmap_fd(
                None,
                len,
                ProtFlags::PROT_READ,
                MapFlags::MAP_SHARED,
                self.fd.as_fd(),
                0,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mmap::{DefaultMmap, PAGE_SIZE};

    fn scratch_page(fill: u8) -> NonNull<std::ffi::c_void> {
        let ptr = unsafe {
            DefaultMmap::mmap_anonymous(
                None,
                PAGE_SIZE,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }
        .unwrap();
        unsafe { ptr.as_ptr().cast::<u8>().write_bytes(fill, PAGE_SIZE) };
        ptr
    }

    #[test]
    fn capture_preserves_content() {
        let page = scratch_page(0xa5);
        let addr = page.as_ptr() as usize;
        let handle = unsafe { RelroHandle::capture(addr, PAGE_SIZE, true) }.unwrap();
        let copy = handle.read_to_vec::<DefaultMmap>(PAGE_SIZE).unwrap();
        assert!(copy.iter().all(|&b| b == 0xa5));
        assert!(handle.matches_memory::<DefaultMmap>(addr, PAGE_SIZE).unwrap());
        unsafe { DefaultMmap::munmap(page, PAGE_SIZE) }.unwrap();
    }

    #[test]
    fn unsealed_capture_preserves_content() {
        let page = scratch_page(0x5a);
        let addr = page.as_ptr() as usize;
        let handle = unsafe { RelroHandle::capture(addr, PAGE_SIZE, false) }.unwrap();
        let copy = handle.read_to_vec::<DefaultMmap>(PAGE_SIZE).unwrap();
        assert!(copy.iter().all(|&b| b == 0x5a));
        unsafe { DefaultMmap::munmap(page, PAGE_SIZE) }.unwrap();
    }

    #[test]
    fn mismatch_is_detected() {
        let page = scratch_page(0x11);
        let other = scratch_page(0x22);
        let handle =
            unsafe { RelroHandle::capture(page.as_ptr() as usize, PAGE_SIZE, true) }.unwrap();
        assert!(
            !handle
                .matches_memory::<DefaultMmap>(other.as_ptr() as usize, PAGE_SIZE)
                .unwrap()
        );
        unsafe { DefaultMmap::munmap(page, PAGE_SIZE) }.unwrap();
        unsafe { DefaultMmap::munmap(other, PAGE_SIZE) }.unwrap();
    }

    #[test]
    fn map_fixed_over_replaces_private_pages() {
        let page = scratch_page(0x33);
        let addr = page.as_ptr() as usize;
        let handle = unsafe { RelroHandle::capture(addr, PAGE_SIZE, true) }.unwrap();
        // Clobber the private copy, then swap the shared region back in.
        unsafe { page.as_ptr().cast::<u8>().write_bytes(0x44, PAGE_SIZE) };
        handle.map_fixed_over::<DefaultMmap>(addr, PAGE_SIZE).unwrap();
        let now = unsafe { std::slice::from_raw_parts(addr as *const u8, PAGE_SIZE) };
        assert!(now.iter().all(|&b| b == 0x33));
        unsafe { DefaultMmap::munmap(page, PAGE_SIZE) }.unwrap();
    }
}
