//! Negotiation of the common base load address shared by cooperating
//! processes.
//!
//! The negotiator asks the kernel for an anonymous mapping large enough to
//! hold the largest library the loader ever expects to load, immediately
//! releases it, and hands back the address ASLR picked. The address is a
//! hint, not a guarantee: nothing stops another mapping from landing in the
//! range before it is reused, so callers must treat a failed fixed-address
//! load as recoverable.

use crate::mmap::Mmap;

/// Size of the area requested when using ASLR to obtain a random load
/// address. Also bounds the incremental placement of multiple libraries so
/// they never leave the originally probed area.
pub const ADDRESS_SPACE_RESERVATION: usize = 192 * 1024 * 1024;

/// Returns a random address that should be free to be mapped with
/// [`ADDRESS_SPACE_RESERVATION`] bytes.
///
/// Maps an area large enough for the largest library that might be loaded,
/// and if successful unmaps it and returns the address the system chose.
/// The area should remain free of other mappings until a library is mapped
/// into it, with high probability.
///
/// Returns `0` if no viable mapping could be obtained, e.g. under address
/// space pressure; the caller is expected to disable sharing for the
/// session in that case.
pub fn reserve_base_address<M: Mmap>() -> usize {
    let ptr = match unsafe { M::mmap_reserve(ADDRESS_SPACE_RESERVATION) } {
        Ok(ptr) => ptr,
        Err(_) => return 0,
    };
    let addr = ptr.as_ptr() as usize;
    if unsafe { M::munmap(ptr, ADDRESS_SPACE_RESERVATION) }.is_err() {
        return 0;
    }
    log::trace!("[Reserve] random base load address: 0x{addr:x}");
    addr
}
