use crate::error::map_error;
use crate::mapper::MappedLibrary;
use crate::mmap::{MapFlags, Mmap, ProtFlags, page_end, page_start};
use crate::Result;
use std::ffi::c_void;
use std::fs::OpenOptions;
use std::io::Write;
use std::os::fd::{AsRawFd, BorrowedFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

/// An implementation of the Mmap trait backed by libc.
pub struct DefaultMmap;

impl Mmap for DefaultMmap {
    unsafe fn mmap_fd(
        addr: Option<usize>,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: BorrowedFd<'_>,
        offset: usize,
    ) -> Result<NonNull<c_void>> {
        let ptr = unsafe {
            libc::mmap(
                addr.unwrap_or(0) as _,
                len,
                prot.bits(),
                flags.bits(),
                fd.as_raw_fd(),
                offset as _,
            )
        };
        if std::ptr::eq(ptr, libc::MAP_FAILED) {
            return Err(map_error("mmap failed"));
        }
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    unsafe fn mmap_anonymous(
        addr: Option<usize>,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<NonNull<c_void>> {
        let ptr = unsafe {
            libc::mmap(
                addr.unwrap_or(0) as _,
                len,
                prot.bits(),
                flags.union(MapFlags::MAP_ANONYMOUS).bits(),
                -1,
                0,
            )
        };
        if std::ptr::eq(ptr, libc::MAP_FAILED) {
            return Err(map_error("mmap anonymous failed"));
        }
        Ok(unsafe { NonNull::new_unchecked(ptr) })
    }

    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()> {
        let res = unsafe { libc::munmap(addr.as_ptr(), len) };
        if res != 0 {
            return Err(map_error("munmap failed"));
        }
        Ok(())
    }

    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()> {
        let res = unsafe { libc::mprotect(addr.as_ptr(), len, prot.bits()) };
        if res != 0 {
            return Err(map_error("mprotect failed"));
        }
        Ok(())
    }
}

/// What the running platform offers for shared RELRO regions. Probed once
/// when an implementation is selected, never on hot paths.
#[derive(Clone, Copy, Debug)]
pub struct Capabilities {
    /// Whether the platform can create shared memory regions whose contents
    /// are sealed against any future write, shrink, or grow.
    pub sealed_regions: bool,
}

/// Probes the platform's capabilities.
pub fn capabilities() -> Capabilities {
    cfg_if::cfg_if! {
        if #[cfg(any(target_os = "linux", target_os = "android"))] {
            Capabilities { sealed_regions: true }
        } else {
            Capabilities { sealed_regions: false }
        }
    }
}

/// Page size reported by the kernel, compared against the compile-time
/// constant when the platform bridge initializes.
pub(crate) fn native_page_size() -> usize {
    unsafe { libc::sysconf(libc::_SC_PAGESIZE) as usize }
}

/// Creates a sealed memory region holding a copy of `bytes`.
///
/// The region is sealed against writes, shrinking, and growing, so no later
/// holder of the descriptor can alter the content other processes observe,
/// not even by remapping it writable.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn sealed_region_from_bytes(bytes: &[u8]) -> Result<OwnedFd> {
    use std::fs::File;
    use std::os::fd::FromRawFd;

    let fd = unsafe {
        libc::memfd_create(
            c"relro_region".as_ptr(),
            libc::MFD_CLOEXEC | libc::MFD_ALLOW_SEALING,
        )
    };
    if fd < 0 {
        return Err(map_error("memfd_create failed"));
    }
    let mut file = unsafe { File::from_raw_fd(fd) };
    file.write_all(bytes)
        .map_err(|_| map_error("shared region write failed"))?;
    let seals = libc::F_SEAL_SHRINK | libc::F_SEAL_GROW | libc::F_SEAL_WRITE | libc::F_SEAL_SEAL;
    if unsafe { libc::fcntl(file.as_raw_fd(), libc::F_ADD_SEALS, seals) } < 0 {
        return Err(map_error("sealing shared region failed"));
    }
    Ok(OwnedFd::from(file))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn sealed_region_from_bytes(_bytes: &[u8]) -> Result<OwnedFd> {
    Err(map_error("sealed memory regions are not supported on this platform"))
}

static REGION_SERIAL: AtomicU64 = AtomicU64::new(0);

/// Creates a file-backed shared region holding a copy of `bytes`, reopened
/// read-only. The directory entry is removed immediately; the descriptor
/// keeps the data alive. A read-only descriptor cannot be mapped writable.
pub(crate) fn file_region_from_bytes(bytes: &[u8]) -> Result<OwnedFd> {
    let serial = REGION_SERIAL.fetch_add(1, Ordering::Relaxed);
    let path = std::env::temp_dir().join(format!("relro-{}-{}", std::process::id(), serial));
    let result = (|| {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .map_err(|_| map_error("shared region file creation failed"))?;
        file.write_all(bytes)
            .map_err(|_| map_error("shared region write failed"))?;
        drop(file);
        let read_only = OpenOptions::new()
            .read(true)
            .open(&path)
            .map_err(|_| map_error("shared region reopen failed"))?;
        Ok(OwnedFd::from(read_only))
    })();
    // The name is no longer needed whether creation succeeded or not.
    let _ = std::fs::remove_file(&path);
    result
}

/// Finds the layout of an already loaded library whose path ends with
/// `file_name`, by walking the program headers the dynamic loader reports.
/// The RELRO span is zero-sized when the library carries none.
#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) fn loaded_library_layout(file_name: &str) -> Option<MappedLibrary> {
    use std::ffi::{CStr, c_int};

    struct Query<'a> {
        file_name: &'a str,
        found: Option<MappedLibrary>,
    }

    unsafe extern "C" fn visit(
        info: *mut libc::dl_phdr_info,
        _size: libc::size_t,
        data: *mut c_void,
    ) -> c_int {
        let query = unsafe { &mut *data.cast::<Query>() };
        let info = unsafe { &*info };
        if info.dlpi_name.is_null() {
            return 0;
        }
        let Ok(name) = unsafe { CStr::from_ptr(info.dlpi_name) }.to_str() else {
            return 0;
        };
        if name.is_empty() || !name.ends_with(query.file_name) {
            return 0;
        }
        let phdrs =
            unsafe { std::slice::from_raw_parts(info.dlpi_phdr, info.dlpi_phnum as usize) };
        let base = info.dlpi_addr as usize;
        let mut min_vaddr = usize::MAX;
        let mut max_vaddr = 0usize;
        let mut relro = None;
        for phdr in phdrs {
            let vaddr = phdr.p_vaddr as usize;
            let memsz = phdr.p_memsz as usize;
            match phdr.p_type {
                libc::PT_LOAD => {
                    min_vaddr = min_vaddr.min(vaddr);
                    max_vaddr = max_vaddr.max(vaddr + memsz);
                }
                libc::PT_GNU_RELRO => relro = Some((vaddr, memsz)),
                _ => {}
            }
        }
        if min_vaddr > max_vaddr {
            return 0;
        }
        let (relro_start, relro_size) = match relro {
            Some((vaddr, memsz)) => {
                let start = page_start(base + vaddr);
                (start, page_end(base + vaddr + memsz) - start)
            }
            None => (0, 0),
        };
        query.found = Some(MappedLibrary {
            load_address: base + page_start(min_vaddr),
            load_size: page_end(max_vaddr) - page_start(min_vaddr),
            relro_start,
            relro_size,
        });
        1
    }

    let mut query = Query { file_name, found: None };
    unsafe {
        libc::dl_iterate_phdr(Some(visit), (&mut query as *mut Query).cast::<c_void>());
    }
    query.found
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
pub(crate) fn loaded_library_layout(_file_name: &str) -> Option<MappedLibrary> {
    None
}
