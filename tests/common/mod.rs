#![allow(dead_code)]

use relro_linker::mapper::{LibraryMapper, MappedLibrary};
use relro_linker::mmap::{MapFlags, Mmap, ProtFlags, DefaultMmap};
use relro_linker::{Error, Result};
use std::collections::HashMap;
use std::ffi::c_void;
use std::ptr::NonNull;
use std::sync::Mutex;

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Shape of one fake library image: total span plus the RELRO subrange.
/// All values are multiples of the page size.
#[derive(Clone, Copy)]
pub struct ImageSpec {
    pub size: usize,
    pub relro_offset: usize,
    pub relro_size: usize,
}

/// A loader primitive standing in for the OS loader: "loading" maps an
/// anonymous range and fills it with bytes that depend on the image name
/// and the load address, the way relocated pointers do. Loading at an
/// occupied fixed address fails, like the real thing.
pub struct ImageMapper {
    images: HashMap<String, ImageSpec>,
    mapped: Mutex<Vec<(usize, usize)>>,
}

impl ImageMapper {
    pub fn new() -> Self {
        ImageMapper {
            images: HashMap::new(),
            mapped: Mutex::new(Vec::new()),
        }
    }

    pub fn register(mut self, name: &str, spec: ImageSpec) -> Self {
        self.images.insert(name.to_owned(), spec);
        self
    }

    pub fn unmap_all(&self) {
        let mut mapped = self.mapped.lock().unwrap();
        for (addr, len) in mapped.drain(..) {
            let ptr = NonNull::new(addr as *mut c_void).unwrap();
            unsafe { DefaultMmap::munmap(ptr, len) }.unwrap();
        }
    }
}

impl Drop for ImageMapper {
    fn drop(&mut self) {
        self.unmap_all();
    }
}

impl LibraryMapper for ImageMapper {
    fn map_library(&self, path: &str, address: Option<usize>) -> Result<MappedLibrary> {
        let spec = self.images.get(path).ok_or_else(|| Error::Load {
            msg: format!("unknown image {path}").into(),
        })?;
        let ptr = unsafe {
            DefaultMmap::mmap_anonymous(
                address,
                spec.size,
                ProtFlags::PROT_READ | ProtFlags::PROT_WRITE,
                MapFlags::MAP_PRIVATE,
            )
        }?;
        let addr = ptr.as_ptr() as usize;
        if let Some(want) = address
            && addr != want
        {
            unsafe { DefaultMmap::munmap(ptr, spec.size) }.unwrap();
            return Err(Error::Load {
                msg: format!("address 0x{want:x} is unavailable").into(),
            });
        }
        let image = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr().cast::<u8>(), spec.size) };
        image.copy_from_slice(&image_bytes(path, addr, spec.size));
        let relro_start = addr + spec.relro_offset;
        unsafe {
            DefaultMmap::mprotect(
                NonNull::new(relro_start as *mut c_void).unwrap(),
                spec.relro_size,
                ProtFlags::PROT_READ,
            )
        }?;
        self.mapped.lock().unwrap().push((addr, spec.size));
        Ok(MappedLibrary {
            load_address: addr,
            load_size: spec.size,
            relro_start,
            relro_size: spec.relro_size,
        })
    }
}

/// The content a fake image has when loaded at `base`. Deterministic in
/// (name, base), so two processes of a group produce identical bytes at
/// the same address and different bytes elsewhere.
pub fn image_bytes(name: &str, base: usize, len: usize) -> Vec<u8> {
    let mut h = 0xcbf2_9ce4_8422_2325u64;
    for b in name.bytes() {
        h ^= b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    let mut state = (h ^ base as u64) | 1;
    let mut out = Vec::with_capacity(len + 8);
    while out.len() < len {
        state ^= state << 13;
        state ^= state >> 7;
        state ^= state << 17;
        out.extend_from_slice(&state.to_le_bytes());
    }
    out.truncate(len);
    out
}

/// The RELRO bytes a fake image has for the given recorded layout.
pub fn relro_bytes(name: &str, layout: MappedLibrary) -> Vec<u8> {
    let image = image_bytes(name, layout.load_address, layout.load_size);
    let offset = layout.relro_start - layout.load_address;
    image[offset..offset + layout.relro_size].to_vec()
}

/// An mmap backend whose address-space reservation always fails, for
/// exercising the negotiator failure path.
pub struct NoReserveMmap;

impl Mmap for NoReserveMmap {
    unsafe fn mmap_fd(
        addr: Option<usize>,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
        fd: std::os::fd::BorrowedFd<'_>,
        offset: usize,
    ) -> Result<NonNull<c_void>> {
        unsafe { DefaultMmap::mmap_fd(addr, len, prot, flags, fd, offset) }
    }

    unsafe fn mmap_anonymous(
        addr: Option<usize>,
        len: usize,
        prot: ProtFlags,
        flags: MapFlags,
    ) -> Result<NonNull<c_void>> {
        unsafe { DefaultMmap::mmap_anonymous(addr, len, prot, flags) }
    }

    unsafe fn munmap(addr: NonNull<c_void>, len: usize) -> Result<()> {
        unsafe { DefaultMmap::munmap(addr, len) }
    }

    unsafe fn mprotect(addr: NonNull<c_void>, len: usize, prot: ProtFlags) -> Result<()> {
        unsafe { DefaultMmap::mprotect(addr, len, prot) }
    }

    unsafe fn mmap_reserve(_len: usize) -> Result<NonNull<c_void>> {
        Err(Error::Mmap {
            msg: "address space reservation failed".into(),
        })
    }
}
