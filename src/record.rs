//! Records describing loaded libraries and their cross-process transport.
//!
//! A [`LibraryRecord`] captures one library's memory layout plus exclusive
//! ownership of the descriptor for its shared RELRO region, if one was
//! produced. Serializing a record into a [`RecordEnvelope`] detaches the
//! handle from the source, so exactly one live owner exists at any time.
//!
//! A [`RelroPackage`] is the ordered collection of named envelopes a
//! producer sends to its consumers. The byte encoding carries the layout
//! integers; owned descriptors travel in a parallel vector, in entry order,
//! the way the platform channel attaches them to a message.

use crate::error::transfer_error;
use crate::mapper::MappedLibrary;
use crate::region::RelroHandle;
use crate::Result;
use std::os::fd::OwnedFd;

/// Number of bytes one encoded envelope occupies on the wire: four layout
/// words plus a descriptor-present flag, little-endian.
pub const ENVELOPE_BYTES: usize = 5 * 8;

/// Describes one library loaded by the coordinated loader.
///
/// The record owns the shared RELRO descriptor exclusively until it is
/// transferred (serialized into an envelope, or packaged for another
/// process) or the record is dropped, which closes it.
#[derive(Debug)]
pub struct LibraryRecord {
    load_address: usize,
    load_size: usize,
    relro_start: usize,
    relro_size: usize,
    relro: Option<RelroHandle>,
}

impl LibraryRecord {
    /// Creates a record for a freshly mapped library, with no shared RELRO
    /// produced yet.
    pub fn new(layout: MappedLibrary) -> Self {
        if layout.relro_size != 0 {
            debug_assert!(layout.relro_start >= layout.load_address);
            debug_assert!(
                layout.relro_start + layout.relro_size <= layout.load_address + layout.load_size
            );
        }
        LibraryRecord {
            load_address: layout.load_address,
            load_size: layout.load_size,
            relro_start: layout.relro_start,
            relro_size: layout.relro_size,
            relro: None,
        }
    }

    /// The library's memory layout.
    #[inline]
    pub fn layout(&self) -> MappedLibrary {
        MappedLibrary {
            load_address: self.load_address,
            load_size: self.load_size,
            relro_start: self.relro_start,
            relro_size: self.relro_size,
        }
    }

    /// The shared RELRO handle, if this record currently owns one.
    #[inline]
    pub fn relro_handle(&self) -> Option<&RelroHandle> {
        self.relro.as_ref()
    }

    #[inline]
    pub(crate) fn set_relro_handle(&mut self, handle: RelroHandle) {
        debug_assert!(self.relro.is_none());
        self.relro = Some(handle);
    }

    /// Moves this record into a transport envelope. The handle, if any, is
    /// detached from the record and owned by the envelope afterwards.
    pub fn serialize(&mut self) -> RecordEnvelope {
        RecordEnvelope {
            load_address: self.load_address,
            load_size: self.load_size,
            relro_start: self.relro_start,
            relro_size: self.relro_size,
            handle: self.relro.take(),
        }
    }
}

/// The exchangeable form of a [`LibraryRecord`].
#[derive(Debug)]
pub struct RecordEnvelope {
    load_address: usize,
    load_size: usize,
    relro_start: usize,
    relro_size: usize,
    handle: Option<RelroHandle>,
}

impl RecordEnvelope {
    /// The layout the source record described.
    #[inline]
    pub fn layout(&self) -> MappedLibrary {
        MappedLibrary {
            load_address: self.load_address,
            load_size: self.load_size,
            relro_start: self.relro_start,
            relro_size: self.relro_size,
        }
    }

    /// The transported handle, if one was attached.
    #[inline]
    pub fn relro_handle(&self) -> Option<&RelroHandle> {
        self.handle.as_ref()
    }

    #[inline]
    pub(crate) fn take_relro_handle(&mut self) -> Option<RelroHandle> {
        self.handle.take()
    }

    /// Rebuilds a record on the receiving side. The new record exclusively
    /// owns the transported handle.
    pub fn deserialize(self) -> LibraryRecord {
        LibraryRecord {
            load_address: self.load_address,
            load_size: self.load_size,
            relro_start: self.relro_start,
            relro_size: self.relro_size,
            relro: self.handle,
        }
    }

    fn to_bytes(&self) -> [u8; ENVELOPE_BYTES] {
        let mut bytes = [0u8; ENVELOPE_BYTES];
        let words = [
            self.load_address as u64,
            self.load_size as u64,
            self.relro_start as u64,
            self.relro_size as u64,
            self.handle.is_some() as u64,
        ];
        for (chunk, word) in bytes.chunks_exact_mut(8).zip(words) {
            chunk.copy_from_slice(&word.to_le_bytes());
        }
        bytes
    }

    fn from_bytes(bytes: &[u8], fd: Option<OwnedFd>) -> Result<Self> {
        if bytes.len() != ENVELOPE_BYTES {
            return Err(transfer_error("envelope has the wrong length"));
        }
        let mut words = [0u64; 5];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(8)) {
            let mut le = [0u8; 8];
            le.copy_from_slice(chunk);
            *word = u64::from_le_bytes(le);
        }
        let handle = match (words[4], fd) {
            (0, None) => None,
            (1, Some(fd)) => Some(RelroHandle::from(fd)),
            (0, Some(_)) => return Err(transfer_error("stray descriptor for envelope")),
            (1, None) => return Err(transfer_error("missing descriptor for envelope")),
            _ => return Err(transfer_error("corrupt descriptor flag in envelope")),
        };
        Ok(RecordEnvelope {
            load_address: words[0] as usize,
            load_size: words[1] as usize,
            relro_start: words[2] as usize,
            relro_size: words[3] as usize,
            handle,
        })
    }
}

/// An ordered collection of (library name, envelope) pairs, one per library
/// a producer packaged for transfer.
#[derive(Debug, Default)]
pub struct RelroPackage {
    entries: Vec<(String, RecordEnvelope)>,
}

impl RelroPackage {
    pub fn new() -> Self {
        RelroPackage::default()
    }

    /// Appends an envelope under `name`. Names are expected to be unique;
    /// adoption consumes the first match.
    pub fn insert(&mut self, name: impl Into<String>, envelope: RecordEnvelope) {
        self.entries.push((name.into(), envelope));
    }

    /// Looks up the envelope for `name`.
    pub fn get(&self, name: &str) -> Option<&RecordEnvelope> {
        self.entries
            .iter()
            .find(|(entry, _)| entry == name)
            .map(|(_, envelope)| envelope)
    }

    /// Removes and returns the envelope for `name`.
    pub(crate) fn take(&mut self, name: &str) -> Option<RecordEnvelope> {
        let index = self.entries.iter().position(|(entry, _)| entry == name)?;
        Some(self.entries.remove(index).1)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The library names in the package, in transfer order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    /// Encodes the package for the platform channel.
    ///
    /// Returns the byte stream (entry count, then length-prefixed names and
    /// fixed-size envelopes) and the owned descriptors to attach, in entry
    /// order. Encoding consumes the package: every handle moves into the
    /// descriptor vector.
    pub fn encode(self) -> (Vec<u8>, Vec<OwnedFd>) {
        let mut bytes = Vec::new();
        let mut fds = Vec::new();
        put_u64(&mut bytes, self.entries.len() as u64);
        for (name, mut envelope) in self.entries {
            put_u64(&mut bytes, name.len() as u64);
            bytes.extend_from_slice(name.as_bytes());
            bytes.extend_from_slice(&envelope.to_bytes());
            if let Some(handle) = envelope.take_relro_handle() {
                fds.push(OwnedFd::from(handle));
            }
        }
        (bytes, fds)
    }

    /// Decodes a package received from the platform channel, claiming the
    /// attached descriptors in entry order.
    pub fn decode(bytes: &[u8], fds: Vec<OwnedFd>) -> Result<Self> {
        let mut cursor = 0usize;
        let mut fds = fds.into_iter();
        let count = read_u64(bytes, &mut cursor)?;
        let mut entries = Vec::new();
        for _ in 0..count {
            let name_len = read_u64(bytes, &mut cursor)? as usize;
            let name = std::str::from_utf8(read_slice(bytes, &mut cursor, name_len)?)
                .map_err(|_| transfer_error("package entry name is not valid utf-8"))?
                .to_owned();
            let raw = read_slice(bytes, &mut cursor, ENVELOPE_BYTES)?;
            let wants_fd = raw[ENVELOPE_BYTES - 8] != 0;
            let fd = if wants_fd { fds.next() } else { None };
            entries.push((name, RecordEnvelope::from_bytes(raw, fd)?));
        }
        if cursor != bytes.len() {
            return Err(transfer_error("trailing bytes in package"));
        }
        if fds.next().is_some() {
            return Err(transfer_error("unclaimed descriptors in package"));
        }
        Ok(RelroPackage { entries })
    }
}

fn put_u64(buf: &mut Vec<u8>, value: u64) {
    buf.extend_from_slice(&value.to_le_bytes());
}

fn read_u64(bytes: &[u8], cursor: &mut usize) -> Result<u64> {
    let raw = read_slice(bytes, cursor, 8)?;
    let mut le = [0u8; 8];
    le.copy_from_slice(raw);
    Ok(u64::from_le_bytes(le))
}

fn read_slice<'a>(bytes: &'a [u8], cursor: &mut usize, len: usize) -> Result<&'a [u8]> {
    let end = cursor
        .checked_add(len)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| transfer_error("package is truncated"))?;
    let slice = &bytes[*cursor..end];
    *cursor = end;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> MappedLibrary {
        MappedLibrary {
            load_address: 0x7000_0000,
            load_size: 0x2000,
            relro_start: 0x7000_1000,
            relro_size: 0x400,
        }
    }

    #[test]
    fn envelope_roundtrip_without_handle() {
        let mut record = LibraryRecord::new(layout());
        let envelope = record.serialize();
        let raw = envelope.to_bytes();
        let decoded = RecordEnvelope::from_bytes(&raw, None).unwrap();
        assert_eq!(decoded.layout(), layout());
        assert!(decoded.relro_handle().is_none());
    }

    #[test]
    fn envelope_rejects_wrong_length() {
        assert!(RecordEnvelope::from_bytes(&[0u8; 7], None).is_err());
    }

    #[test]
    fn package_roundtrip_without_handles() {
        let mut package = RelroPackage::new();
        package.insert("libfoo.so", LibraryRecord::new(layout()).serialize());
        package.insert("libbar.so", LibraryRecord::new(layout()).serialize());
        let (bytes, fds) = package.encode();
        assert!(fds.is_empty());
        let decoded = RelroPackage::decode(&bytes, fds).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded.names().collect::<Vec<_>>(), ["libfoo.so", "libbar.so"]);
        assert_eq!(decoded.get("libfoo.so").unwrap().layout(), layout());
    }

    #[test]
    fn package_rejects_truncation_and_trailing_bytes() {
        let mut package = RelroPackage::new();
        package.insert("libfoo.so", LibraryRecord::new(layout()).serialize());
        let (bytes, _) = package.encode();
        assert!(RelroPackage::decode(&bytes[..bytes.len() - 1], Vec::new()).is_err());
        let mut padded = bytes.clone();
        padded.push(0);
        assert!(RelroPackage::decode(&padded, Vec::new()).is_err());
    }
}
