//! Opaque addressing types shared by every storage-core subsystem.
//!
//! A [`FileHandle`] names a file as far as NFS/NLM/SMB clients are
//! concerned; only the metadata layer (outside this crate) knows how to
//! turn one into a `(shareName, fileID)` pair. A [`PayloadId`] names a
//! file's content stream and is what the cache, WAL and transfer manager
//! actually key their state by.

use std::fmt;

/// Opaque, protocol-agnostic file handle.
///
/// Core components never inspect the bytes; they only use `FileHandle` as a
/// hashable/orderable key. Decoding is the metadata store's job (see
/// [`crate::store::MetadataStore::decode_file_handle`]).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileHandle(Vec<u8>);

impl FileHandle {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.0
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileHandle({})", hex_preview(&self.0))
    }
}

impl From<Vec<u8>> for FileHandle {
    fn from(bytes: Vec<u8>) -> Self {
        Self::new(bytes)
    }
}

/// Identifier for a file's content stream; one-to-one with a file until
/// copy-on-write creates a divergent identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PayloadId(pub u64);

impl fmt::Display for PayloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "payload:{:016x}", self.0)
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    let take = bytes.len().min(8);
    let mut out = String::with_capacity(take * 2 + 3);
    for b in &bytes[..take] {
        out.push_str(&format!("{:02x}", b));
    }
    if bytes.len() > take {
        out.push_str("..");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_handle_roundtrips_bytes() {
        let fh = FileHandle::new(vec![1, 2, 3, 4]);
        assert_eq!(fh.as_bytes(), &[1, 2, 3, 4]);
        assert_eq!(fh.clone().into_bytes(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn payload_id_formats_as_hex() {
        let id = PayloadId(0xabcd);
        assert_eq!(format!("{}", id), "payload:000000000000abcd");
    }
}
