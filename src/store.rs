//! External contracts the storage core consumes but does not own
//! (`spec.md` §6): a content-addressed block store, and the metadata
//! store's RPC-style file surface.

use async_trait::async_trait;

use crate::error::Result;
use crate::handle::{FileHandle, PayloadId};

/// Content-addressed object store consumed by the Transfer Manager.
/// `Put` is idempotent: putting the same hash twice is a no-op success.
#[async_trait]
pub trait BlockStore: Send + Sync {
    async fn put(&self, hash: &[u8; 32], data: &[u8]) -> Result<()>;
    async fn get(&self, hash: &[u8; 32]) -> Result<Vec<u8>>;
    async fn delete(&self, hash: &[u8; 32]) -> Result<()>;
}

/// Attributes the metadata store hands back for a file (`spec.md` §6); the
/// core treats this as opaque beyond what it needs to drive the cache.
#[derive(Debug, Clone)]
pub struct FileAttrs {
    pub payload: PayloadId,
    pub size: u64,
}

/// A prepared, not-yet-committed write (`spec.md` §6 "PrepareWrite(handle,
/// newSize) -> intent").
#[derive(Debug, Clone)]
pub struct WriteIntent {
    pub handle: FileHandle,
    pub payload: PayloadId,
    pub new_size: u64,
}

/// Everything needed to serve `READ`/`WRITE` against a payload
/// (`spec.md` §6 "PrepareRead(handle) -> {payloadID, size}").
#[derive(Debug, Clone, Copy)]
pub struct ReadIntent {
    pub payload: PayloadId,
    pub size: u64,
}

/// One entry in a directory listing (`SPEC_FULL.md` §6 READDIR).
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: String,
    pub handle: FileHandle,
    pub file_id: u64,
}

/// Metadata-layer RPC surface the core consumes but never rewrites or owns
/// (`spec.md` §6). Implemented by the export/namespace layer that sits
/// above this crate.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn get_file(&self, handle: &FileHandle) -> Result<FileAttrs>;
    async fn prepare_write(&self, handle: &FileHandle, new_size: u64) -> Result<WriteIntent>;
    async fn commit_write(&self, intent: &WriteIntent) -> Result<FileAttrs>;
    async fn prepare_read(&self, handle: &FileHandle) -> Result<ReadIntent>;

    /// Lists a directory's entries starting after `cookie` (0 means "from
    /// the start"), returning at most `max_entries`.
    async fn read_dir(&self, handle: &FileHandle, cookie: u64, max_entries: usize) -> Result<Vec<DirEntry>>;

    /// Decode an opaque wire handle into `(shareName, fileID)`.
    fn decode_file_handle(&self, handle: &FileHandle) -> Result<(String, u64)>;
}
