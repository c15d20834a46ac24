//! Block Cache (`spec.md` §4.1): an in-memory page store keyed by
//! `(payload, chunk, block)`, tracking dirty/uploading/uploaded state and
//! enforcing a size budget with LRU eviction of uploaded, non-dirty blocks.

pub mod block;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use tracing::{debug, trace};

pub use block::{Block, BlockPos, BlockState, BLOCKS_PER_CHUNK, BLOCK_SIZE, CHUNK_SIZE};

use crate::error::{Error, Result};
use crate::handle::PayloadId;
use crate::wal::WalSink;

/// A gap in cached data the caller (the Payload Service, via the Transfer
/// Manager) must populate before a read can complete (`spec.md` §4.1).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    pub chunk_idx: u32,
    pub block_idx: u32,
    pub start: u32,
    pub end: u32,
}

/// Outcome of [`Cache::read_at`]: either the full range was cached, or a
/// list of gaps the caller must fill.
#[derive(Debug)]
pub enum ReadOutcome {
    Complete(usize),
    Gaps(Vec<Gap>),
}

#[derive(Default)]
struct Chunk {
    blocks: HashMap<u32, Block>,
}

struct FileEntry {
    chunks: HashMap<u32, Chunk>,
    total_size: u64,
}

impl FileEntry {
    fn new() -> Self {
        Self { chunks: HashMap::new(), total_size: 0 }
    }
}

/// Snapshot counters for the telemetry layer (`SPEC_FULL.md` §4.1 addition).
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub bytes_in_use: u64,
    pub blocks_pending: u64,
    pub blocks_uploading: u64,
    pub blocks_uploaded: u64,
    pub evictions: u64,
}

/// Global LRU tracker over `Uploaded`, non-dirty blocks only; `Pending` and
/// `Uploading` blocks are pinned and never appear here.
#[derive(Default)]
struct Lru {
    clock: u64,
    order: std::collections::BTreeMap<u64, BlockPos>,
    last_seen: HashMap<BlockPos, u64>,
}

impl Lru {
    fn touch(&mut self, pos: BlockPos) {
        if let Some(old) = self.last_seen.remove(&pos) {
            self.order.remove(&old);
        }
        self.clock += 1;
        self.order.insert(self.clock, pos);
        self.last_seen.insert(pos, self.clock);
    }

    fn remove(&mut self, pos: &BlockPos) {
        if let Some(old) = self.last_seen.remove(pos) {
            self.order.remove(&old);
        }
    }

    fn pop_oldest(&mut self) -> Option<BlockPos> {
        let (&key, &pos) = self.order.iter().next()?;
        self.order.remove(&key);
        self.last_seen.remove(&pos);
        Some(pos)
    }
}

/// The in-memory page store. Per-file mutexes serialize writes to a single
/// payload (`spec.md` §5); a single global mutex guards the LRU/eviction
/// bookkeeping and byte budget.
pub struct Cache {
    files: RwLock<HashMap<PayloadId, Arc<Mutex<FileEntry>>>>,
    lru: Mutex<Lru>,
    bytes_in_use: AtomicU64,
    budget: u64,
    evictions: AtomicU64,
    wal: Arc<dyn WalSink>,
}

impl Cache {
    pub fn new(budget_bytes: u64, wal: Arc<dyn WalSink>) -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            lru: Mutex::new(Lru::default()),
            bytes_in_use: AtomicU64::new(0),
            budget: budget_bytes,
            evictions: AtomicU64::new(0),
            wal,
        }
    }

    fn file_entry(&self, payload: PayloadId) -> Arc<Mutex<FileEntry>> {
        if let Some(entry) = self.files.read().unwrap().get(&payload) {
            return entry.clone();
        }
        let mut files = self.files.write().unwrap();
        files.entry(payload).or_insert_with(|| Arc::new(Mutex::new(FileEntry::new()))).clone()
    }

    fn locate(offset: u64) -> (u32, u32, u32) {
        let chunk_idx = (offset / CHUNK_SIZE) as u32;
        let within_chunk = offset % CHUNK_SIZE;
        let block_idx = (within_chunk / BLOCK_SIZE as u64) as u32;
        let offset_in_block = (within_chunk % BLOCK_SIZE as u64) as u32;
        (chunk_idx, block_idx, offset_in_block)
    }

    /// Split `[offset, offset+data.len())` across affected blocks, write
    /// each, demoting `Uploaded` blocks to `Pending`; record every
    /// sub-write to the WAL before returning; evict if over budget.
    pub fn write_at(&self, payload: PayloadId, offset: u64, data: &[u8]) -> Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        let entry = self.file_entry(payload);
        let mut file = entry.lock().unwrap();

        let mut written = 0usize;
        let mut cursor = offset;
        let mut remaining = data;

        while !remaining.is_empty() {
            let (chunk_idx, block_idx, offset_in_block) = Self::locate(cursor);
            let space_in_block = BLOCK_SIZE - offset_in_block as usize;
            let take = remaining.len().min(space_in_block);
            let (piece, rest) = remaining.split_at(take);

            let chunk = file.chunks.entry(chunk_idx).or_default();
            let was_new = !chunk.blocks.contains_key(&block_idx);
            let block = chunk.blocks.entry(block_idx).or_insert_with(Block::new);
            let was_uploaded = matches!(block.state, BlockState::Uploaded);

            block.write(offset_in_block, piece);

            self.wal.append_block_write(payload, chunk_idx, block_idx, offset_in_block, piece)?;

            let pos = BlockPos { payload, chunk_idx, block_idx };
            if was_new {
                self.bytes_in_use.fetch_add(BLOCK_SIZE as u64, Ordering::SeqCst);
            }
            if was_uploaded {
                // Demoted: no longer evictable, drop it from the LRU.
                self.lru.lock().unwrap().remove(&pos);
            }

            written += piece.len();
            cursor += take as u64;
            remaining = rest;
        }

        file.total_size = file.total_size.max(offset + data.len() as u64);

        drop(file);
        self.enforce_budget()?;
        Ok(written)
    }

    /// Assemble bytes from present blocks; returns the gaps the caller must
    /// populate via [`Cache::populate_block`] before retrying.
    pub fn read_at(&self, payload: PayloadId, offset: u64, buf: &mut [u8]) -> Result<ReadOutcome> {
        if buf.is_empty() {
            return Ok(ReadOutcome::Complete(0));
        }
        let entry = self.file_entry(payload);
        let mut file = entry.lock().unwrap();

        let mut gaps = Vec::new();
        let mut cursor = offset;
        let mut filled = 0usize;
        let end_offset = offset + buf.len() as u64;

        while cursor < end_offset {
            let (chunk_idx, block_idx, offset_in_block) = Self::locate(cursor);
            let space_in_block = BLOCK_SIZE - offset_in_block as usize;
            let want = ((end_offset - cursor) as usize).min(space_in_block);

            match file.chunks.get_mut(&chunk_idx).and_then(|c| c.blocks.get_mut(&block_idx)) {
                Some(block) => {
                    let want_end = offset_in_block + want as u32;
                    let block_gaps = block.valid.gaps(offset_in_block, want_end);
                    if block_gaps.is_empty() {
                        let dst_start = (cursor - offset) as usize;
                        buf[dst_start..dst_start + want]
                            .copy_from_slice(&block.data[offset_in_block as usize..offset_in_block as usize + want]);
                        filled += want;
                        self.lru.lock().unwrap().touch(BlockPos { payload, chunk_idx, block_idx });
                    } else {
                        for (s, e) in block_gaps {
                            gaps.push(Gap { chunk_idx, block_idx, start: s, end: e });
                        }
                    }
                }
                None => {
                    gaps.push(Gap { chunk_idx, block_idx, start: offset_in_block, end: offset_in_block + want as u32 });
                }
            }

            cursor += want as u64;
        }

        if gaps.is_empty() {
            Ok(ReadOutcome::Complete(filled))
        } else {
            Ok(ReadOutcome::Gaps(gaps))
        }
    }

    /// Insert a block fetched from the block store in `Uploaded` state.
    pub fn populate_block(&self, payload: PayloadId, chunk_idx: u32, block_idx: u32, data: &[u8], hash: [u8; 32]) {
        let entry = self.file_entry(payload);
        let mut file = entry.lock().unwrap();
        let chunk = file.chunks.entry(chunk_idx).or_default();
        let was_new = !chunk.blocks.contains_key(&block_idx);
        let block = chunk.blocks.entry(block_idx).or_insert_with(Block::new);

        // A concurrent write may already have demoted this slot; only
        // populate bytes we don't already have.
        for (s, e) in block.valid.gaps(0, data.len() as u32) {
            block.data[s as usize..e as usize].copy_from_slice(&data[s as usize..e as usize]);
            block.valid.insert(s, e);
        }
        if matches!(block.state, BlockState::Pending) && block.valid.covers(0, data.len() as u32) {
            block.state = BlockState::Uploaded;
            block.hash = Some(hash);
        }

        if was_new {
            self.bytes_in_use.fetch_add(BLOCK_SIZE as u64, Ordering::SeqCst);
        }
        if matches!(block.state, BlockState::Uploaded) {
            self.lru.lock().unwrap().touch(BlockPos { payload, chunk_idx, block_idx });
        }
    }

    /// Acquire a Pending block for upload: returns its data snapshot and
    /// version, and transitions it to `Uploading`.
    pub fn mark_uploading(&self, payload: PayloadId, chunk_idx: u32, block_idx: u32) -> Option<(Vec<u8>, u32)> {
        let entry = self.file_entry(payload);
        let mut file = entry.lock().unwrap();
        let block = file.chunks.get_mut(&chunk_idx)?.blocks.get_mut(&block_idx)?;
        if !matches!(block.state, BlockState::Pending) {
            return None;
        }
        block.state = BlockState::Uploading;
        let size = block.size() as usize;
        Some((block.data[..size].to_vec(), block.version))
    }

    /// Mark a block uploaded, but only if `version` still matches — a
    /// concurrent write bumps the version and this call is dropped
    /// (`spec.md` §4.1/§4.3).
    pub fn mark_uploaded(&self, payload: PayloadId, chunk_idx: u32, block_idx: u32, version: u32, hash: [u8; 32]) -> bool {
        let entry = self.file_entry(payload);
        let mut file = entry.lock().unwrap();
        let Some(block) = file.chunks.get_mut(&chunk_idx).and_then(|c| c.blocks.get_mut(&block_idx)) else {
            return false;
        };
        if block.version != version {
            trace!(?payload, chunk_idx, block_idx, "stale MarkUploaded dropped");
            return false;
        }
        block.state = BlockState::Uploaded;
        block.hash = Some(hash);
        drop(file);
        self.lru.lock().unwrap().touch(BlockPos { payload, chunk_idx, block_idx });
        true
    }

    /// Revert an `Uploading` block back to `Pending` (e.g. the store
    /// request failed and must be retried).
    pub fn revert_to_pending(&self, payload: PayloadId, chunk_idx: u32, block_idx: u32) {
        let entry = self.file_entry(payload);
        let mut file = entry.lock().unwrap();
        if let Some(block) = file.chunks.get_mut(&chunk_idx).and_then(|c| c.blocks.get_mut(&block_idx)) {
            if matches!(block.state, BlockState::Uploading) {
                block.state = BlockState::Pending;
            }
        }
    }

    /// Stream of `(chunk_idx, block_idx)` for every dirty (non-Uploaded)
    /// block of a payload — used by flush/recovery.
    pub fn iterate_dirty(&self, payload: PayloadId) -> Vec<(u32, u32)> {
        let entry = self.file_entry(payload);
        let file = entry.lock().unwrap();
        let mut out = Vec::new();
        for (&chunk_idx, chunk) in &file.chunks {
            for (&block_idx, block) in &chunk.blocks {
                if block.is_dirty() {
                    out.push((chunk_idx, block_idx));
                }
            }
        }
        out
    }

    pub fn truncate(&self, payload: PayloadId, new_size: u64) {
        let entry = self.file_entry(payload);
        let mut file = entry.lock().unwrap();
        file.total_size = new_size;
        let last_chunk = (new_size / CHUNK_SIZE) as u32;
        file.chunks.retain(|&idx, _| idx <= last_chunk);
    }

    pub fn remove(&self, payload: PayloadId) -> Result<()> {
        self.wal.append_remove(payload)?;
        let mut files = self.files.write().unwrap();
        if let Some(entry) = files.remove(&payload) {
            let file = entry.lock().unwrap();
            let mut freed = 0u64;
            let mut lru = self.lru.lock().unwrap();
            for (&chunk_idx, chunk) in &file.chunks {
                for &block_idx in chunk.blocks.keys() {
                    lru.remove(&BlockPos { payload, chunk_idx, block_idx });
                    freed += BLOCK_SIZE as u64;
                }
            }
            self.bytes_in_use.fetch_sub(freed, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Evict `Uploaded`, non-dirty blocks in LRU order until within budget.
    /// Fails with `ErrCacheFull` if over budget and nothing is evictable.
    fn enforce_budget(&self) -> Result<()> {
        loop {
            if self.bytes_in_use.load(Ordering::SeqCst) <= self.budget {
                return Ok(());
            }
            let Some(pos) = self.lru.lock().unwrap().pop_oldest() else {
                return Err(Error::CacheFull);
            };
            let entry = self.file_entry(pos.payload);
            let mut file = entry.lock().unwrap();
            if let Some(chunk) = file.chunks.get_mut(&pos.chunk_idx) {
                if let Some(block) = chunk.blocks.get(&pos.block_idx) {
                    if matches!(block.state, BlockState::Uploaded) {
                        chunk.blocks.remove(&pos.block_idx);
                        self.bytes_in_use.fetch_sub(BLOCK_SIZE as u64, Ordering::SeqCst);
                        self.evictions.fetch_add(1, Ordering::SeqCst);
                        debug!(?pos.payload, pos.chunk_idx, pos.block_idx, "evicted uploaded block");
                    }
                }
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let files = self.files.read().unwrap();
        let mut stats = CacheStats { bytes_in_use: self.bytes_in_use.load(Ordering::SeqCst), evictions: self.evictions.load(Ordering::SeqCst), ..Default::default() };
        for entry in files.values() {
            let file = entry.lock().unwrap();
            for chunk in file.chunks.values() {
                for block in chunk.blocks.values() {
                    match block.state {
                        BlockState::Pending => stats.blocks_pending += 1,
                        BlockState::Uploading => stats.blocks_uploading += 1,
                        BlockState::Uploaded => stats.blocks_uploaded += 1,
                    }
                }
            }
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FakeWal {
        writes: StdMutex<Vec<(PayloadId, u32, u32, u32, Vec<u8>)>>,
    }

    impl FakeWal {
        fn new() -> Arc<Self> {
            Arc::new(Self { writes: StdMutex::new(Vec::new()) })
        }
    }

    impl WalSink for FakeWal {
        fn append_block_write(&self, payload: PayloadId, chunk_idx: u32, block_idx: u32, offset_in_block: u32, data: &[u8]) -> Result<()> {
            self.writes.lock().unwrap().push((payload, chunk_idx, block_idx, offset_in_block, data.to_vec()));
            Ok(())
        }
        fn append_block_uploaded(&self, _p: PayloadId, _c: u32, _b: u32) -> Result<()> {
            Ok(())
        }
        fn append_remove(&self, _p: PayloadId) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn write_then_read_reconstructs_bytes() {
        let wal = FakeWal::new();
        let cache = Cache::new(u64::MAX, wal);
        let payload = PayloadId(1);

        cache.write_at(payload, 0, b"hello").unwrap();
        cache.write_at(payload, 5, b"world").unwrap();

        let mut buf = [0u8; 10];
        match cache.read_at(payload, 0, &mut buf).unwrap() {
            ReadOutcome::Complete(n) => assert_eq!(n, 10),
            ReadOutcome::Gaps(g) => panic!("unexpected gaps: {g:?}"),
        }
        assert_eq!(&buf, b"helloworld");
    }

    #[test]
    fn read_miss_reports_gap() {
        let wal = FakeWal::new();
        let cache = Cache::new(u64::MAX, wal);
        let payload = PayloadId(2);

        let mut buf = [0u8; 4];
        match cache.read_at(payload, 0, &mut buf).unwrap() {
            ReadOutcome::Gaps(gaps) => assert_eq!(gaps.len(), 1),
            ReadOutcome::Complete(_) => panic!("expected a gap"),
        }
    }

    #[test]
    fn write_after_upload_demotes_block_and_cancels_stale_mark() {
        let wal = FakeWal::new();
        let cache = Cache::new(u64::MAX, wal);
        let payload = PayloadId(3);

        cache.write_at(payload, 0, b"v1-data-").unwrap();
        let (_, version) = cache.mark_uploading(payload, 0, 0).unwrap();

        // Concurrent write supersedes the in-flight upload.
        cache.write_at(payload, 0, b"v2-data!").unwrap();

        // The stale MarkUploaded from the superseded upload must be dropped.
        assert!(!cache.mark_uploaded(payload, 0, 0, version, [0u8; 32]));

        let mut buf = [0u8; 8];
        cache.read_at(payload, 0, &mut buf).unwrap();
        assert_eq!(&buf, b"v2-data!");
    }

    #[test]
    fn eviction_only_touches_uploaded_blocks() {
        let wal = FakeWal::new();
        // Budget for exactly one block.
        let cache = Cache::new(BLOCK_SIZE as u64, wal);

        cache.write_at(PayloadId(10), 0, b"aaaa").unwrap();
        let (_, v0) = cache.mark_uploading(PayloadId(10), 0, 0).unwrap();
        assert!(cache.mark_uploaded(PayloadId(10), 0, 0, v0, [1u8; 32]));

        // Writing a second file's block should evict the first (Uploaded).
        cache.write_at(PayloadId(11), 0, b"bbbb").unwrap();

        let mut buf = [0u8; 4];
        match cache.read_at(PayloadId(10), 0, &mut buf).unwrap() {
            ReadOutcome::Gaps(_) => {} // evicted, correctly reported as a gap
            ReadOutcome::Complete(_) => panic!("expected eviction to create a gap"),
        }
    }

    #[test]
    fn cache_full_when_nothing_evictable() {
        let wal = FakeWal::new();
        let cache = Cache::new(BLOCK_SIZE as u64, wal);
        cache.write_at(PayloadId(1), 0, b"pending-data").unwrap();
        // Second payload's block can't fit and the first is Pending (pinned).
        let err = cache.write_at(PayloadId(2), 0, b"more-data").unwrap_err();
        assert!(matches!(err, Error::CacheFull));
    }
}
