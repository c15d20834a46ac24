//! WAL Persister (`spec.md` §4.2): an append-only, memory-mapped log of
//! block writes, upload markers, and file removals. Recovery replays the
//! log into the cache.

use std::fs::OpenOptions;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use byteorder::{ByteOrder, LittleEndian};
use memmap2::MmapMut;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::handle::PayloadId;

/// Magic bytes identifying a DittoFS WAL file (`spec.md` §6).
pub const MAGIC: &[u8; 4] = b"DTTC";
/// On-disk format version.
pub const VERSION: u32 = 2;
/// Fixed 64-byte header (`spec.md` §3).
pub const HEADER_SIZE: usize = 64;

const TAG_BLOCK_WRITE: u8 = 0x00;
const TAG_BLOCK_UPLOADED: u8 = 0x01;
const TAG_REMOVE: u8 = 0x03;

/// A single WAL record (`spec.md` §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WalRecord {
    BlockWrite { payload: PayloadId, chunk_idx: u32, block_idx: u32, offset_in_block: u32, data: Vec<u8> },
    BlockUploaded { payload: PayloadId, chunk_idx: u32, block_idx: u32 },
    Remove { payload: PayloadId },
}

impl WalRecord {
    fn tag(&self) -> u8 {
        match self {
            WalRecord::BlockWrite { .. } => TAG_BLOCK_WRITE,
            WalRecord::BlockUploaded { .. } => TAG_BLOCK_UPLOADED,
            WalRecord::Remove { .. } => TAG_REMOVE,
        }
    }

    fn encode_body(&self) -> Vec<u8> {
        let mut body = Vec::new();
        match self {
            WalRecord::BlockWrite { payload, chunk_idx, block_idx, offset_in_block, data } => {
                push_u64(&mut body, payload.0);
                push_u32(&mut body, *chunk_idx);
                push_u32(&mut body, *block_idx);
                push_u32(&mut body, *offset_in_block);
                push_u32(&mut body, data.len() as u32);
                body.extend_from_slice(data);
            }
            WalRecord::BlockUploaded { payload, chunk_idx, block_idx } => {
                push_u64(&mut body, payload.0);
                push_u32(&mut body, *chunk_idx);
                push_u32(&mut body, *block_idx);
            }
            WalRecord::Remove { payload } => {
                push_u64(&mut body, payload.0);
            }
        }
        body
    }

    fn decode(tag: u8, body: &[u8]) -> Result<Self> {
        match tag {
            TAG_BLOCK_WRITE => {
                if body.len() < 20 {
                    return Err(Error::Corrupted("short BlockWrite body".into()));
                }
                let payload = PayloadId(LittleEndian::read_u64(&body[0..8]));
                let chunk_idx = LittleEndian::read_u32(&body[8..12]);
                let block_idx = LittleEndian::read_u32(&body[12..16]);
                let offset_in_block = LittleEndian::read_u32(&body[16..20]);
                let data_len = LittleEndian::read_u32(&body[20..24]) as usize;
                if body.len() < 24 + data_len {
                    return Err(Error::Corrupted("truncated BlockWrite data".into()));
                }
                let data = body[24..24 + data_len].to_vec();
                Ok(WalRecord::BlockWrite { payload, chunk_idx, block_idx, offset_in_block, data })
            }
            TAG_BLOCK_UPLOADED => {
                if body.len() < 16 {
                    return Err(Error::Corrupted("short BlockUploaded body".into()));
                }
                let payload = PayloadId(LittleEndian::read_u64(&body[0..8]));
                let chunk_idx = LittleEndian::read_u32(&body[8..12]);
                let block_idx = LittleEndian::read_u32(&body[12..16]);
                Ok(WalRecord::BlockUploaded { payload, chunk_idx, block_idx })
            }
            TAG_REMOVE => {
                if body.len() < 8 {
                    return Err(Error::Corrupted("short Remove body".into()));
                }
                Ok(WalRecord::Remove { payload: PayloadId(LittleEndian::read_u64(&body[0..8])) })
            }
            other => Err(Error::Corrupted(format!("unknown record tag {other}"))),
        }
    }
}

fn push_u32(buf: &mut Vec<u8>, v: u32) {
    let mut tmp = [0u8; 4];
    LittleEndian::write_u32(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

fn push_u64(buf: &mut Vec<u8>, v: u64) {
    let mut tmp = [0u8; 8];
    LittleEndian::write_u64(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

/// Result of [`WalPersister::recover`]: the writes to replay, and the set
/// of blocks already known uploaded.
#[derive(Debug, Default)]
pub struct RecoveredState {
    pub entries: Vec<WalRecord>,
    pub uploaded: std::collections::HashSet<(PayloadId, u32, u32)>,
}

pub struct WalConfig {
    pub path: PathBuf,
    pub initial_size: u64,
    pub grow_factor: u64,
}

impl WalConfig {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), initial_size: 1024 * 1024, grow_factor: 2 }
    }
}

struct MappedFile {
    file: std::fs::File,
    mmap: MmapMut,
    capacity: u64,
    grow_factor: u64,
}

/// Appends records to a memory-mapped, single-writer WAL file.
pub struct WalPersister {
    inner: Mutex<Option<MappedFile>>,
}

/// Behavior a cache can depend on without importing the full persister
/// (keeps `cache` decoupled from `wal`'s on-disk format).
pub trait WalSink: Send + Sync {
    fn append_block_write(
        &self,
        payload: PayloadId,
        chunk_idx: u32,
        block_idx: u32,
        offset_in_block: u32,
        data: &[u8],
    ) -> Result<()>;
    fn append_block_uploaded(&self, payload: PayloadId, chunk_idx: u32, block_idx: u32) -> Result<()>;
    fn append_remove(&self, payload: PayloadId) -> Result<()>;
}

impl WalPersister {
    pub fn open(config: &WalConfig) -> Result<Self> {
        let exists = config.path.exists();
        let file = OpenOptions::new().read(true).write(true).create(true).open(&config.path)?;

        if !exists {
            file.set_len(config.initial_size)?;
            let mut header = [0u8; HEADER_SIZE];
            header[0..4].copy_from_slice(MAGIC);
            LittleEndian::write_u32(&mut header[4..8], VERSION);
            // entry_count, next_offset (starts right after header), total_data_size.
            LittleEndian::write_u64(&mut header[16..24], HEADER_SIZE as u64);
            {
                let mut f = &file;
                f.write_all(&header)?;
                f.flush()?;
            }
        }

        let mmap = unsafe { MmapMut::map_mut(&file)? };
        let capacity = file.metadata()?.len();
        validate_header(&mmap)?;

        Ok(Self {
            inner: Mutex::new(Some(MappedFile { file, mmap, capacity, grow_factor: config.grow_factor })),
        })
    }

    fn append_record(&self, record: WalRecord) -> Result<()> {
        let body = record.encode_body();
        let checksum = crc32fast::hash(&body);

        // tag(1) + body_len(4) + body + crc32(4)
        let mut frame = Vec::with_capacity(1 + 4 + body.len() + 4);
        frame.push(record.tag());
        push_u32(&mut frame, body.len() as u32);
        frame.extend_from_slice(&body);
        push_u32(&mut frame, checksum);

        let mut guard = self.inner.lock().unwrap();
        let mapped = guard.as_mut().ok_or(Error::Closed)?;

        let next_offset = LittleEndian::read_u64(&mapped.mmap[16..24]);
        let required = next_offset + frame.len() as u64;
        while required > mapped.capacity {
            grow(mapped, mapped.grow_factor)?;
        }

        let start = next_offset as usize;
        mapped.mmap[start..start + frame.len()].copy_from_slice(&frame);

        let new_next = next_offset + frame.len() as u64;
        LittleEndian::write_u64(&mut mapped.mmap[16..24], new_next);
        let entry_count = LittleEndian::read_u64(&mapped.mmap[8..16]);
        LittleEndian::write_u64(&mut mapped.mmap[8..16], entry_count + 1);
        let total_data = LittleEndian::read_u64(&mapped.mmap[24..32]);
        LittleEndian::write_u64(&mut mapped.mmap[24..32], total_data + body.len() as u64);

        Ok(())
    }

    pub fn append_block_write(
        &self,
        payload: PayloadId,
        chunk_idx: u32,
        block_idx: u32,
        offset_in_block: u32,
        data: &[u8],
    ) -> Result<()> {
        self.append_record(WalRecord::BlockWrite {
            payload,
            chunk_idx,
            block_idx,
            offset_in_block,
            data: data.to_vec(),
        })
    }

    pub fn append_block_uploaded(&self, payload: PayloadId, chunk_idx: u32, block_idx: u32) -> Result<()> {
        self.append_record(WalRecord::BlockUploaded { payload, chunk_idx, block_idx })
    }

    pub fn append_remove(&self, payload: PayloadId) -> Result<()> {
        self.append_record(WalRecord::Remove { payload })
    }

    /// Explicit flush-to-disk barrier; routine appends rely on the OS page
    /// cache for durability (`spec.md` §4.2 documented trade-off).
    pub fn sync(&self) -> Result<()> {
        let guard = self.inner.lock().unwrap();
        let mapped = guard.as_ref().ok_or(Error::Closed)?;
        mapped.mmap.flush()?;
        Ok(())
    }

    pub fn close(&self) {
        let mut guard = self.inner.lock().unwrap();
        *guard = None;
    }

    /// Two-pass recovery algorithm (`spec.md` §4.2).
    pub fn recover(&self) -> Result<RecoveredState> {
        let guard = self.inner.lock().unwrap();
        let mapped = guard.as_ref().ok_or(Error::Closed)?;
        let next_offset = (LittleEndian::read_u64(&mapped.mmap[16..24]) as usize).min(mapped.mmap.len());
        let bytes = &mapped.mmap[..next_offset];

        let mut removed = std::collections::HashSet::new();
        let mut uploaded = std::collections::HashSet::new();
        let mut writes = Vec::new();
        let mut cursor = HEADER_SIZE;

        // Single forward scan is sufficient since Remove supersedes earlier
        // records for its payload regardless of pass order; we track it in
        // one pass and filter at the end (equivalent to the two-pass
        // description but avoids re-reading the mapping).
        while cursor + 9 <= bytes.len() {
            let tag = bytes[cursor];
            let body_len = LittleEndian::read_u32(&bytes[cursor + 1..cursor + 5]) as usize;
            let frame_len = 1 + 4 + body_len + 4;
            if cursor + frame_len > bytes.len() {
                debug!(at = cursor, "wal truncated mid-record, stopping recovery here");
                break;
            }
            let body = &bytes[cursor + 5..cursor + 5 + body_len];
            let expected_crc = LittleEndian::read_u32(&bytes[cursor + 5 + body_len..cursor + frame_len]);
            if crc32fast::hash(body) != expected_crc {
                warn!(at = cursor, "wal checksum mismatch, stopping recovery here");
                break;
            }

            match WalRecord::decode(tag, body) {
                Ok(WalRecord::Remove { payload }) => {
                    removed.insert(payload);
                    uploaded.retain(|&(p, _, _): &(PayloadId, u32, u32)| p != payload);
                }
                Ok(WalRecord::BlockUploaded { payload, chunk_idx, block_idx }) => {
                    uploaded.insert((payload, chunk_idx, block_idx));
                }
                Ok(record @ WalRecord::BlockWrite { .. }) => writes.push(record),
                Err(e) => {
                    warn!(at = cursor, error = %e, "wal record decode failed, stopping recovery here");
                    break;
                }
            }
            cursor += frame_len;
        }

        let entries = writes
            .into_iter()
            .filter(|r| match r {
                WalRecord::BlockWrite { payload, .. } => !removed.contains(payload),
                _ => true,
            })
            .collect();
        uploaded.retain(|(p, _, _)| !removed.contains(p));

        Ok(RecoveredState { entries, uploaded })
    }
}

impl WalSink for WalPersister {
    fn append_block_write(
        &self,
        payload: PayloadId,
        chunk_idx: u32,
        block_idx: u32,
        offset_in_block: u32,
        data: &[u8],
    ) -> Result<()> {
        WalPersister::append_block_write(self, payload, chunk_idx, block_idx, offset_in_block, data)
    }

    fn append_block_uploaded(&self, payload: PayloadId, chunk_idx: u32, block_idx: u32) -> Result<()> {
        WalPersister::append_block_uploaded(self, payload, chunk_idx, block_idx)
    }

    fn append_remove(&self, payload: PayloadId) -> Result<()> {
        WalPersister::append_remove(self, payload)
    }
}

fn grow(mapped: &mut MappedFile, factor: u64) -> Result<()> {
    let new_capacity = mapped.capacity.saturating_mul(factor).max(mapped.capacity + 1);
    mapped.file.set_len(new_capacity)?;
    mapped.mmap = unsafe { MmapMut::map_mut(&mapped.file)? };
    mapped.capacity = new_capacity;
    Ok(())
}

fn validate_header(mmap: &MmapMut) -> Result<()> {
    if mmap.len() < HEADER_SIZE {
        return Err(Error::Corrupted("file shorter than header".into()));
    }
    if &mmap[0..4] != MAGIC {
        return Err(Error::Corrupted("bad magic".into()));
    }
    let version = LittleEndian::read_u32(&mmap[4..8]);
    if version != VERSION {
        return Err(Error::VersionMismatch);
    }
    Ok(())
}

pub fn wal_path_for(dir: impl AsRef<Path>) -> PathBuf {
    dir.as_ref().join("ditto.wal")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_and_recovers_in_order() {
        let dir = tempdir().unwrap();
        let cfg = WalConfig::new(wal_path_for(dir.path()));
        let wal = WalPersister::open(&cfg).unwrap();

        wal.append_block_write(PayloadId(1), 0, 0, 0, b"hello").unwrap();
        wal.append_block_write(PayloadId(1), 0, 0, 5, b"world").unwrap();
        wal.append_block_uploaded(PayloadId(1), 0, 0).unwrap();
        wal.sync().unwrap();

        let recovered = wal.recover().unwrap();
        assert_eq!(recovered.entries.len(), 2);
        assert!(recovered.uploaded.contains(&(PayloadId(1), 0, 0)));
    }

    #[test]
    fn remove_supersedes_earlier_writes() {
        let dir = tempdir().unwrap();
        let cfg = WalConfig::new(wal_path_for(dir.path()));
        let wal = WalPersister::open(&cfg).unwrap();

        wal.append_block_write(PayloadId(7), 0, 0, 0, b"data").unwrap();
        wal.append_remove(PayloadId(7)).unwrap();

        let recovered = wal.recover().unwrap();
        assert!(recovered.entries.is_empty());
    }

    #[test]
    fn growing_the_file_preserves_earlier_records() {
        let dir = tempdir().unwrap();
        let mut cfg = WalConfig::new(wal_path_for(dir.path()));
        cfg.initial_size = HEADER_SIZE as u64 + 16; // force an early grow
        let wal = WalPersister::open(&cfg).unwrap();

        for i in 0..50u64 {
            wal.append_block_write(PayloadId(i), 0, 0, 0, b"0123456789").unwrap();
        }

        let recovered = wal.recover().unwrap();
        assert_eq!(recovered.entries.len(), 50);
    }

    #[test]
    fn truncation_at_random_offset_yields_a_prefix() {
        let dir = tempdir().unwrap();
        let cfg = WalConfig::new(wal_path_for(dir.path()));
        let path = cfg.path.clone();
        {
            let wal = WalPersister::open(&cfg).unwrap();
            for i in 0..10u64 {
                wal.append_block_write(PayloadId(i), 0, 0, 0, b"payload-bytes").unwrap();
            }
            wal.sync().unwrap();
        }

        // Truncate the file partway through the written log (not the
        // padded file capacity) to simulate a crash mid-append.
        let header = std::fs::read(&path).unwrap();
        let next_offset = LittleEndian::read_u64(&header[16..24]);
        let cut = HEADER_SIZE as u64 + (next_offset - HEADER_SIZE as u64) / 2 + 3;
        let file = OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(cut).unwrap();

        let cfg2 = WalConfig::new(path);
        let wal = WalPersister::open(&cfg2).unwrap();
        let recovered = wal.recover().unwrap();
        assert!(recovered.entries.len() <= 10);
        for (i, entry) in recovered.entries.iter().enumerate() {
            match entry {
                WalRecord::BlockWrite { payload, .. } => assert_eq!(payload.0, i as u64),
                _ => panic!("unexpected record"),
            }
        }
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("bad.wal");
        std::fs::write(&path, vec![0u8; HEADER_SIZE]).unwrap();
        let cfg = WalConfig::new(path);
        assert!(matches!(WalPersister::open(&cfg), Err(Error::Corrupted(_))));
    }
}
