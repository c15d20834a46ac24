//! Demo entrypoint: loads configuration, wires a filesystem-backed
//! `BlockStore`/`MetadataStore` pair (a stand-in for the real metadata
//! layer, which lives outside this crate), and serves connections.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use dittofs_core::error::{Error, Result};
use dittofs_core::handle::{FileHandle, PayloadId};
use dittofs_core::store::{BlockStore, DirEntry, FileAttrs, MetadataStore, ReadIntent, WriteIntent};
use dittofs_core::config::Cli;
use dittofs_core::DittoFs;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

/// Writes each block to `<root>/<hex(hash)>`; good enough to exercise the
/// Transfer Manager end to end, not a production object store.
struct FsBlockStore {
    root: PathBuf,
}

#[async_trait]
impl BlockStore for FsBlockStore {
    async fn put(&self, hash: &[u8; 32], data: &[u8]) -> Result<()> {
        tokio::fs::write(self.root.join(hex(hash)), data).await?;
        Ok(())
    }

    async fn get(&self, hash: &[u8; 32]) -> Result<Vec<u8>> {
        tokio::fs::read(self.root.join(hex(hash))).await.map_err(|_| Error::NotFound)
    }

    async fn delete(&self, hash: &[u8; 32]) -> Result<()> {
        let _ = tokio::fs::remove_file(self.root.join(hex(hash))).await;
        Ok(())
    }
}

/// File id of the single root directory every demo export starts with.
const ROOT_FILE_ID: u64 = 0;

/// Assigns every file a payload id on first sight; the demo harness keeps
/// a flat one-level directory under `ROOT_FILE_ID` rather than a real
/// namespace tree, it just satisfies the trait so the storage core is
/// reachable end to end.
struct DemoMetadataStore {
    files: Mutex<HashMap<u64, FileAttrs>>,
    dirs: Mutex<HashMap<u64, Vec<(String, u64)>>>,
    next_payload: AtomicU64,
}

#[async_trait]
impl MetadataStore for DemoMetadataStore {
    async fn get_file(&self, handle: &FileHandle) -> Result<FileAttrs> {
        let (_, file_id) = self.decode_file_handle(handle)?;
        self.files.lock().unwrap().get(&file_id).cloned().ok_or(Error::NotFound)
    }

    async fn prepare_write(&self, handle: &FileHandle, new_size: u64) -> Result<WriteIntent> {
        let (_, file_id) = self.decode_file_handle(handle)?;
        let payload = self.files.lock().unwrap().get(&file_id).map(|a| a.payload).unwrap_or_else(|| {
            PayloadId(self.next_payload.fetch_add(1, Ordering::SeqCst))
        });
        Ok(WriteIntent { handle: handle.clone(), payload, new_size })
    }

    async fn commit_write(&self, intent: &WriteIntent) -> Result<FileAttrs> {
        let (_, file_id) = self.decode_file_handle(&intent.handle)?;
        let attrs = FileAttrs { payload: intent.payload, size: intent.new_size };
        self.files.lock().unwrap().insert(file_id, attrs.clone());
        Ok(attrs)
    }

    async fn prepare_read(&self, handle: &FileHandle) -> Result<ReadIntent> {
        let attrs = self.get_file(handle).await?;
        Ok(ReadIntent { payload: attrs.payload, size: attrs.size })
    }

    async fn read_dir(&self, handle: &FileHandle, cookie: u64, max_entries: usize) -> Result<Vec<DirEntry>> {
        let (_, file_id) = self.decode_file_handle(handle)?;
        let dirs = self.dirs.lock().unwrap();
        let entries = dirs.get(&file_id).ok_or(Error::NotFound)?;
        Ok(entries
            .iter()
            .skip(cookie as usize)
            .take(max_entries)
            .map(|(name, id)| DirEntry { name: name.clone(), handle: FileHandle::new(id.to_le_bytes().to_vec()), file_id: *id })
            .collect())
    }

    fn decode_file_handle(&self, handle: &FileHandle) -> Result<(String, u64)> {
        let bytes = handle.as_bytes();
        if bytes.len() != 8 {
            return Err(Error::InvalidArgument("file handle must be 8 bytes".into()));
        }
        let mut id = [0u8; 8];
        id.copy_from_slice(bytes);
        Ok(("default".into(), u64::from_le_bytes(id)))
    }
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let config = cli.load_config()?;

    tracing_subscriber::fmt().with_env_filter(EnvFilter::new(&config.log.filter)).init();

    let block_root = config.cache.path.parent().unwrap_or_else(|| config.cache.path.as_path()).join("blocks");
    tokio::fs::create_dir_all(&block_root).await?;

    let store: Arc<dyn BlockStore> = Arc::new(FsBlockStore { root: block_root });
    let metadata: Arc<dyn MetadataStore> = Arc::new(DemoMetadataStore {
        files: Mutex::new(HashMap::new()),
        dirs: Mutex::new(HashMap::from([(ROOT_FILE_ID, Vec::new())])),
        next_payload: AtomicU64::new(1),
    });

    let epoch = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH)?.as_secs() as u32;
    let core = Arc::new(DittoFs::start(&config, store, metadata, epoch).await?);

    let listener = TcpListener::bind(config.bind_addr()?).await?;
    tracing::info!(addr = %config.server.bind_addr, "dittofs listening");

    dittofs_core::handle_forever(listener, core).await?;
    Ok(())
}
