//! DittoFS storage core: a WAL-backed block cache, a unified cross-protocol
//! lock manager, and an NFSv4.0 session-state manager, wired together
//! behind a small facade the protocol glue drives.

pub mod allocator;
pub mod cache;
pub mod config;
pub mod error;
pub mod handle;
pub mod lock;
pub mod payload;
pub mod proto;
pub mod state;
pub mod store;
pub mod transfer;
pub mod wal;

mod message_types;
mod read_task;
mod stream_writer;
mod vfs_task;

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::info;

use crate::cache::{Cache, BLOCK_SIZE, CHUNK_SIZE};
use crate::config::Config;
use crate::error::Result;
use crate::lock::grace::GraceManager;
use crate::lock::{LockManager, LockManagerConfig};
use crate::message_types::{create_early_reply_channel, create_proc_channel, create_reply_channel};
use crate::payload::PayloadService;
use crate::read_task::ReadTask;
use crate::state::StateManager;
use crate::store::{BlockStore, MetadataStore};
use crate::stream_writer::StreamWriter;
use crate::transfer::{TransferConfig, TransferManager};
use crate::vfs_task::VfsTask;
use crate::wal::{WalConfig, WalPersister, WalRecord, WalSink};

/// Epoch a running process stamps into every stateid it mints
/// (`spec.md` §4.5 "epoch distinguishes stateids across server restarts").
/// Derived from the current time at startup by the binary; tests fix it.
pub type Epoch = u32;

/// Bundles the storage core's long-lived components behind the surfaces
/// protocol glue actually needs: payload I/O, locking, and NFSv4.0 session
/// state.
pub struct DittoFs {
    pub payload: Arc<PayloadService>,
    pub lock_manager: Arc<LockManager>,
    pub state_manager: Arc<StateManager>,
    pub metadata: Arc<dyn MetadataStore>,
    transfer: Arc<TransferManager>,
}

impl DittoFs {
    /// Opens the WAL, replays it into a fresh cache, starts the Transfer
    /// Manager's worker pool (re-enqueuing any blocks left `Pending` by the
    /// replay), and builds the lock/state managers (`spec.md` §4.2 "on
    /// startup, scan the log... rebuild the in-memory cache state").
    pub async fn start(
        config: &Config,
        store: Arc<dyn BlockStore>,
        metadata: Arc<dyn MetadataStore>,
        epoch: Epoch,
    ) -> Result<Self> {
        let wal_config = WalConfig::new(config.cache.path.clone());
        let wal = Arc::new(WalPersister::open(&wal_config)?);
        let recovered = wal.recover()?;
        let wal_sink: Arc<dyn WalSink> = wal.clone();

        let cache = Arc::new(Cache::new(config.cache.size, wal_sink.clone()));
        let mut still_pending = Vec::new();
        for record in &recovered.entries {
            if let WalRecord::BlockWrite { payload, chunk_idx, block_idx, offset_in_block, data } = record {
                let offset = *chunk_idx as u64 * CHUNK_SIZE
                    + *block_idx as u64 * BLOCK_SIZE as u64
                    + *offset_in_block as u64;
                if cache.write_at(*payload, offset, data).is_ok()
                    && !recovered.uploaded.contains(&(*payload, *chunk_idx, *block_idx))
                {
                    still_pending.push((*payload, *chunk_idx, *block_idx));
                }
            }
        }

        let transfer_config = TransferConfig {
            upload_workers: config.payload.workers.uploads,
            download_workers: config.payload.workers.downloads,
            ..TransferConfig::default()
        };
        let transfer = TransferManager::start(transfer_config, cache.clone(), store, wal_sink.clone());
        let recovery_stats = transfer.recover(&cache, &still_pending).await;
        info!(
            files_scanned = recovery_stats.files_scanned,
            blocks_found = recovery_stats.blocks_found,
            bytes_pending = recovery_stats.bytes_pending,
            "WAL recovery complete"
        );

        let payload = Arc::new(PayloadService::new(cache, transfer.clone(), wal_sink));

        let grace = GraceManager::new(config.grace_period(), 0);
        let lock_config = LockManagerConfig {
            lease_break_timeout: config.lease_break_timeout(),
            max_locks_per_file: config.lock.max_locks_per_file,
            max_locks_per_client: config.lock.max_locks_per_client,
            max_locks_total: config.lock.max_locks_total,
        };
        let lock_manager = Arc::new(LockManager::new(lock_config, Some(grace)));

        let state_manager = Arc::new(StateManager::new(lock_manager.clone(), Duration::from_secs(90), epoch));
        state_manager.spawn_lease_sweep();

        Ok(Self { payload, lock_manager, state_manager, metadata, transfer })
    }

    /// Drains every outstanding upload before shutdown so a restart's WAL
    /// replay has as little to redo as possible.
    pub async fn shutdown(&self) {
        self.transfer.shutdown().await;
    }
}

/// Accepts connections forever, handing each socket to its own
/// read/dispatch/write task triple (`spec.md` §5 "one task per
/// connection").
pub async fn handle_forever(listener: TcpListener, core: Arc<DittoFs>) -> std::io::Result<()> {
    loop {
        let (socket, peer) = listener.accept().await?;
        socket.set_nodelay(true)?;
        info!(%peer, "accepted connection");
        process_socket(socket, core.clone()).await;
    }
}

async fn process_socket(socket: TcpStream, core: Arc<DittoFs>) {
    let (readhalf, writehalf) = socket.into_split();

    let (args_send, args_recv) = create_proc_channel(64);
    let (reply_send, reply_recv) = create_reply_channel(64);
    let (early_send, early_recv) = create_early_reply_channel(64);

    ReadTask::spawn(readhalf, args_send, early_send);
    VfsTask::spawn(args_recv, reply_send, core);
    StreamWriter::spawn(writehalf, reply_recv, early_recv);
}
