//! Transfer Manager (`spec.md` §4.3): bounded upload/download worker pools
//! that move blocks between the [`Cache`](crate::cache::Cache) and a
//! content-addressed [`BlockStore`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_channel::{bounded, Receiver, Sender};
use sha2::{Digest, Sha256};
use tokio::sync::{oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace, warn};

use crate::cache::Cache;
use crate::error::Result;
use crate::handle::PayloadId;
use crate::store::BlockStore;
use crate::wal::WalSink;

/// Cooperative cancellation, checked at worker-loop boundaries and await
/// points. A cheap `Arc<Notify>`-based stand-in for a cancellation token.
#[derive(Clone)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
    notify: Arc<Notify>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self { cancelled: Arc::new(AtomicBool::new(false)), notify: Arc::new(Notify::new()) }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    async fn cancelled(&self) {
        if !self.is_cancelled() {
            self.notify.notified().await;
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub upload_workers: usize,
    pub download_workers: usize,
    pub queue_depth: usize,
    pub backoff_initial: Duration,
    pub backoff_max: Duration,
    pub backoff_factor: u32,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            upload_workers: 4,
            download_workers: 4,
            queue_depth: 256,
            backoff_initial: Duration::from_millis(50),
            backoff_max: Duration::from_secs(10),
            backoff_factor: 2,
        }
    }
}

struct UploadTask {
    payload: PayloadId,
    chunk_idx: u32,
    block_idx: u32,
}

struct DownloadTask {
    payload: PayloadId,
    chunk_idx: u32,
    block_idx: u32,
    hash: [u8; 32],
}

type WaiterKey = (PayloadId, u32, u32);
type WaiterMap = Arc<Mutex<HashMap<WaiterKey, Vec<oneshot::Sender<()>>>>>;

/// Counters surfaced at startup recovery and during steady-state operation
/// (`spec.md` §4.3 "Emit counters").
#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryStats {
    pub files_scanned: u64,
    pub blocks_found: u64,
    pub bytes_pending: u64,
}

/// Drives upload and download worker pools against a [`BlockStore`],
/// content-addressing blocks with SHA-256 and deduplicating against an
/// in-memory object index keyed by hash.
pub struct TransferManager {
    upload_tx: Sender<UploadTask>,
    download_tx: Sender<DownloadTask>,
    object_index: Arc<Mutex<HashMap<[u8; 32], ()>>>,
    waiters: WaiterMap,
    cancel: CancelToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl TransferManager {
    pub fn start(
        config: TransferConfig,
        cache: Arc<Cache>,
        store: Arc<dyn BlockStore>,
        wal: Arc<dyn WalSink>,
    ) -> Arc<Self> {
        let (upload_tx, upload_rx) = bounded::<UploadTask>(config.queue_depth);
        let (download_tx, download_rx) = bounded::<DownloadTask>(config.queue_depth);
        let cancel = CancelToken::new();
        let object_index = Arc::new(Mutex::new(HashMap::new()));
        let waiters: WaiterMap = Arc::new(Mutex::new(HashMap::new()));

        let mut handles = Vec::new();

        for i in 0..config.upload_workers {
            let rx = upload_rx.clone();
            let cache = cache.clone();
            let store = store.clone();
            let wal = wal.clone();
            let object_index = object_index.clone();
            let cancel = cancel.clone();
            let config = config.clone();
            handles.push(tokio::spawn(async move {
                upload_worker(i, rx, cache, store, wal, object_index, cancel, config).await;
            }));
        }

        for i in 0..config.download_workers {
            let rx = download_rx.clone();
            let cache = cache.clone();
            let store = store.clone();
            let cancel = cancel.clone();
            let config = config.clone();
            let waiters = waiters.clone();
            handles.push(tokio::spawn(async move {
                download_worker(i, rx, cache, store, cancel, config, waiters).await;
            }));
        }

        Arc::new(Self { upload_tx, download_tx, object_index, waiters, cancel, workers: Mutex::new(handles) })
    }

    /// Enqueue a Pending block for upload; blocks the caller if the queue
    /// is full (`spec.md` §4.3 "submission blocks when the internal queue
    /// is full").
    pub async fn enqueue_upload(&self, payload: PayloadId, chunk_idx: u32, block_idx: u32) {
        let _ = self.upload_tx.send(UploadTask { payload, chunk_idx, block_idx }).await;
    }

    /// Enqueue a download and await its completion. Concurrent callers
    /// asking for the same `(payload, chunk_idx, block_idx)` coalesce onto
    /// a single in-flight [`DownloadTask`]: only the first registers one,
    /// and every registered waiter is woken when it completes (`spec.md`
    /// §4.3 "concurrent readers of the same missing block coalesce onto a
    /// single fetch").
    pub async fn fetch_block(&self, payload: PayloadId, chunk_idx: u32, block_idx: u32, hash: [u8; 32]) {
        let (tx, rx) = oneshot::channel();
        let key = (payload, chunk_idx, block_idx);
        let is_first_waiter = {
            let mut waiters = self.waiters.lock().unwrap();
            let entry = waiters.entry(key).or_default();
            let is_first = entry.is_empty();
            entry.push(tx);
            is_first
        };

        if is_first_waiter {
            if self.download_tx.send(DownloadTask { payload, chunk_idx, block_idx, hash }).await.is_err() {
                wake_waiters(&self.waiters, key);
                return;
            }
        }
        let _ = rx.await;
    }

    /// Replay recovery: every Pending block found after WAL replay is
    /// enqueued as an upload task (`spec.md` §4.3 "Recovery hook").
    pub async fn recover(&self, cache: &Cache, pending: &[(PayloadId, u32, u32)]) -> RecoveryStats {
        let mut stats = RecoveryStats::default();
        let mut files = std::collections::HashSet::new();
        for &(payload, chunk_idx, block_idx) in pending {
            files.insert(payload);
            stats.blocks_found += 1;
            stats.bytes_pending += crate::cache::BLOCK_SIZE as u64;
            self.enqueue_upload(payload, chunk_idx, block_idx).await;
        }
        stats.files_scanned = files.len() as u64;
        let _ = cache; // cache contents already reconstructed by the caller via WAL replay
        stats
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let handles = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            let _ = handle.await;
        }
    }
}

async fn upload_worker(
    id: usize,
    rx: Receiver<UploadTask>,
    cache: Arc<Cache>,
    store: Arc<dyn BlockStore>,
    wal: Arc<dyn WalSink>,
    object_index: Arc<Mutex<HashMap<[u8; 32], ()>>>,
    cancel: CancelToken,
    config: TransferConfig,
) {
    loop {
        let task = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            task = rx.recv() => match task {
                Ok(task) => task,
                Err(_) => break,
            },
        };

        let Some((data, version)) = cache.mark_uploading(task.payload, task.chunk_idx, task.block_idx) else {
            // Nothing left to upload (already handled, or racing a revert).
            continue;
        };

        let hash: [u8; 32] = Sha256::digest(&data).into();

        let already_present = object_index.lock().unwrap().contains_key(&hash);
        let put_result = if already_present {
            Ok(())
        } else {
            retry_with_backoff(&config, &cancel, || {
                let store = store.clone();
                let data = data.clone();
                let hash = hash;
                async move { store.put(&hash, &data).await }
            })
            .await
        };

        match put_result {
            Ok(()) => {
                object_index.lock().unwrap().insert(hash, ());
                if cache.mark_uploaded(task.payload, task.chunk_idx, task.block_idx, version, hash) {
                    if let Err(e) = wal.append_block_uploaded(task.payload, task.chunk_idx, task.block_idx) {
                        error!(worker = id, error = %e, "failed to append BlockUploaded to wal");
                    }
                } else {
                    trace!(worker = id, "mark_uploaded dropped: block superseded by a concurrent write");
                }
            }
            Err(e) => {
                warn!(worker = id, error = %e, "upload permanently failed, reverting block to pending");
                cache.revert_to_pending(task.payload, task.chunk_idx, task.block_idx);
            }
        }
    }
    debug!(worker = id, "upload worker stopped");
}

async fn download_worker(
    id: usize,
    rx: Receiver<DownloadTask>,
    cache: Arc<Cache>,
    store: Arc<dyn BlockStore>,
    cancel: CancelToken,
    config: TransferConfig,
    waiters: WaiterMap,
) {
    loop {
        let task = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            task = rx.recv() => match task {
                Ok(task) => task,
                Err(_) => break,
            },
        };

        let result = retry_with_backoff(&config, &cancel, || {
            let store = store.clone();
            let hash = task.hash;
            async move { store.get(&hash).await }
        })
        .await;

        match result {
            Ok(data) => cache.populate_block(task.payload, task.chunk_idx, task.block_idx, &data, task.hash),
            Err(e) => error!(worker = id, error = %e, "download permanently failed"),
        }

        wake_waiters(&waiters, (task.payload, task.chunk_idx, task.block_idx));
    }
    debug!(worker = id, "download worker stopped");
}

/// Drains every waiter registered for `key` and wakes it, whether the
/// fetch succeeded or failed permanently — a failed fetch still has to
/// unblock everyone waiting on it.
fn wake_waiters(waiters: &WaiterMap, key: WaiterKey) {
    let pending = waiters.lock().unwrap().remove(&key).unwrap_or_default();
    for sender in pending {
        let _ = sender.send(());
    }
}

/// Exponential backoff with jitter, bounded by `backoff_max`; cancellation
/// aborts the retry loop immediately (`spec.md` §4.3, §5 "Cancellation is
/// honoured at every await point").
async fn retry_with_backoff<F, Fut>(config: &TransferConfig, cancel: &CancelToken, mut attempt: F) -> Result<Vec<u8>>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<Vec<u8>>>,
{
    let mut delay = config.backoff_initial;
    loop {
        if cancel.is_cancelled() {
            return Err(crate::error::Error::Closed);
        }
        match attempt().await {
            Ok(v) => return Ok(v),
            Err(e) if is_transient(&e) => {
                warn!(delay_ms = delay.as_millis() as u64, error = %e, "transient store error, backing off");
                tokio::select! {
                    _ = tokio::time::sleep(jittered(delay)) => {}
                    _ = cancel.cancelled() => return Err(crate::error::Error::Closed),
                }
                delay = (delay * config.backoff_factor).min(config.backoff_max);
            }
            Err(e) => return Err(e),
        }
    }
}

fn is_transient(err: &crate::error::Error) -> bool {
    matches!(err, crate::error::Error::Io(_))
}

fn jittered(base: Duration) -> Duration {
    use rand::Rng;
    let jitter_ms = rand::thread_rng().gen_range(0..=base.as_millis() as u64 / 4 + 1);
    base + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct FakeStore {
        objects: Mutex<HashMap<[u8; 32], Vec<u8>>>,
        put_calls: AtomicU32,
        get_calls: AtomicU32,
    }

    impl FakeStore {
        fn new() -> Arc<Self> {
            Arc::new(Self { objects: Mutex::new(HashMap::new()), put_calls: AtomicU32::new(0), get_calls: AtomicU32::new(0) })
        }
    }

    #[async_trait::async_trait]
    impl BlockStore for FakeStore {
        async fn put(&self, hash: &[u8; 32], data: &[u8]) -> Result<()> {
            self.put_calls.fetch_add(1, Ordering::SeqCst);
            self.objects.lock().unwrap().insert(*hash, data.to_vec());
            Ok(())
        }

        async fn get(&self, hash: &[u8; 32]) -> Result<Vec<u8>> {
            self.get_calls.fetch_add(1, Ordering::SeqCst);
            // Gives concurrent fetch_block callers a window to register as
            // waiters on the same key before this one completes.
            tokio::time::sleep(Duration::from_millis(30)).await;
            self.objects
                .lock()
                .unwrap()
                .get(hash)
                .cloned()
                .ok_or(crate::error::Error::NotFound)
        }

        async fn delete(&self, _hash: &[u8; 32]) -> Result<()> {
            Ok(())
        }
    }

    struct NullWal;
    impl WalSink for NullWal {
        fn append_block_write(&self, _: PayloadId, _: u32, _: u32, _: u32, _: &[u8]) -> Result<()> {
            Ok(())
        }
        fn append_block_uploaded(&self, _: PayloadId, _: u32, _: u32) -> Result<()> {
            Ok(())
        }
        fn append_remove(&self, _: PayloadId) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn upload_then_download_round_trips_through_the_store() {
        let wal: Arc<dyn WalSink> = Arc::new(NullWal);
        let cache = Arc::new(Cache::new(u64::MAX, wal.clone()));
        let store = FakeStore::new();
        let manager = TransferManager::start(TransferConfig::default(), cache.clone(), store.clone(), wal);

        cache.write_at(PayloadId(1), 0, b"round-trip-me").unwrap();
        manager.enqueue_upload(PayloadId(1), 0, 0).await;

        // Give the worker a moment to process.
        for _ in 0..50 {
            if store.put_calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.put_calls.load(Ordering::SeqCst), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn recover_reenqueues_every_still_pending_block() {
        let wal: Arc<dyn WalSink> = Arc::new(NullWal);
        let cache = Arc::new(Cache::new(u64::MAX, wal.clone()));
        let store = FakeStore::new();
        let manager = TransferManager::start(TransferConfig::default(), cache.clone(), store.clone(), wal);

        cache.write_at(PayloadId(2), 0, b"left-pending-by-crash").unwrap();
        let stats = manager.recover(&cache, &[(PayloadId(2), 0, 0)]).await;
        assert_eq!(stats.files_scanned, 1);
        assert_eq!(stats.blocks_found, 1);

        for _ in 0..50 {
            if store.put_calls.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(store.put_calls.load(Ordering::SeqCst), 1);

        manager.shutdown().await;
    }

    #[tokio::test]
    async fn concurrent_fetches_of_the_same_block_coalesce() {
        let wal: Arc<dyn WalSink> = Arc::new(NullWal);
        let cache = Arc::new(Cache::new(u64::MAX, wal.clone()));
        let store = FakeStore::new();
        let hash: [u8; 32] = Sha256::digest(b"shared-block").into();
        store.objects.lock().unwrap().insert(hash, b"shared-block".to_vec());

        let config = TransferConfig { download_workers: 1, ..TransferConfig::default() };
        let manager = TransferManager::start(config, cache.clone(), store.clone(), wal);

        let a = manager.fetch_block(PayloadId(9), 0, 0, hash);
        let b = manager.fetch_block(PayloadId(9), 0, 0, hash);
        let c = manager.fetch_block(PayloadId(9), 0, 0, hash);
        tokio::join!(a, b, c);

        // Only one get() should have been needed to satisfy all three waiters.
        assert_eq!(store.get_calls.load(Ordering::SeqCst), 1);
        assert!(manager.waiters.lock().unwrap().is_empty());

        manager.shutdown().await;
    }
}
