use std::sync::Arc;

use rand::RngCore;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::Error;
use crate::handle::FileHandle;
use crate::lock::{AccessMode, LockOwner, LockType, UnifiedLock, LENGTH_FULL_FILE};
use crate::message_types::{ProcRecv, ReplySender};
use crate::proto::{self, mount, nfs3, nlm, Call};
use crate::state::{ClaimType, CreateMode, Nfs4Status, Stateid};
use crate::store::DirEntry;
use crate::DittoFs;

/// Dispatches parsed RPC commands against the storage core, sending
/// results to [`crate::stream_writer::StreamWriter`].
///
/// Every connection auto-registers itself as an NFSv4 client on the first
/// poll instead of waiting for a wire-level `SETCLIENTID`/`SETCLIENTID_CONFIRM`
/// exchange — that negotiation has no procedure number in the surface this
/// core speaks (`SPEC_FULL.md` §6), so the glue performs it once per
/// connection and reuses the resulting `client_id` for every `OPEN`/`LOCK`
/// on that socket.
pub struct VfsTask {
    proc_recv: ProcRecv,
    reply_sender: ReplySender,
    core: Arc<DittoFs>,
    nfs4_client_id: Option<u64>,
}

impl VfsTask {
    /// Creates new instance of [`VfsTask`].
    pub fn spawn(proc_recv: ProcRecv, reply_sender: ReplySender, core: Arc<DittoFs>) -> JoinHandle<()> {
        tokio::spawn(async move { Self { proc_recv, reply_sender, core, nfs4_client_id: None }.run().await })
    }

    async fn run(mut self) {
        while let Some(procedure) = self.proc_recv.recv().await {
            let reply = self.dispatch(procedure.call).await;
            if self.reply_sender.send(procedure.header.xid, reply).await.is_err() {
                return;
            }
        }
    }

    /// Lazily registers this connection as an NFSv4 client on its first
    /// `OPEN`/`LOCK`, and returns the `client_id` to use from then on.
    fn nfs4_client_id(&mut self) -> u64 {
        if let Some(id) = self.nfs4_client_id {
            return id;
        }
        let mut verifier = [0u8; 8];
        rand::thread_rng().fill_bytes(&mut verifier);
        let client_id = self.core.state_manager.set_clientid(verifier, "protocol-glue".to_string());
        // Confirmation can't fail here: this is the same connection that just
        // registered the client, with the verifier it was just handed.
        self.core.state_manager.confirm_clientid(client_id, verifier).expect("freshly registered client");
        self.nfs4_client_id = Some(client_id);
        client_id
    }

    async fn dispatch(&mut self, call: Call) -> proto::Reply {
        match call {
            Call::MountNull => proto::Reply::MountNull,
            Call::MountMnt { path } => self.mount(path).await,
            Call::Nfs3Read { handle, offset, count } => self.nfs3_read(handle, offset, count).await,
            Call::Nfs3Write { handle, offset, data } => self.nfs3_write(handle, offset, data).await,
            Call::Nfs3ReadDir { handle, cookie, max_entries } => self.nfs3_readdir(handle, cookie, max_entries).await,
            Call::Nfs4Open { owner, seqid, handle, access, deny } => self.nfs4_open(owner, seqid, handle, access, deny).await,
            Call::Nfs4Close { stateid } => self.nfs4_close(stateid).await,
            Call::Nfs4Lock {
                open_stateid,
                new_lock_owner,
                lock_owner,
                open_seqid,
                lock_seqid,
                offset,
                length,
                exclusive,
                reclaim,
            } => {
                self.nfs4_lock(open_stateid, new_lock_owner, lock_owner, open_seqid, lock_seqid, offset, length, exclusive, reclaim)
                    .await
            }
            Call::NlmLock { owner, handle, offset, length, exclusive, blocking } => {
                self.nlm_lock(owner, handle, offset, length, exclusive, blocking)
            }
        }
    }

    /// `MNT`: the export root is a well-known handle (file id `0`); this
    /// glue has no path-resolution logic of its own, so every non-empty
    /// export path maps to the same root.
    async fn mount(&self, path: String) -> proto::Reply {
        if path.is_empty() {
            return proto::Reply::MountMnt {
                status: mount::to_mount_status(&Error::InvalidArgument("empty export path".into())),
                handle: Vec::new(),
            };
        }
        let root = 0u64.to_le_bytes().to_vec();
        proto::Reply::MountMnt { status: mount::MountStat::Ok, handle: root }
    }

    async fn nfs3_read(&self, handle: FileHandle, offset: u64, count: u32) -> proto::Reply {
        let intent = match self.core.metadata.prepare_read(&handle).await {
            Ok(intent) => intent,
            Err(e) => return proto::Reply::Nfs3Read { status: nfs3::to_nfs3_status(&e), data: Vec::new(), eof: true },
        };

        let remaining = intent.size.saturating_sub(offset);
        let to_read = remaining.min(count as u64) as usize;
        let mut buf = vec![0u8; to_read];
        // No remote gap-fill source at this layer: every block this glue
        // writes lands in the cache locally first, so a missing block has
        // nowhere else to be fetched from.
        match self.core.payload.read_at(intent.payload, offset, &mut buf, |_, _| None).await {
            Ok(n) => {
                buf.truncate(n);
                let eof = offset + n as u64 >= intent.size;
                proto::Reply::Nfs3Read { status: nfs3::Nfs3Stat::Ok, data: buf, eof }
            }
            Err(e) => proto::Reply::Nfs3Read { status: nfs3::to_nfs3_status(&e), data: Vec::new(), eof: true },
        }
    }

    async fn nfs3_write(&self, handle: FileHandle, offset: u64, data: Vec<u8>) -> proto::Reply {
        let Some(new_size) = offset.checked_add(data.len() as u64) else {
            return proto::Reply::Nfs3Write { status: nfs3::Nfs3Stat::InvalidArgument, count: 0 };
        };

        let intent = match self.core.metadata.prepare_write(&handle, new_size).await {
            Ok(intent) => intent,
            Err(e) => return proto::Reply::Nfs3Write { status: nfs3::to_nfs3_status(&e), count: 0 },
        };

        let written = match self.core.payload.write_at(intent.payload, offset, &data).await {
            Ok(n) => n,
            Err(e) => return proto::Reply::Nfs3Write { status: nfs3::to_nfs3_status(&e), count: 0 },
        };

        match self.core.metadata.commit_write(&intent).await {
            Ok(_) => proto::Reply::Nfs3Write { status: nfs3::Nfs3Stat::Ok, count: written as u32 },
            Err(e) => proto::Reply::Nfs3Write { status: nfs3::to_nfs3_status(&e), count: 0 },
        }
    }

    async fn nfs3_readdir(&self, handle: FileHandle, cookie: u64, max_entries: u32) -> proto::Reply {
        match self.core.metadata.read_dir(&handle, cookie, max_entries as usize).await {
            Ok(entries) => {
                let eof = entries.len() < max_entries as usize;
                let entries = entries
                    .into_iter()
                    .map(|e: DirEntry| (e.name, e.file_id, e.handle.into_bytes()))
                    .collect();
                proto::Reply::Nfs3ReadDir { status: nfs3::Nfs3Stat::Ok, entries, eof }
            }
            Err(e) => proto::Reply::Nfs3ReadDir { status: nfs3::to_nfs3_status(&e), entries: Vec::new(), eof: true },
        }
    }

    /// `OPEN`. `OPEN_CONFIRM` has no wire representation in this surface,
    /// so a new open-owner is confirmed immediately after it is granted
    /// instead of waiting for a second round trip.
    async fn nfs4_open(&mut self, owner: Vec<u8>, seqid: u32, handle: FileHandle, access: u8, deny: u8) -> proto::Reply {
        let client_id = self.nfs4_client_id();
        let access_mode = AccessMode::from_bits_truncate(access);
        let deny_mode = AccessMode::from_bits_truncate(deny);

        let result = self.core.state_manager.open(client_id, owner, seqid, handle, access_mode, deny_mode, ClaimType::Null, CreateMode::Unchecked);
        let result = match result {
            Ok(r) => r,
            Err(e) => return proto::Reply::Nfs4Open { status: crate::state::map_error(&e), stateid: [0; 16] },
        };

        let stateid = if result.needs_confirm {
            match self.core.state_manager.open_confirm(&result.stateid, 1) {
                Ok(s) => s,
                Err(e) => return proto::Reply::Nfs4Open { status: crate::state::map_error(&e), stateid: [0; 16] },
            }
        } else {
            result.stateid
        };

        proto::Reply::Nfs4Open { status: Nfs4Status::Ok, stateid: stateid.encode() }
    }

    async fn nfs4_close(&self, stateid: [u8; 16]) -> proto::Reply {
        let stateid = Stateid::decode(&stateid);
        match self.core.state_manager.close(&stateid) {
            Ok(()) => proto::Reply::Nfs4Close { status: Nfs4Status::Ok },
            Err(e) => proto::Reply::Nfs4Close { status: crate::state::map_error(&e) },
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn nfs4_lock(
        &mut self,
        open_stateid: [u8; 16],
        new_lock_owner: bool,
        lock_owner: Vec<u8>,
        open_seqid: u32,
        lock_seqid: u32,
        offset: u64,
        length: u64,
        exclusive: bool,
        reclaim: bool,
    ) -> proto::Reply {
        let open_stateid = Stateid::decode(&open_stateid);
        let open_seqid = if new_lock_owner { Some(open_seqid) } else { None };
        let lock_type = if exclusive { LockType::Exclusive } else { LockType::Shared };

        let result = self.core.state_manager.lock(&open_stateid, new_lock_owner, lock_owner, open_seqid, lock_seqid, offset, length, lock_type, reclaim);
        match result {
            Ok(stateid) => proto::Reply::Nfs4Lock { status: Nfs4Status::Ok, stateid: stateid.encode() },
            Err(e) => proto::Reply::Nfs4Lock { status: crate::state::map_error(&e), stateid: [0; 16] },
        }
    }

    /// `NLM_LOCK`: dispatched straight into the shared lock manager, not
    /// through `StateManager` — NLM has no session state of its own, only
    /// byte-range locks under an `nlm:`-prefixed owner.
    fn nlm_lock(&self, owner: String, handle: FileHandle, offset: u64, length: u64, exclusive: bool, blocking: bool) -> proto::Reply {
        let length = if length == 0 { LENGTH_FULL_FILE } else { length };
        let lock_owner = LockOwner::new(format!("nlm:{owner}"), owner.clone(), String::new());
        let unified = UnifiedLock {
            id: 0,
            owner: lock_owner,
            handle,
            offset,
            length,
            lock_type: if exclusive { LockType::Exclusive } else { LockType::Shared },
            access_mode: AccessMode::empty(),
            oplock: None,
            acquired_at: std::time::Instant::now(),
            reclaim: false,
        };

        let status = match self.core.lock_manager.add_unified_lock_blocking(unified, blocking) {
            Ok(_) => nlm::NlmStat::Granted,
            Err(Error::Conflict(_)) if blocking => nlm::NlmStat::Blocked,
            Err(e) => {
                warn!(owner, error = %e, "NLM lock request denied");
                nlm::to_nlm_status(&e)
            }
        };
        proto::Reply::NlmLock { status }
    }
}
