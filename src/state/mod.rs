//! NFSv4.0 session-state manager (`spec.md` §4.5): clients, open-owners,
//! lock-owners, stateids with replay-cache semantics, and lease expiry
//! coordinated with the [`LockManager`](crate::lock::LockManager).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use rand::RngCore;
use tracing::info;

use crate::error::{Error, Result};
use crate::handle::FileHandle;
use crate::lock::{AccessMode, LockManager, LockOwner, LockType, UnifiedLock};

pub mod nfs4_error;
pub use nfs4_error::{map_error, Nfs4Status};

/// Stateid `other` field's type tag (`spec.md` §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateidType {
    Open = 0x01,
    Lock = 0x02,
    Delegation = 0x03,
}

/// `stateid4 = { seqid: u32, other: opaque[12] }` (`spec.md` §6).
/// `other` = `[epoch:4][type:1][random:7]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Stateid {
    pub seqid: u32,
    pub other: [u8; 12],
}

impl Stateid {
    fn new(epoch: u32, ty: StateidType, rng: &mut impl RngCore) -> Self {
        let mut other = [0u8; 12];
        other[0..4].copy_from_slice(&epoch.to_be_bytes());
        other[4] = ty as u8;
        let mut random = [0u8; 7];
        rng.fill_bytes(&mut random);
        other[5..12].copy_from_slice(&random);
        Self { seqid: 1, other }
    }

    fn epoch(&self) -> u32 {
        u32::from_be_bytes(self.other[0..4].try_into().unwrap())
    }

    pub fn encode(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.seqid.to_be_bytes());
        out[4..16].copy_from_slice(&self.other);
        out
    }

    pub fn decode(bytes: &[u8; 16]) -> Self {
        let seqid = u32::from_be_bytes(bytes[0..4].try_into().unwrap());
        let mut other = [0u8; 12];
        other.copy_from_slice(&bytes[4..16]);
        Self { seqid, other }
    }
}

/// Outcome of validating an incoming seqid against an owner's replay cache
/// (`spec.md` §4.5, §8 "Seqid round-trip").
#[derive(Debug)]
pub enum SeqidOutcome<T> {
    Process,
    Replay(T),
    BadSeqid,
}

/// Per-owner replay cache: `lastSeqID` plus the cached result of the last
/// non-replay request (`spec.md` §9 "Replay cache").
struct ReplayState<T> {
    last_seqid: u32,
    last_result: Option<T>,
}

impl<T: Clone> ReplayState<T> {
    fn new() -> Self {
        Self { last_seqid: 0, last_result: None }
    }

    /// Validate `seqid`; on `Process`, the caller must call
    /// [`ReplayState::commit`] with the outcome before returning.
    fn validate(&self, seqid: u32) -> SeqidOutcome<T> {
        let expected_next = self.last_seqid.wrapping_add(1).max(1);
        if seqid == expected_next {
            SeqidOutcome::Process
        } else if self.last_seqid != 0 && seqid == self.last_seqid {
            match &self.last_result {
                Some(r) => SeqidOutcome::Replay(r.clone()),
                None => SeqidOutcome::BadSeqid,
            }
        } else {
            SeqidOutcome::BadSeqid
        }
    }

    fn commit(&mut self, seqid: u32, result: T) {
        self.last_seqid = seqid;
        self.last_result = Some(result);
    }
}

#[derive(Debug, Clone)]
pub struct Client {
    pub client_id: u64,
    pub verifier: [u8; 8],
    pub principal: String,
    pub confirmed: bool,
    pub lease_expires_at: Instant,
}

pub struct OpenOwner {
    pub client_id: u64,
    pub owner_data: Vec<u8>,
    seqid_state: ReplayState<Result<Stateid>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Unchecked,
    Guarded,
    Exclusive4([u8; 8]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimType {
    Null,
    Previous,
}

pub struct OpenState {
    pub stateid: Stateid,
    pub open_owner_key: (u64, Vec<u8>),
    pub handle: FileHandle,
    pub share_access: AccessMode,
    pub share_deny: AccessMode,
    pub lock_owner_keys: Vec<(u64, Vec<u8>)>,
}

pub struct LockOwnerState {
    pub client_id: u64,
    pub owner_data: Vec<u8>,
    seqid_state: ReplayState<Result<Stateid>>,
}

pub struct LockState {
    pub stateid: Stateid,
    pub lock_owner_key: (u64, Vec<u8>),
    pub handle: FileHandle,
    pub lock_id: u64,
}

/// Result of a successful OPEN (`spec.md` §4.5).
pub struct OpenResult {
    pub stateid: Stateid,
    pub needs_confirm: bool,
}

struct Inner {
    clients: HashMap<u64, Client>,
    open_owners: HashMap<(u64, Vec<u8>), OpenOwner>,
    open_states: HashMap<[u8; 12], OpenState>,
    lock_owners: HashMap<(u64, Vec<u8>), LockOwnerState>,
    lock_states: HashMap<[u8; 12], LockState>,
    next_client_id: u64,
}

/// Clients/open-owners/lock-owners/stateids and their lease lifecycle. Sits
/// on top of a shared [`LockManager`] — state removal always routes through
/// it so the two subsystems never drift apart.
pub struct StateManager {
    inner: RwLock<Inner>,
    lock_manager: Arc<LockManager>,
    epoch: u32,
    lease_time: Duration,
}

impl StateManager {
    pub fn new(lock_manager: Arc<LockManager>, lease_time: Duration, epoch: u32) -> Self {
        Self {
            inner: RwLock::new(Inner {
                clients: HashMap::new(),
                open_owners: HashMap::new(),
                open_states: HashMap::new(),
                lock_owners: HashMap::new(),
                lock_states: HashMap::new(),
                next_client_id: 1,
            }),
            lock_manager,
            epoch,
            lease_time,
        }
    }

    /// `SETCLIENTID`: registers an unconfirmed client, to be finalized by
    /// `SETCLIENTID_CONFIRM`.
    pub fn set_clientid(&self, verifier: [u8; 8], principal: String) -> u64 {
        let mut inner = self.inner.write().unwrap();
        let client_id = inner.next_client_id;
        inner.next_client_id += 1;
        inner.clients.insert(
            client_id,
            Client { client_id, verifier, principal, confirmed: false, lease_expires_at: Instant::now() + self.lease_time },
        );
        client_id
    }

    /// `SETCLIENTID_CONFIRM`.
    pub fn confirm_clientid(&self, client_id: u64, verifier: [u8; 8]) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let client = inner.clients.get_mut(&client_id).ok_or(Error::BadStateid)?;
        if client.verifier != verifier {
            return Err(Error::BadStateid);
        }
        client.confirmed = true;
        client.lease_expires_at = Instant::now() + self.lease_time;
        Ok(())
    }

    fn renew_lease(&self, inner: &mut Inner, client_id: u64) {
        if let Some(client) = inner.clients.get_mut(&client_id) {
            client.lease_expires_at = Instant::now() + self.lease_time;
        }
    }

    /// `OPEN` (`spec.md` §4.5): `CLAIM_NULL` or `CLAIM_PREVIOUS` (reclaim
    /// during grace), `UNCHECKED`/`GUARDED`/`EXCLUSIVE4` create modes.
    /// Always returns `needs_confirm = true` for a first-seen open-owner.
    pub fn open(
        &self,
        client_id: u64,
        owner_data: Vec<u8>,
        seqid: u32,
        handle: FileHandle,
        share_access: AccessMode,
        share_deny: AccessMode,
        claim: ClaimType,
        _create_mode: CreateMode,
    ) -> Result<OpenResult> {
        let mut inner = self.inner.write().unwrap();
        if !inner.clients.contains_key(&client_id) {
            return Err(Error::BadStateid);
        }

        let key = (client_id, owner_data.clone());
        let is_new_owner = !inner.open_owners.contains_key(&key);
        let owner = inner.open_owners.entry(key.clone()).or_insert_with(|| OpenOwner {
            client_id,
            owner_data: owner_data.clone(),
            seqid_state: ReplayState::new(),
        });

        match owner.seqid_state.validate(seqid) {
            SeqidOutcome::BadSeqid => return Err(Error::BadSeqid),
            SeqidOutcome::Replay(cached) => return cached.map(|stateid| OpenResult { stateid, needs_confirm: is_new_owner }),
            SeqidOutcome::Process => {}
        }

        let lock_owner = LockOwner::new(format!("nfs4:{client_id}:{}", hex(&owner_data)), client_id.to_string(), String::new());
        let access_mode = share_access | deny_bits(share_deny);
        let reclaim = matches!(claim, ClaimType::Previous);

        let unified = UnifiedLock {
            id: 0,
            owner: lock_owner,
            handle: handle.clone(),
            offset: 0,
            length: crate::lock::LENGTH_FULL_FILE,
            lock_type: LockType::Shared,
            access_mode,
            oplock: None,
            acquired_at: Instant::now(),
            reclaim,
        };

        let outcome: Result<Stateid> = match self.lock_manager.add_unified_lock(unified) {
            Ok(_) => {
                let mut rng = rand::thread_rng();
                let stateid = Stateid::new(self.epoch, StateidType::Open, &mut rng);
                inner.open_states.insert(
                    stateid.other,
                    OpenState {
                        stateid,
                        open_owner_key: key.clone(),
                        handle,
                        share_access,
                        share_deny,
                        lock_owner_keys: Vec::new(),
                    },
                );
                Ok(stateid)
            }
            Err(e) => Err(e),
        };

        let owner = inner.open_owners.get_mut(&key).unwrap();
        // Denied requests still advance the open-owner's seqid per the
        // general OPEN path (only LOCK's denial is seqid-exempt, spec.md §8).
        owner.seqid_state.commit(seqid, outcome.clone());

        self.renew_lease(&mut inner, client_id);
        outcome.map(|stateid| OpenResult { stateid, needs_confirm: is_new_owner })
    }

    /// `OPEN_CONFIRM`: required after the first OPEN for a new open-owner.
    pub fn open_confirm(&self, stateid: &Stateid, seqid: u32) -> Result<Stateid> {
        self.validate_epoch(stateid)?;
        let mut inner = self.inner.write().unwrap();
        let open_key = inner.open_states.get(&stateid.other).map(|s| s.open_owner_key.clone()).ok_or(Error::BadStateid)?;
        let owner = inner.open_owners.get_mut(&open_key).ok_or(Error::BadStateid)?;

        match owner.seqid_state.validate(seqid) {
            SeqidOutcome::BadSeqid => return Err(Error::BadSeqid),
            SeqidOutcome::Replay(cached) => return cached,
            SeqidOutcome::Process => {}
        }

        let new_stateid = stateid.clone_bumped();

        let state = inner.open_states.get_mut(&stateid.other).unwrap();
        state.stateid = new_stateid;

        let owner = inner.open_owners.get_mut(&open_key).unwrap();
        owner.seqid_state.commit(seqid, Ok(new_stateid));
        Ok(new_stateid)
    }

    /// `LOCK`: decodes the effective `locker4` union via `new_lock_owner`.
    /// Denied requests do not advance either owner's seqid (`spec.md` §8).
    #[allow(clippy::too_many_arguments)]
    pub fn lock(
        &self,
        open_stateid: &Stateid,
        new_lock_owner: bool,
        lock_owner_data: Vec<u8>,
        open_seqid: Option<u32>,
        lock_seqid: u32,
        offset: u64,
        length: u64,
        lock_type: LockType,
        reclaim: bool,
    ) -> Result<Stateid> {
        self.validate_epoch(open_stateid)?;
        let mut inner = self.inner.write().unwrap();

        let open_state = inner.open_states.get(&open_stateid.other).ok_or(Error::BadStateid)?;
        let handle = open_state.handle.clone();
        let share_access = open_state.share_access;
        let open_owner_key = open_state.open_owner_key.clone();
        let client_id = inner.open_owners.get(&open_owner_key).map(|o| o.client_id).ok_or(Error::BadStateid)?;

        if matches!(lock_type, LockType::Exclusive) && !share_access.contains(AccessMode::ACCESS_WRITE) {
            return Err(Error::OpenMode);
        }

        let lock_owner_key = (client_id, lock_owner_data.clone());

        if new_lock_owner {
            let seqid = open_seqid.ok_or(Error::BadSeqid)?;
            let open_owner = inner.open_owners.get_mut(&open_owner_key).ok_or(Error::BadStateid)?;
            match open_owner.seqid_state.validate(seqid) {
                SeqidOutcome::BadSeqid => return Err(Error::BadSeqid),
                SeqidOutcome::Process => {}
                SeqidOutcome::Replay(_) => return Err(Error::BadSeqid),
            }
            // Only successful LOCK requests advance the open-owner's seqid here.
        }

        let lock_owner_state = inner.lock_owners.entry(lock_owner_key.clone()).or_insert_with(|| LockOwnerState {
            client_id,
            owner_data: lock_owner_data.clone(),
            seqid_state: ReplayState::new(),
        });

        match lock_owner_state.seqid_state.validate(lock_seqid) {
            SeqidOutcome::BadSeqid => return Err(Error::BadSeqid),
            SeqidOutcome::Replay(cached) => return cached,
            SeqidOutcome::Process => {}
        }

        let owner = LockOwner::new(format!("nfs4:{client_id}:{}", hex(&lock_owner_data)), client_id.to_string(), String::new());
        let unified = UnifiedLock {
            id: 0,
            owner,
            handle: handle.clone(),
            offset,
            length,
            lock_type,
            access_mode: AccessMode::empty(),
            oplock: None,
            acquired_at: Instant::now(),
            reclaim,
        };

        let add_result = self.lock_manager.add_unified_lock(unified);

        let outcome: Result<Stateid> = match add_result {
            Ok(installed) => {
                let mut rng = rand::thread_rng();
                let stateid = Stateid::new(self.epoch, StateidType::Lock, &mut rng);
                inner.lock_states.insert(
                    stateid.other,
                    LockState { stateid, lock_owner_key: lock_owner_key.clone(), handle: handle.clone(), lock_id: installed.id },
                );
                if let Some(open_state) = inner.open_states.get_mut(&open_stateid.other) {
                    open_state.lock_owner_keys.push(lock_owner_key.clone());
                }
                Ok(stateid)
            }
            Err(e) => Err(e),
        };

        // Denied lock requests do not advance seqids on either owner.
        if outcome.is_ok() {
            let lock_owner_state = inner.lock_owners.get_mut(&lock_owner_key).unwrap();
            lock_owner_state.seqid_state.commit(lock_seqid, outcome.clone());
            if new_lock_owner {
                if let Some(seqid) = open_seqid {
                    let open_owner = inner.open_owners.get_mut(&open_owner_key).unwrap();
                    open_owner.seqid_state.commit(seqid, Ok(open_stateid.clone_bumped()));
                }
            }
        }

        self.renew_lease(&mut inner, client_id);
        outcome
    }

    /// `CLOSE`: `NFS4ERR_LOCKS_HELD` if the open's lock-state set is
    /// non-empty (`spec.md` I-N2).
    pub fn close(&self, stateid: &Stateid) -> Result<()> {
        self.validate_epoch(stateid)?;
        let mut inner = self.inner.write().unwrap();
        let state = inner.open_states.get(&stateid.other).ok_or(Error::BadStateid)?;
        if !state.lock_owner_keys.is_empty() {
            return Err(Error::LocksHeld);
        }
        let handle = state.handle.clone();
        let owner_key = state.open_owner_key.clone();
        let owner_data = inner.open_owners.get(&owner_key).map(|o| o.owner_data.clone()).unwrap_or_default();

        inner.open_states.remove(&stateid.other);
        inner.open_owners.remove(&owner_key);
        drop(inner);

        let lock_owner = LockOwner::new(format!("nfs4:{}:{}", owner_key.0, hex(&owner_data)), owner_key.0.to_string(), String::new());
        self.lock_manager.remove_unified_lock(&handle, &lock_owner, 0, crate::lock::LENGTH_FULL_FILE);
        Ok(())
    }

    /// `RELEASE_LOCKOWNER`: strict RFC reading, `NFS4ERR_LOCKS_HELD` if any
    /// lock state remains for the owner.
    pub fn release_lockowner(&self, client_id: u64, owner_data: &[u8]) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        let key = (client_id, owner_data.to_vec());
        let has_locks = inner.lock_states.values().any(|s| s.lock_owner_key == key);
        if has_locks {
            return Err(Error::LocksHeld);
        }
        inner.lock_owners.remove(&key);
        Ok(())
    }

    fn validate_epoch(&self, stateid: &Stateid) -> Result<()> {
        if stateid.epoch() != self.epoch {
            return Err(Error::StaleStateid);
        }
        Ok(())
    }

    /// Lease-expiry sweep, run every second (`spec.md` §4.5, §5
    /// "Timeouts"). Tears down state in I-N3 order: lockowners →
    /// lockstates (and their locks) → openowners → openstates → client.
    pub fn sweep_expired_leases(&self) {
        let now = Instant::now();
        let expired: Vec<u64> = {
            let inner = self.inner.read().unwrap();
            inner.clients.values().filter(|c| c.confirmed && c.lease_expires_at <= now).map(|c| c.client_id).collect()
        };

        for client_id in expired {
            info!(client_id, "client lease expired, tearing down state");
            self.lock_manager.remove_client_locks(&client_id.to_string());

            let mut inner = self.inner.write().unwrap();
            inner.lock_states.retain(|_, s| s.lock_owner_key.0 != client_id);
            inner.lock_owners.retain(|k, _| k.0 != client_id);
            inner.open_states.retain(|_, s| s.open_owner_key.0 != client_id);
            inner.open_owners.retain(|k, _| k.0 != client_id);
            inner.clients.remove(&client_id);
        }
    }

    /// Spawn the background lease sweep task (`spec.md` §5: "runs every
    /// second").
    pub fn spawn_lease_sweep(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            loop {
                interval.tick().await;
                this.sweep_expired_leases();
            }
        })
    }

    pub fn touch_client(&self, client_id: u64) {
        let mut inner = self.inner.write().unwrap();
        self.renew_lease(&mut inner, client_id);
    }
}

impl Stateid {
    fn clone_bumped(&self) -> Stateid {
        let mut s = *self;
        s.seqid = s.seqid.wrapping_add(1).max(1);
        s
    }
}

fn deny_bits(deny: AccessMode) -> AccessMode {
    let mut out = AccessMode::empty();
    if deny.contains(AccessMode::ACCESS_READ) {
        out |= AccessMode::DENY_READ;
    }
    if deny.contains(AccessMode::ACCESS_WRITE) {
        out |= AccessMode::DENY_WRITE;
    }
    out
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::LockManagerConfig;

    fn new_manager() -> (Arc<LockManager>, Arc<StateManager>) {
        let lm = Arc::new(LockManager::new(LockManagerConfig::default(), None));
        let sm = Arc::new(StateManager::new(lm.clone(), Duration::from_secs(90), 7));
        (lm, sm)
    }

    #[test]
    fn open_requires_confirm_for_new_owner() {
        let (_lm, sm) = new_manager();
        let client_id = sm.set_clientid([1; 8], "alice".into());
        sm.confirm_clientid(client_id, [1; 8]).unwrap();

        let handle = FileHandle::new(vec![1, 2, 3]);
        let result = sm
            .open(
                client_id,
                b"owner-1".to_vec(),
                1,
                handle,
                AccessMode::ACCESS_READ | AccessMode::ACCESS_WRITE,
                AccessMode::empty(),
                ClaimType::Null,
                CreateMode::Unchecked,
            )
            .unwrap();
        assert!(result.needs_confirm);

        let confirmed = sm.open_confirm(&result.stateid, 1).unwrap();
        assert_eq!(confirmed.seqid, result.stateid.seqid + 1);
    }

    #[test]
    fn replay_returns_cached_result_without_reprocessing() {
        let (_lm, sm) = new_manager();
        let client_id = sm.set_clientid([2; 8], "bob".into());
        sm.confirm_clientid(client_id, [2; 8]).unwrap();
        let handle = FileHandle::new(vec![9]);

        let first = sm
            .open(
                client_id,
                b"owner".to_vec(),
                1,
                handle.clone(),
                AccessMode::ACCESS_READ,
                AccessMode::empty(),
                ClaimType::Null,
                CreateMode::Unchecked,
            )
            .unwrap();

        let replay = sm
            .open(
                client_id,
                b"owner".to_vec(),
                1,
                handle,
                AccessMode::ACCESS_READ,
                AccessMode::empty(),
                ClaimType::Null,
                CreateMode::Unchecked,
            )
            .unwrap();

        assert_eq!(first.stateid, replay.stateid);
    }

    #[test]
    fn bad_seqid_is_rejected() {
        let (_lm, sm) = new_manager();
        let client_id = sm.set_clientid([3; 8], "carol".into());
        sm.confirm_clientid(client_id, [3; 8]).unwrap();
        let handle = FileHandle::new(vec![5]);

        let err = sm
            .open(
                client_id,
                b"owner".to_vec(),
                5, // should be 1 for a first request
                handle,
                AccessMode::ACCESS_READ,
                AccessMode::empty(),
                ClaimType::Null,
                CreateMode::Unchecked,
            )
            .unwrap_err();
        assert!(matches!(err, Error::BadSeqid));
    }

    #[test]
    fn close_with_held_locks_is_rejected() {
        let (_lm, sm) = new_manager();
        let client_id = sm.set_clientid([4; 8], "dave".into());
        sm.confirm_clientid(client_id, [4; 8]).unwrap();
        let handle = FileHandle::new(vec![6]);

        let open_result = sm
            .open(
                client_id,
                b"owner".to_vec(),
                1,
                handle,
                AccessMode::ACCESS_READ | AccessMode::ACCESS_WRITE,
                AccessMode::empty(),
                ClaimType::Null,
                CreateMode::Unchecked,
            )
            .unwrap();
        let confirmed = sm.open_confirm(&open_result.stateid, 1).unwrap();

        sm.lock(&confirmed, true, b"lock-owner".to_vec(), Some(2), 1, 0, 10, LockType::Exclusive, false).unwrap();

        let err = sm.close(&confirmed).unwrap_err();
        assert!(matches!(err, Error::LocksHeld));
    }

    #[test]
    fn lease_expiry_tears_down_client_and_locks() {
        let lm = Arc::new(LockManager::new(LockManagerConfig::default(), None));
        let sm = Arc::new(StateManager::new(lm.clone(), Duration::from_millis(20), 9));
        let client_id = sm.set_clientid([5; 8], "erin".into());
        sm.confirm_clientid(client_id, [5; 8]).unwrap();
        let handle = FileHandle::new(vec![7]);

        let open_result = sm
            .open(
                client_id,
                b"owner".to_vec(),
                1,
                handle.clone(),
                AccessMode::ACCESS_READ | AccessMode::ACCESS_WRITE,
                AccessMode::empty(),
                ClaimType::Null,
                CreateMode::Unchecked,
            )
            .unwrap();
        let confirmed = sm.open_confirm(&open_result.stateid, 1).unwrap();
        sm.lock(&confirmed, true, b"lock-owner".to_vec(), Some(2), 1, 0, 10, LockType::Exclusive, false).unwrap();

        std::thread::sleep(Duration::from_millis(40));
        sm.sweep_expired_leases();

        let err = sm
            .open(
                client_id,
                b"other-owner".to_vec(),
                1,
                handle.clone(),
                AccessMode::ACCESS_READ,
                AccessMode::empty(),
                ClaimType::Null,
                CreateMode::Unchecked,
            )
            .unwrap_err();
        assert!(matches!(err, Error::BadStateid));

        // The byte-range lock the expired client held must be gone too: a
        // fresh exclusive lock over the same range from another owner now
        // succeeds instead of conflicting.
        let other = UnifiedLock {
            id: 0,
            owner: LockOwner::new("nfs4:99:new", "99", ""),
            handle,
            offset: 0,
            length: 10,
            lock_type: LockType::Exclusive,
            access_mode: AccessMode::empty(),
            oplock: None,
            acquired_at: Instant::now(),
            reclaim: false,
        };
        lm.add_unified_lock(other).unwrap();
    }
}
