//! Unified lock manager (`spec.md` §4.4): a single protocol-agnostic
//! conflict-detection engine over byte-range locks, share-mode access
//! reservations, and oplocks/leases/delegations.

pub mod grace;

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::{Duration, Instant};

use bitflags::bitflags;
use tracing::{debug, trace, warn};

use crate::error::{ConflictInfo, Error, Result};
use crate::handle::FileHandle;

pub use grace::GraceManager;

/// Default `LeaseBreakTimeout` — the SMB2 spec's maximum (`spec.md` §4.4).
pub const DEFAULT_LEASE_BREAK_TIMEOUT: Duration = Duration::from_secs(35);
/// Default grace period duration (`spec.md` §4.4).
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(90);

/// Cross-protocol lock owner identity.
///
/// `owner_id` carries a reserved prefix identifying the protocol that
/// created it: `nfs4:`, `nlm:`, `smb:`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockOwner {
    pub owner_id: String,
    pub client_id: String,
    pub share_name: String,
}

impl LockOwner {
    pub fn new(
        owner_id: impl Into<String>,
        client_id: impl Into<String>,
        share_name: impl Into<String>,
    ) -> Self {
        Self { owner_id: owner_id.into(), client_id: client_id.into(), share_name: share_name.into() }
    }
}

bitflags! {
    /// 5-bit access-mode field (`spec.md` §3).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AccessMode: u8 {
        const ACCESS_READ  = 0b0000_0001;
        const ACCESS_WRITE = 0b0000_0010;
        const DENY_READ    = 0b0000_0100;
        const DENY_WRITE   = 0b0000_1000;
        const DENY_DELETE  = 0b0001_0000;
    }
}

bitflags! {
    /// Union-set `OpLockState` (`spec.md` §3): `None`, `Read`, `Write`,
    /// `Handle`, `Read|Handle`, `Read|Write|Handle`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpLockState: u8 {
        const READ   = 0b001;
        const WRITE  = 0b010;
        const HANDLE = 0b100;
    }
}

/// Byte-range lock type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Shared,
    Exclusive,
}

/// "To EOF" / "full file" range sentinel values (`spec.md` §4.4).
pub const LENGTH_TO_EOF: u64 = 0;
pub const LENGTH_FULL_FILE: u64 = u64::MAX;

/// An oplock/lease/delegation grant on a handle.
#[derive(Debug, Clone)]
pub struct OpLock {
    pub group_key: String,
    pub state: OpLockState,
    pub breaking: bool,
    pub break_target: OpLockState,
    pub version: u32,
}

/// A single unified lock: a byte-range lock, a share reservation, or an
/// oplock, all modeled through the same record so the conflict engine can
/// reason about all three uniformly.
#[derive(Debug, Clone)]
pub struct UnifiedLock {
    pub id: u64,
    pub owner: LockOwner,
    pub handle: FileHandle,
    pub offset: u64,
    pub length: u64,
    pub lock_type: LockType,
    pub access_mode: AccessMode,
    pub oplock: Option<OpLock>,
    pub acquired_at: Instant,
    pub reclaim: bool,
}

impl UnifiedLock {
    /// Exclusive-of-interval end (`offset + length`), `u64::MAX` for the
    /// "to EOF" / "full file" sentinels.
    fn range_end(&self) -> u64 {
        if self.length == LENGTH_TO_EOF || self.offset.checked_add(self.length).is_none() {
            u64::MAX
        } else {
            self.offset + self.length
        }
    }

    fn overlaps(&self, other: &UnifiedLock) -> bool {
        if self.length == LENGTH_FULL_FILE || other.length == LENGTH_FULL_FILE {
            return true;
        }
        self.offset < other.range_end() && other.offset < self.range_end()
    }

    fn is_byte_range(&self) -> bool {
        true
    }
}

/// Reason a byte-range lock was revoked, carried to
/// [`BreakCallbacks::on_byte_range_revoke`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevokeReason {
    LeaseExpired,
    ClientReleased,
}

/// Callback surface the lock manager fans break notifications out to. The
/// NFS adapter implements only `on_oplock_break` (delegation recall); the
/// SMB adapter implements all three (`spec.md` §4.4).
pub trait BreakCallbacks: Send + Sync {
    fn on_oplock_break(&self, handle: &FileHandle, lock: &UnifiedLock, target: OpLockState);
    fn on_byte_range_revoke(&self, handle: &FileHandle, lock: &UnifiedLock, reason: RevokeReason) {
        let _ = (handle, lock, reason);
    }
    fn on_access_conflict(&self, handle: &FileHandle, existing: &UnifiedLock, requested: AccessMode) {
        let _ = (handle, existing, requested);
    }
}

/// Denial detail returned when `AddUnifiedLock`/`TestLock` finds a conflict;
/// maps to NFS `LOCK4denied`, the NLM holder reply, and the SMB deny reason.
#[derive(Debug, Clone)]
pub struct LockDenied {
    pub holder: LockOwner,
    pub offset: u64,
    pub length: u64,
    pub lock_type: LockType,
}

pub struct LockManagerConfig {
    pub lease_break_timeout: Duration,
    pub max_locks_per_file: usize,
    pub max_locks_per_client: usize,
    pub max_locks_total: usize,
}

impl Default for LockManagerConfig {
    fn default() -> Self {
        Self {
            lease_break_timeout: DEFAULT_LEASE_BREAK_TIMEOUT,
            max_locks_per_file: 10_000,
            max_locks_per_client: 100_000,
            max_locks_total: 1_000_000,
        }
    }
}

struct HandleLocks {
    locks: Vec<UnifiedLock>,
}

/// The central conflict-detection engine. A single reader/writer lock
/// guards the per-handle lock table; break dispatch happens with the lock
/// released (`spec.md` I-L4).
pub struct LockManager {
    table: RwLock<HashMap<FileHandle, HandleLocks>>,
    next_id: Mutex<u64>,
    config: LockManagerConfig,
    grace: Option<GraceManager>,
    callbacks: RwLock<Vec<Box<dyn BreakCallbacks>>>,
    total_locks: Mutex<usize>,
    /// Wait-for graph for blocking lock requests (`spec.md` §4.4): edge
    /// `waiter -> holder` means `waiter` is blocked on a lock `holder`
    /// currently holds. A cycle means granting the wait would deadlock.
    wait_for: Mutex<HashMap<String, std::collections::HashSet<String>>>,
}

/// One pending break notification, collected under the write lock and
/// delivered after it is released.
struct PendingBreak {
    handle: FileHandle,
    lock: UnifiedLock,
    target: OpLockState,
}

impl LockManager {
    pub fn new(config: LockManagerConfig, grace: Option<GraceManager>) -> Self {
        Self {
            table: RwLock::new(HashMap::new()),
            next_id: Mutex::new(1),
            config,
            grace,
            callbacks: RwLock::new(Vec::new()),
            total_locks: Mutex::new(0),
            wait_for: Mutex::new(HashMap::new()),
        }
    }

    pub fn register_break_callbacks(&self, callbacks: Box<dyn BreakCallbacks>) {
        self.callbacks.write().unwrap().push(callbacks);
    }

    fn next_id(&self) -> u64 {
        let mut guard = self.next_id.lock().unwrap();
        let id = *guard;
        *guard += 1;
        id
    }

    /// Central conflict predicate (`spec.md` §4.4, steps 1-5).
    pub fn conflicts_with(a: &UnifiedLock, b: &UnifiedLock) -> bool {
        if a.owner.owner_id == b.owner.owner_id {
            return false;
        }

        if access_mode_conflict(a, b) {
            return true;
        }

        match (&a.oplock, &b.oplock) {
            (Some(oa), Some(ob)) => return oplock_states_conflict(oa.state, ob.state),
            (Some(oa), None) => return oplock_vs_range_conflicts(oa.state, b),
            (None, Some(ob)) => return oplock_vs_range_conflicts(ob.state, a),
            (None, None) => {}
        }

        if !a.overlaps(b) {
            return false;
        }
        matches!(a.lock_type, LockType::Exclusive) || matches!(b.lock_type, LockType::Exclusive)
    }

    /// `AddUnifiedLock`: rejects on grace-period restriction, scans for the
    /// first conflict, merges adjacent same-owner same-type ranges, and
    /// installs atomically.
    pub fn add_unified_lock(&self, mut lock: UnifiedLock) -> Result<UnifiedLock> {
        if let Some(grace) = &self.grace {
            if grace.is_active() {
                if !lock.reclaim {
                    return Err(Error::GracePeriod);
                }
            } else if lock.reclaim {
                // Open question in spec.md §9: strict reading rejects
                // reclaim=true outside grace with NFS4ERR_NO_GRACE.
                return Err(Error::NoGrace);
            }
        } else if lock.reclaim {
            return Err(Error::NoGrace);
        }

        let mut table = self.table.write().unwrap();
        let entry = table.entry(lock.handle.clone()).or_insert_with(|| HandleLocks { locks: Vec::new() });

        if entry.locks.len() >= self.config.max_locks_per_file {
            return Err(Error::InvalidArgument("max_locks_per_file exceeded".into()));
        }
        {
            let total = *self.total_locks.lock().unwrap();
            if total >= self.config.max_locks_total {
                return Err(Error::InvalidArgument("max_locks_total exceeded".into()));
            }
        }

        for existing in &entry.locks {
            if Self::conflicts_with(&lock, existing) {
                return Err(Error::Conflict(ConflictInfo {
                    holder: existing.owner.clone(),
                    offset: existing.offset,
                    length: existing.length,
                }));
            }
        }

        lock.id = self.next_id();
        merge_or_insert(&mut entry.locks, lock.clone());
        *self.total_locks.lock().unwrap() += 1;
        Ok(lock)
    }

    /// `AddUnifiedLock` variant protocol glue uses for blocking lock
    /// requests (`spec.md` §4.4 "deadlock detection on blocking-lock
    /// requests builds a wait-for graph when Blocking=true"). On conflict
    /// with `blocking = true`, records a wait-for edge from the requesting
    /// owner to the conflicting holder and checks whether that edge would
    /// close a cycle; a cycle yields [`Error::Deadlock`] instead of the
    /// usual [`Error::Conflict`]. A non-blocking request behaves exactly
    /// like [`Self::add_unified_lock`].
    pub fn add_unified_lock_blocking(&self, lock: UnifiedLock, blocking: bool) -> Result<UnifiedLock> {
        let waiter = lock.owner.owner_id.clone();
        match self.add_unified_lock(lock) {
            Ok(granted) => {
                self.release_waits_held_by(&waiter);
                Ok(granted)
            }
            Err(Error::Conflict(info)) if blocking => {
                let holder = info.holder.owner_id.clone();
                if self.would_deadlock(&waiter, &holder) {
                    warn!(waiter, holder, "blocking lock request would deadlock");
                    Err(Error::Deadlock)
                } else {
                    self.add_wait(&waiter, &holder);
                    Err(Error::Conflict(info))
                }
            }
            Err(e) => Err(e),
        }
    }

    fn add_wait(&self, waiter: &str, holder: &str) {
        self.wait_for.lock().unwrap().entry(waiter.to_string()).or_default().insert(holder.to_string());
    }

    /// Drops every wait-for edge naming `owner_id`, either as the waiter
    /// (its request was granted or abandoned) or as the held-upon resource
    /// (its lock was released, so anyone waiting on it can retry).
    fn release_waits_held_by(&self, owner_id: &str) {
        let mut graph = self.wait_for.lock().unwrap();
        graph.remove(owner_id);
        for holders in graph.values_mut() {
            holders.remove(owner_id);
        }
    }

    /// Would adding the edge `waiter -> holder` close a cycle in the
    /// wait-for graph? Depth-first search from `holder` looking for a path
    /// back to `waiter`.
    fn would_deadlock(&self, waiter: &str, holder: &str) -> bool {
        if waiter == holder {
            return true;
        }
        let graph = self.wait_for.lock().unwrap();
        let mut stack = vec![holder.to_string()];
        let mut seen = std::collections::HashSet::new();
        while let Some(node) = stack.pop() {
            if node == waiter {
                return true;
            }
            if !seen.insert(node.clone()) {
                continue;
            }
            if let Some(next) = graph.get(&node) {
                stack.extend(next.iter().cloned());
            }
        }
        false
    }

    /// `TestLock`: would this lock conflict, without installing it?
    pub fn test_lock(&self, candidate: &UnifiedLock) -> Option<LockDenied> {
        let table = self.table.read().unwrap();
        let entry = table.get(&candidate.handle)?;
        for existing in &entry.locks {
            if Self::conflicts_with(candidate, existing) {
                return Some(LockDenied {
                    holder: existing.owner.clone(),
                    offset: existing.offset,
                    length: existing.length,
                    lock_type: existing.lock_type,
                });
            }
        }
        None
    }

    /// `RemoveUnifiedLock`: POSIX split semantics — a single existing range
    /// may split into 0, 1, or 2 sub-ranges.
    pub fn remove_unified_lock(&self, handle: &FileHandle, owner: &LockOwner, offset: u64, length: u64) {
        let mut table = self.table.write().unwrap();
        let Some(entry) = table.get_mut(handle) else { return };

        let remove_end = if length == LENGTH_TO_EOF { u64::MAX } else { offset.saturating_add(length) };
        let mut result = Vec::with_capacity(entry.locks.len());
        let mut removed = 0usize;

        for existing in entry.locks.drain(..) {
            if existing.owner.owner_id != owner.owner_id {
                result.push(existing);
                continue;
            }
            let existing_end =
                if existing.length == LENGTH_TO_EOF { u64::MAX } else { existing.offset.saturating_add(existing.length) };

            if remove_end <= existing.offset || offset >= existing_end {
                // no overlap
                result.push(existing);
                continue;
            }

            removed += 1;
            // left remainder
            if existing.offset < offset {
                let mut left = existing.clone();
                left.id = self.next_id();
                left.length = offset - existing.offset;
                result.push(left);
            }
            // right remainder
            if existing_end > remove_end && existing_end != u64::MAX {
                let mut right = existing.clone();
                right.id = self.next_id();
                right.offset = remove_end;
                right.length = existing_end - remove_end;
                result.push(right);
            } else if existing_end == u64::MAX && remove_end != u64::MAX {
                let mut right = existing.clone();
                right.id = self.next_id();
                right.offset = remove_end;
                right.length = LENGTH_TO_EOF;
                result.push(right);
            }
        }

        entry.locks = result;
        if removed > 0 {
            *self.total_locks.lock().unwrap() -= removed;
        }
        self.release_waits_held_by(&owner.owner_id);
    }

    pub fn list_unified_locks(&self, handle: &FileHandle) -> Vec<UnifiedLock> {
        let table = self.table.read().unwrap();
        table.get(handle).map(|e| e.locks.clone()).unwrap_or_default()
    }

    pub fn remove_file_unified_locks(&self, handle: &FileHandle) {
        let mut table = self.table.write().unwrap();
        if let Some(entry) = table.remove(handle) {
            *self.total_locks.lock().unwrap() -= entry.locks.len();
        }
    }

    pub fn remove_client_locks(&self, client_id: &str) {
        let mut table = self.table.write().unwrap();
        let mut removed = 0usize;
        let mut released_owners = Vec::new();
        for entry in table.values_mut() {
            let before = entry.locks.len();
            entry.locks.retain(|l| {
                let keep = l.owner.client_id != client_id;
                if !keep {
                    released_owners.push(l.owner.owner_id.clone());
                }
                keep
            });
            removed += before - entry.locks.len();
        }
        if removed > 0 {
            *self.total_locks.lock().unwrap() -= removed;
        }
        drop(table);
        for owner_id in released_owners {
            self.release_waits_held_by(&owner_id);
        }
    }

    /// `UpgradeLock`: replace a Shared lock with an Exclusive one in place,
    /// re-checking for conflicts against every other owner first.
    pub fn upgrade_lock(&self, handle: &FileHandle, owner: &LockOwner, offset: u64, length: u64) -> Result<()> {
        let mut table = self.table.write().unwrap();
        let Some(entry) = table.get_mut(handle) else { return Err(Error::NotFound) };

        let idx = entry
            .locks
            .iter()
            .position(|l| l.owner.owner_id == owner.owner_id && l.offset == offset && l.length == length)
            .ok_or(Error::NotFound)?;

        let mut candidate = entry.locks[idx].clone();
        candidate.lock_type = LockType::Exclusive;
        for (i, existing) in entry.locks.iter().enumerate() {
            if i == idx {
                continue;
            }
            if Self::conflicts_with(&candidate, existing) {
                return Err(Error::Conflict(ConflictInfo {
                    holder: existing.owner.clone(),
                    offset: existing.offset,
                    length: existing.length,
                }));
            }
        }
        entry.locks[idx].lock_type = LockType::Exclusive;
        Ok(())
    }

    /// Transitions all Read/Write oplocks on the handle (other than
    /// `exclude_owner`) to `None`. Collects break callbacks, releases the
    /// write lock, then invokes them (`spec.md` I-L4).
    pub fn check_and_break_oplocks_for_write(&self, handle: &FileHandle, exclude_owner: &str) {
        self.break_oplocks(handle, exclude_owner, OpLockState::empty(), |_state| true)
    }

    /// Transitions Write oplocks on the handle to `Read`.
    pub fn check_and_break_oplocks_for_read(&self, handle: &FileHandle, exclude_owner: &str) {
        self.break_oplocks(handle, exclude_owner, OpLockState::READ, |state| {
            state.contains(OpLockState::WRITE)
        })
    }

    /// Transitions all oplocks on the handle to `None` (delete path, and
    /// the `SHARE_DENY_DELETE` open question in `spec.md` §9).
    pub fn check_and_break_oplocks_for_delete(&self, handle: &FileHandle, exclude_owner: &str) {
        self.break_oplocks(handle, exclude_owner, OpLockState::empty(), |_state| true)
    }

    fn break_oplocks(
        &self,
        handle: &FileHandle,
        exclude_owner: &str,
        target: OpLockState,
        should_break: impl Fn(OpLockState) -> bool,
    ) {
        let mut pending = Vec::new();
        {
            let mut table = self.table.write().unwrap();
            if let Some(entry) = table.get_mut(handle) {
                for lock in entry.locks.iter_mut() {
                    if lock.owner.owner_id == exclude_owner {
                        continue;
                    }
                    let Some(oplock) = lock.oplock.as_mut() else { continue };
                    if !should_break(oplock.state) {
                        continue;
                    }
                    oplock.breaking = true;
                    oplock.break_target = target;
                    oplock.version += 1;
                    pending.push(PendingBreak { handle: handle.clone(), lock: lock.clone(), target });
                }
            }
        }

        if pending.is_empty() {
            return;
        }

        let callbacks = self.callbacks.read().unwrap();
        for item in pending {
            trace!(handle = ?item.handle, target = ?item.target, "dispatching oplock break");
            for cb in callbacks.iter() {
                cb.on_oplock_break(&item.handle, &item.lock, item.target);
            }
        }
    }

    /// Acknowledge a break: the holder downgraded its oplock explicitly.
    pub fn acknowledge_break(&self, handle: &FileHandle, lock_id: u64, new_state: OpLockState) {
        let mut table = self.table.write().unwrap();
        if let Some(entry) = table.get_mut(handle) {
            for lock in entry.locks.iter_mut() {
                if lock.id == lock_id {
                    if let Some(oplock) = lock.oplock.as_mut() {
                        oplock.state = new_state;
                        oplock.breaking = false;
                    }
                }
            }
        }
    }

    /// Force-downgrade any oplock still marked `breaking` past the
    /// configured timeout, without waiting for the holder (`spec.md` §4.4).
    pub fn expire_unacknowledged_breaks(&self, older_than: Duration) {
        let cutoff = Instant::now().checked_sub(older_than);
        let Some(cutoff) = cutoff else { return };
        let mut table = self.table.write().unwrap();
        for entry in table.values_mut() {
            for lock in entry.locks.iter_mut() {
                if let Some(oplock) = lock.oplock.as_mut() {
                    if oplock.breaking && lock.acquired_at <= cutoff {
                        debug!(id = lock.id, "oplock break acknowledgment timed out");
                        oplock.state = oplock.break_target;
                        oplock.breaking = false;
                    }
                }
            }
        }
    }

    pub fn lease_break_timeout(&self) -> Duration {
        self.config.lease_break_timeout
    }

    pub fn grace(&self) -> Option<&GraceManager> {
        self.grace.as_ref()
    }
}

fn access_mode_conflict(a: &UnifiedLock, b: &UnifiedLock) -> bool {
    let a_wants = a.access_mode.intersection(AccessMode::ACCESS_READ | AccessMode::ACCESS_WRITE);
    let b_denies = deny_to_wants(b.access_mode);
    let b_wants = b.access_mode.intersection(AccessMode::ACCESS_READ | AccessMode::ACCESS_WRITE);
    let a_denies = deny_to_wants(a.access_mode);
    !(a_wants & b_denies).is_empty() || !(b_wants & a_denies).is_empty()
}

fn deny_to_wants(mode: AccessMode) -> AccessMode {
    let mut out = AccessMode::empty();
    if mode.contains(AccessMode::DENY_READ) {
        out |= AccessMode::ACCESS_READ;
    }
    if mode.contains(AccessMode::DENY_WRITE) {
        out |= AccessMode::ACCESS_WRITE;
    }
    out
}

fn oplock_states_conflict(a: OpLockState, b: OpLockState) -> bool {
    // Write is exclusive: any Write oplock conflicts with any other grant.
    if a.contains(OpLockState::WRITE) || b.contains(OpLockState::WRITE) {
        return true;
    }
    // Read coexists with Read; Handle-holders conflict with other Handle-holders.
    a.contains(OpLockState::HANDLE) && b.contains(OpLockState::HANDLE)
}

fn oplock_vs_range_conflicts(state: OpLockState, range_lock: &UnifiedLock) -> bool {
    if !range_lock.is_byte_range() {
        return false;
    }
    if state.contains(OpLockState::WRITE) {
        return true;
    }
    if state.contains(OpLockState::READ) {
        return matches!(range_lock.lock_type, LockType::Exclusive);
    }
    false
}

/// Merge an incoming lock into an owner's adjacent same-type ranges
/// (`spec.md` I-L2), or append it if nothing merges.
fn merge_or_insert(locks: &mut Vec<UnifiedLock>, lock: UnifiedLock) {
    if lock.oplock.is_some() {
        locks.push(lock);
        return;
    }
    for existing in locks.iter_mut() {
        if existing.owner.owner_id != lock.owner.owner_id || existing.lock_type != lock.lock_type {
            continue;
        }
        if existing.length == LENGTH_TO_EOF || lock.length == LENGTH_TO_EOF {
            continue;
        }
        let existing_end = existing.offset.saturating_add(existing.length);
        let lock_end = lock.offset.saturating_add(lock.length);
        if lock.offset <= existing_end && existing.offset <= lock_end {
            existing.offset = existing.offset.min(lock.offset);
            let new_end = existing_end.max(lock_end);
            existing.length = new_end - existing.offset;
            return;
        }
    }
    locks.push(lock);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn owner(id: &str) -> LockOwner {
        LockOwner::new(id, id, "share")
    }

    fn byte_range(handle: &FileHandle, owner_id: &str, offset: u64, length: u64, ty: LockType) -> UnifiedLock {
        UnifiedLock {
            id: 0,
            owner: owner(owner_id),
            handle: handle.clone(),
            offset,
            length,
            lock_type: ty,
            access_mode: AccessMode::empty(),
            oplock: None,
            acquired_at: Instant::now(),
            reclaim: false,
        }
    }

    #[test]
    fn cross_protocol_lock_conflict_scenario() {
        // spec.md §8 scenario 2.
        let mgr = LockManager::new(LockManagerConfig::default(), None);
        let h = FileHandle::new(vec![1]);

        let a = byte_range(&h, "nfs4:42:aa", 0, 100, LockType::Exclusive);
        mgr.add_unified_lock(a).unwrap();

        let b_test = byte_range(&h, "nlm:alice:17:bb", 50, 100, LockType::Shared);
        let denied = mgr.test_lock(&b_test).unwrap();
        assert_eq!(denied.holder.owner_id, "nfs4:42:aa");
        assert_eq!(denied.offset, 0);
        assert_eq!(denied.length, 100);

        mgr.remove_unified_lock(&h, &owner("nfs4:42:aa"), 0, 100);
        assert!(mgr.test_lock(&b_test).is_none());
        mgr.add_unified_lock(b_test).unwrap();
        assert_eq!(mgr.list_unified_locks(&h).len(), 1);
    }

    #[test]
    fn same_owner_never_self_conflicts() {
        let mgr = LockManager::new(LockManagerConfig::default(), None);
        let h = FileHandle::new(vec![2]);
        mgr.add_unified_lock(byte_range(&h, "nfs4:1:a", 0, 10, LockType::Exclusive)).unwrap();
        // Same owner re-locking an overlapping range must not conflict.
        assert!(mgr.add_unified_lock(byte_range(&h, "nfs4:1:a", 5, 10, LockType::Exclusive)).is_ok());
    }

    #[test]
    fn shared_locks_from_different_owners_coexist() {
        let mgr = LockManager::new(LockManagerConfig::default(), None);
        let h = FileHandle::new(vec![3]);
        mgr.add_unified_lock(byte_range(&h, "nfs4:1:a", 0, 100, LockType::Shared)).unwrap();
        assert!(mgr.add_unified_lock(byte_range(&h, "nfs4:2:b", 50, 50, LockType::Shared)).is_ok());
    }

    #[test]
    fn posix_split_semantics_on_remove() {
        let mgr = LockManager::new(LockManagerConfig::default(), None);
        let h = FileHandle::new(vec![4]);
        mgr.add_unified_lock(byte_range(&h, "nfs4:1:a", 0, 100, LockType::Exclusive)).unwrap();
        // remove the middle [40, 60) -> splits into [0,40) and [60,100)
        mgr.remove_unified_lock(&h, &owner("nfs4:1:a"), 40, 20);
        let mut remaining = mgr.list_unified_locks(&h);
        remaining.sort_by_key(|l| l.offset);
        assert_eq!(remaining.len(), 2);
        assert_eq!((remaining[0].offset, remaining[0].length), (0, 40));
        assert_eq!((remaining[1].offset, remaining[1].length), (60, 40));
    }

    #[test]
    fn write_oplock_conflicts_with_any_byte_range_lock() {
        let mgr = LockManager::new(LockManagerConfig::default(), None);
        let h = FileHandle::new(vec![5]);
        let mut holder = byte_range(&h, "smb:1", 0, 0, LockType::Shared);
        holder.oplock = Some(OpLock {
            group_key: "g".into(),
            state: OpLockState::WRITE,
            breaking: false,
            break_target: OpLockState::empty(),
            version: 0,
        });
        mgr.add_unified_lock(holder).unwrap();

        let writer = byte_range(&h, "nfs4:2", 0, 10, LockType::Shared);
        assert!(mgr.test_lock(&writer).is_some());
    }

    #[test]
    fn grace_period_blocks_non_reclaim_locks() {
        let grace = GraceManager::new(Duration::from_secs(90), 1);
        let mgr = LockManager::new(LockManagerConfig::default(), Some(grace));
        let h = FileHandle::new(vec![6]);

        let mut reclaim_lock = byte_range(&h, "nfs4:1", 0, 10, LockType::Exclusive);
        reclaim_lock.reclaim = true;
        assert!(mgr.add_unified_lock(reclaim_lock).is_ok());

        let non_reclaim = byte_range(&h, "nfs4:2", 20, 10, LockType::Exclusive);
        assert!(matches!(mgr.add_unified_lock(non_reclaim), Err(Error::GracePeriod)));
    }

    #[test]
    fn oplock_break_dispatches_without_holding_lock() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        struct Counter(Arc<AtomicUsize>);
        impl BreakCallbacks for Counter {
            fn on_oplock_break(&self, _h: &FileHandle, _l: &UnifiedLock, _t: OpLockState) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let mgr = LockManager::new(LockManagerConfig::default(), None);
        let counter = Arc::new(AtomicUsize::new(0));
        mgr.register_break_callbacks(Box::new(Counter(counter.clone())));

        let h = FileHandle::new(vec![7]);
        let mut holder = byte_range(&h, "smb:1", 0, 0, LockType::Shared);
        holder.oplock = Some(OpLock {
            group_key: "g".into(),
            state: OpLockState::WRITE,
            breaking: false,
            break_target: OpLockState::empty(),
            version: 0,
        });
        mgr.add_unified_lock(holder).unwrap();

        mgr.check_and_break_oplocks_for_write(&h, "nfs4:writer");
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn blocking_lock_waits_on_conflict_without_deadlock() {
        let mgr = LockManager::new(LockManagerConfig::default(), None);
        let h = FileHandle::new(vec![8]);
        mgr.add_unified_lock(byte_range(&h, "nfs4:1:a", 0, 10, LockType::Exclusive)).unwrap();

        let waiter = byte_range(&h, "nfs4:2:b", 0, 10, LockType::Exclusive);
        let err = mgr.add_unified_lock_blocking(waiter, true).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn two_cycle_blocking_locks_yield_deadlock() {
        // owner a holds file 1 and wants file 2; owner b holds file 2 and
        // wants file 1 -> granting either wait closes a cycle.
        let mgr = LockManager::new(LockManagerConfig::default(), None);
        let h1 = FileHandle::new(vec![9]);
        let h2 = FileHandle::new(vec![10]);

        mgr.add_unified_lock(byte_range(&h1, "nfs4:1:a", 0, 10, LockType::Exclusive)).unwrap();
        mgr.add_unified_lock(byte_range(&h2, "nfs4:2:b", 0, 10, LockType::Exclusive)).unwrap();

        let a_wants_h2 = byte_range(&h2, "nfs4:1:a", 0, 10, LockType::Exclusive);
        let err = mgr.add_unified_lock_blocking(a_wants_h2, true).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        let b_wants_h1 = byte_range(&h1, "nfs4:2:b", 0, 10, LockType::Exclusive);
        let err = mgr.add_unified_lock_blocking(b_wants_h1, true).unwrap_err();
        assert!(matches!(err, Error::Deadlock));
    }

    #[test]
    fn non_blocking_conflict_never_reports_deadlock() {
        let mgr = LockManager::new(LockManagerConfig::default(), None);
        let h = FileHandle::new(vec![11]);
        mgr.add_unified_lock(byte_range(&h, "nfs4:1:a", 0, 10, LockType::Exclusive)).unwrap();

        let other = byte_range(&h, "nfs4:2:b", 0, 10, LockType::Exclusive);
        let err = mgr.add_unified_lock_blocking(other, false).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn releasing_the_held_lock_clears_the_wait_edge() {
        let mgr = LockManager::new(LockManagerConfig::default(), None);
        let h1 = FileHandle::new(vec![12]);
        let h2 = FileHandle::new(vec![13]);

        mgr.add_unified_lock(byte_range(&h1, "nfs4:1:a", 0, 10, LockType::Exclusive)).unwrap();
        mgr.add_unified_lock(byte_range(&h2, "nfs4:2:b", 0, 10, LockType::Exclusive)).unwrap();

        let a_wants_h2 = byte_range(&h2, "nfs4:1:a", 0, 10, LockType::Exclusive);
        mgr.add_unified_lock_blocking(a_wants_h2, true).unwrap_err();

        // b releases its hold on h2; a's wait edge on b must be gone, so
        // b re-requesting h1 no longer closes a cycle.
        mgr.remove_unified_lock(&h2, &owner("nfs4:2:b"), 0, 10);
        let b_wants_h1 = byte_range(&h1, "nfs4:2:b", 0, 10, LockType::Exclusive);
        let err = mgr.add_unified_lock_blocking(b_wants_h1, true).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[test]
    fn expire_unacknowledged_breaks_downgrades_stale_oplocks() {
        let mgr = LockManager::new(LockManagerConfig::default(), None);
        let h = FileHandle::new(vec![14]);
        let mut holder = byte_range(&h, "smb:1", 0, 0, LockType::Shared);
        holder.oplock = Some(OpLock {
            group_key: "g".into(),
            state: OpLockState::WRITE,
            breaking: false,
            break_target: OpLockState::empty(),
            version: 0,
        });
        holder.acquired_at = Instant::now() - Duration::from_secs(60);
        let granted = mgr.add_unified_lock(holder).unwrap();

        mgr.check_and_break_oplocks_for_write(&h, "nobody");
        mgr.expire_unacknowledged_breaks(Duration::from_secs(35));

        let locks = mgr.list_unified_locks(&h);
        let lock = locks.iter().find(|l| l.id == granted.id).unwrap();
        let oplock = lock.oplock.as_ref().unwrap();
        assert!(!oplock.breaking);
        assert_eq!(oplock.state, OpLockState::empty());
    }

    #[test]
    fn expire_unacknowledged_breaks_leaves_recent_breaks_alone() {
        let mgr = LockManager::new(LockManagerConfig::default(), None);
        let h = FileHandle::new(vec![15]);
        let mut holder = byte_range(&h, "smb:1", 0, 0, LockType::Shared);
        holder.oplock = Some(OpLock {
            group_key: "g".into(),
            state: OpLockState::WRITE,
            breaking: false,
            break_target: OpLockState::empty(),
            version: 0,
        });
        let granted = mgr.add_unified_lock(holder).unwrap();

        mgr.check_and_break_oplocks_for_write(&h, "nobody");
        mgr.expire_unacknowledged_breaks(Duration::from_secs(35));

        let locks = mgr.list_unified_locks(&h);
        let lock = locks.iter().find(|l| l.id == granted.id).unwrap();
        let oplock = lock.oplock.as_ref().unwrap();
        assert!(oplock.breaking, "break issued moments ago must not have timed out yet");
    }
}
