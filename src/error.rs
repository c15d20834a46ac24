//! Crate-wide error taxonomy (`spec.md` §7).
//!
//! Each subsystem returns this single tagged enum; the protocol glue is the
//! only place that translates a variant to a wire status code (NFSv3/NFSv4
//! status, NLM stat, SMB2 status).

use std::fmt;

use crate::lock::LockOwner;

/// Result alias used throughout the storage core.
pub type Result<T> = std::result::Result<T, Error>;

/// The conflicting lock's identity and range, carried by [`Error::Conflict`]
/// so the protocol glue can build `LOCK4denied` / NLM holder replies / SMB
/// deny reasons without reaching back into the lock manager.
#[derive(Debug, Clone)]
pub struct ConflictInfo {
    pub holder: LockOwner,
    pub offset: u64,
    pub length: u64,
}

#[derive(Debug, Clone)]
pub enum Error {
    // Metadata-layer passthroughs.
    NotFound,
    AlreadyExists,
    PermissionDenied,
    InvalidArgument(String),

    // Lock manager.
    Conflict(ConflictInfo),
    GracePeriod,
    NoGrace,
    Deadlock,

    // NFSv4 state manager.
    BadStateid,
    StaleStateid,
    BadSeqid,
    LocksHeld,
    OpenMode,

    // Storage core internals.
    CacheFull,
    Corrupted(String),
    VersionMismatch,
    Closed,

    /// Catch-all for I/O failures surfaced by the block store / WAL file.
    Io(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::NotFound => write!(f, "not found"),
            Error::AlreadyExists => write!(f, "already exists"),
            Error::PermissionDenied => write!(f, "permission denied"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
            Error::Conflict(info) => write!(
                f,
                "lock conflict: held by {:?} on [{}, {})",
                info.holder,
                info.offset,
                info.offset.saturating_add(info.length)
            ),
            Error::GracePeriod => write!(f, "refused: grace period active"),
            Error::NoGrace => write!(f, "reclaim requested outside grace period"),
            Error::Deadlock => write!(f, "lock request would deadlock"),
            Error::BadStateid => write!(f, "bad stateid"),
            Error::StaleStateid => write!(f, "stale stateid (epoch mismatch)"),
            Error::BadSeqid => write!(f, "bad seqid"),
            Error::LocksHeld => write!(f, "locks held"),
            Error::OpenMode => write!(f, "open mode mismatch"),
            Error::CacheFull => write!(f, "cache full, no evictable block"),
            Error::Corrupted(msg) => write!(f, "corrupted: {msg}"),
            Error::VersionMismatch => write!(f, "version mismatch"),
            Error::Closed => write!(f, "persister closed"),
            Error::Io(msg) => write!(f, "io error: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
