//! Error code mapping (`spec.md` §6, §7): the single place a core `Error`
//! is translated to an NFSv4 wire status. Protocol glue for other
//! dialects (NLM stat, SMB2 status) does the analogous translation at its
//! own boundary.

use crate::error::Error;

/// NFSv4 status codes relevant to the operations this core drives
/// (RFC 7530 §13.1; only the subset this crate can produce).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Nfs4Status {
    Ok = 0,
    PermissionDenied = 13,
    NoSpace = 28,
    NotFound = 2,
    Exist = 17,
    InvalidArgument = 22,
    Denied = 10010,
    Grace = 10013,
    BadStateid = 10025,
    StaleStateid = 10023,
    BadSeqid = 10026,
    LocksHeld = 10037,
    OpenMode = 10038,
    Deadlock = 10045,
    NoGrace = 10033,
    ServerFault = 10006,
}

/// Maps a core [`Error`] to its NFSv4 status (`spec.md` §6 "Error code
/// mapping (sample)").
pub fn map_error(err: &Error) -> Nfs4Status {
    match err {
        Error::NotFound => Nfs4Status::NotFound,
        Error::AlreadyExists => Nfs4Status::Exist,
        Error::PermissionDenied => Nfs4Status::PermissionDenied,
        Error::InvalidArgument(_) => Nfs4Status::InvalidArgument,
        Error::Conflict(_) => Nfs4Status::Denied,
        Error::GracePeriod => Nfs4Status::Grace,
        Error::NoGrace => Nfs4Status::NoGrace,
        Error::Deadlock => Nfs4Status::Deadlock,
        Error::BadStateid => Nfs4Status::BadStateid,
        Error::StaleStateid => Nfs4Status::StaleStateid,
        Error::BadSeqid => Nfs4Status::BadSeqid,
        Error::LocksHeld => Nfs4Status::LocksHeld,
        Error::OpenMode => Nfs4Status::OpenMode,
        Error::CacheFull => Nfs4Status::NoSpace,
        Error::Corrupted(_) | Error::VersionMismatch | Error::Closed | Error::Io(_) => Nfs4Status::ServerFault,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_maps_to_denied() {
        assert_eq!(map_error(&Error::Conflict(crate::error::ConflictInfo {
            holder: crate::lock::LockOwner::new("nfs4:1:a", "1", ""),
            offset: 0,
            length: 10,
        })), Nfs4Status::Denied);
    }

    #[test]
    fn cache_full_maps_to_no_space() {
        assert_eq!(map_error(&Error::CacheFull), Nfs4Status::NoSpace);
    }

    #[test]
    fn locks_held_maps_correctly() {
        assert_eq!(map_error(&Error::LocksHeld), Nfs4Status::LocksHeld);
    }
}
