//! NFSv3 procedures this core actually dispatches: READ, WRITE, READDIR
//! (`SPEC_FULL.md` §6). Every other NFSv3 procedure is out of scope.

use crate::error::Error;

pub const PROC_READ: u32 = 6;
pub const PROC_WRITE: u32 = 7;
pub const PROC_READDIR: u32 = 16;

/// NFSv3 `nfsstat3` (RFC 1813 §2.6), restricted to the subset this core
/// can actually produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Nfs3Stat {
    Ok = 0,
    PermissionDenied = 13,
    NoSpace = 28,
    NotFound = 2,
    Exist = 17,
    InvalidArgument = 22,
    JukeBox = 10008,
    ServerFault = 10006,
}

pub fn to_nfs3_status(err: &Error) -> Nfs3Stat {
    match err {
        Error::NotFound => Nfs3Stat::NotFound,
        Error::AlreadyExists => Nfs3Stat::Exist,
        Error::PermissionDenied => Nfs3Stat::PermissionDenied,
        Error::InvalidArgument(_) => Nfs3Stat::InvalidArgument,
        Error::Conflict(_) | Error::GracePeriod | Error::NoGrace | Error::Deadlock => Nfs3Stat::JukeBox,
        Error::CacheFull => Nfs3Stat::NoSpace,
        Error::BadStateid
        | Error::StaleStateid
        | Error::BadSeqid
        | Error::LocksHeld
        | Error::OpenMode
        | Error::Corrupted(_)
        | Error::VersionMismatch
        | Error::Closed
        | Error::Io(_) => Nfs3Stat::ServerFault,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_maps_correctly() {
        assert_eq!(to_nfs3_status(&Error::NotFound), Nfs3Stat::NotFound);
    }

    #[test]
    fn cache_full_maps_to_no_space() {
        assert_eq!(to_nfs3_status(&Error::CacheFull), Nfs3Stat::NoSpace);
    }
}
