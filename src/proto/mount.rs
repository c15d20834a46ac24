//! MOUNT program (RFC 1813 Appendix I): just enough to hand a client a
//! root file handle, since every other protocol needs one to start from.

use crate::error::Error;

pub const PROC_NULL: u32 = 0;
pub const PROC_MNT: u32 = 1;

/// `mountstat3` (RFC 1813 Appendix I), restricted to the outcomes this
/// core can actually produce for `MNT`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MountStat {
    Ok = 0,
    PermissionDenied = 13,
    NotDir = 20,
    NoEnt = 2,
    ServerFault = 10006,
}

pub fn to_mount_status(err: &Error) -> MountStat {
    match err {
        Error::NotFound => MountStat::NoEnt,
        Error::PermissionDenied => MountStat::PermissionDenied,
        Error::InvalidArgument(_) => MountStat::NotDir,
        _ => MountStat::ServerFault,
    }
}
