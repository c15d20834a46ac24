//! NLM program (RFC 1813-adjacent, the "Network Lock Manager" companion
//! protocol): just the `LOCK` procedure, dispatched straight into the
//! shared [`crate::lock::LockManager`] so the cross-protocol conflict
//! scenario (`spec.md` §8) is actually exercisable over the wire.

use crate::error::Error;

pub const PROC_NULL: u32 = 0;
pub const PROC_LOCK: u32 = 2;

/// `nlm4_stats` (RFC 1813-adjacent), restricted to the outcomes this core
/// can actually produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NlmStat {
    Granted = 0,
    Denied = 1,
    DeniedNolocks = 2,
    Blocked = 3,
    DeniedGrace = 5,
    Deadlck = 8,
}

pub fn to_nlm_status(err: &Error) -> NlmStat {
    match err {
        Error::Conflict(_) => NlmStat::Denied,
        Error::Deadlock => NlmStat::Deadlck,
        Error::GracePeriod => NlmStat::DeniedGrace,
        Error::InvalidArgument(_) => NlmStat::DeniedNolocks,
        _ => NlmStat::DeniedNolocks,
    }
}
