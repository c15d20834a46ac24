//! NFSv4.0 operations this core dispatches directly as top-level
//! procedures rather than inside a `COMPOUND` (`SPEC_FULL.md` §6: the
//! minimal protocol glue does not implement `COMPOUND` request framing,
//! only the three operations that drive the state manager). Proc numbers
//! match the real NFSv4 operation codes (RFC 7530 §13) they stand in for.

pub const PROC_OPEN: u32 = 18;
pub const PROC_CLOSE: u32 = 4;
pub const PROC_LOCK: u32 = 12;
