//! Protocol glue: wire decode/dispatch/encode for the minimal procedure
//! surface this core speaks (`SPEC_FULL.md` §6) — MOUNT's `MNT`, NFSv3
//! `READ`/`WRITE`/`READDIR`, NFSv4.0 `OPEN`/`CLOSE`/`LOCK` (each dispatched
//! as its own top-level procedure rather than wrapped in a `COMPOUND`),
//! and NLM's `LOCK`. Everything else named in RFC 1813/1057/NFSv4.0 is out
//! of scope and has no wire representation here.
//!
//! Framing is length-prefixed, not RFC 1057 record marking: a `u32` byte
//! count precedes every request and every reply. [`xdr`] is the shared
//! big-endian primitive codec both directions use.

pub mod mount;
pub mod nfs3;
pub mod nfs4;
pub mod nlm;
pub mod xdr;

use std::io::Read;

use crate::error::{Error, Result};
use crate::handle::FileHandle;
use crate::state::Nfs4Status;

pub const MOUNT_PROGRAM: u32 = 100_005;
pub const NFS_PROGRAM: u32 = 100_003;
pub const NLM_PROGRAM: u32 = 100_021;

/// The ONC RPC call header every request carries ahead of its
/// procedure-specific body.
#[derive(Debug, Clone, Copy)]
pub struct Header {
    pub xid: u32,
    pub program: u32,
    pub version: u32,
    pub proc: u32,
}

/// A decoded request, with its arguments already validated for shape (not
/// yet dispatched against the storage core).
#[derive(Debug)]
pub enum Call {
    MountNull,
    MountMnt { path: String },
    Nfs3Read { handle: FileHandle, offset: u64, count: u32 },
    Nfs3Write { handle: FileHandle, offset: u64, data: Vec<u8> },
    Nfs3ReadDir { handle: FileHandle, cookie: u64, max_entries: u32 },
    Nfs4Open { owner: Vec<u8>, seqid: u32, handle: FileHandle, access: u8, deny: u8 },
    Nfs4Close { stateid: [u8; 16] },
    #[allow(clippy::too_many_arguments)]
    Nfs4Lock {
        open_stateid: [u8; 16],
        new_lock_owner: bool,
        lock_owner: Vec<u8>,
        open_seqid: u32,
        lock_seqid: u32,
        offset: u64,
        length: u64,
        exclusive: bool,
        reclaim: bool,
    },
    NlmLock { owner: String, handle: FileHandle, offset: u64, length: u64, exclusive: bool, blocking: bool },
}

/// A reply, ready for [`encode_reply`] to serialize.
#[derive(Debug)]
pub enum Reply {
    MountNull,
    MountMnt { status: mount::MountStat, handle: Vec<u8> },
    Nfs3Read { status: nfs3::Nfs3Stat, data: Vec<u8>, eof: bool },
    Nfs3Write { status: nfs3::Nfs3Stat, count: u32 },
    Nfs3ReadDir { status: nfs3::Nfs3Stat, entries: Vec<(String, u64, Vec<u8>)>, eof: bool },
    Nfs4Open { status: Nfs4Status, stateid: [u8; 16] },
    Nfs4Close { status: Nfs4Status },
    Nfs4Lock { status: Nfs4Status, stateid: [u8; 16] },
    NlmLock { status: nlm::NlmStat },
    /// A malformed request: the header (if one could be recovered) and a
    /// description, sent in place of a procedure-specific reply.
    RpcError { detail: String },
}

fn read_stateid(src: &mut impl Read) -> Result<[u8; 16]> {
    let mut buf = [0u8; 16];
    src.read_exact(&mut buf).map_err(|e| Error::InvalidArgument(e.to_string()))?;
    Ok(buf)
}

/// Decodes one request: the RPC call header, then its procedure-specific
/// body. `src` must contain exactly one request (the length-prefix framing
/// is stripped by the caller before this is invoked).
pub fn decode_call(src: &mut impl Read) -> Result<(Header, Call)> {
    let xid = xdr::read_u32(src)?;
    let program = xdr::read_u32(src)?;
    let version = xdr::read_u32(src)?;
    let proc = xdr::read_u32(src)?;
    let header = Header { xid, program, version, proc };

    let call = match (program, version, proc) {
        (MOUNT_PROGRAM, 3, mount::PROC_NULL) => Call::MountNull,
        (MOUNT_PROGRAM, 3, mount::PROC_MNT) => Call::MountMnt { path: xdr::read_string(src)? },
        (NFS_PROGRAM, 3, nfs3::PROC_READ) => {
            let handle = xdr::read_handle(src)?;
            let offset = xdr::read_u64(src)?;
            let count = xdr::read_u32(src)?;
            Call::Nfs3Read { handle, offset, count }
        }
        (NFS_PROGRAM, 3, nfs3::PROC_WRITE) => {
            let handle = xdr::read_handle(src)?;
            let offset = xdr::read_u64(src)?;
            let data = xdr::read_opaque(src)?;
            Call::Nfs3Write { handle, offset, data }
        }
        (NFS_PROGRAM, 3, nfs3::PROC_READDIR) => {
            let handle = xdr::read_handle(src)?;
            let cookie = xdr::read_u64(src)?;
            let max_entries = xdr::read_u32(src)?;
            Call::Nfs3ReadDir { handle, cookie, max_entries }
        }
        (NFS_PROGRAM, 4, nfs4::PROC_OPEN) => {
            let owner = xdr::read_opaque(src)?;
            let seqid = xdr::read_u32(src)?;
            let handle = xdr::read_handle(src)?;
            let access = xdr::read_u32(src)? as u8;
            let deny = xdr::read_u32(src)? as u8;
            Call::Nfs4Open { owner, seqid, handle, access, deny }
        }
        (NFS_PROGRAM, 4, nfs4::PROC_CLOSE) => Call::Nfs4Close { stateid: read_stateid(src)? },
        (NFS_PROGRAM, 4, nfs4::PROC_LOCK) => {
            let open_stateid = read_stateid(src)?;
            let new_lock_owner = xdr::read_bool(src)?;
            let lock_owner = xdr::read_opaque(src)?;
            let open_seqid = xdr::read_u32(src)?;
            let lock_seqid = xdr::read_u32(src)?;
            let offset = xdr::read_u64(src)?;
            let length = xdr::read_u64(src)?;
            let exclusive = xdr::read_bool(src)?;
            let reclaim = xdr::read_bool(src)?;
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
            }
        }
        (NLM_PROGRAM, 4, nlm::PROC_LOCK) => {
            let owner = xdr::read_string(src)?;
            let handle = xdr::read_handle(src)?;
            let offset = xdr::read_u64(src)?;
            let length = xdr::read_u64(src)?;
            let exclusive = xdr::read_bool(src)?;
            let blocking = xdr::read_bool(src)?;
            Call::NlmLock { owner, handle, offset, length, exclusive, blocking }
        }
        _ => {
            return Err(Error::InvalidArgument(format!(
                "unsupported procedure: program={program} version={version} proc={proc}"
            )))
        }
    };

    Ok((header, call))
}

/// Serializes a reply: `xid` followed by the procedure-specific body.
pub fn encode_reply(dst: &mut Vec<u8>, xid: u32, reply: &Reply) -> std::io::Result<()> {
    xdr::write_u32(dst, xid)?;
    match reply {
        Reply::MountNull => xdr::write_u32(dst, mount::MountStat::Ok as u32),
        Reply::MountMnt { status, handle } => {
            xdr::write_u32(dst, *status as u32)?;
            xdr::write_opaque(dst, handle)
        }
        Reply::Nfs3Read { status, data, eof } => {
            xdr::write_u32(dst, *status as u32)?;
            xdr::write_opaque(dst, data)?;
            xdr::write_bool(dst, *eof)
        }
        Reply::Nfs3Write { status, count } => {
            xdr::write_u32(dst, *status as u32)?;
            xdr::write_u32(dst, *count)
        }
        Reply::Nfs3ReadDir { status, entries, eof } => {
            xdr::write_u32(dst, *status as u32)?;
            xdr::write_u32(dst, entries.len() as u32)?;
            for (name, file_id, handle) in entries {
                xdr::write_string(dst, name)?;
                xdr::write_u64(dst, *file_id)?;
                xdr::write_opaque(dst, handle)?;
            }
            xdr::write_bool(dst, *eof)
        }
        Reply::Nfs4Open { status, stateid } => {
            xdr::write_u32(dst, *status as u32)?;
            dst.extend_from_slice(stateid);
            Ok(())
        }
        Reply::Nfs4Close { status } => xdr::write_u32(dst, *status as u32),
        Reply::Nfs4Lock { status, stateid } => {
            xdr::write_u32(dst, *status as u32)?;
            dst.extend_from_slice(stateid);
            Ok(())
        }
        Reply::NlmLock { status } => xdr::write_u32(dst, *status as u32),
        Reply::RpcError { detail } => {
            xdr::write_u32(dst, u32::MAX)?;
            xdr::write_string(dst, detail)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn decodes_nfs3_read_call() {
        let mut buf = Vec::new();
        xdr::write_u32(&mut buf, 7).unwrap(); // xid
        xdr::write_u32(&mut buf, NFS_PROGRAM).unwrap();
        xdr::write_u32(&mut buf, 3).unwrap();
        xdr::write_u32(&mut buf, nfs3::PROC_READ).unwrap();
        xdr::write_opaque(&mut buf, &[1, 2, 3]).unwrap();
        xdr::write_u64(&mut buf, 100).unwrap();
        xdr::write_u32(&mut buf, 4096).unwrap();

        let mut cursor = Cursor::new(buf);
        let (header, call) = decode_call(&mut cursor).unwrap();
        assert_eq!(header.xid, 7);
        match call {
            Call::Nfs3Read { handle, offset, count } => {
                assert_eq!(handle.as_bytes(), &[1, 2, 3]);
                assert_eq!(offset, 100);
                assert_eq!(count, 4096);
            }
            other => panic!("unexpected call: {other:?}"),
        }
    }

    #[test]
    fn unknown_procedure_is_an_error_not_a_panic() {
        let mut buf = Vec::new();
        xdr::write_u32(&mut buf, 1).unwrap();
        xdr::write_u32(&mut buf, NFS_PROGRAM).unwrap();
        xdr::write_u32(&mut buf, 3).unwrap();
        xdr::write_u32(&mut buf, 9999).unwrap();

        let mut cursor = Cursor::new(buf);
        assert!(decode_call(&mut cursor).is_err());
    }

    #[test]
    fn encodes_mount_reply() {
        let mut out = Vec::new();
        encode_reply(&mut out, 42, &Reply::MountMnt { status: mount::MountStat::Ok, handle: vec![9, 9] }).unwrap();
        let mut cursor = Cursor::new(out);
        assert_eq!(xdr::read_u32(&mut cursor).unwrap(), 42);
        assert_eq!(xdr::read_u32(&mut cursor).unwrap(), mount::MountStat::Ok as u32);
        assert_eq!(xdr::read_opaque(&mut cursor).unwrap(), vec![9, 9]);
    }
}
