use std::io::Cursor;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::message_types::{EarlyReplySender, ProcSender};
use crate::proto;

/// Frames larger than this are refused outright rather than buffered
/// (`spec.md` §7 "no panics on valid input" — a hostile or confused peer
/// must not be able to force an unbounded allocation).
const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Reads length-prefixed RPC requests from a network connection, decodes
/// them, and forwards them to a [`crate::vfs_task::VfsTask`]. A request
/// that fails to decode gets an early error reply instead of a dispatch.
pub struct ReadTask {
    readhalf: OwnedReadHalf,
    proc_send: ProcSender,
    early_send: EarlyReplySender,
}

impl ReadTask {
    /// Creates new instance of [`ReadTask`]
    pub fn spawn(
        readhalf: OwnedReadHalf,
        proc_send: ProcSender,
        early_send: EarlyReplySender,
    ) -> JoinHandle<()> {
        tokio::spawn(Self { readhalf, proc_send, early_send }.run())
    }

    async fn run(mut self) {
        loop {
            let len = match self.readhalf.read_u32().await {
                Ok(len) => len,
                Err(_) => return, // peer closed the connection
            };
            if len > MAX_FRAME_LEN {
                warn!(len, "oversized request frame, closing connection");
                let _ = self.early_send.send(0, "request frame too large".into()).await;
                return;
            }

            let mut buf = vec![0u8; len as usize];
            if self.readhalf.read_exact(&mut buf).await.is_err() {
                return;
            }

            let mut cursor = Cursor::new(buf);
            match proto::decode_call(&mut cursor) {
                Ok((header, call)) => {
                    if self.proc_send.send(header, call).await.is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(error = %e, "failed to decode request");
                    let xid = xid_best_effort(cursor.into_inner());
                    if self.early_send.send(xid, e.to_string()).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// The first four bytes of a request are always the xid, even when the
/// rest of the header or body fails to decode; recover it on a best-effort
/// basis so the client can at least match the error to its request.
fn xid_best_effort(buf: Vec<u8>) -> u32 {
    buf.get(0..4).map(|b| u32::from_be_bytes(b.try_into().unwrap())).unwrap_or(0)
}
