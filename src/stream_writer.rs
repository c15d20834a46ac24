use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::mpsc::Receiver;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::message_types::{EarlyReply, ProcReply};
use crate::proto::{self, Reply};

/// Writes [`crate::vfs_task::VfsTask`] responses to a network connection,
/// each framed with the same `u32` length prefix [`crate::read_task::ReadTask`]
/// expects on the way in.
pub struct StreamWriter {
    writehalf: OwnedWriteHalf,
    reply_recv: Receiver<ProcReply>,
    early_recv: Receiver<EarlyReply>,
}

impl StreamWriter {
    /// Creates new instance of [`StreamWriter`]
    pub fn spawn(
        writehalf: OwnedWriteHalf,
        reply_recv: Receiver<ProcReply>,
        early_recv: Receiver<EarlyReply>,
    ) -> JoinHandle<()> {
        tokio::spawn(Self { writehalf, reply_recv, early_recv }.run())
    }

    async fn run(mut self) {
        let mut early_open = true;
        let mut reply_open = true;

        while early_open || reply_open {
            tokio::select! {
                early = self.early_recv.recv(), if early_open => {
                    match early {
                        Some(early_reply) => {
                            if self.write_reply(early_reply.xid, &Reply::RpcError { detail: early_reply.detail }).await.is_err() {
                                return;
                            }
                        }
                        None => early_open = false,
                    }
                },
                reply = self.reply_recv.recv(), if reply_open => {
                    match reply {
                        Some(proc_reply) => {
                            if self.write_reply(proc_reply.xid, &proc_reply.reply).await.is_err() {
                                return;
                            }
                        }
                        None => reply_open = false,
                    }
                },
            }
        }
    }

    async fn write_reply(&mut self, xid: u32, reply: &Reply) -> std::io::Result<()> {
        let mut body = Vec::new();
        proto::encode_reply(&mut body, xid, reply)?;
        self.writehalf.write_u32(body.len() as u32).await?;
        if let Err(e) = self.writehalf.write_all(&body).await {
            debug!(error = %e, "failed to write reply, dropping connection");
            return Err(e);
        }
        Ok(())
    }
}
