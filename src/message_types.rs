//! Channel plumbing between the read/dispatch/write task triple
//! (`spec.md` §5 "one task per connection"). Carries decoded [`proto`]
//! values end to end instead of the placeholder tags the teacher's
//! scaffolding used.

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendError;
use tokio::sync::mpsc::{Receiver, Sender};

use crate::proto::{Call, Header, Reply};

/// A decoded request, queued from [`crate::read_task::ReadTask`] to
/// [`crate::vfs_task::VfsTask`].
pub struct Procedure {
    pub header: Header,
    pub call: Call,
}

/// A dispatched reply, queued from [`crate::vfs_task::VfsTask`] to
/// [`crate::stream_writer::StreamWriter`].
pub struct ProcReply {
    pub xid: u32,
    pub reply: Reply,
}

/// A reply sent without going through dispatch at all: the request never
/// decoded far enough to know what it was asking for.
pub struct EarlyReply {
    pub xid: u32,
    pub detail: String,
}

pub struct EarlyReplySender {
    sender: Sender<EarlyReply>,
}

impl EarlyReplySender {
    pub async fn send(&self, xid: u32, detail: String) -> Result<(), SendError<EarlyReply>> {
        self.sender.send(EarlyReply { xid, detail }).await
    }
}

pub struct ReplySender {
    sender: Sender<ProcReply>,
}

impl ReplySender {
    pub async fn send(&self, xid: u32, reply: Reply) -> Result<(), SendError<ProcReply>> {
        self.sender.send(ProcReply { xid, reply }).await
    }
}

pub struct ProcSender {
    sender: Sender<Procedure>,
}

impl ProcSender {
    pub async fn send(&self, header: Header, call: Call) -> Result<(), SendError<Procedure>> {
        self.sender.send(Procedure { header, call }).await
    }
}

pub struct ProcRecv {
    recv: Receiver<Procedure>,
}

impl ProcRecv {
    pub async fn recv(&mut self) -> Option<Procedure> {
        self.recv.recv().await
    }
}

pub fn create_proc_channel(size: usize) -> (ProcSender, ProcRecv) {
    let (sender, recv) = mpsc::channel::<Procedure>(size);
    (ProcSender { sender }, ProcRecv { recv })
}

pub fn create_reply_channel(size: usize) -> (ReplySender, Receiver<ProcReply>) {
    let (sender, recv) = mpsc::channel::<ProcReply>(size);
    (ReplySender { sender }, recv)
}

pub fn create_early_reply_channel(size: usize) -> (EarlyReplySender, Receiver<EarlyReply>) {
    let (sender, recv) = mpsc::channel::<EarlyReply>(size);
    (EarlyReplySender { sender }, recv)
}
