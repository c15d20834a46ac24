//! Pooled byte buffers used by the block cache and by the NFSv3 parser's
//! variable-length WRITE argument decoding.
//!
//! [`Buffer`] is a single heap-allocated, owned chunk. [`Slice`] is a
//! range-bounded view over several buffers drawn from a [`PoolAllocator`],
//! returned to the pool on drop so the parser never allocates a fresh
//! buffer per WRITE.

mod buffer;
mod slice;

use std::num::NonZeroUsize;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use buffer::Buffer;
pub use slice::{Iter, IterMut, Slice};

type Sender = mpsc::Sender<Buffer>;
type Receiver = mpsc::Receiver<Buffer>;

/// Anything that can hand out a [`Slice`] of at least the requested size.
///
/// Generic over the parser so tests can swap in a fake allocator without
/// pulling in a real buffer pool.
#[async_trait]
pub trait Allocator {
    async fn allocate(&mut self, size: NonZeroUsize) -> Option<Slice>;
}

/// Fixed-capacity pool of equally sized buffers, handed out as a [`Slice`]
/// spanning as many pooled buffers as needed to cover the request.
pub struct PoolAllocator {
    sender: Sender,
    receiver: Receiver,
    buffer_size: usize,
    capacity: usize,
}

impl PoolAllocator {
    /// Pre-allocates `count` buffers of `buffer_size` bytes each.
    pub async fn new(buffer_size: NonZeroUsize, count: NonZeroUsize) -> Self {
        let (sender, receiver) = mpsc::channel(count.get());

        for _ in 0..count.get() {
            let buffer = Buffer::new(buffer_size);
            sender.send(buffer).await.expect("pool channel just created, cannot be closed");
        }

        Self { sender, receiver, buffer_size: buffer_size.get(), capacity: buffer_size.get() * count.get() }
    }
}

#[async_trait]
impl Allocator for PoolAllocator {
    async fn allocate(&mut self, size: NonZeroUsize) -> Option<Slice> {
        if size.get() > self.capacity {
            return None;
        }

        let mut buffers = Vec::new();
        let mut collected = 0usize;
        while collected < size.get() {
            let buffer = self.receiver.recv().await?;
            collected += buffer.len();
            buffers.push(buffer);
        }

        Some(Slice::new(buffers, 0..size.get(), self.sender.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocate_spans_multiple_pooled_buffers() {
        let mut allocator = PoolAllocator::new(NonZeroUsize::new(8).unwrap(), NonZeroUsize::new(4).unwrap()).await;

        let mut slice = allocator.allocate(NonZeroUsize::new(20).unwrap()).await.unwrap();
        let total: usize = slice.iter_mut().map(|chunk| chunk.len()).sum();
        assert_eq!(total, 20);
    }

    #[tokio::test]
    async fn allocate_beyond_capacity_returns_none() {
        let mut allocator = PoolAllocator::new(NonZeroUsize::new(8).unwrap(), NonZeroUsize::new(2).unwrap()).await;
        assert!(allocator.allocate(NonZeroUsize::new(100).unwrap()).await.is_none());
    }
}
