//! Fixed-size block buffer pool.
//!
//! Every buffer handed out by [`BufferPool`] has exactly the pool's
//! block size. The pool never blocks: exhaustion surfaces as `None`
//! from [`BufferAllocator::allocate_buffer`] and the caller backs off.

use parking_lot::Mutex;
use riptide_types::BlockSize;
use std::sync::Arc;
use tracing::trace;

/// Owned block buffer.
///
/// Cheap to clone; clones share the same backing bytes. The cache's
/// refcount accounting decides when a buffer may be released: a clone
/// held by a peer's send path keeps the bytes alive on its own, but the
/// pool's in-use count follows `allocate_buffer`/`free_buffer` pairs.
///
/// Invariant: length == the originating pool's block size.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockBuf {
    bytes: Arc<Vec<u8>>,
}

impl BlockBuf {
    #[must_use]
    pub fn zeroed(len: usize) -> Self {
        Self {
            bytes: Arc::new(vec![0_u8; len]),
        }
    }

    #[must_use]
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(bytes),
        }
    }

    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn clone_ref(&self) -> Self {
        Self {
            bytes: Arc::clone(&self.bytes),
        }
    }

    /// Mutable access for filling the buffer. Copies if clones exist.
    pub fn make_mut(&mut self) -> &mut [u8] {
        Arc::make_mut(&mut self.bytes).as_mut_slice()
    }
}

/// Allocator interface the cache consumes.
///
/// Implementations must be safe to call from inside the cache's critical
/// section: no blocking, no I/O.
pub trait BufferAllocator: Send + Sync {
    /// Allocate one zeroed block buffer, or `None` if the budget is spent.
    fn allocate_buffer(&self) -> Option<BlockBuf>;

    /// Return a buffer to the pool.
    fn free_buffer(&self, buf: BlockBuf);

    /// Number of buffers currently allocated and not yet freed.
    fn in_use_count(&self) -> usize;

    /// The fixed size of every buffer this allocator hands out.
    fn block_size(&self) -> BlockSize;
}

#[derive(Debug, Default)]
struct PoolState {
    free: Vec<Vec<u8>>,
    in_use: usize,
}

/// Counting pool of fixed-size block buffers with a hard budget.
///
/// Freed buffers are recycled when no clones remain, so steady-state
/// operation allocates from the free list instead of the heap.
#[derive(Debug)]
pub struct BufferPool {
    block_size: BlockSize,
    max_buffers: usize,
    state: Mutex<PoolState>,
}

impl BufferPool {
    #[must_use]
    pub fn new(block_size: BlockSize, max_buffers: usize) -> Self {
        Self {
            block_size,
            max_buffers,
            state: Mutex::new(PoolState::default()),
        }
    }

    #[must_use]
    pub fn max_buffers(&self) -> usize {
        self.max_buffers
    }
}

impl BufferAllocator for BufferPool {
    fn allocate_buffer(&self) -> Option<BlockBuf> {
        let mut state = self.state.lock();
        if state.in_use >= self.max_buffers {
            trace!(
                target: "riptide::cache::pool",
                event = "buffer_exhausted",
                in_use = state.in_use,
                max = self.max_buffers
            );
            return None;
        }
        state.in_use += 1;
        let buf = match state.free.pop() {
            Some(mut bytes) => {
                bytes.fill(0);
                BlockBuf::from_vec(bytes)
            }
            None => BlockBuf::zeroed(self.block_size.get() as usize),
        };
        trace!(
            target: "riptide::cache::pool",
            event = "buffer_alloc",
            in_use = state.in_use,
            size = buf.len()
        );
        Some(buf)
    }

    fn free_buffer(&self, buf: BlockBuf) {
        let mut state = self.state.lock();
        assert!(state.in_use > 0, "free_buffer without matching allocation");
        state.in_use -= 1;
        if let Ok(bytes) = Arc::try_unwrap(buf.bytes) {
            state.free.push(bytes);
        }
        trace!(
            target: "riptide::cache::pool",
            event = "buffer_free",
            in_use = state.in_use
        );
    }

    fn in_use_count(&self) -> usize {
        self.state.lock().in_use
    }

    fn block_size(&self) -> BlockSize {
        self.block_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool(max: usize) -> BufferPool {
        BufferPool::new(BlockSize::new(1024).expect("block size"), max)
    }

    #[test]
    fn allocation_respects_budget() {
        let pool = pool(2);
        let a = pool.allocate_buffer().expect("first");
        let b = pool.allocate_buffer().expect("second");
        assert!(pool.allocate_buffer().is_none());
        assert_eq!(pool.in_use_count(), 2);
        pool.free_buffer(a);
        assert_eq!(pool.in_use_count(), 1);
        let c = pool.allocate_buffer().expect("after free");
        assert_eq!(c.len(), 1024);
        drop(b);
    }

    #[test]
    fn recycled_buffers_are_zeroed() {
        let pool = pool(1);
        let mut buf = pool.allocate_buffer().expect("alloc");
        buf.make_mut()[0] = 0xAB;
        pool.free_buffer(buf);
        let buf = pool.allocate_buffer().expect("realloc");
        assert_eq!(buf.as_slice()[0], 0);
    }

    #[test]
    fn shared_buffers_are_not_recycled_in_place() {
        let pool = pool(1);
        let buf = pool.allocate_buffer().expect("alloc");
        let peer_copy = buf.clone_ref();
        pool.free_buffer(buf);
        assert_eq!(pool.in_use_count(), 0);
        // the peer still sees valid data; the pool just allocates fresh
        assert_eq!(peer_copy.len(), 1024);
        let _ = pool.allocate_buffer().expect("fresh");
    }

    #[test]
    fn make_mut_copies_when_shared() {
        let mut buf = BlockBuf::zeroed(8);
        let shared = buf.clone_ref();
        buf.make_mut()[0] = 7;
        assert_eq!(shared.as_slice()[0], 0);
        assert_eq!(buf.as_slice()[0], 7);
    }
}
