#![forbid(unsafe_code)]
//! Block cache for the Riptide transfer engine.
//!
//! The cache sits between peers and storage: blocks received from peers
//! are write-coalesced into whole pieces before they go to disk, blocks
//! served to peers are read-ahead cached, and incremental piece-hash
//! state rides along with the cached data.
//!
//! Eviction is an ARC (Adaptive Replacement Cache) variant: two resident
//! read lists (recency and frequency), a ghost list behind each, a
//! separate list for dirty pieces that can only leave by being flushed,
//! and a volatile list for low-priority read data that is evicted before
//! anything else. Per-block refcounts and a per-piece refcount pin data
//! against eviction while hash jobs, flushes, and peer sends reference
//! it.
//!
//! # Concurrency design
//!
//! A single `parking_lot::Mutex<CacheInner>` protects all cache
//! metadata. Every public operation is one short critical section; the
//! lock is never held across disk I/O or hashing. Long-running work
//! happens outside: the disk executor takes pinned batches out and
//! reports back with [`BlockCache::blocks_flushed`] /
//! [`BlockCache::insert_blocks`], the hash worker with
//! [`BlockCache::begin_hash_job`] / [`BlockCache::complete_hash_job`].
//! Completed jobs are moved into caller-owned queues, never dispatched
//! under the lock.

mod job;
mod lru;
mod piece;
mod pool;

pub use job::{CacheJob, JobPayload};
pub use piece::{CacheState, PartialHash, RefReason};
pub use pool::{BlockBuf, BufferAllocator, BufferPool};

use lru::{LruSet, PieceArena};
use piece::{MAX_BLOCK_REFCOUNT, MAX_PIECE_REFCOUNT, MAX_PINNED_BLOCKS, PieceEntry};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace};

use riptide_error::{Result, RiptideError};
use riptide_types::{BlockIndex, PieceIndex, StorageId};

/// Piece-layout oracle: how many blocks each piece of a storage has.
///
/// Queried once per piece at admission. Implementations must answer
/// without blocking; the cache calls this inside its critical section.
pub trait PieceLayout: Send + Sync {
    fn blocks_in_piece(&self, storage: StorageId, piece: PieceIndex) -> u32;
}

/// Runtime configuration for the block cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Total cache budget in blocks.
    pub capacity_blocks: usize,
    /// Target size of each ghost list, as a fraction of the capacity.
    pub ghost_list_fraction: f64,
    /// Volatile-read budget as a fraction of the capacity.
    pub volatile_fraction: f64,
    /// Minimum residency of a dirty block before age-based flushing.
    pub min_cache_age: Duration,
    /// Hint to the executor to batch adjacent dirty blocks per write.
    pub coalesce_writes: bool,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            capacity_blocks: 1024,
            ghost_list_fraction: 0.25,
            volatile_fraction: 0.125,
            min_cache_age: Duration::from_secs(5),
            coalesce_writes: true,
        }
    }
}

impl CacheSettings {
    fn validate(&self) -> Result<()> {
        if self.capacity_blocks == 0 {
            return Err(RiptideError::Config(
                "cache capacity_blocks must be > 0".to_owned(),
            ));
        }
        if !(0.0..=1.0).contains(&self.ghost_list_fraction) {
            return Err(RiptideError::Config(
                "ghost_list_fraction must be in 0..=1".to_owned(),
            ));
        }
        if !(0.0..=1.0).contains(&self.volatile_fraction) {
            return Err(RiptideError::Config(
                "volatile_fraction must be in 0..=1".to_owned(),
            ));
        }
        Ok(())
    }
}

/// What the last admission-relevant event was; steers eviction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LastCacheOp {
    /// Plain miss: evict from the larger read list.
    CacheMiss,
    /// Ghost hit in the recency list: evict from the frequency list.
    GhostHitLru1,
    /// Ghost hit in the frequency list: evict from the recency list.
    GhostHitLru2,
}

/// Whether a removed piece may leave a ghost entry behind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionMode {
    AllowGhost,
    DisallowGhost,
}

/// A pinned reference to one cached block, owned by a peer send path.
///
/// Every `BlockRef` must be returned via [`BlockCache::reclaim_block`].
#[derive(Debug)]
pub struct BlockRef {
    storage: StorageId,
    piece: PieceIndex,
    block: BlockIndex,
    data: BlockBuf,
}

impl BlockRef {
    #[must_use]
    pub fn storage(&self) -> StorageId {
        self.storage
    }

    #[must_use]
    pub fn piece(&self) -> PieceIndex {
        self.piece
    }

    #[must_use]
    pub fn block(&self) -> BlockIndex {
        self.block
    }

    #[must_use]
    pub fn data(&self) -> &[u8] {
        self.data.as_slice()
    }
}

/// Successful [`BlockCache::try_read`]: the referenced byte count and
/// one pinned reference per covered block, in ascending block order.
#[derive(Debug)]
pub struct ReadHit {
    bytes: u32,
    refs: Vec<BlockRef>,
}

impl ReadHit {
    #[must_use]
    pub fn bytes(&self) -> u32 {
        self.bytes
    }

    #[must_use]
    pub fn refs(&self) -> &[BlockRef] {
        &self.refs
    }

    #[must_use]
    pub fn into_refs(self) -> Vec<BlockRef> {
        self.refs
    }
}

/// Dirty blocks pinned for one flush, in ascending block order.
///
/// Produced by [`BlockCache::take_flush_batch`]; settled by
/// [`BlockCache::blocks_flushed`] for the indices that were written and
/// [`BlockCache::abort_flush`] for the remainder (in that order on a
/// partial failure).
#[derive(Debug)]
pub struct FlushBatch {
    pub storage: StorageId,
    pub piece: PieceIndex,
    pub blocks: Vec<(BlockIndex, BlockBuf)>,
}

/// Cached blocks pinned for one hashing pass, plus the hash context
/// moved out of the piece for the duration.
///
/// `blocks` is the contiguous cached run starting at the hash cursor.
/// The worker feeds each buffer (trimmed to the real piece length for
/// the final block) into `context`, then returns everything with
/// [`BlockCache::complete_hash_job`].
#[derive(Debug)]
pub struct HashJob {
    pub storage: StorageId,
    pub piece: PieceIndex,
    pub context: PartialHash,
    pub blocks: Vec<(BlockIndex, BlockBuf)>,
}

/// Point-in-time summary of one piece.
#[derive(Debug, Clone)]
pub struct PieceSnapshot {
    pub storage: StorageId,
    pub piece: PieceIndex,
    pub state: CacheState,
    pub blocks_in_piece: u32,
    pub num_blocks: u32,
    pub num_dirty: u32,
    pub pinned: u32,
    pub expire: Instant,
}

/// Counters exported to the engine's stats surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub num_pieces: usize,
    pub read_cache_blocks: usize,
    pub write_cache_blocks: usize,
    pub volatile_blocks: usize,
    pub pinned_blocks: usize,
    pub send_buffer_blocks: usize,
    pub write_lru_len: usize,
    pub ghost_lru1_len: usize,
    pub ghost_lru2_len: usize,
    pub last_cache_op: LastCacheOp,
    pub buffers_in_use: usize,
    pub capacity_blocks: usize,
}

type PieceKey = (StorageId, PieceIndex);

struct CacheInner {
    arena: PieceArena,
    index: HashMap<PieceKey, u32>,
    lru: LruSet,
    alloc: Arc<dyn BufferAllocator>,
    layout: Arc<dyn PieceLayout>,
    settings: CacheSettings,
    block_size: u32,
    ghost_size: usize,
    max_volatile_blocks: usize,
    read_cache_size: usize,
    write_cache_size: usize,
    volatile_size: usize,
    pinned_blocks: usize,
    send_buffer_blocks: usize,
    last_cache_op: LastCacheOp,
    /// Completions produced by deferred removal paths (refcount drains,
    /// aborts) where the caller has no queue to hand in.
    deferred: VecDeque<CacheJob>,
}

/// The block cache.
///
/// All state lives behind one mutex; see the crate docs for the
/// concurrency contract.
pub struct BlockCache {
    inner: Mutex<CacheInner>,
}

impl BlockCache {
    pub fn new(
        settings: CacheSettings,
        alloc: Arc<dyn BufferAllocator>,
        layout: Arc<dyn PieceLayout>,
    ) -> Result<Self> {
        settings.validate()?;
        let block_size = alloc.block_size().get();
        let ghost_size = ghost_target(&settings);
        let max_volatile_blocks = volatile_target(&settings);
        info!(
            target: "riptide::cache",
            event = "cache_create",
            capacity_blocks = settings.capacity_blocks,
            block_size,
            ghost_size,
            max_volatile_blocks
        );
        Ok(Self {
            inner: Mutex::new(CacheInner {
                arena: PieceArena::default(),
                index: HashMap::new(),
                lru: LruSet::default(),
                alloc,
                layout,
                settings,
                block_size,
                ghost_size,
                max_volatile_blocks,
                read_cache_size: 0,
                write_cache_size: 0,
                volatile_size: 0,
                pinned_blocks: 0,
                send_buffer_blocks: 0,
                last_cache_op: LastCacheOp::CacheMiss,
                deferred: VecDeque::new(),
            }),
        })
    }

    /// Shared handle to the buffer allocator, for the executor and the
    /// peer receive path.
    #[must_use]
    pub fn allocator(&self) -> Arc<dyn BufferAllocator> {
        Arc::clone(&self.inner.lock().alloc)
    }

    /// Apply new settings: revalidate, recompute the ghost and volatile
    /// targets, trim ghost lists, and evict down to the new capacity
    /// (pins may leave a tolerated shortfall).
    pub fn set_settings(&self, settings: CacheSettings) -> Result<()> {
        settings.validate()?;
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        inner.ghost_size = ghost_target(&settings);
        inner.max_volatile_blocks = volatile_target(&settings);
        inner.settings = settings;
        info!(
            target: "riptide::cache",
            event = "settings_update",
            capacity_blocks = inner.settings.capacity_blocks,
            ghost_size = inner.ghost_size,
            max_volatile_blocks = inner.max_volatile_blocks
        );
        inner.trim_ghost_lists();
        while inner.volatile_size > inner.max_volatile_blocks {
            if inner.try_evict_one_volatile() == 0 {
                break;
            }
        }
        let over = inner
            .blocks_in_use()
            .saturating_sub(inner.settings.capacity_blocks);
        if over > 0 {
            let _ = inner.try_evict_blocks(over, None);
        }
        inner.verify_invariants_debug();
        Ok(())
    }

    // ── Read path ───────────────────────────────────────────────────────

    /// Serve a read job from cached data.
    ///
    /// Returns `None` on a miss: the piece is absent, a ghost (the ghost
    /// hit is recorded and the piece readmitted empty into the frequent
    /// list), or some covered block is absent or pending. On a hit the
    /// covered blocks are pinned (reason `Reading`) and returned as
    /// [`BlockRef`]s the caller must eventually reclaim.
    pub fn try_read(&self, job: &CacheJob) -> Option<ReadHit> {
        let JobPayload::Read {
            offset,
            len,
            volatile,
        } = job.payload
        else {
            panic!("try_read on a write job");
        };
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let idx = inner.find(job.storage, job.piece)?;
        let state = inner.arena.get(idx).cache_state;
        if state.is_ghost() {
            inner.ghost_hit(idx, state);
            return None;
        }

        let bs = inner.block_size;
        let piece_bytes = u64::from(inner.arena.get(idx).blocks_in_piece) * u64::from(bs);
        assert!(u64::from(offset) < piece_bytes, "read offset beyond piece end");
        assert!(len > 0, "zero-length read");
        let len = u32::try_from(u64::from(len).min(piece_bytes - u64::from(offset)))
            .expect("clamped length fits u32");
        let first = (offset / bs) as usize;
        let last = ((u64::from(offset) + u64::from(len) - 1) / u64::from(bs)) as usize;

        {
            let pe = inner.arena.get(idx);
            for b in first..=last {
                let e = pe.block(b);
                if e.buf.is_none() || e.pending {
                    trace!(
                        target: "riptide::cache",
                        event = "read_miss",
                        storage = job.storage.0,
                        piece = job.piece.0,
                        block = b
                    );
                    return None;
                }
            }
        }

        let mut promoted = false;
        let mut refs = Vec::with_capacity(last - first + 1);
        for b in first..=last {
            let ok = inner.inc_block_refcount(idx, b, RefReason::Reading);
            debug_assert!(ok, "verified block vanished");
            let e = inner.arena.get_mut(idx).block_mut(b);
            if e.cache_hit {
                promoted = true;
            }
            e.cache_hit = true;
            refs.push(BlockRef {
                storage: job.storage,
                piece: job.piece,
                block: BlockIndex(u32::try_from(b).expect("block index fits u32")),
                data: e.buf.as_ref().expect("verified block").clone_ref(),
            });
        }
        inner.send_buffer_blocks += refs.len();
        inner.cache_hit_update(idx, promoted, volatile);
        trace!(
            target: "riptide::cache",
            event = "read_hit",
            storage = job.storage.0,
            piece = job.piece.0,
            blocks = refs.len(),
            bytes = len
        );
        inner.verify_invariants_debug();
        Some(ReadHit { bytes: len, refs })
    }

    /// Record a read hit on one block and apply the ARC promotion rules.
    ///
    /// `try_read` does this itself for the blocks it references; this
    /// entry point exists for callers that found the data another way.
    pub fn cache_hit(
        &self,
        storage: StorageId,
        piece: PieceIndex,
        block: BlockIndex,
        volatile_read: bool,
    ) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(idx) = inner.find(storage, piece) else {
            return;
        };
        let state = inner.arena.get(idx).cache_state;
        if state.is_ghost() {
            inner.ghost_hit(idx, state);
            return;
        }
        let promoted = {
            let e = inner.arena.get_mut(idx).block_mut(block.0 as usize);
            if e.buf.is_none() {
                return;
            }
            let promoted = e.cache_hit;
            e.cache_hit = true;
            promoted
        };
        inner.cache_hit_update(idx, promoted, volatile_read);
    }

    /// Return a read reference taken by [`Self::try_read`].
    pub fn reclaim_block(&self, r: BlockRef) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let idx = inner
            .find(r.storage, r.piece)
            .expect("reclaimed block pins its piece");
        inner.send_buffer_blocks -= 1;
        inner.dec_block_refcount(idx, r.block.0 as usize, RefReason::Reading);
        inner.verify_invariants_debug();
    }

    /// Claim the single outstanding disk read for this piece.
    ///
    /// Admits the piece (recency list) if it is not resident. Returns
    /// `false` if a read is already in flight; the caller must then
    /// queue its job with [`Self::queue_read_job`] instead of issuing a
    /// second disk read.
    pub fn begin_read(&self, storage: StorageId, piece: PieceIndex) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let idx = inner.allocate_piece(storage, piece, CacheState::ReadLru1);
        let pe = inner.arena.get_mut(idx);
        if pe.outstanding_read {
            return false;
        }
        pe.outstanding_read = true;
        true
    }

    /// Queue a read job behind the piece's outstanding read.
    ///
    /// Hands the job back when there is no outstanding read to wait
    /// for; the caller should then claim one with [`Self::begin_read`].
    pub fn queue_read_job(&self, job: CacheJob) -> std::result::Result<(), CacheJob> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(idx) = inner.find(job.storage, job.piece) else {
            return Err(job);
        };
        let pe = inner.arena.get_mut(idx);
        if !pe.outstanding_read {
            return Err(job);
        }
        pe.read_jobs.push_back(job);
        Ok(())
    }

    /// Reserve pending placeholder buffers for an in-flight read, so the
    /// covered range is accounted and `try_read` reports it as pending
    /// rather than absent. Returns the number of placeholders created
    /// (an allocator shortfall simply reserves fewer).
    pub fn reserve_read_blocks(
        &self,
        storage: StorageId,
        piece: PieceIndex,
        blocks: &[BlockIndex],
    ) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(idx) = inner.find(storage, piece) else {
            return 0;
        };
        debug_assert!(
            inner.arena.get(idx).outstanding_read,
            "reserving blocks without an outstanding read"
        );
        let volatile = inner.arena.get(idx).cache_state == CacheState::VolatileReadLru;
        let mut reserved = 0;
        for bi in blocks {
            let b = bi.0 as usize;
            if inner.arena.get(idx).block(b).buf.is_some() {
                continue;
            }
            let Some(buf) = inner.alloc.allocate_buffer() else {
                break;
            };
            let pe = inner.arena.get_mut(idx);
            let e = pe.block_mut(b);
            e.buf = Some(buf);
            e.pending = true;
            pe.num_blocks += 1;
            if volatile {
                inner.volatile_size += 1;
            } else {
                inner.read_cache_size += 1;
            }
            reserved += 1;
        }
        if reserved > 0 {
            let over = inner
                .blocks_in_use()
                .saturating_sub(inner.settings.capacity_blocks);
            if over > 0 {
                let _ = inner.try_evict_blocks(over, Some(idx));
            }
        }
        inner.verify_invariants_debug();
        reserved
    }

    /// Install blocks delivered by a completed disk read.
    ///
    /// Pending placeholders in the covered range are replaced; blocks
    /// that meanwhile got data another way keep what they have. Clears
    /// `outstanding_read` and returns the queued read jobs, in the order
    /// they were enqueued, for re-evaluation against the now-populated
    /// piece.
    pub fn insert_blocks(
        &self,
        storage: StorageId,
        piece: PieceIndex,
        blocks: Vec<(BlockIndex, BlockBuf)>,
        volatile_read: bool,
    ) -> VecDeque<CacheJob> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let state = if volatile_read {
            CacheState::VolatileReadLru
        } else {
            CacheState::ReadLru1
        };
        let idx = inner.allocate_piece(storage, piece, state);
        let piece_volatile = inner.arena.get(idx).cache_state == CacheState::VolatileReadLru;
        let mut installed = 0_usize;
        for (bi, buf) in blocks {
            let b = bi.0 as usize;
            assert!(
                bi.0 < inner.arena.get(idx).blocks_in_piece,
                "block beyond piece end"
            );
            let e = inner.arena.get_mut(idx).block_mut(b);
            if e.buf.is_some() {
                if e.pending {
                    let old = e.buf.take().expect("pending placeholder");
                    e.pending = false;
                    e.buf = Some(buf);
                    inner.alloc.free_buffer(old);
                    installed += 1;
                } else {
                    // raced by a write or another read; keep what's there
                    inner.alloc.free_buffer(buf);
                }
                continue;
            }
            e.buf = Some(buf);
            e.pending = false;
            inner.arena.get_mut(idx).num_blocks += 1;
            if piece_volatile {
                inner.volatile_size += 1;
            } else {
                inner.read_cache_size += 1;
            }
            installed += 1;
        }

        let drained = {
            let pe = inner.arena.get_mut(idx);
            pe.outstanding_read = false;
            std::mem::take(&mut pe.read_jobs)
        };

        if piece_volatile {
            while inner.volatile_size > inner.max_volatile_blocks {
                if inner.try_evict_one_volatile() == 0 {
                    break;
                }
            }
        }
        let over = inner
            .blocks_in_use()
            .saturating_sub(inner.settings.capacity_blocks);
        if over > 0 {
            let _ = inner.try_evict_blocks(over, Some(idx));
        }
        trace!(
            target: "riptide::cache",
            event = "insert_blocks",
            storage = storage.0,
            piece = piece.0,
            installed,
            drained_jobs = drained.len()
        );
        inner.verify_invariants_debug();
        drained
    }

    /// Cancel an in-flight read: clear `outstanding_read`, release the
    /// pending placeholders, and fail the queued read jobs into
    /// `completions`.
    pub fn abort_read(
        &self,
        storage: StorageId,
        piece: PieceIndex,
        completions: &mut VecDeque<CacheJob>,
    ) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(idx) = inner.find(storage, piece) else {
            return;
        };
        inner.arena.get_mut(idx).outstanding_read = false;
        let bip = inner.arena.get(idx).blocks_in_piece as usize;
        if inner.arena.get(idx).blocks.is_some() {
            for b in 0..bip {
                if inner.arena.get(idx).block(b).pending {
                    inner.free_block(idx, b);
                }
            }
        }
        let mut queued = std::mem::take(&mut inner.arena.get_mut(idx).read_jobs);
        for job in &mut queued {
            job.fail(RiptideError::Aborted);
        }
        completions.extend(queued);
        inner.maybe_free_piece(idx);
        inner.verify_invariants_debug();
    }

    /// Blocks a read job would read once padded to `read_ahead`, clamped
    /// to the piece end and skipping blocks already cached.
    #[must_use]
    pub fn pad_job(&self, job: &CacheJob, read_ahead: u32) -> u32 {
        let JobPayload::Read { offset, len, .. } = job.payload else {
            panic!("pad_job on a write job");
        };
        let guard = self.inner.lock();
        let inner = &*guard;
        let bs = inner.block_size;
        let bip = inner.layout.blocks_in_piece(job.storage, job.piece);
        let first = offset / bs;
        let end = if len == 0 {
            first + 1
        } else {
            ((u64::from(offset) + u64::from(len) - 1) / u64::from(bs) + 1) as u32
        };
        let want_end = end.max(first.saturating_add(read_ahead)).min(bip);
        match inner.find(job.storage, job.piece) {
            Some(idx) if inner.arena.get(idx).cache_state.is_resident() => {
                let pe = inner.arena.get(idx);
                (first..want_end)
                    .filter(|&b| {
                        let e = pe.block(b as usize);
                        e.buf.is_none() || e.pending
                    })
                    .count() as u32
            }
            _ => want_end.saturating_sub(first),
        }
    }

    // ── Write path ──────────────────────────────────────────────────────

    /// Admit a block received from a peer into the write cache.
    ///
    /// Takes the job's buffer, marks the block dirty, queues the job for
    /// completion when the block is flushed, and moves the piece to the
    /// MRU end of the write list. A duplicate dirty write is a caller
    /// bug and panics.
    pub fn add_dirty_block(&self, mut job: CacheJob) {
        let storage = job.storage;
        let piece = job.piece;
        let (b, buf) = match &mut job.payload {
            JobPayload::Write { block, buf } => (
                block.0 as usize,
                buf.take().expect("write job carries a buffer"),
            ),
            JobPayload::Read { .. } => panic!("add_dirty_block on a read job"),
        };

        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let idx = inner.allocate_piece(storage, piece, CacheState::WriteLru);
        // make room; this only ever evicts read blocks
        let over = (inner.blocks_in_use() + 1).saturating_sub(inner.settings.capacity_blocks);
        if over > 0 {
            let _ = inner.try_evict_blocks(over, Some(idx));
        }

        assert!(
            (b as u32) < inner.arena.get(idx).blocks_in_piece,
            "block beyond piece end"
        );
        {
            let e = inner.arena.get(idx).block(b);
            if e.dirty && e.buf.is_some() {
                error!(
                    target: "riptide::cache",
                    event = "invariant_violation",
                    storage = storage.0,
                    piece = piece.0,
                    block = b,
                    detail = "duplicate dirty write"
                );
                panic!("duplicate dirty write to piece {piece} block {b}");
            }
            assert!(!e.pending, "dirty write to a pending block");
        }
        if inner.arena.get(idx).block(b).buf.is_some() {
            // a cached read copy is superseded by the fresh payload
            assert!(
                inner.arena.get(idx).block(b).refcount == 0,
                "replacing a pinned read block"
            );
            inner.free_block(idx, b);
        }

        let min_age = inner.settings.min_cache_age;
        {
            let pe = inner.arena.get_mut(idx);
            let e = pe.block_mut(b);
            e.buf = Some(buf);
            e.dirty = true;
            e.pending = false;
            pe.num_blocks += 1;
            pe.num_dirty += 1;
            pe.expire = pe.expire.max(Instant::now() + min_age);
            pe.jobs.push_back(job);
        }
        inner.write_cache_size += 1;

        if inner.arena.get(idx).cache_state == CacheState::WriteLru {
            inner.lru.bump(&mut inner.arena, idx);
        } else {
            inner.update_cache_state(idx);
        }
        trace!(
            target: "riptide::cache",
            event = "dirty_block_add",
            storage = storage.0,
            piece = piece.0,
            block = b,
            num_dirty = inner.arena.get(idx).num_dirty
        );
        inner.verify_invariants_debug();
    }

    /// Pin this piece's dirty blocks for one flush.
    ///
    /// Returns `None` if the piece is missing, has nothing dirty, or
    /// already has a flush in flight (at most one per piece).
    pub fn take_flush_batch(&self, storage: StorageId, piece: PieceIndex) -> Option<FlushBatch> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let idx = inner.find(storage, piece)?;
        {
            let pe = inner.arena.get(idx);
            if pe.outstanding_flush || pe.num_dirty == 0 {
                return None;
            }
        }
        let bip = inner.arena.get(idx).blocks_in_piece as usize;
        let mut blocks = Vec::with_capacity(inner.arena.get(idx).num_dirty as usize);
        for b in 0..bip {
            let buf = {
                let e = inner.arena.get(idx).block(b);
                if !e.dirty || e.pending {
                    continue;
                }
                e.buf.as_ref().expect("dirty block has a buffer").clone_ref()
            };
            let ok = inner.inc_block_refcount(idx, b, RefReason::Flushing);
            debug_assert!(ok);
            blocks.push((
                BlockIndex(u32::try_from(b).expect("block index fits u32")),
                buf,
            ));
        }
        debug_assert!(!blocks.is_empty());
        {
            let pe = inner.arena.get_mut(idx);
            pe.outstanding_flush = true;
            pe.flushing_blocks = u32::try_from(blocks.len()).expect("batch fits u32");
            assert!(
                pe.piece_refcount < MAX_PIECE_REFCOUNT,
                "piece refcount overflow"
            );
            pe.piece_refcount += 1;
        }
        debug!(
            target: "riptide::cache",
            event = "flush_batch_take",
            storage = storage.0,
            piece = piece.0,
            blocks = blocks.len()
        );
        inner.verify_invariants_debug();
        Some(FlushBatch {
            storage,
            piece,
            blocks,
        })
    }

    /// Settle flushed blocks: dirty → clean, write accounting → read
    /// accounting, completion jobs posted for blocks now clean.
    ///
    /// When the last dirty block clears, the piece moves to its read
    /// list, or is demoted/erased if `need_readback` or a deferred
    /// removal mark is set. Returns `true` if the piece was freed.
    pub fn blocks_flushed(
        &self,
        storage: StorageId,
        piece: PieceIndex,
        flushed: &[BlockIndex],
        completions: &mut VecDeque<CacheJob>,
    ) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let idx = inner
            .find(storage, piece)
            .expect("flush completion for an unknown piece");
        let bs = inner.block_size;

        for bi in flushed {
            let b = bi.0 as usize;
            {
                let pe = inner.arena.get_mut(idx);
                let e = pe.block_mut(b);
                assert!(
                    e.dirty && !e.pending,
                    "flushed block must be dirty and settled"
                );
                e.dirty = false;
                pe.num_dirty -= 1;
                let cursor_passed = pe
                    .hash
                    .as_ref()
                    .is_some_and(|h| (b as u64) * u64::from(bs) >= u64::from(h.offset()));
                if cursor_passed {
                    pe.need_readback = true;
                }
            }
            inner.write_cache_size -= 1;
            inner.read_cache_size += 1;
            let batch_pinned = {
                let pe = inner.arena.get(idx);
                pe.outstanding_flush && pe.flushing_blocks > 0
            };
            if batch_pinned {
                inner.arena.get_mut(idx).flushing_blocks -= 1;
                inner.dec_block_refcount(idx, b, RefReason::Flushing);
            }
        }
        {
            let pe = inner.arena.get_mut(idx);
            if pe.outstanding_flush && pe.flushing_blocks == 0 {
                pe.outstanding_flush = false;
                pe.piece_refcount -= 1;
            }
        }

        // post completion jobs for blocks now clean, preserving order
        let queued = std::mem::take(&mut inner.arena.get_mut(idx).jobs);
        for mut jobq in queued {
            let b = jobq.write_block().0 as usize;
            if inner.arena.get(idx).block(b).dirty {
                inner.arena.get_mut(idx).jobs.push_back(jobq);
            } else {
                jobq.complete(bs);
                completions.push_back(jobq);
            }
        }

        let (num_dirty, wants_out, can_evict) = {
            let pe = inner.arena.get(idx);
            (
                pe.num_dirty,
                pe.need_readback || pe.marked_for_eviction || pe.marked_for_deletion,
                pe.evictable(true),
            )
        };
        let freed = if num_dirty == 0 {
            if wants_out {
                if can_evict {
                    inner.evict_clean_piece(idx);
                    true
                } else {
                    {
                        let pe = inner.arena.get_mut(idx);
                        if !pe.marked_for_deletion {
                            pe.marked_for_eviction = true;
                        }
                    }
                    inner.update_cache_state(idx);
                    false
                }
            } else {
                inner.update_cache_state(idx);
                false
            }
        } else {
            false
        };
        debug!(
            target: "riptide::cache",
            event = "flush_complete",
            storage = storage.0,
            piece = piece.0,
            flushed = flushed.len(),
            piece_freed = freed
        );
        inner.verify_invariants_debug();
        freed
    }

    /// Drop the flush pins of a failed (or partially failed) flush
    /// without clearing dirty bits. On a partial failure call
    /// [`Self::blocks_flushed`] for the written indices first, then this
    /// with the whole batch.
    pub fn abort_flush(&self, batch: FlushBatch) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let idx = inner
            .find(batch.storage, batch.piece)
            .expect("flush pins its piece");
        for (bi, _) in &batch.blocks {
            let b = bi.0 as usize;
            if inner.arena.get(idx).flushing_blocks == 0 {
                break;
            }
            if !inner.arena.get(idx).block(b).dirty {
                continue; // already settled by blocks_flushed
            }
            inner.arena.get_mut(idx).flushing_blocks -= 1;
            inner.dec_block_refcount(idx, b, RefReason::Flushing);
        }
        let release = {
            let pe = inner.arena.get(idx);
            pe.outstanding_flush && pe.flushing_blocks == 0
        };
        if release {
            let pe = inner.arena.get_mut(idx);
            pe.outstanding_flush = false;
            pe.piece_refcount -= 1;
            inner.maybe_free_piece(idx);
        }
        inner.verify_invariants_debug();
    }

    /// Free every dirty, unpinned block of the piece and fail its queued
    /// write jobs. Pinned dirty blocks keep their state and are released
    /// by the refcount-drop path.
    pub fn abort_dirty(&self, storage: StorageId, piece: PieceIndex) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(idx) = inner.find(storage, piece) else {
            return;
        };
        let mut queued = std::mem::take(&mut inner.arena.get_mut(idx).jobs);
        for jobq in &mut queued {
            jobq.fail(RiptideError::Aborted);
        }
        inner.deferred.extend(queued);
        inner.abort_dirty_blocks(idx);
        if inner.arena.get(idx).cache_state.is_resident() {
            inner.update_cache_state(idx);
        }
        inner.maybe_free_piece(idx);
        inner.verify_invariants_debug();
    }

    // ── Pinning ─────────────────────────────────────────────────────────

    /// Pin one block. Returns `false` if the block has no buffer.
    pub fn inc_block_refcount(
        &self,
        storage: StorageId,
        piece: PieceIndex,
        block: BlockIndex,
        reason: RefReason,
    ) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(idx) = inner.find(storage, piece) else {
            return false;
        };
        if inner.arena.get(idx).blocks.is_none() {
            return false;
        }
        inner.inc_block_refcount(idx, block.0 as usize, reason)
    }

    /// Unpin one block. Runs deferred removal when the last pin drains.
    pub fn dec_block_refcount(
        &self,
        storage: StorageId,
        piece: PieceIndex,
        block: BlockIndex,
        reason: RefReason,
    ) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let idx = inner.find(storage, piece).expect("pinned piece exists");
        inner.dec_block_refcount(idx, block.0 as usize, reason);
        inner.verify_invariants_debug();
    }

    /// Coarse pin for piece-spanning work. Returns `false` if the piece
    /// is not resident.
    pub fn inc_piece_refcount(&self, storage: StorageId, piece: PieceIndex) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(idx) = inner.find(storage, piece) else {
            return false;
        };
        let pe = inner.arena.get_mut(idx);
        if !pe.cache_state.is_resident() {
            return false;
        }
        assert!(
            pe.piece_refcount < MAX_PIECE_REFCOUNT,
            "piece refcount overflow"
        );
        pe.piece_refcount += 1;
        true
    }

    pub fn dec_piece_refcount(&self, storage: StorageId, piece: PieceIndex) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let idx = inner.find(storage, piece).expect("pinned piece exists");
        {
            let pe = inner.arena.get_mut(idx);
            assert!(pe.piece_refcount > 0, "piece refcount underflow");
            pe.piece_refcount -= 1;
        }
        inner.maybe_free_piece(idx);
        inner.verify_invariants_debug();
    }

    // ── Hashing ─────────────────────────────────────────────────────────

    /// Start an incremental hashing pass over the cached run at the hash
    /// cursor. Pins the run (reason `Hashing`), sets `hashing`, takes a
    /// piece refcount, and moves the context out to the worker.
    pub fn begin_hash_job(&self, storage: StorageId, piece: PieceIndex) -> Option<HashJob> {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let idx = inner.find(storage, piece)?;
        {
            let pe = inner.arena.get(idx);
            if !pe.cache_state.is_resident() || pe.hashing || pe.hashing_done {
                return None;
            }
        }
        let bs = inner.block_size;
        let bip = inner.arena.get(idx).blocks_in_piece;
        let context = inner.arena.get_mut(idx).hash.take().unwrap_or_default();
        let cursor_block = context.offset() / bs;
        if cursor_block >= bip {
            inner.arena.get_mut(idx).hash = Some(context);
            return None;
        }

        let mut blocks = Vec::new();
        for b in cursor_block..bip {
            let buf = {
                let e = inner.arena.get(idx).block(b as usize);
                match &e.buf {
                    Some(buf) if !e.pending => buf.clone_ref(),
                    _ => break,
                }
            };
            let ok = inner.inc_block_refcount(idx, b as usize, RefReason::Hashing);
            debug_assert!(ok);
            blocks.push((BlockIndex(b), buf));
        }
        if blocks.is_empty() {
            // nothing cached at the cursor; leave no empty context behind
            let pe = inner.arena.get_mut(idx);
            pe.hash = if context.offset() == 0 {
                None
            } else {
                Some(context)
            };
            return None;
        }
        {
            let pe = inner.arena.get_mut(idx);
            pe.hashing = true;
            assert!(
                pe.piece_refcount < MAX_PIECE_REFCOUNT,
                "piece refcount overflow"
            );
            pe.piece_refcount += 1;
        }
        debug!(
            target: "riptide::cache",
            event = "hash_job_begin",
            storage = storage.0,
            piece = piece.0,
            cursor_block,
            blocks = blocks.len()
        );
        inner.verify_invariants_debug();
        Some(HashJob {
            storage,
            piece,
            context,
            blocks,
        })
    }

    /// Return a hashing pass: unpin the run, restore the advanced
    /// context (or record completion), release the piece refcount.
    pub fn complete_hash_job(&self, hash_job: HashJob, done: bool) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let idx = inner
            .find(hash_job.storage, hash_job.piece)
            .expect("hash job pins its piece");
        for (bi, _) in &hash_job.blocks {
            inner.dec_block_refcount(idx, bi.0 as usize, RefReason::Hashing);
        }
        {
            let pe = inner.arena.get_mut(idx);
            pe.hashing = false;
            if done {
                pe.hashing_done = true;
                pe.hash = None;
            } else {
                pe.hash = Some(hash_job.context);
            }
            assert!(pe.piece_refcount > 0, "piece refcount underflow");
            pe.piece_refcount -= 1;
        }
        inner.maybe_free_piece(idx);
        inner.verify_invariants_debug();
    }

    // ── Eviction ────────────────────────────────────────────────────────

    /// Flag the piece for removal; remove it now if nothing pins it,
    /// otherwise removal happens when the pins drain.
    pub fn mark_for_eviction(&self, storage: StorageId, piece: PieceIndex, mode: EvictionMode) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(idx) = inner.find(storage, piece) else {
            return;
        };
        inner.mark_piece(idx, mode);
        inner.maybe_free_piece(idx);
        inner.verify_invariants_debug();
    }

    /// Like [`Self::mark_for_eviction`], but posts the piece's queued
    /// jobs to `completions` and reports whether the piece was actually
    /// freed now.
    pub fn evict_piece(
        &self,
        storage: StorageId,
        piece: PieceIndex,
        mode: EvictionMode,
        completions: &mut VecDeque<CacheJob>,
    ) -> bool {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let Some(idx) = inner.find(storage, piece) else {
            return false;
        };
        inner.mark_piece(idx, mode);
        let freed = inner.maybe_free_piece(idx);
        completions.append(&mut inner.deferred);
        inner.verify_invariants_debug();
        freed
    }

    /// Try to free `num` read-cache buffers; returns the shortfall.
    pub fn try_evict_blocks(&self, num: usize) -> usize {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let shortfall = inner.try_evict_blocks(num, None);
        inner.verify_invariants_debug();
        shortfall
    }

    /// Evict the least recently used evictable volatile piece, if any.
    pub fn try_evict_one_volatile(&self) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let _ = inner.try_evict_one_volatile();
        inner.verify_invariants_debug();
    }

    /// Tear down a storage: abort its dirty data, fail its queued jobs
    /// with `StorageGone` into `completions`, and erase every piece the
    /// moment its pins drain (immediately, for unpinned pieces).
    pub fn clear(&self, storage: StorageId, completions: &mut VecDeque<CacheJob>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let idxs: Vec<u32> = inner
            .index
            .iter()
            .filter(|((s, _), _)| *s == storage)
            .map(|(_, &idx)| idx)
            .collect();
        let count = idxs.len();
        for idx in idxs {
            {
                let pe = inner.arena.get_mut(idx);
                pe.outstanding_read = false;
                let mut jobs = std::mem::take(&mut pe.jobs);
                let read_jobs = std::mem::take(&mut pe.read_jobs);
                jobs.extend(read_jobs);
                for jobq in &mut jobs {
                    jobq.fail(RiptideError::StorageGone);
                }
                completions.extend(jobs);
            }
            if inner.arena.get(idx).blocks.is_some() {
                let bip = inner.arena.get(idx).blocks_in_piece as usize;
                for b in 0..bip {
                    if inner.arena.get(idx).block(b).pending {
                        inner.free_block(idx, b);
                    }
                }
            }
            inner.abort_dirty_blocks(idx);
            inner.arena.get_mut(idx).marked_for_deletion = true;
            if !inner.maybe_free_piece(idx) && inner.arena.get(idx).cache_state.is_resident() {
                // pins defer the erase; keep list membership consistent
                inner.update_cache_state(idx);
            }
        }
        info!(
            target: "riptide::cache",
            event = "storage_clear",
            storage = storage.0,
            pieces = count
        );
        inner.verify_invariants_debug();
    }

    /// Completions produced by deferred removal paths. Dispatch outside
    /// the lock.
    pub fn drain_deferred_completions(&self) -> VecDeque<CacheJob> {
        std::mem::take(&mut self.inner.lock().deferred)
    }

    // ── Introspection ───────────────────────────────────────────────────

    #[must_use]
    pub fn piece_state(&self, storage: StorageId, piece: PieceIndex) -> Option<CacheState> {
        let inner = self.inner.lock();
        inner
            .find(storage, piece)
            .map(|idx| inner.arena.get(idx).cache_state)
    }

    #[must_use]
    pub fn num_pieces(&self) -> usize {
        self.inner.lock().arena.len()
    }

    #[must_use]
    pub fn num_write_lru_pieces(&self) -> usize {
        self.inner.lock().lru.list(CacheState::WriteLru).len()
    }

    #[must_use]
    pub fn read_cache_size(&self) -> usize {
        self.inner.lock().read_cache_size
    }

    #[must_use]
    pub fn write_cache_size(&self) -> usize {
        self.inner.lock().write_cache_size
    }

    #[must_use]
    pub fn pinned_blocks(&self) -> usize {
        self.inner.lock().pinned_blocks
    }

    /// Snapshot of every piece, in arena order.
    #[must_use]
    pub fn all_pieces(&self) -> Vec<PieceSnapshot> {
        let inner = self.inner.lock();
        inner.arena.iter().map(|(_, pe)| snapshot(pe)).collect()
    }

    /// Snapshot of the write list from LRU to MRU, for flush scheduling.
    #[must_use]
    pub fn write_lru_pieces(&self) -> Vec<PieceSnapshot> {
        let guard = self.inner.lock();
        let inner = &*guard;
        inner
            .lru
            .list(CacheState::WriteLru)
            .iter(&inner.arena)
            .map(|idx| snapshot(inner.arena.get(idx)))
            .collect()
    }

    #[must_use]
    pub fn stats(&self) -> CacheStats {
        let inner = self.inner.lock();
        CacheStats {
            num_pieces: inner.arena.len(),
            read_cache_blocks: inner.read_cache_size,
            write_cache_blocks: inner.write_cache_size,
            volatile_blocks: inner.volatile_size,
            pinned_blocks: inner.pinned_blocks,
            send_buffer_blocks: inner.send_buffer_blocks,
            write_lru_len: inner.lru.list(CacheState::WriteLru).len(),
            ghost_lru1_len: inner.lru.list(CacheState::ReadLru1Ghost).len(),
            ghost_lru2_len: inner.lru.list(CacheState::ReadLru2Ghost).len(),
            last_cache_op: inner.last_cache_op,
            buffers_in_use: inner.alloc.in_use_count(),
            capacity_blocks: inner.settings.capacity_blocks,
        }
    }

    /// Verify the full data-model invariant set; panics on violation.
    pub fn check_invariant(&self) {
        self.inner.lock().verify_invariants();
    }
}

fn ghost_target(settings: &CacheSettings) -> usize {
    (settings.capacity_blocks as f64 * settings.ghost_list_fraction) as usize
}

fn volatile_target(settings: &CacheSettings) -> usize {
    (settings.capacity_blocks as f64 * settings.volatile_fraction) as usize
}

fn snapshot(pe: &PieceEntry) -> PieceSnapshot {
    PieceSnapshot {
        storage: pe.storage,
        piece: pe.piece,
        state: pe.cache_state,
        blocks_in_piece: pe.blocks_in_piece,
        num_blocks: pe.num_blocks,
        num_dirty: pe.num_dirty,
        pinned: pe.pinned,
        expire: pe.expire,
    }
}

impl CacheInner {
    fn find(&self, storage: StorageId, piece: PieceIndex) -> Option<u32> {
        self.index.get(&(storage, piece)).copied()
    }

    fn blocks_in_use(&self) -> usize {
        self.read_cache_size + self.write_cache_size + self.volatile_size
    }

    /// Return the existing piece (re-retaining it, and materializing a
    /// ghost when a resident state is requested), or admit a fresh one
    /// at the MRU end of the requested list.
    fn allocate_piece(&mut self, storage: StorageId, piece: PieceIndex, state: CacheState) -> u32 {
        if let Some(idx) = self.find(storage, piece) {
            let materialize = {
                let pe = self.arena.get_mut(idx);
                pe.marked_for_eviction = false;
                pe.cache_state.is_ghost() && state.is_resident()
            };
            if materialize {
                let pe = self.arena.get_mut(idx);
                pe.blocks = Some(PieceEntry::zeroed_blocks(pe.blocks_in_piece));
                self.lru.relink(&mut self.arena, idx, state);
                trace!(
                    target: "riptide::cache::arc",
                    event = "ghost_materialize",
                    storage = storage.0,
                    piece = piece.0
                );
            }
            return idx;
        }

        let bip = self.layout.blocks_in_piece(storage, piece);
        let entry = PieceEntry::new(storage, piece, bip, state);
        let idx = self.arena.insert(entry);
        self.lru.link_current(&mut self.arena, idx);
        self.index.insert((storage, piece), idx);
        if state.is_resident() {
            self.last_cache_op = LastCacheOp::CacheMiss;
        }
        debug!(
            target: "riptide::cache::arc",
            event = "piece_admit",
            storage = storage.0,
            piece = piece.0,
            blocks_in_piece = bip,
            state = ?state
        );
        idx
    }

    /// A request touched a ghost entry: record which list produced the
    /// hit and readmit the piece, empty, into the frequent list.
    fn ghost_hit(&mut self, idx: u32, state: CacheState) {
        self.last_cache_op = match state {
            CacheState::ReadLru1Ghost => LastCacheOp::GhostHitLru1,
            CacheState::ReadLru2Ghost => LastCacheOp::GhostHitLru2,
            _ => unreachable!("ghost_hit on a resident piece"),
        };
        let (storage, piece) = {
            let pe = self.arena.get_mut(idx);
            pe.blocks = Some(PieceEntry::zeroed_blocks(pe.blocks_in_piece));
            pe.was_frequent = true;
            pe.marked_for_eviction = false;
            (pe.storage, pe.piece)
        };
        self.lru.relink(&mut self.arena, idx, CacheState::ReadLru2);
        debug!(
            target: "riptide::cache::arc",
            event = "ghost_hit",
            storage = storage.0,
            piece = piece.0,
            list = ?state
        );
    }

    /// Apply the ARC promotion rules after a read hit.
    fn cache_hit_update(&mut self, idx: u32, promoted: bool, volatile_read: bool) {
        let state = self.arena.get(idx).cache_state;
        if volatile_read {
            if state == CacheState::VolatileReadLru {
                self.lru.bump(&mut self.arena, idx);
            }
            return;
        }
        match state {
            CacheState::ReadLru1 => {
                if promoted {
                    self.arena.get_mut(idx).was_frequent = true;
                    self.lru.relink(&mut self.arena, idx, CacheState::ReadLru2);
                    trace!(
                        target: "riptide::cache::arc",
                        event = "promote_frequent",
                        piece = self.arena.get(idx).piece.0
                    );
                } else {
                    self.lru.bump(&mut self.arena, idx);
                }
            }
            CacheState::ReadLru2 | CacheState::VolatileReadLru => {
                self.lru.bump(&mut self.arena, idx);
            }
            // the write list is ordered by write recency; ghosts were
            // handled before the copy
            _ => {}
        }
    }

    fn inc_block_refcount(&mut self, idx: u32, block: usize, reason: RefReason) -> bool {
        let pe = self.arena.get_mut(idx);
        if pe.blocks.is_none() {
            return false;
        }
        let e = pe.block_mut(block);
        if e.buf.is_none() {
            return false;
        }
        assert!(e.refcount < MAX_BLOCK_REFCOUNT, "block refcount overflow");
        let was_zero = e.refcount == 0;
        e.refcount += 1;
        e.note_ref(reason);
        pe.refcount += 1;
        if was_zero {
            pe.pinned += 1;
            assert!(pe.pinned <= MAX_PINNED_BLOCKS, "pinned block count overflow");
            self.pinned_blocks += 1;
        }
        true
    }

    fn dec_block_refcount(&mut self, idx: u32, block: usize, reason: RefReason) {
        let now_zero = {
            let piece = self.arena.get(idx).piece;
            let pe = self.arena.get_mut(idx);
            let e = pe.block_mut(block);
            if e.refcount == 0 {
                error!(
                    target: "riptide::cache",
                    event = "invariant_violation",
                    piece = piece.0,
                    block,
                    detail = "refcount underflow"
                );
                panic!("block refcount underflow");
            }
            e.refcount -= 1;
            e.note_unref(reason);
            let now_zero = e.refcount == 0;
            pe.refcount -= 1;
            if now_zero {
                pe.pinned -= 1;
            }
            now_zero
        };
        if now_zero {
            self.pinned_blocks -= 1;
            let free_dirty = {
                let pe = self.arena.get(idx);
                pe.marked_for_deletion && pe.block(block).dirty
            };
            if free_dirty {
                self.free_block(idx, block);
                self.update_cache_state(idx);
            }
            let run_removal = {
                let pe = self.arena.get(idx);
                pe.pinned == 0 && (pe.marked_for_eviction || pe.marked_for_deletion)
            };
            if run_removal {
                self.maybe_free_piece(idx);
            }
        }
    }

    /// Release one block's buffer. The block must be unpinned.
    fn free_block(&mut self, idx: u32, block: usize) {
        let state = self.arena.get(idx).cache_state;
        let (buf, was_dirty) = {
            let pe = self.arena.get_mut(idx);
            let e = pe.block_mut(block);
            assert!(e.refcount == 0, "freeing a pinned block");
            let buf = e.buf.take().expect("freeing an absent block");
            let was_dirty = e.dirty;
            e.dirty = false;
            e.pending = false;
            e.cache_hit = false;
            pe.num_blocks -= 1;
            if was_dirty {
                pe.num_dirty -= 1;
            }
            (buf, was_dirty)
        };
        if was_dirty {
            self.write_cache_size -= 1;
        } else if state == CacheState::VolatileReadLru {
            self.volatile_size -= 1;
        } else {
            self.read_cache_size -= 1;
        }
        self.alloc.free_buffer(buf);
    }

    /// Free every dirty block with no pins, clearing its dirty flag.
    fn abort_dirty_blocks(&mut self, idx: u32) {
        if self.arena.get(idx).blocks.is_none() {
            return;
        }
        let bip = self.arena.get(idx).blocks_in_piece as usize;
        for b in 0..bip {
            let droppable = {
                let e = self.arena.get(idx).block(b);
                e.dirty && e.refcount == 0 && !e.pending
            };
            if droppable {
                self.free_block(idx, b);
            }
        }
    }

    /// Reconcile the piece's list membership with its dirty count.
    fn update_cache_state(&mut self, idx: u32) {
        let (num_dirty, num_blocks, state, was_frequent) = {
            let pe = self.arena.get(idx);
            (pe.num_dirty, pe.num_blocks, pe.cache_state, pe.was_frequent)
        };
        if num_dirty > 0 && state != CacheState::WriteLru {
            debug_assert!(state.is_resident());
            if state == CacheState::VolatileReadLru {
                // clean blocks counted volatile follow the piece out
                let clean = (num_blocks - num_dirty) as usize;
                self.volatile_size -= clean;
                self.read_cache_size += clean;
            }
            self.lru.relink(&mut self.arena, idx, CacheState::WriteLru);
        } else if num_dirty == 0 && state == CacheState::WriteLru {
            let target = if was_frequent {
                CacheState::ReadLru2
            } else {
                CacheState::ReadLru1
            };
            self.lru.relink(&mut self.arena, idx, target);
        }
    }

    fn mark_piece(&mut self, idx: u32, mode: EvictionMode) {
        match mode {
            EvictionMode::AllowGhost => {
                self.arena.get_mut(idx).marked_for_eviction = true;
            }
            EvictionMode::DisallowGhost => {
                let mut jobs = {
                    let pe = self.arena.get_mut(idx);
                    pe.marked_for_deletion = true;
                    pe.outstanding_read = false;
                    let mut jobs = std::mem::take(&mut pe.jobs);
                    let read_jobs = std::mem::take(&mut pe.read_jobs);
                    jobs.extend(read_jobs);
                    jobs
                };
                for jobq in &mut jobs {
                    jobq.fail(RiptideError::Aborted);
                }
                self.deferred.extend(jobs);
            }
        }
    }

    /// Run a deferred removal if the marks are set and nothing pins the
    /// piece any more. Returns `true` if the piece was freed.
    fn maybe_free_piece(&mut self, idx: u32) -> bool {
        {
            let pe = self.arena.get(idx);
            if !(pe.marked_for_eviction || pe.marked_for_deletion) {
                return false;
            }
            if !pe.evictable(true) {
                return false;
            }
        }
        if self.arena.get(idx).marked_for_deletion {
            self.abort_dirty_blocks(idx);
            // anything queued after the mark fails along with the piece
            let mut jobs = {
                let pe = self.arena.get_mut(idx);
                let mut jobs = std::mem::take(&mut pe.jobs);
                jobs.extend(std::mem::take(&mut pe.read_jobs));
                jobs
            };
            for jobq in &mut jobs {
                jobq.fail(RiptideError::Aborted);
            }
            self.deferred.extend(jobs);
            self.erase_piece(idx);
            return true;
        }
        if self.arena.get(idx).num_dirty > 0 {
            return false; // the flush path finishes this
        }
        if self.arena.get(idx).cache_state.is_ghost() {
            return false; // already demoted
        }
        self.evict_clean_piece(idx);
        true
    }

    /// Demote a fully clean, evictable piece out of the resident set:
    /// volatile pieces are erased, read pieces become ghosts, clean
    /// write-list pieces pass through their read list on the way out.
    fn evict_clean_piece(&mut self, idx: u32) {
        let (state, was_frequent, deletion) = {
            let pe = self.arena.get(idx);
            debug_assert!(pe.num_dirty == 0);
            (pe.cache_state, pe.was_frequent, pe.marked_for_deletion)
        };
        if deletion {
            self.erase_piece(idx);
            return;
        }
        match state {
            CacheState::VolatileReadLru => self.erase_piece(idx),
            CacheState::WriteLru => {
                let target = if was_frequent {
                    CacheState::ReadLru2
                } else {
                    CacheState::ReadLru1
                };
                self.lru.relink(&mut self.arena, idx, target);
                self.move_to_ghost(idx);
            }
            CacheState::ReadLru1 | CacheState::ReadLru2 => self.move_to_ghost(idx),
            CacheState::ReadLru1Ghost | CacheState::ReadLru2Ghost | CacheState::Detached => {}
        }
    }

    /// Free the piece's buffers and relink it into its ghost list,
    /// trimming that list to the ghost target. Volatile pieces are
    /// erased instead; they never enter ARC tracking.
    fn move_to_ghost(&mut self, idx: u32) {
        let state = self.arena.get(idx).cache_state;
        if state == CacheState::VolatileReadLru {
            self.erase_piece(idx);
            return;
        }
        let ghost = state.ghost_variant().expect("read-list piece");
        self.free_piece_buffers(idx);
        {
            let pe = self.arena.get_mut(idx);
            pe.blocks = None;
            pe.hash = None;
            pe.marked_for_eviction = false;
            pe.need_readback = false;
            trace!(
                target: "riptide::cache::arc",
                event = "ghost_demote",
                storage = pe.storage.0,
                piece = pe.piece.0,
                list = ?ghost
            );
        }
        self.lru.relink(&mut self.arena, idx, ghost);
        self.trim_ghost_list(ghost);
    }

    fn trim_ghost_list(&mut self, ghost: CacheState) {
        while self.lru.list(ghost).len() > self.ghost_size {
            let victim = self.lru.list(ghost).front().expect("nonempty list");
            self.erase_piece(victim);
        }
    }

    fn trim_ghost_lists(&mut self) {
        self.trim_ghost_list(CacheState::ReadLru1Ghost);
        self.trim_ghost_list(CacheState::ReadLru2Ghost);
    }

    fn free_piece_buffers(&mut self, idx: u32) {
        if self.arena.get(idx).blocks.is_none() {
            return;
        }
        let bip = self.arena.get(idx).blocks_in_piece as usize;
        for b in 0..bip {
            if self.arena.get(idx).block(b).buf.is_some() {
                self.free_block(idx, b);
            }
        }
    }

    /// Remove the piece outright. Everything must be unpinned and no
    /// jobs may be queued.
    fn erase_piece(&mut self, idx: u32) {
        self.free_piece_buffers(idx);
        self.lru.relink(&mut self.arena, idx, CacheState::Detached);
        let pe = self.arena.remove(idx);
        assert!(
            pe.refcount == 0 && pe.piece_refcount == 0 && pe.pinned == 0,
            "erasing a pinned piece"
        );
        assert!(
            pe.jobs.is_empty() && pe.read_jobs.is_empty(),
            "erasing a piece with queued jobs"
        );
        self.index.remove(&(pe.storage, pe.piece));
        trace!(
            target: "riptide::cache",
            event = "piece_erase",
            storage = pe.storage.0,
            piece = pe.piece.0
        );
    }

    /// Try to free `num` buffers: volatile pieces over budget first,
    /// then the ARC-disfavored read list, then the other. Returns the
    /// shortfall.
    fn try_evict_blocks(&mut self, mut num: usize, ignore: Option<u32>) -> usize {
        if num == 0 {
            return 0;
        }
        while self.volatile_size > self.max_volatile_blocks && num > 0 {
            let freed = self.try_evict_one_volatile();
            if freed == 0 {
                break;
            }
            num = num.saturating_sub(freed);
        }

        let lru1 = self.lru.list(CacheState::ReadLru1).len();
        let lru2 = self.lru.list(CacheState::ReadLru2).len();
        let (first, second) = match self.last_cache_op {
            LastCacheOp::CacheMiss => {
                if lru1 >= lru2 {
                    (CacheState::ReadLru1, CacheState::ReadLru2)
                } else {
                    (CacheState::ReadLru2, CacheState::ReadLru1)
                }
            }
            LastCacheOp::GhostHitLru1 => (CacheState::ReadLru2, CacheState::ReadLru1),
            LastCacheOp::GhostHitLru2 => (CacheState::ReadLru1, CacheState::ReadLru2),
        };

        for state in [first, second] {
            if num == 0 {
                break;
            }
            let candidates: Vec<u32> = self.lru.list(state).iter(&self.arena).collect();
            for idx in candidates {
                if num == 0 {
                    break;
                }
                if ignore == Some(idx) {
                    continue;
                }
                if !self.arena.get(idx).evictable(false) {
                    continue;
                }
                let bip = self.arena.get(idx).blocks_in_piece as usize;
                for b in 0..bip {
                    if num == 0 {
                        break;
                    }
                    if self.arena.get(idx).block(b).buf.is_some() {
                        self.free_block(idx, b);
                        num -= 1;
                    }
                }
                if self.arena.get(idx).num_blocks == 0 {
                    self.move_to_ghost(idx);
                }
            }
        }
        if num > 0 {
            trace!(
                target: "riptide::cache::arc",
                event = "evict_shortfall",
                shortfall = num
            );
        }
        num
    }

    /// Evict the first evictable volatile piece from the LRU end.
    /// Returns the number of buffers freed.
    fn try_evict_one_volatile(&mut self) -> usize {
        let candidates: Vec<u32> = self
            .lru
            .list(CacheState::VolatileReadLru)
            .iter(&self.arena)
            .collect();
        for idx in candidates {
            if !self.arena.get(idx).evictable(false) {
                continue;
            }
            let freed = self.arena.get(idx).num_blocks as usize;
            trace!(
                target: "riptide::cache::arc",
                event = "volatile_evict",
                piece = self.arena.get(idx).piece.0,
                freed
            );
            self.erase_piece(idx);
            return freed;
        }
        0
    }

    #[cfg(debug_assertions)]
    fn verify_invariants_debug(&self) {
        self.verify_invariants();
    }

    #[cfg(not(debug_assertions))]
    fn verify_invariants_debug(&self) {}

    /// Check the full data-model invariant set. O(pieces × blocks); runs
    /// after every mutating operation in debug builds.
    fn verify_invariants(&self) {
        let mut read = 0_usize;
        let mut write = 0_usize;
        let mut volatile = 0_usize;
        let mut pinned_total = 0_usize;

        for (idx, pe) in self.arena.iter() {
            assert_eq!(
                self.index.get(&(pe.storage, pe.piece)),
                Some(&idx),
                "index entry mismatch"
            );
            assert_ne!(pe.cache_state, CacheState::Detached, "piece outside any list");
            let Some(blocks) = &pe.blocks else {
                assert!(pe.cache_state.is_ghost(), "resident piece without blocks");
                assert_eq!(pe.num_blocks, 0);
                assert_eq!(pe.num_dirty, 0);
                assert_eq!(pe.pinned, 0);
                assert_eq!(pe.refcount, 0);
                continue;
            };
            assert!(!pe.cache_state.is_ghost(), "ghost piece with blocks");
            assert_eq!(blocks.len() as u32, pe.blocks_in_piece);

            let mut num_blocks = 0_u32;
            let mut num_dirty = 0_u32;
            let mut pinned = 0_u32;
            let mut refcount = 0_u32;
            for e in blocks {
                if e.buf.is_some() {
                    num_blocks += 1;
                } else {
                    assert_eq!(e.refcount, 0, "pinned block without a buffer");
                    assert!(!e.pending, "pending block without a buffer");
                    assert!(!e.dirty, "dirty block without a buffer");
                }
                if e.dirty {
                    num_dirty += 1;
                    write += 1;
                } else if e.buf.is_some() {
                    if pe.cache_state == CacheState::VolatileReadLru {
                        volatile += 1;
                    } else {
                        read += 1;
                    }
                }
                if e.refcount > 0 {
                    pinned += 1;
                }
                refcount += e.refcount;
                #[cfg(debug_assertions)]
                assert_eq!(
                    e.hashing_count + e.reading_count + e.flushing_count,
                    e.refcount,
                    "per-reason counts disagree with the refcount"
                );
            }
            assert_eq!(num_blocks, pe.num_blocks, "num_blocks drifted");
            assert_eq!(num_dirty, pe.num_dirty, "num_dirty drifted");
            assert_eq!(pinned, pe.pinned, "pinned drifted");
            assert_eq!(refcount, pe.refcount, "refcount sum drifted");
            assert!(pe.num_dirty <= pe.num_blocks);
            assert!(pe.num_blocks <= pe.blocks_in_piece);
            assert_eq!(
                pe.cache_state == CacheState::WriteLru,
                pe.num_dirty > 0,
                "write-list membership must track dirty blocks"
            );
            pinned_total += pinned as usize;
        }

        assert_eq!(read, self.read_cache_size, "read_cache_size drifted");
        assert_eq!(write, self.write_cache_size, "write_cache_size drifted");
        assert_eq!(volatile, self.volatile_size, "volatile_size drifted");
        assert_eq!(pinned_total, self.pinned_blocks, "pinned_blocks drifted");
        assert_eq!(
            self.lru.total_len(),
            self.arena.len(),
            "list membership count drifted"
        );
        assert_eq!(self.index.len(), self.arena.len(), "index size drifted");

        for state in [
            CacheState::WriteLru,
            CacheState::VolatileReadLru,
            CacheState::ReadLru1,
            CacheState::ReadLru1Ghost,
            CacheState::ReadLru2,
            CacheState::ReadLru2Ghost,
        ] {
            let list = self.lru.list(state);
            let mut walked = 0;
            for idx in list.iter(&self.arena) {
                assert_eq!(
                    self.arena.get(idx).cache_state,
                    state,
                    "piece linked into the wrong list"
                );
                walked += 1;
            }
            assert_eq!(walked, list.len(), "list length drifted");
        }
    }
}
