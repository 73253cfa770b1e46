//! Per-block and per-piece cache state.
//!
//! Counters use native integers but keep the ranges of a packed
//! bitfield layout: block refcounts up to 2^29-1, piece refcounts up
//! to 127, block counts up to 2^14-1, pinned counts up to 2^15-1. The
//! ranges are enforced at the transitions.

use crate::job::CacheJob;
use crate::pool::BlockBuf;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use riptide_types::{PieceIndex, StorageId};

pub(crate) const MAX_BLOCK_REFCOUNT: u32 = (1 << 29) - 1;
pub(crate) const MAX_PIECE_REFCOUNT: u8 = 127;
pub(crate) const MAX_BLOCKS_IN_PIECE: u32 = (1 << 14) - 1;
pub(crate) const MAX_PINNED_BLOCKS: u32 = (1 << 15) - 1;

/// Why a block refcount is being taken or dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefReason {
    /// A hash job is reading the block.
    Hashing,
    /// A peer send path references the block.
    Reading,
    /// A flush in progress references the block.
    Flushing,
}

/// Which LRU list a piece is chained into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum CacheState {
    /// Not linked into any list.
    Detached,
    /// Pieces with dirty blocks awaiting flush.
    WriteLru,
    /// Low-priority read pieces, evicted before anything else.
    VolatileReadLru,
    /// Read pieces requested once (ARC recency list).
    ReadLru1,
    /// Ghosts of pieces evicted from `ReadLru1`.
    ReadLru1Ghost,
    /// Read pieces requested repeatedly (ARC frequency list).
    ReadLru2,
    /// Ghosts of pieces evicted from `ReadLru2`.
    ReadLru2Ghost,
}

/// Number of LRU lists (every state except `Detached`).
pub(crate) const NUM_LRUS: usize = 6;

impl CacheState {
    /// Slot in the LRU set, or `None` for `Detached`.
    #[must_use]
    pub(crate) fn lru_index(self) -> Option<usize> {
        match self {
            Self::Detached => None,
            Self::WriteLru => Some(0),
            Self::VolatileReadLru => Some(1),
            Self::ReadLru1 => Some(2),
            Self::ReadLru1Ghost => Some(3),
            Self::ReadLru2 => Some(4),
            Self::ReadLru2Ghost => Some(5),
        }
    }

    #[must_use]
    pub fn is_ghost(self) -> bool {
        matches!(self, Self::ReadLru1Ghost | Self::ReadLru2Ghost)
    }

    #[must_use]
    pub fn is_resident(self) -> bool {
        !self.is_ghost() && self != Self::Detached
    }

    /// The ghost list a read piece demotes into.
    #[must_use]
    pub(crate) fn ghost_variant(self) -> Option<Self> {
        match self {
            Self::ReadLru1 => Some(Self::ReadLru1Ghost),
            Self::ReadLru2 => Some(Self::ReadLru2Ghost),
            _ => None,
        }
    }
}

/// Interim state of an incremental piece hash.
pub struct PartialHash {
    offset: u32,
    hasher: blake3::Hasher,
}

impl PartialHash {
    #[must_use]
    pub fn new() -> Self {
        Self {
            offset: 0,
            hasher: blake3::Hasher::new(),
        }
    }

    /// Bytes of the piece hashed so far.
    #[must_use]
    pub fn offset(&self) -> u32 {
        self.offset
    }

    /// Feed the next run of piece bytes into the context.
    pub fn update(&mut self, data: &[u8]) {
        self.hasher.update(data);
        self.offset += u32::try_from(data.len()).expect("block fits in u32");
    }

    /// Final digest. Consumes the context.
    #[must_use]
    pub fn finalize(self) -> blake3::Hash {
        self.hasher.finalize()
    }
}

impl Default for PartialHash {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PartialHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PartialHash")
            .field("offset", &self.offset)
            .finish_non_exhaustive()
    }
}

/// Per-block record inside a resident piece.
#[derive(Debug, Default)]
pub(crate) struct BlockEntry {
    /// The cached data, or `None` when nothing is resident.
    pub buf: Option<BlockBuf>,
    /// Outstanding external holds (hashing, peer sends, flushing).
    pub refcount: u32,
    /// Must be written to disk before the buffer may be released.
    pub dirty: bool,
    /// Buffer allocated but contents not yet valid (read in flight).
    pub pending: bool,
    /// Read at least once; a second read promotes the piece.
    pub cache_hit: bool,
    #[cfg(debug_assertions)]
    pub hashing_count: u32,
    #[cfg(debug_assertions)]
    pub reading_count: u32,
    #[cfg(debug_assertions)]
    pub flushing_count: u32,
}

impl BlockEntry {
    #[cfg(debug_assertions)]
    pub(crate) fn note_ref(&mut self, reason: RefReason) {
        match reason {
            RefReason::Hashing => self.hashing_count += 1,
            RefReason::Reading => self.reading_count += 1,
            RefReason::Flushing => self.flushing_count += 1,
        }
    }

    #[cfg(not(debug_assertions))]
    pub(crate) fn note_ref(&mut self, _reason: RefReason) {}

    #[cfg(debug_assertions)]
    pub(crate) fn note_unref(&mut self, reason: RefReason) {
        match reason {
            RefReason::Hashing => {
                assert!(self.hashing_count > 0, "hashing refcount underflow");
                self.hashing_count -= 1;
            }
            RefReason::Reading => {
                assert!(self.reading_count > 0, "reading refcount underflow");
                self.reading_count -= 1;
            }
            RefReason::Flushing => {
                assert!(self.flushing_count > 0, "flushing refcount underflow");
                self.flushing_count -= 1;
            }
        }
    }

    #[cfg(not(debug_assertions))]
    pub(crate) fn note_unref(&mut self, _reason: RefReason) {}
}

/// Per-piece record: the unit of admission and eviction.
#[derive(Debug)]
pub(crate) struct PieceEntry {
    pub storage: StorageId,
    pub piece: PieceIndex,

    /// Dense block array; `None` for ghost entries.
    pub blocks: Option<Box<[BlockEntry]>>,
    /// Length of `blocks` when resident (and when it was resident, for
    /// ghosts).
    pub blocks_in_piece: u32,

    /// Count of entries with a buffer present.
    pub num_blocks: u32,
    /// Count of dirty entries.
    pub num_dirty: u32,
    /// Count of entries with refcount > 0.
    pub pinned: u32,
    /// Sum of all block refcounts.
    pub refcount: u32,
    /// Coarse pin held by piece-spanning work (flush, hash job).
    pub piece_refcount: u8,

    /// Incremental hash state, present while a hash is accumulating.
    pub hash: Option<PartialHash>,
    pub hashing: bool,
    pub hashing_done: bool,

    /// At most one disk read in flight per piece.
    pub outstanding_read: bool,
    /// At most one flush in flight per piece.
    pub outstanding_flush: bool,
    /// Blocks pinned by the current flush batch, not yet accounted back.
    pub flushing_blocks: u32,

    /// Read jobs queued behind the outstanding read.
    pub read_jobs: VecDeque<CacheJob>,
    /// Write jobs to complete as their blocks become clean.
    pub jobs: VecDeque<CacheJob>,

    /// Blocks past the hash cursor were flushed; don't retain read data
    /// once the piece is clean.
    pub need_readback: bool,
    /// Demote to ghost as soon as all pins drain.
    pub marked_for_eviction: bool,
    /// Erase outright as soon as all pins drain.
    pub marked_for_deletion: bool,
    /// The piece has been in the frequent list; a clean write piece
    /// returns there instead of the recency list.
    pub was_frequent: bool,

    /// Earliest time a dirty block here should be flushed by age.
    pub expire: Instant,

    pub cache_state: CacheState,

    /// Intrusive LRU links (slot indices into the piece arena).
    pub prev: Option<u32>,
    pub next: Option<u32>,
}

impl PieceEntry {
    pub(crate) fn new(
        storage: StorageId,
        piece: PieceIndex,
        blocks_in_piece: u32,
        cache_state: CacheState,
    ) -> Self {
        assert!(
            blocks_in_piece <= MAX_BLOCKS_IN_PIECE,
            "piece {piece} has too many blocks: {blocks_in_piece}"
        );
        let blocks = if cache_state.is_ghost() {
            None
        } else {
            Some(Self::zeroed_blocks(blocks_in_piece))
        };
        Self {
            storage,
            piece,
            blocks,
            blocks_in_piece,
            num_blocks: 0,
            num_dirty: 0,
            pinned: 0,
            refcount: 0,
            piece_refcount: 0,
            hash: None,
            hashing: false,
            hashing_done: false,
            outstanding_read: false,
            outstanding_flush: false,
            flushing_blocks: 0,
            read_jobs: VecDeque::new(),
            jobs: VecDeque::new(),
            need_readback: false,
            marked_for_eviction: false,
            marked_for_deletion: false,
            was_frequent: false,
            expire: Instant::now(),
            cache_state,
            prev: None,
            next: None,
        }
    }

    pub(crate) fn zeroed_blocks(blocks_in_piece: u32) -> Box<[BlockEntry]> {
        let mut blocks = Vec::with_capacity(blocks_in_piece as usize);
        blocks.resize_with(blocks_in_piece as usize, BlockEntry::default);
        blocks.into_boxed_slice()
    }

    /// The eviction predicate: nothing may reference the piece.
    ///
    /// `ignore_hash` permits eviction despite accumulated hash progress,
    /// used on deletion paths where the progress is being discarded
    /// anyway.
    pub(crate) fn evictable(&self, ignore_hash: bool) -> bool {
        self.refcount == 0
            && self.piece_refcount == 0
            && !self.hashing
            && self.read_jobs.is_empty()
            && !self.outstanding_read
            && (ignore_hash || self.hash.as_ref().is_none_or(|h| h.offset() == 0))
    }

    pub(crate) fn block(&self, block: usize) -> &BlockEntry {
        &self.blocks.as_ref().expect("resident piece")[block]
    }

    pub(crate) fn block_mut(&mut self, block: usize) -> &mut BlockEntry {
        &mut self.blocks.as_mut().expect("resident piece")[block]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn piece(state: CacheState) -> PieceEntry {
        PieceEntry::new(StorageId(1), PieceIndex(0), 4, state)
    }

    #[test]
    fn ghost_pieces_have_no_block_array() {
        let ghost = piece(CacheState::ReadLru1Ghost);
        assert!(ghost.blocks.is_none());
        assert_eq!(ghost.blocks_in_piece, 4);
        let resident = piece(CacheState::ReadLru1);
        assert_eq!(resident.blocks.as_ref().map(|b| b.len()), Some(4));
    }

    #[test]
    fn fresh_piece_is_evictable() {
        let p = piece(CacheState::ReadLru1);
        assert!(p.evictable(false));
    }

    #[test]
    fn pins_and_hash_progress_veto_eviction() {
        let mut p = piece(CacheState::ReadLru1);
        p.refcount = 1;
        assert!(!p.evictable(false));
        p.refcount = 0;
        p.piece_refcount = 1;
        assert!(!p.evictable(false));
        p.piece_refcount = 0;

        let mut hash = PartialHash::new();
        hash.update(&[0_u8; 16]);
        p.hash = Some(hash);
        assert!(!p.evictable(false));
        assert!(p.evictable(true));
    }

    #[test]
    fn outstanding_reads_veto_eviction() {
        let mut p = piece(CacheState::ReadLru1);
        p.outstanding_read = true;
        assert!(!p.evictable(false));
        p.outstanding_read = false;
        p.read_jobs.push_back(CacheJob::read(StorageId(1), PieceIndex(0), 0, 1));
        assert!(!p.evictable(false));
    }

    #[test]
    fn partial_hash_tracks_its_cursor() {
        let mut hash = PartialHash::new();
        assert_eq!(hash.offset(), 0);
        hash.update(&[1_u8; 1024]);
        hash.update(&[2_u8; 512]);
        assert_eq!(hash.offset(), 1536);

        let mut reference = blake3::Hasher::new();
        reference.update(&[1_u8; 1024]);
        reference.update(&[2_u8; 512]);
        assert_eq!(hash.finalize(), reference.finalize());
    }

    #[test]
    fn ghost_variants() {
        assert_eq!(
            CacheState::ReadLru1.ghost_variant(),
            Some(CacheState::ReadLru1Ghost)
        );
        assert_eq!(
            CacheState::ReadLru2.ghost_variant(),
            Some(CacheState::ReadLru2Ghost)
        );
        assert_eq!(CacheState::WriteLru.ghost_variant(), None);
        assert!(CacheState::ReadLru2Ghost.is_ghost());
        assert!(!CacheState::ReadLru2Ghost.is_resident());
        assert!(CacheState::WriteLru.is_resident());
    }

    #[test]
    #[should_panic(expected = "too many blocks")]
    fn block_count_range_is_enforced() {
        let _ = PieceEntry::new(
            StorageId(1),
            PieceIndex(9),
            MAX_BLOCKS_IN_PIECE + 1,
            CacheState::ReadLru1,
        );
    }
}
