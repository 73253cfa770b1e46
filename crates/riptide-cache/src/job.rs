//! Job model shared between the cache, the disk executor, and the peer
//! transport.
//!
//! A job addresses a region of one piece and, for writes, carries the
//! buffer the cache takes ownership of. The cache never invokes
//! callbacks; completed jobs are moved into caller-owned queues with
//! their result slot filled in, and the caller dispatches them outside
//! the critical section.

use crate::pool::BlockBuf;
use riptide_error::{Result, RiptideError};
use riptide_types::{BlockIndex, PieceIndex, StorageId};

/// What a job asks of the cache.
#[derive(Debug)]
pub enum JobPayload {
    /// Store a block received from a peer. The buffer is taken by
    /// `add_dirty_block` and `buf` is `None` from then on.
    Write {
        block: BlockIndex,
        buf: Option<BlockBuf>,
    },
    /// Serve a byte range of the piece to a peer.
    Read {
        /// Byte offset within the piece.
        offset: u32,
        /// Number of bytes requested.
        len: u32,
        /// Low-priority read; cached data goes to the volatile list.
        volatile: bool,
    },
}

/// One unit of work flowing through the cache.
#[derive(Debug)]
pub struct CacheJob {
    pub storage: StorageId,
    pub piece: PieceIndex,
    pub payload: JobPayload,
    /// Set when the job completes: bytes transferred, or the failure.
    pub result: Option<Result<u32>>,
}

impl CacheJob {
    #[must_use]
    pub fn write(storage: StorageId, piece: PieceIndex, block: BlockIndex, buf: BlockBuf) -> Self {
        Self {
            storage,
            piece,
            payload: JobPayload::Write {
                block,
                buf: Some(buf),
            },
            result: None,
        }
    }

    #[must_use]
    pub fn read(storage: StorageId, piece: PieceIndex, offset: u32, len: u32) -> Self {
        Self {
            storage,
            piece,
            payload: JobPayload::Read {
                offset,
                len,
                volatile: false,
            },
            result: None,
        }
    }

    #[must_use]
    pub fn volatile_read(storage: StorageId, piece: PieceIndex, offset: u32, len: u32) -> Self {
        Self {
            storage,
            piece,
            payload: JobPayload::Read {
                offset,
                len,
                volatile: true,
            },
            result: None,
        }
    }

    /// The block a write job targets. Panics on read jobs.
    #[must_use]
    pub fn write_block(&self) -> BlockIndex {
        match &self.payload {
            JobPayload::Write { block, .. } => *block,
            JobPayload::Read { .. } => panic!("write_block on a read job"),
        }
    }

    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self.payload, JobPayload::Write { .. })
    }

    pub(crate) fn complete(&mut self, bytes: u32) {
        debug_assert!(self.result.is_none(), "job completed twice");
        self.result = Some(Ok(bytes));
    }

    pub(crate) fn fail(&mut self, err: RiptideError) {
        debug_assert!(self.result.is_none(), "job completed twice");
        self.result = Some(Err(err));
    }
}
