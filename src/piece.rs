//! Per-piece block assembly and integrity checking.
//!
//! Pieces are downloaded as 16 KiB blocks that may arrive in any order.
//! [`PieceWork`] accumulates them into a buffer sized to the actual piece
//! length and tracks which block slots are filled; once every slot is in,
//! the piece is hashed against the descriptor's digest before it is allowed
//! to leave the worker.

use boring::sha::Sha1;
use thiserror::Error;

use crate::message::PieceMessage;

/// Size of a block request, and of every block except a short tail.
pub const BLOCK_SIZE: u32 = 16_384;

#[derive(Debug, Error)]
pub enum BlockError {
    #[error("block belongs to piece {got}, expected piece {want}")]
    WrongPiece { got: u32, want: u32 },
    #[error("block at offset {offset} with {length} bytes overflows the piece")]
    OutOfBounds { offset: u32, length: usize },
    #[error("block slot {0} was already filled")]
    DuplicateBlock(usize),
}

/// A fully downloaded, hash-verified piece on its way to the writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Piece {
    pub id: u32,
    pub data: Vec<u8>,
}

impl Piece {
    /// Compares the SHA-1 digest of the piece data against `expected`.
    pub fn check_integrity(&self, expected: &[u8; 20]) -> bool {
        let mut hasher = Sha1::new();
        hasher.update(&self.data);

        hasher.finish() == *expected
    }
}

/// Download state of a single piece attempt.
///
/// The buffer is sized to the piece's actual length, so the final piece of
/// a torrent (which may be shorter than the nominal piece length) has a
/// correspondingly smaller block count and completes when its short tail
/// block lands.
#[derive(Debug)]
pub struct PieceWork {
    pub id: u32,
    /// Actual length of this piece in bytes.
    pub length: u32,
    /// Block requests emitted so far; owned by the worker's pipeline.
    pub requested: u32,
    data: Vec<u8>,
    blocks: Vec<bool>,
    downloaded: u32,
}

impl PieceWork {
    pub fn new(id: u32, length: u32) -> PieceWork {
        let block_count = length.div_ceil(BLOCK_SIZE);

        PieceWork {
            id,
            length,
            requested: 0,
            data: vec![0; length as usize],
            blocks: vec![false; block_count as usize],
            downloaded: 0,
        }
    }

    /// Number of blocks this piece divides into.
    pub fn block_count(&self) -> u32 {
        self.blocks.len() as u32
    }

    /// Copies one received block into the piece buffer.
    ///
    /// Rejects blocks for a different piece, blocks that would write past
    /// the end of the buffer, and duplicates for an already-filled slot.
    pub fn add_block(&mut self, block: &PieceMessage) -> Result<(), BlockError> {
        if block.piece_id != self.id {
            return Err(BlockError::WrongPiece {
                got: block.piece_id,
                want: self.id,
            });
        }

        let end = block.block_offset as u64 + block.data.len() as u64;
        if end > self.length as u64 {
            return Err(BlockError::OutOfBounds {
                offset: block.block_offset,
                length: block.data.len(),
            });
        }

        let slot = (block.block_offset / BLOCK_SIZE) as usize;
        if self.blocks[slot] {
            return Err(BlockError::DuplicateBlock(slot));
        }

        self.data[block.block_offset as usize..end as usize].copy_from_slice(&block.data);
        self.blocks[slot] = true;
        self.downloaded += 1;

        Ok(())
    }

    /// Whether every block slot has been filled.
    pub fn completed(&self) -> bool {
        self.downloaded == self.block_count()
    }

    pub fn into_piece(self) -> Piece {
        Piece {
            id: self.id,
            data: self.data,
        }
    }
}
