//! Per-peer download loop.
//!
//! Each worker owns one peer connection and pulls piece IDs from the
//! shared work queue. A piece is downloaded by interleaving request
//! pipelining with message handling: as long as the peer is not choking
//! us, up to [`MAX_BACKLOG`] block requests stay in flight; otherwise the
//! worker reads and dispatches one incoming message. Blocks may arrive in
//! any order and the assembler places them by offset.
//!
//! Failures come in two kinds, and the two kinds drive the requeue
//! behavior:
//!
//! - **Network**: the socket is broken (dial, read/write failure, timeout,
//!   over-long frame). The drawn piece goes back on the queue and the
//!   worker exits; the peer is no longer usable.
//! - **Downloading**: the peer is healthy but this attempt failed (peer
//!   lacks the piece, malformed payload, assembler rejection, digest
//!   mismatch). The piece goes back on the queue and the worker keeps
//!   drawing from the same peer.
//!
//! A piece is published to the result channel only after its digest has
//! been verified, so the writer never sees bytes from a failed attempt.

use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;

use crate::client::{Client, PeerError};
use crate::message::{
    Message, PieceMessage, RequestMessage, MSG_BITFIELD, MSG_CHOKE, MSG_HAVE, MSG_INTERESTED,
    MSG_PIECE, MSG_UNCHOKE,
};
use crate::metadata::TorrentMetadata;
use crate::peer::PeerAddr;
use crate::piece::{PieceWork, Piece, BLOCK_SIZE};

/// Maximum number of unanswered block requests kept in flight.
pub const MAX_BACKLOG: u32 = 5;

// Deadline re-armed before every read or write inside the interleave
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DownloadError {
    /// The connection is dead; the worker must give up on this peer.
    #[error("network failure: {0}")]
    Network(anyhow::Error),
    /// The attempt failed but the peer remains usable.
    #[error("downloading failure: {0}")]
    Downloading(anyhow::Error),
}

impl From<PeerError> for DownloadError {
    fn from(err: PeerError) -> DownloadError {
        match err {
            // the frame was read fine, its content is the problem
            PeerError::Message(e) => DownloadError::Downloading(e.into()),
            other => DownloadError::Network(other.into()),
        }
    }
}

/// Downloads pieces from a single peer until the peer dies or the work
/// queue disconnects.
pub struct Worker {
    peer: PeerAddr,
    peer_id: [u8; 20],
    metadata: Arc<TorrentMetadata>,
    work_chan: (Sender<u32>, Receiver<u32>),
    piece_chan: Sender<Piece>,
}

impl Worker {
    pub fn new(
        peer: PeerAddr,
        peer_id: [u8; 20],
        metadata: Arc<TorrentMetadata>,
        work_chan: (Sender<u32>, Receiver<u32>),
        piece_chan: Sender<Piece>,
    ) -> Worker {
        Worker {
            peer,
            peer_id,
            metadata,
            work_chan,
            piece_chan,
        }
    }

    /// Connects to the peer and consumes the work queue. Intended to run
    /// on its own thread; all failures are absorbed here.
    pub fn run(&self) {
        let mut client =
            match Client::connect(self.peer, &self.metadata.info_hash, &self.peer_id) {
                Ok(client) => client,
                Err(e) => {
                    debug!("could not reach peer {}: {}", self.peer, e);
                    return;
                }
            };

        if client.send_message(&Message::new(MSG_INTERESTED)).is_err() {
            debug!("peer {} went away before the first request", self.peer);
            return;
        }

        while let Ok(piece_id) = self.work_chan.1.recv() {
            match self.download_piece(&mut client, piece_id) {
                Ok(piece) => {
                    debug!("piece {} verified via peer {}", piece_id, self.peer);
                    if self.piece_chan.send(piece).is_err() {
                        // the writer is gone, the download is over
                        return;
                    }
                }
                Err(DownloadError::Downloading(e)) => {
                    debug!("piece {} attempt on peer {} failed: {}", piece_id, self.peer, e);
                    if self.work_chan.0.send(piece_id).is_err() {
                        return;
                    }
                }
                Err(DownloadError::Network(e)) => {
                    debug!("peer {} is unusable: {}", self.peer, e);
                    let _ = self.work_chan.0.send(piece_id);
                    return;
                }
            }
        }
    }

    /// Runs one download attempt for `piece_id` and verifies the result.
    fn download_piece(
        &self,
        client: &mut Client,
        piece_id: u32,
    ) -> Result<Piece, DownloadError> {
        if !client.has_piece(piece_id) {
            return Err(DownloadError::Downloading(anyhow!(
                "peer {} does not have piece {}",
                client.peer(),
                piece_id
            )));
        }

        let mut piece = PieceWork::new(piece_id, self.metadata.piece_length_at(piece_id));
        let mut backlog: u32 = 0;

        while !piece.completed() {
            client.set_timeouts(Some(REQUEST_TIMEOUT))?;

            if !client.is_choked() && backlog < MAX_BACKLOG && piece.requested < piece.block_count()
            {
                let block_offset = piece.requested * BLOCK_SIZE;
                let piece_start =
                    piece_id as u64 * self.metadata.piece_length as u64 + block_offset as u64;
                let remaining = self.metadata.length - piece_start;
                let block_length = (BLOCK_SIZE as u64).min(remaining) as u32;

                let request = RequestMessage::new(piece_id, block_offset, block_length);
                client.send_message(&request.to_message())?;

                piece.requested += 1;
                backlog += 1;
                continue;
            }

            match client.read_message()? {
                None => client.send_keep_alive()?,
                Some(message) => match message.id {
                    MSG_PIECE => {
                        backlog = backlog.saturating_sub(1);
                        let block = PieceMessage::try_from(&message)
                            .map_err(|e| DownloadError::Downloading(e.into()))?;
                        piece
                            .add_block(&block)
                            .map_err(|e| DownloadError::Downloading(e.into()))?;
                    }
                    MSG_CHOKE => client.set_choked(true),
                    MSG_UNCHOKE => client.set_choked(false),
                    // availability updates are not tracked mid-session
                    MSG_HAVE | MSG_BITFIELD => {}
                    _ => {}
                },
            }
        }

        let piece = piece.into_piece();
        let expected = &self.metadata.piece_hashes[piece_id as usize];
        if !piece.check_integrity(expected) {
            return Err(DownloadError::Downloading(anyhow!(
                "piece {} failed hash verification",
                piece_id
            )));
        }

        Ok(piece)
    }
}
