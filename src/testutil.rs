//! Test support: a scripted TCP peer speaking the real wire protocol, and
//! generators for patterned torrent data.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::thread;
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt};

use crate::handshake::Handshake;
use crate::message::{Message, PieceMessage, RequestMessage, MSG_BITFIELD, MSG_CHOKE, MSG_HAVE, MSG_UNCHOKE};
use crate::metadata::TorrentMetadata;
use crate::peer::PeerAddr;
use crate::piece::BLOCK_SIZE;

/// A mock peer that accepts connections, completes the session preamble,
/// and serves block requests out of an in-memory copy of the torrent data.
///
/// After the bitfield it sends a scripted choke, unchoke, keep-alive, and
/// have sequence, which exercises every dispatch arm of a downloader
/// before the first block arrives.
#[derive(Clone)]
pub struct MockPeer {
    metadata: TorrentMetadata,
    data: Vec<u8>,
    bitfield: Vec<u8>,
    corrupt: bool,
    wrong_info_hash: bool,
    skip_bitfield: bool,
    oversized_frame: bool,
    disconnect_after_setup: bool,
}

impl MockPeer {
    /// A peer holding every piece of `data`.
    pub fn new(metadata: &TorrentMetadata, data: &[u8]) -> MockPeer {
        let bitfield = vec![0xff; metadata.piece_count().div_ceil(8).max(1) as usize];

        MockPeer {
            metadata: metadata.clone(),
            data: data.to_vec(),
            bitfield,
            corrupt: false,
            wrong_info_hash: false,
            skip_bitfield: false,
            oversized_frame: false,
            disconnect_after_setup: false,
        }
    }

    /// Overrides the advertised bitfield.
    pub fn bitfield(mut self, bytes: Vec<u8>) -> MockPeer {
        self.bitfield = bytes;
        self
    }

    /// Serves zeroed bytes instead of the real data, so every piece fails
    /// its digest check.
    pub fn corrupt_blocks(mut self) -> MockPeer {
        self.corrupt = true;
        self
    }

    /// Replies to the handshake with an unrelated info hash.
    pub fn wrong_info_hash(mut self) -> MockPeer {
        self.wrong_info_hash = true;
        self
    }

    /// Sends an unchoke where the bitfield belongs.
    pub fn skip_bitfield(mut self) -> MockPeer {
        self.skip_bitfield = true;
        self
    }

    /// Announces a 25,000-byte frame right after the bitfield.
    pub fn oversized_frame(mut self) -> MockPeer {
        self.oversized_frame = true;
        self
    }

    /// Closes the connection once the session preamble is done.
    pub fn disconnect_after_setup(mut self) -> MockPeer {
        self.disconnect_after_setup = true;
        self
    }

    /// Binds a listener and serves connections until the test ends.
    pub fn start(self) -> PeerAddr {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        thread::spawn(move || {
            for conn in listener.incoming() {
                let Ok(conn) = conn else { return };
                let peer = self.clone();
                thread::spawn(move || peer.serve(conn));
            }
        });

        PeerAddr {
            ip: Ipv4Addr::LOCALHOST,
            port,
        }
    }

    fn serve(&self, mut conn: TcpStream) {
        let _ = conn.set_read_timeout(Some(Duration::from_secs(5)));
        let _ = conn.set_write_timeout(Some(Duration::from_secs(5)));

        let Ok(handshake) = Handshake::read(&mut conn) else {
            return;
        };
        let info_hash = if self.wrong_info_hash {
            [0xEE; 20]
        } else {
            handshake.info_hash
        };
        let reply = Handshake::new(info_hash, *b"-MOCK00-abcdefghijkl");
        if conn.write_all(&reply.serialize()).is_err() {
            return;
        }

        if self.skip_bitfield {
            let _ = conn.write_all(&Message::new(MSG_UNCHOKE).serialize());
            return;
        }

        let bitfield = Message::new_with_payload(MSG_BITFIELD, self.bitfield.clone());
        if conn.write_all(&bitfield.serialize()).is_err() {
            return;
        }

        if self.oversized_frame {
            let _ = conn.write_all(&25_000u32.to_be_bytes());
            return;
        }

        // scripted preamble: choke, unchoke, keep-alive, have piece 0
        let _ = conn.write_all(&Message::new(MSG_CHOKE).serialize());
        let _ = conn.write_all(&Message::new(MSG_UNCHOKE).serialize());
        let _ = conn.write_all(&[0u8; 4]);
        let have = Message::new_with_payload(MSG_HAVE, 0u32.to_be_bytes().to_vec());
        let _ = conn.write_all(&have.serialize());

        if self.disconnect_after_setup {
            return;
        }

        loop {
            let message = match read_frame(&mut conn) {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(_) => return,
            };
            let Ok(request) = RequestMessage::try_from(&message) else {
                // interested, keep-alive replies and the like
                continue;
            };

            let begin = request.piece_id as u64 * self.metadata.piece_length as u64
                + request.block_offset as u64;
            let end = (begin + request.block_length as u64).min(self.data.len() as u64);
            if begin >= end {
                return;
            }

            let block = if self.corrupt {
                vec![0u8; (end - begin) as usize]
            } else {
                self.data[begin as usize..end as usize].to_vec()
            };

            let piece = PieceMessage::new(request.piece_id, request.block_offset, block);
            if conn.write_all(&piece.to_message().serialize()).is_err() {
                return;
            }
        }
    }
}

fn read_frame(conn: &mut TcpStream) -> std::io::Result<Option<Message>> {
    let mut len_buf = [0u8; 4];
    conn.read_exact(&mut len_buf)?;
    let len = std::io::Cursor::new(len_buf).read_u32::<BigEndian>()?;

    if len == 0 {
        return Ok(None);
    }

    let mut buf = vec![0u8; len as usize];
    conn.read_exact(&mut buf)?;

    Ok(Message::parse(&buf).ok().flatten())
}

/// Deterministic patterned bytes: `piece_count` pieces of
/// `blocks_per_piece` blocks each, with the very last block truncated to
/// `last_block_size`.
pub fn generate_test_data(
    piece_count: usize,
    blocks_per_piece: usize,
    last_block_size: usize,
) -> Vec<u8> {
    let block_size = BLOCK_SIZE as usize;
    let data_len = piece_count * blocks_per_piece * block_size - (block_size - last_block_size);
    let mut data = vec![0u8; data_len];

    for p in 0..piece_count {
        for b in 0..blocks_per_piece {
            let offset = p * blocks_per_piece * block_size + b * block_size;
            let size = if p == piece_count - 1 && b == blocks_per_piece - 1 {
                last_block_size
            } else {
                block_size
            };
            for (i, byte) in data[offset..offset + size].iter_mut().enumerate() {
                *byte = ((b + p + i) % 255) as u8;
            }
        }
    }

    data
}

/// Patterned test data plus a descriptor generated over it.
pub fn generate_test_metadata(
    piece_count: usize,
    blocks_per_piece: usize,
    last_block_size: usize,
) -> (TorrentMetadata, Vec<u8>) {
    let data = generate_test_data(piece_count, blocks_per_piece, last_block_size);
    let piece_length = (blocks_per_piece * BLOCK_SIZE as usize) as u32;
    let metadata = TorrentMetadata::generate(
        &mut data.as_slice(),
        "http://tracker.test/announce",
        "test",
        piece_length,
    )
    .unwrap();

    (metadata, data)
}
