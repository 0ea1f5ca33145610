//! The fixed-size handshake that opens every peer connection.
//!
//! A handshake is always 68 bytes:
//!
//! ```text
//! <19><"BitTorrent protocol"><8 reserved zero bytes><info hash><peer id>
//! ```
//!
//! Both sides send one immediately after the TCP connect. The info hash
//! identifies the torrent; a peer answering with a different hash is
//! serving a different swarm and must be dropped by the caller.

use std::io::{self, Read};

use thiserror::Error;

const PROTOCOL_ID: &[u8; 19] = b"BitTorrent protocol";

/// Exact size of a serialized handshake.
pub const HANDSHAKE_LEN: usize = 68;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error("remote end does not speak the BitTorrent protocol")]
    BadProtocol,
}

/// Handshake message with the two variable fields; the protocol string and
/// reserved bytes are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Handshake {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Handshake {
        Handshake { info_hash, peer_id }
    }

    /// Serializes the handshake into its 68-byte wire form.
    pub fn serialize(&self) -> [u8; HANDSHAKE_LEN] {
        let mut buf = [0u8; HANDSHAKE_LEN];

        buf[0] = PROTOCOL_ID.len() as u8;
        buf[1..20].copy_from_slice(PROTOCOL_ID);
        // bytes 20..28 stay zero (reserved)
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);

        buf
    }

    /// Reads and validates a handshake from `reader`.
    ///
    /// Rejects a length byte other than 19 and any protocol string other
    /// than `"BitTorrent protocol"`. The info hash is not checked here;
    /// only the caller knows which torrent the session belongs to.
    pub fn read<R: Read>(reader: &mut R) -> Result<Handshake, HandshakeError> {
        let mut buf = [0u8; HANDSHAKE_LEN];
        reader.read_exact(&mut buf)?;

        if buf[0] as usize != PROTOCOL_ID.len() || &buf[1..20] != PROTOCOL_ID {
            return Err(HandshakeError::BadProtocol);
        }

        let mut info_hash = [0u8; 20];
        let mut peer_id = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Handshake { info_hash, peer_id })
    }
}
