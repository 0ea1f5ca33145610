//! Connection to a single remote peer.
//!
//! A session starts with a TCP dial, exchanges handshakes, and then
//! expects the peer's bitfield as the very first message; anything else at
//! that point ends the session. After the exchange the connection carries
//! the framed messages of the peer wire protocol.
//!
//! The dial and the handshake + bitfield phase run under one timeout, a
//! per-operation approximation of an absolute deadline, which is cleared
//! once the bitfield has been stored. During a download the worker re-arms
//! the timeout before every read or write, so a stalled peer surfaces as
//! an I/O error rather than a hang.
//!
//! Frames longer than [`MAX_MESSAGE_LEN`] fail the connection before any
//! payload is read; a peer claiming a gigabyte-sized message gets no
//! buffer for it.

use std::io::{self, Cursor, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

use byteorder::{BigEndian, ReadBytesExt};
use thiserror::Error;

use crate::bitfield::Bitfield;
use crate::handshake::{Handshake, HandshakeError};
use crate::message::{Message, MessageError, MSG_BITFIELD};
use crate::peer::PeerAddr;

/// Upper bound on the length prefix of an accepted frame.
pub const MAX_MESSAGE_LEN: u32 = 20_000;

// Covers the dial and the handshake + bitfield phase
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum PeerError {
    #[error("peer i/o failure: {0}")]
    Io(#[from] io::Error),
    #[error("frame of {0} bytes exceeds the message size limit")]
    FrameTooLong(u32),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error("peer answered with a different info hash")]
    InfoHashMismatch,
    #[error("expected a bitfield message after the handshake")]
    ExpectedBitfield,
    #[error(transparent)]
    Message(#[from] MessageError),
}

/// An established session with a remote peer.
///
/// Owned exclusively by one worker; the remote bitfield is fixed after the
/// initial exchange and the choking flag tracks incoming Choke/Unchoke.
#[derive(Debug)]
pub struct Client {
    conn: TcpStream,
    peer: PeerAddr,
    bitfield: Bitfield,
    choked: bool,
}

impl Client {
    /// Dials `peer` and runs the session preamble: handshake exchange,
    /// info-hash validation, and the initial bitfield.
    pub fn connect(
        peer: PeerAddr,
        info_hash: &[u8; 20],
        peer_id: &[u8; 20],
    ) -> Result<Client, PeerError> {
        let conn = TcpStream::connect_timeout(&SocketAddr::from(peer), CONNECT_TIMEOUT)?;

        let mut client = Client {
            conn,
            peer,
            bitfield: Bitfield::default(),
            choked: true,
        };

        client.set_timeouts(Some(CONNECT_TIMEOUT))?;
        client.handshake(info_hash, peer_id)?;
        client.receive_bitfield()?;
        client.set_timeouts(None)?;

        debug!("connected to peer {}", client.peer);

        Ok(client)
    }

    fn handshake(&mut self, info_hash: &[u8; 20], peer_id: &[u8; 20]) -> Result<(), PeerError> {
        let handshake = Handshake::new(*info_hash, *peer_id);
        self.conn.write_all(&handshake.serialize())?;

        let reply = Handshake::read(&mut self.conn)?;
        if reply.info_hash != *info_hash {
            return Err(PeerError::InfoHashMismatch);
        }

        Ok(())
    }

    fn receive_bitfield(&mut self) -> Result<(), PeerError> {
        match self.read_message()? {
            Some(message) if message.id == MSG_BITFIELD => {
                self.bitfield = Bitfield::new(message.payload);
                debug!(
                    "peer {} announced {} piece slots",
                    self.peer,
                    self.bitfield.len()
                );
                Ok(())
            }
            _ => Err(PeerError::ExpectedBitfield),
        }
    }

    /// Arms or clears the read and write timeouts on the connection.
    pub fn set_timeouts(&self, timeout: Option<Duration>) -> Result<(), PeerError> {
        self.conn.set_read_timeout(timeout)?;
        self.conn.set_write_timeout(timeout)?;

        Ok(())
    }

    /// Reads one framed message; `None` is a keep-alive.
    pub fn read_message(&mut self) -> Result<Option<Message>, PeerError> {
        let mut len_buf = [0u8; 4];
        self.conn.read_exact(&mut len_buf)?;
        let message_len = Cursor::new(len_buf).read_u32::<BigEndian>()?;

        if message_len == 0 {
            debug!("received keep-alive from peer {}", self.peer);
            return Ok(None);
        }
        if message_len > MAX_MESSAGE_LEN {
            return Err(PeerError::FrameTooLong(message_len));
        }

        let mut buf = vec![0u8; message_len as usize];
        self.conn.read_exact(&mut buf)?;

        Ok(Message::parse(&buf)?)
    }

    pub fn send_message(&mut self, message: &Message) -> Result<(), PeerError> {
        self.conn.write_all(&message.serialize())?;

        Ok(())
    }

    /// Sends a zero-length frame.
    pub fn send_keep_alive(&mut self) -> Result<(), PeerError> {
        self.conn.write_all(&[0u8; 4])?;

        Ok(())
    }

    pub fn has_piece(&self, index: u32) -> bool {
        self.bitfield.has_piece(index)
    }

    pub fn is_choked(&self) -> bool {
        self.choked
    }

    pub fn set_choked(&mut self, choked: bool) {
        self.choked = choked;
    }

    pub fn peer(&self) -> PeerAddr {
        self.peer
    }
}
