//! Peer wire message codec.
//!
//! Every message on the wire is a 4-byte big-endian length prefix followed
//! by `length` payload bytes. A length of zero is a keep-alive and carries
//! neither an ID nor a payload; otherwise the first payload byte is the
//! message ID and the rest is ID-specific.
//!
//! | ID | Name           | Payload |
//! |----|----------------|---------|
//! | 0  | CHOKE          | none |
//! | 1  | UNCHOKE        | none |
//! | 2  | INTERESTED     | none |
//! | 3  | NOT INTERESTED | none |
//! | 4  | HAVE           | piece index (u32) |
//! | 5  | BITFIELD       | raw bitfield bytes |
//! | 6  | REQUEST        | index, begin, length (u32 each) |
//! | 7  | PIECE          | index, begin, block bytes |
//! | 8  | CANCEL         | index, begin, length (u32 each) |

use thiserror::Error;

pub type MessageId = u8;

pub const MSG_CHOKE: MessageId = 0;
pub const MSG_UNCHOKE: MessageId = 1;
pub const MSG_INTERESTED: MessageId = 2;
#[allow(dead_code)]
pub const MSG_NOT_INTERESTED: MessageId = 3;
pub const MSG_HAVE: MessageId = 4;
pub const MSG_BITFIELD: MessageId = 5;
pub const MSG_REQUEST: MessageId = 6;
pub const MSG_PIECE: MessageId = 7;
pub const MSG_CANCEL: MessageId = 8;

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("unknown message id {0}")]
    UnknownId(u8),
    #[error("request payload must be 12 bytes, got {0}")]
    InvalidRequest(usize),
    #[error("piece payload of {0} bytes is too short")]
    InvalidPiece(usize),
}

/// A framed peer wire message. Keep-alives are not represented here; the
/// transport reports them as `None`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub payload: Vec<u8>,
}

impl Message {
    pub fn new(id: MessageId) -> Message {
        Message {
            id,
            payload: vec![],
        }
    }

    pub fn new_with_payload(id: MessageId, payload: Vec<u8>) -> Message {
        Message { id, payload }
    }

    /// Serializes the message with its length prefix.
    pub fn serialize(&self) -> Vec<u8> {
        let length = 1 + self.payload.len();
        let mut buf = Vec::with_capacity(4 + length);

        buf.extend_from_slice(&(length as u32).to_be_bytes());
        buf.push(self.id);
        buf.extend_from_slice(&self.payload);

        buf
    }

    /// Parses the body of a frame (everything after the length prefix).
    ///
    /// An empty body is a keep-alive and yields `None`. An ID byte above 8
    /// is not part of the core protocol and fails the parse.
    pub fn parse(buf: &[u8]) -> Result<Option<Message>, MessageError> {
        let Some((&id, payload)) = buf.split_first() else {
            return Ok(None);
        };

        if id > MSG_CANCEL {
            return Err(MessageError::UnknownId(id));
        }

        Ok(Some(Message {
            id,
            payload: payload.to_vec(),
        }))
    }
}

/// Typed view of a REQUEST message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestMessage {
    pub piece_id: u32,
    pub block_offset: u32,
    pub block_length: u32,
}

impl RequestMessage {
    pub fn new(piece_id: u32, block_offset: u32, block_length: u32) -> RequestMessage {
        RequestMessage {
            piece_id,
            block_offset,
            block_length,
        }
    }

    pub fn to_message(self) -> Message {
        let mut payload = Vec::with_capacity(12);
        payload.extend_from_slice(&self.piece_id.to_be_bytes());
        payload.extend_from_slice(&self.block_offset.to_be_bytes());
        payload.extend_from_slice(&self.block_length.to_be_bytes());

        Message::new_with_payload(MSG_REQUEST, payload)
    }
}

impl TryFrom<&Message> for RequestMessage {
    type Error = MessageError;

    fn try_from(message: &Message) -> Result<RequestMessage, MessageError> {
        if message.id != MSG_REQUEST || message.payload.len() != 12 {
            return Err(MessageError::InvalidRequest(message.payload.len()));
        }

        let p = &message.payload;

        Ok(RequestMessage {
            piece_id: u32::from_be_bytes([p[0], p[1], p[2], p[3]]),
            block_offset: u32::from_be_bytes([p[4], p[5], p[6], p[7]]),
            block_length: u32::from_be_bytes([p[8], p[9], p[10], p[11]]),
        })
    }
}

/// Typed view of a PIECE message carrying one block of data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PieceMessage {
    pub piece_id: u32,
    pub block_offset: u32,
    pub data: Vec<u8>,
}

impl PieceMessage {
    #[allow(dead_code)]
    pub fn new(piece_id: u32, block_offset: u32, data: Vec<u8>) -> PieceMessage {
        PieceMessage {
            piece_id,
            block_offset,
            data,
        }
    }

    #[allow(dead_code)]
    pub fn to_message(&self) -> Message {
        let mut payload = Vec::with_capacity(8 + self.data.len());
        payload.extend_from_slice(&self.piece_id.to_be_bytes());
        payload.extend_from_slice(&self.block_offset.to_be_bytes());
        payload.extend_from_slice(&self.data);

        Message::new_with_payload(MSG_PIECE, payload)
    }
}

impl TryFrom<&Message> for PieceMessage {
    type Error = MessageError;

    fn try_from(message: &Message) -> Result<PieceMessage, MessageError> {
        // 8 header bytes plus at least one byte of block data
        if message.id != MSG_PIECE || message.payload.len() < 9 {
            return Err(MessageError::InvalidPiece(message.payload.len()));
        }

        let p = &message.payload;

        Ok(PieceMessage {
            piece_id: u32::from_be_bytes([p[0], p[1], p[2], p[3]]),
            block_offset: u32::from_be_bytes([p[4], p[5], p[6], p[7]]),
            data: p[8..].to_vec(),
        })
    }
}
