//! Torrent descriptor parsing and production.
//!
//! A descriptor is a bencoded dictionary with an `announce` URL and an
//! `info` dictionary (`length`, `name`, `piece length`, `pieces`). The
//! `pieces` value concatenates one 20-byte SHA-1 digest per piece, and the
//! SHA-1 of the bencoded `info` dictionary is the torrent's identity on
//! both the tracker and the peer wire.
//!
//! The bencode structs below declare their fields in bencode key order, so
//! encoding is byte-stable and the info digest survives a parse/produce
//! round trip.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{anyhow, Result};
use boring::sha::Sha1;
use serde::{Deserialize, Serialize};
use serde_bencode::{de, ser};
use serde_bytes::ByteBuf;

// Size of a SHA-1 digest in bytes
const SHA1_HASH_SIZE: usize = 20;

/// Everything the downloader needs to know about a torrent. Immutable
/// after parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentMetadata {
    /// Tracker URL for peer discovery
    pub announce: String,
    /// SHA-1 of the bencoded info dictionary
    pub info_hash: [u8; 20],
    /// One 20-byte SHA-1 digest per piece, in piece order
    pub piece_hashes: Vec<[u8; 20]>,
    /// Nominal size of each piece; only the last piece may be shorter
    pub piece_length: u32,
    /// Total size of the file in bytes
    pub length: u64,
    /// Suggested filename from the descriptor
    pub name: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct BencodeInfo {
    #[serde(rename = "length")]
    length: u64,
    #[serde(rename = "name")]
    name: String,
    #[serde(rename = "piece length")]
    piece_length: u32,
    #[serde(rename = "pieces")]
    pieces: ByteBuf,
}

#[derive(Debug, Deserialize, Serialize)]
struct BencodeTorrent {
    #[serde(default)]
    announce: String,
    info: BencodeInfo,
}

impl BencodeInfo {
    /// Hashes the bencoded info dictionary, yielding the torrent identity.
    fn hash(&self) -> Result<[u8; 20]> {
        let buf = ser::to_bytes(self)?;

        let mut hasher = Sha1::new();
        hasher.update(&buf);

        Ok(hasher.finish())
    }

    /// Splits the concatenated `pieces` string into per-piece digests.
    fn split_piece_hashes(&self) -> Result<Vec<[u8; 20]>> {
        if self.pieces.len() % SHA1_HASH_SIZE != 0 {
            return Err(anyhow!("torrent piece hashes are malformed"));
        }

        let mut hashes = Vec::with_capacity(self.pieces.len() / SHA1_HASH_SIZE);
        for chunk in self.pieces.chunks_exact(SHA1_HASH_SIZE) {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hashes.push(hash);
        }

        Ok(hashes)
    }
}

impl TorrentMetadata {
    /// Parses a torrent descriptor from a file on disk.
    pub fn from_file(path: &Path) -> Result<TorrentMetadata> {
        let mut file = match File::open(path) {
            Ok(file) => file,
            Err(_) => return Err(anyhow!("could not open torrent file {:?}", path)),
        };

        let mut buf = vec![];
        if file.read_to_end(&mut buf).is_err() {
            return Err(anyhow!("could not read torrent file {:?}", path));
        }

        TorrentMetadata::from_bytes(&buf)
    }

    /// Parses a torrent descriptor from its bencoded bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<TorrentMetadata> {
        let bencode = match de::from_bytes::<BencodeTorrent>(buf) {
            Ok(bencode) => bencode,
            Err(_) => return Err(anyhow!("could not decode torrent file")),
        };

        TorrentMetadata::from_bencode(bencode)
    }

    fn from_bencode(bencode: BencodeTorrent) -> Result<TorrentMetadata> {
        if bencode.announce.is_empty() {
            return Err(anyhow!("torrent has no announce url"));
        }
        if bencode.info.piece_length == 0 {
            return Err(anyhow!("torrent has an invalid piece length"));
        }

        let piece_hashes = bencode.info.split_piece_hashes()?;
        let expected_pieces = bencode.info.length.div_ceil(bencode.info.piece_length as u64);
        if expected_pieces != piece_hashes.len() as u64 {
            return Err(anyhow!(
                "torrent length implies {} pieces but {} hashes are present",
                expected_pieces,
                piece_hashes.len()
            ));
        }

        Ok(TorrentMetadata {
            announce: bencode.announce,
            info_hash: bencode.info.hash()?,
            piece_hashes,
            piece_length: bencode.info.piece_length,
            length: bencode.info.length,
            name: bencode.info.name,
        })
    }

    /// Encodes the metadata back into descriptor bytes.
    #[allow(dead_code)]
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let bencode = BencodeTorrent {
            announce: self.announce.clone(),
            info: BencodeInfo {
                length: self.length,
                name: self.name.clone(),
                piece_length: self.piece_length,
                pieces: ByteBuf::from(self.piece_hashes.concat()),
            },
        };

        Ok(ser::to_bytes(&bencode)?)
    }

    /// Builds a descriptor for the bytes read from `source`, hashing one
    /// piece at a time.
    #[allow(dead_code)]
    pub fn generate<R: Read>(
        source: &mut R,
        announce: &str,
        name: &str,
        piece_length: u32,
    ) -> Result<TorrentMetadata> {
        if piece_length == 0 {
            return Err(anyhow!("piece length must be positive"));
        }

        let mut piece_hashes = Vec::new();
        let mut length: u64 = 0;
        let mut buf = vec![0u8; piece_length as usize];

        loop {
            let n = read_chunk(source, &mut buf)?;
            if n == 0 {
                break;
            }

            let mut hasher = Sha1::new();
            hasher.update(&buf[..n]);
            piece_hashes.push(hasher.finish());

            length += n as u64;
            if n < buf.len() {
                break;
            }
        }

        let info = BencodeInfo {
            length,
            name: name.to_string(),
            piece_length,
            pieces: ByteBuf::from(piece_hashes.concat()),
        };

        Ok(TorrentMetadata {
            announce: announce.to_string(),
            info_hash: info.hash()?,
            piece_hashes,
            piece_length,
            length,
            name: name.to_string(),
        })
    }

    pub fn piece_count(&self) -> u32 {
        self.piece_hashes.len() as u32
    }

    /// Actual length of piece `id`; the final piece may be shorter than
    /// the nominal piece length.
    pub fn piece_length_at(&self, id: u32) -> u32 {
        let begin = id as u64 * self.piece_length as u64;
        let end = (begin + self.piece_length as u64).min(self.length);

        (end - begin) as u32
    }
}

/// Reads from `reader` until `buf` is full or the stream ends, returning
/// how many bytes landed.
fn read_chunk<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;

    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }

    Ok(filled)
}
