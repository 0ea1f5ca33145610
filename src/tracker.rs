//! HTTP tracker announce and compact peer-list decoding.
//!
//! The announce is a plain GET whose query carries the raw 20-byte info
//! hash and peer ID. Those values are binary, so the query string is
//! assembled by hand with every byte percent-encoded; generic URL encoders
//! would mangle them. The tracker answers with a bencoded dictionary whose
//! `peers` value packs one peer per 6 bytes: an IPv4 address followed by a
//! big-endian port.

use std::io::Cursor;
use std::net::Ipv4Addr;
use std::time::Duration;

use anyhow::{anyhow, Result};
use byteorder::{BigEndian, ReadBytesExt};
use serde::Deserialize;
use serde_bytes::ByteBuf;
use url::Url;

use crate::metadata::TorrentMetadata;
use crate::peer::PeerAddr;

// Port reported to the tracker; nothing listens on it, this client only
// downloads.
const PORT: u16 = 6881;
const TRACKER_TIMEOUT: Duration = Duration::from_secs(15);
const COMPACT_PEER_SIZE: usize = 6;

/// Source of peers for a torrent.
pub trait Tracker: Send + Sync {
    fn request_peers(
        &self,
        metadata: &TorrentMetadata,
        peer_id: &[u8; 20],
    ) -> Result<Vec<PeerAddr>>;
}

/// Tracker speaking the original HTTP announce protocol.
pub struct HttpTracker {
    announce: String,
}

#[derive(Debug, Deserialize)]
struct TrackerResponse {
    // Seconds the tracker wants us to wait before re-announcing
    interval: u32,
    // Compact peer list
    peers: ByteBuf,
}

impl HttpTracker {
    pub fn new(announce: String) -> HttpTracker {
        HttpTracker { announce }
    }

    fn build_url(&self, metadata: &TorrentMetadata, peer_id: &[u8; 20]) -> Result<String> {
        let base_url = match Url::parse(&self.announce) {
            Ok(url) => url,
            Err(_) => return Err(anyhow!("could not parse tracker url {:?}", self.announce)),
        };

        let query = format!(
            "info_hash={}&peer_id={}&port={}&uploaded=0&downloaded=0&compact=1&left={}",
            percent_encode_binary(&metadata.info_hash),
            percent_encode_binary(peer_id),
            PORT,
            metadata.length
        );

        let mut url = base_url.to_string();
        if url.contains('?') {
            url.push('&');
        } else {
            url.push('?');
        }
        url.push_str(&query);

        Ok(url)
    }
}

impl Tracker for HttpTracker {
    fn request_peers(
        &self,
        metadata: &TorrentMetadata,
        peer_id: &[u8; 20],
    ) -> Result<Vec<PeerAddr>> {
        let url = self.build_url(metadata, peer_id)?;

        let client = match reqwest::blocking::Client::builder()
            .timeout(TRACKER_TIMEOUT)
            .build()
        {
            Ok(client) => client,
            Err(_) => return Err(anyhow!("could not build http client")),
        };

        let response = match client.get(&url).send() {
            Ok(response) => match response.bytes() {
                Ok(bytes) => bytes,
                Err(_) => return Err(anyhow!("could not read tracker response")),
            },
            Err(_) => return Err(anyhow!("could not reach tracker {:?}", self.announce)),
        };

        let response = match serde_bencode::de::from_bytes::<TrackerResponse>(&response) {
            Ok(response) => response,
            Err(_) => return Err(anyhow!("could not decode tracker response")),
        };

        debug!("tracker announced an interval of {}s", response.interval);

        parse_compact_peers(&response.peers)
    }
}

/// Each byte becomes %XX with upper-case hex digits.
fn percent_encode_binary(data: &[u8]) -> String {
    const HEX_DIGITS: &[u8] = b"0123456789ABCDEF";
    let mut encoded = String::with_capacity(data.len() * 3);

    for &byte in data {
        encoded.push('%');
        encoded.push(HEX_DIGITS[(byte >> 4) as usize] as char);
        encoded.push(HEX_DIGITS[(byte & 0x0f) as usize] as char);
    }

    encoded
}

/// Decodes a compact peer list: 4 IPv4 octets and a big-endian port per
/// peer. Any other layout is a failure.
fn parse_compact_peers(raw: &[u8]) -> Result<Vec<PeerAddr>> {
    if raw.len() % COMPACT_PEER_SIZE != 0 {
        return Err(anyhow!("received a malformed peer list from tracker"));
    }

    let mut peers = Vec::with_capacity(raw.len() / COMPACT_PEER_SIZE);
    for group in raw.chunks_exact(COMPACT_PEER_SIZE) {
        let ip = Ipv4Addr::new(group[0], group[1], group[2], group[3]);
        let port = Cursor::new(&group[4..6]).read_u16::<BigEndian>()?;
        peers.push(PeerAddr { ip, port });
    }

    Ok(peers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    fn test_metadata() -> TorrentMetadata {
        let mut source = "1111222233334".as_bytes();
        TorrentMetadata::generate(&mut source, "http://tracker.test/announce", "test", 4).unwrap()
    }

    /// One-shot HTTP server answering any request with `body`.
    fn spawn_tracker_stub(body: Vec<u8>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();

        thread::spawn(move || {
            let Ok((mut conn, _)) = listener.accept() else {
                return;
            };

            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            loop {
                match conn.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => {
                        request.extend_from_slice(&buf[..n]);
                        if request.windows(4).any(|w| w == b"\r\n\r\n") {
                            break;
                        }
                    }
                    Err(_) => return,
                }
            }

            let header = format!(
                "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                body.len()
            );
            let _ = conn.write_all(header.as_bytes());
            let _ = conn.write_all(&body);
        });

        format!("http://{}/announce", addr)
    }

    #[test]
    fn decodes_the_compact_peer_list() {
        let mut body = Vec::new();
        body.extend_from_slice(b"d8:intervali900e5:peers12:");
        body.extend_from_slice(&[0, 0, 0, 0, 0, 1]);
        body.extend_from_slice(&[0, 0, 0, 1, 0, 2]);
        body.extend_from_slice(b"e");

        let announce = spawn_tracker_stub(body);
        let tracker = HttpTracker::new(announce);

        let peers = tracker.request_peers(&test_metadata(), &[0u8; 20]).unwrap();

        assert_eq!(
            peers,
            vec![
                PeerAddr {
                    ip: Ipv4Addr::new(0, 0, 0, 0),
                    port: 1
                },
                PeerAddr {
                    ip: Ipv4Addr::new(0, 0, 0, 1),
                    port: 2
                },
            ]
        );
    }

    #[test]
    fn a_ragged_peer_list_is_an_error() {
        assert!(parse_compact_peers(&[0u8; 13]).is_err());
        assert!(parse_compact_peers(&[0u8; 12]).is_ok());
        assert!(parse_compact_peers(&[]).unwrap().is_empty());
    }

    #[test]
    fn ports_decode_big_endian() {
        let peers = parse_compact_peers(&[192, 168, 1, 7, 0x1a, 0xe1]).unwrap();

        assert_eq!(peers[0].ip, Ipv4Addr::new(192, 168, 1, 7));
        assert_eq!(peers[0].port, 6881);
    }

    #[test]
    fn the_announce_url_carries_the_raw_digests() {
        let mut metadata = test_metadata();
        metadata.info_hash = [0x12; 20];
        let tracker = HttpTracker::new("http://tracker.test/announce".to_string());

        let url = tracker.build_url(&metadata, &[0xab; 20]).unwrap();

        assert!(url.starts_with("http://tracker.test/announce?"));
        assert!(url.contains(&format!("info_hash={}", "%12".repeat(20))));
        assert!(url.contains(&format!("peer_id={}", "%AB".repeat(20))));
        assert!(url.contains("port=6881"));
        assert!(url.contains("uploaded=0"));
        assert!(url.contains("downloaded=0"));
        assert!(url.contains("compact=1"));
        assert!(url.contains("left=13"));
    }

    #[test]
    fn an_unparsable_announce_is_rejected() {
        let tracker = HttpTracker::new("not a url".to_string());

        assert!(tracker.build_url(&test_metadata(), &[0u8; 20]).is_err());
    }
}
