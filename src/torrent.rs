//! Download coordination: tracker announce, worker fan-out, and the
//! writer that lands verified pieces in the output file.
//!
//! The coordinator seeds a bounded work queue with every piece ID, spawns
//! one worker thread per peer (at most [`MAX_PEERS`]), and then acts as
//! the single writer: it drains the piece-result channel and writes each
//! verified piece at `pieceID × pieceLength`. Workers never touch the
//! file; everything flows through the two channels.
//!
//! The work queue's capacity equals the piece count, so a worker can
//! always requeue a failed piece without blocking. The piece channel
//! carries only pieces that already passed their digest check.

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::{anyhow, Result};
use crossbeam_channel::bounded;
use rand::Rng;

use crate::metadata::TorrentMetadata;
use crate::piece::Piece;
use crate::speed::SpeedEstimator;
use crate::tracker::{HttpTracker, Tracker};
use crate::worker::Worker;

/// Upper bound on concurrently connected peers.
const MAX_PEERS: usize = 50;
// Verified pieces buffered between the workers and the writer
const PIECE_CHANNEL_CAPACITY: usize = 100;
// Records averaged by the speed estimate
const SPEED_WINDOW: usize = 30;

const PEER_ID_PREFIX: &[u8; 8] = b"-UW0100-";

/// A torrent being downloaded, plus the progress state the UI polls.
pub struct Torrent {
    metadata: Arc<TorrentMetadata>,
    tracker: Box<dyn Tracker>,
    out_dir: PathBuf,
    peer_id: [u8; 20],
    downloaded: AtomicU64,
    done: AtomicBool,
    speed: SpeedEstimator,
}

impl Torrent {
    /// Parses the descriptor at `torrent_path`; the download will land in
    /// `out_dir` under the descriptor's (sanitized) name.
    pub fn new(torrent_path: &Path, out_dir: &Path) -> Result<Torrent> {
        let metadata = TorrentMetadata::from_file(torrent_path)?;
        let tracker = Box::new(HttpTracker::new(metadata.announce.clone()));

        Ok(Torrent {
            metadata: Arc::new(metadata),
            tracker,
            out_dir: out_dir.to_path_buf(),
            peer_id: generate_peer_id(),
            downloaded: AtomicU64::new(0),
            done: AtomicBool::new(false),
            speed: SpeedEstimator::new(SPEED_WINDOW),
        })
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Total size of the file in bytes.
    pub fn length(&self) -> u64 {
        self.metadata.length
    }

    /// Bytes written to disk so far.
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    pub fn is_done(&self) -> bool {
        self.done.load(Ordering::Relaxed)
    }

    /// Current download speed estimate in bytes per second.
    pub fn speed(&self) -> u64 {
        self.speed.speed()
    }

    /// Where the downloaded file is (or will be) written.
    pub fn output_path(&self) -> PathBuf {
        self.out_dir.join(sanitize_filename(&self.metadata.name))
    }

    /// Starts the download on a background thread.
    pub fn start(self: Arc<Self>) -> thread::JoinHandle<Result<()>> {
        thread::spawn(move || self.download())
    }

    /// Runs the download to completion on the calling thread.
    ///
    /// Only start-up failures (tracker, output file) and writer I/O errors
    /// surface here; per-peer failures are absorbed by the workers, which
    /// requeue the affected piece.
    pub fn download(&self) -> Result<()> {
        let peers = self.tracker.request_peers(&self.metadata, &self.peer_id)?;
        let piece_count = self.metadata.piece_count();

        let out_path = self.output_path();
        let mut output = OutputFile::create(&out_path, Arc::clone(&self.metadata))?;

        if piece_count == 0 {
            self.done.store(true, Ordering::Relaxed);
            return Ok(());
        }

        let (work_tx, work_rx) = bounded::<u32>(piece_count as usize);
        let (piece_tx, piece_rx) = bounded::<Piece>(PIECE_CHANNEL_CAPACITY);

        for piece_id in 0..piece_count {
            if work_tx.send(piece_id).is_err() {
                return Err(anyhow!("could not seed the work queue"));
            }
        }

        let worker_count = peers.len().min(MAX_PEERS);
        info!(
            "downloading {:?} ({} pieces) from {} peers",
            self.metadata.name, piece_count, worker_count
        );

        for peer in peers.into_iter().take(MAX_PEERS) {
            let worker = Worker::new(
                peer,
                self.peer_id,
                Arc::clone(&self.metadata),
                (work_tx.clone(), work_rx.clone()),
                piece_tx.clone(),
            );
            thread::spawn(move || worker.run());
        }

        // only the workers hold channel ends now; if they all die, the
        // piece channel disconnects and the writer loop below ends
        drop(work_tx);
        drop(work_rx);
        drop(piece_tx);

        while let Ok(piece) = piece_rx.recv() {
            if output.write_piece(piece.id, &piece.data).is_err() {
                return Err(anyhow!(
                    "could not write piece {} to {:?}",
                    piece.id,
                    out_path
                ));
            }

            let bytes = piece.data.len() as u64;
            let total = self.downloaded.fetch_add(bytes, Ordering::Relaxed) + bytes;
            self.speed.update(bytes);

            if total >= self.metadata.length {
                self.done.store(true, Ordering::Relaxed);
                break;
            }
        }

        if !self.is_done() {
            return Err(anyhow!("every peer gave up before the download completed"));
        }

        info!("download of {:?} completed", self.metadata.name);

        Ok(())
    }
}

/// The single output file, written piece by piece at fixed offsets.
pub struct OutputFile {
    file: std::fs::File,
    metadata: Arc<TorrentMetadata>,
}

impl OutputFile {
    /// Creates (or truncates) the file at `path`.
    pub fn create(path: &Path, metadata: Arc<TorrentMetadata>) -> Result<OutputFile> {
        let file = match OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
        {
            Ok(file) => file,
            Err(e) => return Err(anyhow!("could not create output file {:?}: {}", path, e)),
        };

        Ok(OutputFile { file, metadata })
    }

    /// Writes a piece at `id × pieceLength`. The final piece is shorter,
    /// which is fine: its offset is still a whole multiple of the piece
    /// length and `data` holds exactly the verified bytes.
    pub fn write_piece(&mut self, id: u32, data: &[u8]) -> std::io::Result<()> {
        let offset = id as u64 * self.metadata.piece_length as u64;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)
    }

    /// Reads piece `id` back from disk.
    #[allow(dead_code)]
    pub fn read_piece(&mut self, id: u32) -> std::io::Result<Vec<u8>> {
        let offset = id as u64 * self.metadata.piece_length as u64;
        let mut piece = vec![0u8; self.metadata.piece_length_at(id) as usize];

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut piece)?;

        Ok(piece)
    }
}

/// Random azureus-style peer ID: a fixed client prefix and a random tail.
pub fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
    rand::thread_rng().fill(&mut peer_id[8..]);

    peer_id
}

/// Keeps descriptor-supplied names from escaping the output directory.
fn sanitize_filename(filename: &str) -> String {
    let safe_name = filename.replace(['/', '\\'], "_");

    if safe_name.trim().is_empty() {
        "download".to_string()
    } else {
        safe_name
    }
}
