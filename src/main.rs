//! # Undertow
//!
//! A command-line BitTorrent download client.
//!
//! Undertow parses a torrent descriptor, asks the HTTP tracker for peers,
//! and downloads the file from up to 50 peers at once. Each peer gets its
//! own worker thread pulling piece IDs from a shared queue; pieces are
//! SHA-1-verified before a single writer lands them in the output file at
//! their fixed offsets, so the file is byte-complete the moment the
//! progress bar fills.

#[macro_use]
extern crate log;

mod bitfield;
mod client;
mod handshake;
mod message;
mod metadata;
mod peer;
mod piece;
mod speed;
#[cfg(test)]
mod testutil;
mod torrent;
mod tracker;
mod worker;

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};

use torrent::Torrent;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "A command-line BitTorrent download client, written in Rust."
)]
struct Args {
    /// Path to the .torrent file
    torrent: PathBuf,

    /// Directory where the downloaded file is written
    out_dir: PathBuf,
}

/// Renders a byte rate in whole units.
fn format_speed(bytes_per_second: u64) -> String {
    match bytes_per_second {
        s if s > 999_999 => format!("{} MB/s", s / 1_000_000),
        s if s > 999 => format!("{} KB/s", s / 1_000),
        s => format!("{} B/s", s),
    }
}

fn run(args: Args) -> Result<()> {
    if !args.torrent.exists() {
        return Err(anyhow!("could not find torrent file {:?}", args.torrent));
    }

    let torrent = Arc::new(Torrent::new(&args.torrent, &args.out_dir)?);

    println!("Downloading {:?}", torrent.name());
    let handle = Arc::clone(&torrent).start();

    let pb = ProgressBar::new(torrent.length());
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {bytes}/{total_bytes} [{bar:40.cyan/blue}] {percent}% {msg}")
            .unwrap()
            .progress_chars("#>-"),
    );

    while !torrent.is_done() && !handle.is_finished() {
        pb.set_position(torrent.downloaded());
        pb.set_message(format!("[{}]", format_speed(torrent.speed())));
        thread::sleep(Duration::from_millis(500));
    }

    handle
        .join()
        .map_err(|_| anyhow!("the download thread panicked"))??;

    pb.set_position(torrent.downloaded());
    pb.finish_and_clear();

    println!("Saved in {:?}.", torrent.output_path());

    Ok(())
}

fn main() {
    // Initialize logger
    pretty_env_logger::init_timed();

    // Parse arguments
    let args = Args::parse();

    // Run program, eventually exit failure
    if let Err(error) = run(args) {
        eprintln!("Error: {}", error);
        std::process::exit(1);
    }

    std::process::exit(0);
}
