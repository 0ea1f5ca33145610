//! Moving-window estimate of the download throughput.

use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug, Clone, Copy)]
struct SpeedRecord {
    bytes: u64,
    elapsed: f64,
}

#[derive(Debug, Default)]
struct SpeedInner {
    history: Vec<SpeedRecord>,
    last_update: Option<Instant>,
    count: usize,
}

/// Thread-safe throughput estimator averaging over the last `window`
/// recorded intervals.
///
/// The first update only stamps the clock; every later update records how
/// many bytes arrived since the previous one. Old records are overwritten
/// in ring-buffer fashion once the window is full.
#[derive(Debug)]
pub struct SpeedEstimator {
    window: usize,
    inner: Mutex<SpeedInner>,
}

impl SpeedEstimator {
    pub fn new(window: usize) -> SpeedEstimator {
        SpeedEstimator {
            window,
            inner: Mutex::new(SpeedInner::default()),
        }
    }

    /// Records `bytes` arriving now.
    pub fn update(&self, bytes: u64) {
        self.update_at(bytes, Instant::now());
    }

    fn update_at(&self, bytes: u64, now: Instant) {
        let mut inner = self.inner.lock().unwrap();

        let Some(last) = inner.last_update else {
            inner.last_update = Some(now);
            return;
        };

        let elapsed = now.duration_since(last).as_secs_f64();
        if elapsed > 0.0 {
            let record = SpeedRecord { bytes, elapsed };
            let slot = inner.count % self.window;
            if inner.history.len() < self.window {
                inner.history.push(record);
            } else {
                inner.history[slot] = record;
            }
        }

        inner.last_update = Some(now);
        inner.count += 1;
    }

    /// Current estimate in bytes per second; 0 until two updates have
    /// been seen.
    pub fn speed(&self) -> u64 {
        let inner = self.inner.lock().unwrap();

        if inner.history.is_empty() {
            return 0;
        }

        let total_bytes: u64 = inner.history.iter().map(|r| r.bytes).sum();
        let total_elapsed: f64 = inner.history.iter().map(|r| r.elapsed).sum();

        (total_bytes as f64 / total_elapsed) as u64
    }
}
