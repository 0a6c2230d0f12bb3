//! Progress reduction and human-readable rate reporting.
//!
//! Every worker owns a per-rank `(bytes, items)` accumulator pair; rank 0
//! periodically sums them and prints one line with transferred volume,
//! percent of the planned total, rate, and estimated time remaining.  A
//! `progress_interval` of `None` disables the periodic lines; the final
//! "done" line is always printed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crossbeam::utils::CachePadded;

// ── Unit formatting ──────────────────────────────────────────────────────────

const BYTE_UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
const RATE_UNITS: [&str; 6] = ["B/s", "KiB/s", "MiB/s", "GiB/s", "TiB/s", "PiB/s"];

fn scale(value: f64, units: &[&'static str; 6]) -> (f64, &'static str) {
    let mut v = value;
    let mut unit = 0;
    while v >= 1024.0 && unit + 1 < units.len() {
        v /= 1024.0;
        unit += 1;
    }
    (v, units[unit])
}

/// Scale a byte count into the largest binary unit below 1024.
pub fn format_bytes(bytes: u64) -> (f64, &'static str) {
    scale(bytes as f64, &BYTE_UNITS)
}

/// Scale a bytes-per-second rate the same way.
pub fn format_rate(rate: f64) -> (f64, &'static str) {
    scale(rate, &RATE_UNITS)
}

// ── Progress state ───────────────────────────────────────────────────────────

/// Shared accumulator set for one transfer phase.  Constructed once via
/// `Comm::shared` so all ranks update the same instance; the counters are
/// cache-padded so workers never contend on a line.
pub struct Progress {
    bytes:       Vec<CachePadded<AtomicU64>>,
    items:       Vec<CachePadded<AtomicU64>>,
    total_bytes: u64,
    verb:        &'static str,
    interval:    Option<Duration>,
    start:       Instant,
    last_print:  Mutex<Instant>,
}

impl Progress {
    pub fn new(
        ranks:       usize,
        total_bytes: u64,
        verb:        &'static str,
        interval:    Option<Duration>,
    ) -> Self {
        let now = Instant::now();
        Progress {
            bytes:       (0..ranks).map(|_| CachePadded::new(AtomicU64::new(0))).collect(),
            items:       (0..ranks).map(|_| CachePadded::new(AtomicU64::new(0))).collect(),
            total_bytes,
            verb,
            interval,
            start:       now,
            last_print:  Mutex::new(now),
        }
    }

    /// Credit transferred bytes and completed items to `rank`.
    #[inline]
    pub fn add(&self, rank: usize, bytes: u64, items: u64) {
        if bytes > 0 {
            self.bytes[rank].fetch_add(bytes, Ordering::Relaxed);
        }
        if items > 0 {
            self.items[rank].fetch_add(items, Ordering::Relaxed);
        }
    }

    fn reduce(&self) -> (u64, u64) {
        let bytes = self.bytes.iter().map(|c| c.load(Ordering::Relaxed)).sum();
        let items = self.items.iter().map(|c| c.load(Ordering::Relaxed)).sum();
        (bytes, items)
    }

    /// Called by the printer rank from its worker loop.  Prints at most
    /// once per interval; a no-op on other ranks and when disabled.
    pub fn tick(&self, rank: usize) {
        if rank != 0 {
            return;
        }
        let Some(interval) = self.interval else { return };

        let mut last = self.last_print.lock().unwrap();
        if last.elapsed() < interval {
            return;
        }
        *last = Instant::now();
        drop(last);

        let (bytes, items) = self.reduce();
        let secs = self.start.elapsed().as_secs_f64();
        let rate = if secs > 0.0 { bytes as f64 / secs } else { 0.0 };

        let percent = if self.total_bytes > 0 {
            bytes as f64 * 100.0 / self.total_bytes as f64
        } else {
            0.0
        };
        let remaining = if rate > 0.0 {
            self.total_bytes.saturating_sub(bytes) as f64 / rate
        } else {
            0.0
        };

        let (val, val_units) = format_bytes(bytes);
        let (bw, bw_units) = format_rate(rate);
        log::info!(
            "{} {} items and {:.3} {} ({:.0}%) in {:.3} secs ({:.3} {}) {:.0} secs left ...",
            self.verb, items, val, val_units, percent, secs, bw, bw_units, remaining
        );
    }

    /// Print the closing line and return the reduced `(bytes, items)`.
    /// Only rank 0 prints; every rank gets the totals.
    pub fn finish(&self, rank: usize) -> (u64, u64) {
        let (bytes, items) = self.reduce();
        if rank == 0 && self.interval.is_some() {
            let secs = self.start.elapsed().as_secs_f64();
            let rate = if secs > 0.0 { bytes as f64 / secs } else { 0.0 };
            let (val, val_units) = format_bytes(bytes);
            let (bw, bw_units) = format_rate(rate);
            log::info!(
                "{} {} items and {:.3} {} (100%) in {:.3} secs ({:.3} {}) done",
                self.verb, items, val, val_units, secs, bw, bw_units
            );
        }
        (bytes, items)
    }

    #[inline]
    pub fn seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_scale_to_binary_units() {
        assert_eq!(format_bytes(512), (512.0, "B"));
        assert_eq!(format_bytes(2048), (2.0, "KiB"));
        assert_eq!(format_bytes(3 * 1024 * 1024), (3.0, "MiB"));
    }

    #[test]
    fn counters_reduce_across_ranks() {
        let p = Progress::new(3, 1000, "Moved", None);
        p.add(0, 100, 1);
        p.add(1, 200, 2);
        p.add(2, 300, 0);
        assert_eq!(p.finish(0), (600, 3));
    }
}
