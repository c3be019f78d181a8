//! Per-session network statistics.
//!
//! Counters are atomics rather than a mutex-guarded struct: statistics
//! counters are not globally locked, so they may be read concurrently
//! with updates. Weighted running averages are stored as the
//! bit pattern of an `f64` inside an `AtomicU64`, updated with a
//! compare-exchange loop so concurrent writers never lose an update.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Exponential-weighting factor for running averages.
const ALPHA: f64 = 0.9;

/// Requests smaller than this many bytes are folded into the ping
/// estimator as well as the request-time average.
const PING_REQUEST_SIZE_THRESHOLD: u64 = 128;

macro_rules! bitflags_like {
    ($(#[$meta:meta])* $name:ident : $repr:ty { $($variant:ident = $value:expr),+ $(,)? }) => {
        $(#[$meta])*
        #[allow(non_snake_case)]
        pub mod $name {
            $(pub const $variant: $repr = $value;)+
        }
    };
}

bitflags_like! {
    /// Bitmap of which statistics fields have ever been written, consulted
    /// before reading a weighted average.
    FieldSet: u32 {
        UPLOAD_SPEED = 1 << 0,
        DOWNLOAD_SPEED = 1 << 1,
        REQUEST_SPEED = 1 << 2,
        REQUEST_TIME = 1 << 3,
        PING = 1 << 4,
    }
}

/// A running weighted average, stored as raw bits so it can live in an
/// `AtomicU64` without a mutex.
#[derive(Debug)]
struct WeightedAvg(AtomicU64);

impl WeightedAvg {
    const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    /// `new = alpha * sample + (1 - alpha) * old`, seeded with the first
    /// sample verbatim.
    fn update(&self, sample: f64, first: &AtomicBool) {
        loop {
            let old_bits = self.0.load(Ordering::Relaxed);
            let old = f64::from_bits(old_bits);
            let is_first = !first.swap(true, Ordering::AcqRel);
            let next = if is_first {
                sample
            } else {
                ALPHA * sample + (1.0 - ALPHA) * old
            };
            if self
                .0
                .compare_exchange_weak(
                    old_bits,
                    next.to_bits(),
                    Ordering::AcqRel,
                    Ordering::Relaxed,
                )
                .is_ok()
            {
                break;
            }
        }
    }
}

/// Per-connection/session network statistics.
#[derive(Debug)]
pub struct NetStatistics {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    bytes_uploaded: AtomicU64,
    bytes_downloaded: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    request_count: AtomicU64,

    max_request_time_ms: AtomicU64,
    max_ping_ms: AtomicU64,

    upload_speed_avg: WeightedAvg,
    upload_speed_seeded: AtomicBool,
    download_speed_avg: WeightedAvg,
    download_speed_seeded: AtomicBool,
    request_speed_avg: WeightedAvg,
    request_speed_seeded: AtomicBool,
    request_time_avg: WeightedAvg,
    request_time_seeded: AtomicBool,
    ping_avg: WeightedAvg,
    ping_seeded: AtomicBool,

    field_set: AtomicU32,

    reset_at: AtomicU64,

    partial_read: AtomicBool,
    partial_write: AtomicBool,
}

impl Default for NetStatistics {
    fn default() -> Self {
        Self::new()
    }
}

impl NetStatistics {
    pub fn new() -> Self {
        NetStatistics {
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_uploaded: AtomicU64::new(0),
            bytes_downloaded: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            request_count: AtomicU64::new(0),
            max_request_time_ms: AtomicU64::new(0),
            max_ping_ms: AtomicU64::new(0),
            upload_speed_avg: WeightedAvg::new(),
            upload_speed_seeded: AtomicBool::new(false),
            download_speed_avg: WeightedAvg::new(),
            download_speed_seeded: AtomicBool::new(false),
            request_speed_avg: WeightedAvg::new(),
            request_speed_seeded: AtomicBool::new(false),
            request_time_avg: WeightedAvg::new(),
            request_time_seeded: AtomicBool::new(false),
            ping_avg: WeightedAvg::new(),
            ping_seeded: AtomicBool::new(false),
            field_set: AtomicU32::new(0),
            reset_at: AtomicU64::new(now_unix()),
            partial_read: AtomicBool::new(false),
            partial_write: AtomicBool::new(false),
        }
    }

    fn mark(&self, bit: u32) {
        self.field_set.fetch_or(bit, Ordering::Relaxed);
    }

    fn has(&self, bit: u32) -> bool {
        self.field_set.load(Ordering::Relaxed) & bit != 0
    }

    /// Records `size` bytes sent on the wire.
    pub fn outgoing(&self, size: u64) {
        self.bytes_sent.fetch_add(size, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    /// Records `size` bytes received from the wire.
    pub fn incoming(&self, size: u64) {
        self.bytes_received.fetch_add(size, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a completed request/response round trip.
    ///
    /// Requests smaller than [`PING_REQUEST_SIZE_THRESHOLD`] bytes also
    /// feed the ping estimator.
    pub fn request(&self, size: u64, elapsed_ms: u64) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.max_request_time_ms
            .fetch_max(elapsed_ms, Ordering::Relaxed);

        let elapsed = elapsed_ms as f64;
        if elapsed > 0.0 {
            let per_sec = 1000.0 / elapsed;
            self.request_speed_avg
                .update(per_sec, &self.request_speed_seeded);
            self.mark(FieldSet::REQUEST_SPEED);
        }
        self.request_time_avg.update(elapsed, &self.request_time_seeded);
        self.mark(FieldSet::REQUEST_TIME);

        if size < PING_REQUEST_SIZE_THRESHOLD {
            self.ping(elapsed_ms);
        }
    }

    /// Records an upload of `size` bytes taking `elapsed_ms` milliseconds.
    pub fn upload(&self, size: u64, elapsed_ms: u64) {
        self.bytes_uploaded.fetch_add(size, Ordering::Relaxed);
        if elapsed_ms > 0 {
            let bytes_per_sec = size as f64 * 1000.0 / elapsed_ms as f64;
            self.upload_speed_avg
                .update(bytes_per_sec, &self.upload_speed_seeded);
            self.mark(FieldSet::UPLOAD_SPEED);
        }
    }

    /// Records a download of `size` bytes taking `elapsed_ms` milliseconds.
    pub fn download(&self, size: u64, elapsed_ms: u64) {
        self.bytes_downloaded.fetch_add(size, Ordering::Relaxed);
        if elapsed_ms > 0 {
            let bytes_per_sec = size as f64 * 1000.0 / elapsed_ms as f64;
            self.download_speed_avg
                .update(bytes_per_sec, &self.download_speed_seeded);
            self.mark(FieldSet::DOWNLOAD_SPEED);
        }
    }

    /// Records a round-trip ping sample.
    pub fn ping(&self, ms: u64) {
        self.max_ping_ms.fetch_max(ms, Ordering::Relaxed);
        self.ping_avg.update(ms as f64, &self.ping_seeded);
        self.mark(FieldSet::PING);
    }

    pub fn trigger_partial_read(&self) {
        self.partial_read.store(true, Ordering::Relaxed);
    }

    pub fn trigger_partial_write(&self) {
        self.partial_write.store(true, Ordering::Relaxed);
    }

    pub fn partial_read(&self) -> bool {
        self.partial_read.load(Ordering::Relaxed)
    }

    pub fn partial_write(&self) -> bool {
        self.partial_write.load(Ordering::Relaxed)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    pub fn bytes_uploaded(&self) -> u64 {
        self.bytes_uploaded.load(Ordering::Relaxed)
    }

    pub fn bytes_downloaded(&self) -> u64 {
        self.bytes_downloaded.load(Ordering::Relaxed)
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn max_request_time_ms(&self) -> u64 {
        self.max_request_time_ms.load(Ordering::Relaxed)
    }

    pub fn max_ping_ms(&self) -> u64 {
        self.max_ping_ms.load(Ordering::Relaxed)
    }

    /// Returns `Some(value)` only if this average has ever been sampled:
    /// weighted averages are only consulted when their field-set bit is
    /// true.
    pub fn upload_speed_avg(&self) -> Option<f64> {
        self.has(FieldSet::UPLOAD_SPEED).then(|| self.upload_speed_avg.get())
    }

    pub fn download_speed_avg(&self) -> Option<f64> {
        self.has(FieldSet::DOWNLOAD_SPEED)
            .then(|| self.download_speed_avg.get())
    }

    pub fn request_speed_avg(&self) -> Option<f64> {
        self.has(FieldSet::REQUEST_SPEED)
            .then(|| self.request_speed_avg.get())
    }

    pub fn request_time_avg(&self) -> Option<f64> {
        self.has(FieldSet::REQUEST_TIME)
            .then(|| self.request_time_avg.get())
    }

    pub fn ping_avg(&self) -> Option<f64> {
        self.has(FieldSet::PING).then(|| self.ping_avg.get())
    }

    /// Resets all counters, maxima and averages, clearing every field-set
    /// bit. Partial-read/write flags are cleared too: they are only
    /// monotonic *between* resets.
    pub fn reset(&self) {
        self.bytes_sent.store(0, Ordering::Relaxed);
        self.bytes_received.store(0, Ordering::Relaxed);
        self.bytes_uploaded.store(0, Ordering::Relaxed);
        self.bytes_downloaded.store(0, Ordering::Relaxed);
        self.packets_sent.store(0, Ordering::Relaxed);
        self.packets_received.store(0, Ordering::Relaxed);
        self.request_count.store(0, Ordering::Relaxed);
        self.max_request_time_ms.store(0, Ordering::Relaxed);
        self.max_ping_ms.store(0, Ordering::Relaxed);
        self.field_set.store(0, Ordering::Relaxed);
        self.upload_speed_seeded.store(false, Ordering::Relaxed);
        self.download_speed_seeded.store(false, Ordering::Relaxed);
        self.request_speed_seeded.store(false, Ordering::Relaxed);
        self.request_time_seeded.store(false, Ordering::Relaxed);
        self.ping_seeded.store(false, Ordering::Relaxed);
        self.partial_read.store(false, Ordering::Relaxed);
        self.partial_write.store(false, Ordering::Relaxed);
        self.reset_at.store(now_unix(), Ordering::Relaxed);
    }

    pub fn reset_at_unix(&self) -> u64 {
        self.reset_at.load(Ordering::Relaxed)
    }

    /// Quality score in `[1, 5]`, or `-1.0` if no sub-score has any data
    /// yet. Each of up to five sub-scores is normalised and
    /// clamped to `[0, 1]`, then averaged and scaled to `[1, 5]`. If a
    /// partial read or write has ever been triggered, the weighted
    /// denominator is inflated, which depresses the score.
    pub fn quality_score(&self) -> f64 {
        let mut sum = 0.0;
        let mut count = 0.0;

        if let Some(t) = self.request_time_avg() {
            sum += clamp01(1.0 - t / 500.0);
            count += 1.0;
        }
        if let Some(d) = self.download_speed_avg() {
            sum += clamp01(d / (10.0 * 1024.0 * 1024.0));
            count += 1.0;
        }
        if let Some(u) = self.upload_speed_avg() {
            sum += clamp01(u / (10.0 * 1024.0 * 1024.0));
            count += 1.0;
        }
        let max_t = self.max_request_time_ms() as f64;
        if let Some(avg_t) = self.request_time_avg() {
            if avg_t > 0.0 {
                sum += clamp01(1.0 - (max_t / avg_t - 1.0).max(0.0));
                count += 1.0;
            }
        }
        if let Some(p) = self.ping_avg() {
            sum += clamp01(1.0 - p / 200.0);
            count += 1.0;
        }

        if count == 0.0 {
            return -1.0;
        }

        // A partial read/write inflates the denominator, depressing the
        // final average without excluding any sub-score outright.
        let penalty = match (self.partial_read(), self.partial_write()) {
            (false, false) => 0.0,
            (true, true) => 1.0,
            _ => 0.5,
        };

        let quality = sum / (count + penalty);
        1.0 + quality * 4.0
    }
}

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_field_set_bits() {
        let stats = NetStatistics::new();
        stats.upload(1024, 100);
        assert!(stats.upload_speed_avg().is_some());
        stats.reset();
        assert!(stats.upload_speed_avg().is_none());
        assert!(stats.download_speed_avg().is_none());
    }

    #[test]
    fn quality_score_absent_without_data() {
        let stats = NetStatistics::new();
        assert_eq!(stats.quality_score(), -1.0);
    }

    #[test]
    fn partial_flags_are_monotonic_until_reset() {
        let stats = NetStatistics::new();
        assert!(!stats.partial_read());
        stats.trigger_partial_read();
        assert!(stats.partial_read());
        stats.trigger_partial_read();
        assert!(stats.partial_read());
        stats.reset();
        assert!(!stats.partial_read());
    }

    #[test]
    fn weighted_average_matches_formula() {
        let stats = NetStatistics::new();
        stats.upload(1000, 1000); // 1000 bytes/s, seeds the average
        let first = stats.upload_speed_avg().unwrap();
        assert!((first - 1000.0).abs() < 1e-9);

        stats.upload(2000, 1000); // 2000 bytes/s sample
        let second = stats.upload_speed_avg().unwrap();
        let expected = 0.9 * 2000.0 + 0.1 * 1000.0;
        assert!((second - expected).abs() < 1e-9);
    }
}
