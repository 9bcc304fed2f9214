//! Pipeline statistics: moving averages, counters, log throttling.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Exponential moving average with divisor-form updates.
///
/// `value += sample/N − value/N`, matching the pipeline's traditional
/// recurrences (size N=64, timing N=100). Stored as f64 bits in an atomic so
/// the telemetry thread can read while the owning stage writes; each EMA has
/// a single writer, so plain load/store is sufficient.
pub struct Ema {
    bits: AtomicU64,
    divisor: f64,
}

impl Ema {
    pub fn new(divisor: u32) -> Self {
        Self {
            bits: AtomicU64::new(0f64.to_bits()),
            divisor: divisor as f64,
        }
    }

    pub fn update(&self, sample: f64) {
        let current = self.get();
        let next = current + (sample / self.divisor) - (current / self.divisor);
        self.bits.store(next.to_bits(), Ordering::Relaxed);
    }

    /// Stall flag: double the current value (applied when a build produced
    /// nothing in a full wait interval).
    pub fn penalize_double(&self) {
        let next = self.get() * 2.0;
        self.bits.store(next.to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::Relaxed))
    }
}

/// Shared counters and averages for one builder pipeline.
pub struct PipelineCounters {
    /// STFs currently between assembly output and send completion.
    pub stfs_in_pipeline: AtomicI64,
    /// STFs finalized by the assembly stage.
    pub built_total: AtomicU64,
    /// STFs serialized onto the output channel.
    pub sent_total: AtomicU64,
    /// Bundles or HBFs dropped anywhere in the pipeline.
    pub dropped_total: AtomicU64,
    /// Mean STF payload size, N = 64.
    pub stf_size: Ema,
    /// Mean inter-STF interval in seconds, N = 100.
    pub stf_time: Ema,
    /// Mean channel send time in milliseconds, N = 100.
    pub send_time_ms: Ema,
    /// Instantaneous send rate, written by the outbound stage.
    sent_rate_bits: AtomicU64,
}

impl PipelineCounters {
    pub fn new() -> Self {
        Self {
            stfs_in_pipeline: AtomicI64::new(0),
            built_total: AtomicU64::new(0),
            sent_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            stf_size: Ema::new(64),
            stf_time: Ema::new(100),
            send_time_ms: Ema::new(100),
            sent_rate_bits: AtomicU64::new(0f64.to_bits()),
        }
    }

    pub fn set_sent_rate(&self, rate: f64) {
        self.sent_rate_bits.store(rate.to_bits(), Ordering::Relaxed);
    }

    pub fn sent_rate(&self) -> f64 {
        f64::from_bits(self.sent_rate_bits.load(Ordering::Relaxed))
    }
}

impl Default for PipelineCounters {
    fn default() -> Self {
        Self::new()
    }
}

/// Interval-based log throttle for high-frequency error paths.
///
/// `check()` returns true at most once per interval; callers skip the log
/// statement otherwise. Counters keep the true event count.
pub struct LogRatelimit {
    start: Instant,
    interval_ms: u64,
    last_ms: AtomicU64,
}

impl LogRatelimit {
    pub fn new(interval: Duration) -> Self {
        Self {
            start: Instant::now(),
            interval_ms: interval.as_millis() as u64,
            // Start in the past so the first event always logs.
            last_ms: AtomicU64::new(u64::MAX),
        }
    }

    pub fn check(&self) -> bool {
        let now = self.start.elapsed().as_millis() as u64;
        let last = self.last_ms.load(Ordering::Relaxed);
        if last != u64::MAX && now.saturating_sub(last) < self.interval_ms {
            return false;
        }
        self.last_ms
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ema_converges() {
        let ema = Ema::new(64);
        for _ in 0..2000 {
            ema.update(128.0);
        }
        assert!((ema.get() - 128.0).abs() < 1.0);
    }

    #[test]
    fn test_ema_penalty_doubles() {
        let ema = Ema::new(100);
        ema.update(10.0);
        let before = ema.get();
        ema.penalize_double();
        assert_eq!(ema.get(), before * 2.0);
    }

    #[test]
    fn test_ratelimit_first_passes_then_blocks() {
        let rl = LogRatelimit::new(Duration::from_secs(60));
        assert!(rl.check());
        assert!(!rl.check());
        assert!(!rl.check());
    }

    #[test]
    fn test_ratelimit_allows_after_interval() {
        let rl = LogRatelimit::new(Duration::from_millis(10));
        assert!(rl.check());
        std::thread::sleep(Duration::from_millis(15));
        assert!(rl.check());
    }

    #[test]
    fn test_counters_start_zero() {
        let c = PipelineCounters::new();
        assert_eq!(c.built_total.load(Ordering::Relaxed), 0);
        assert_eq!(c.sent_rate(), 0.0);
    }
}
