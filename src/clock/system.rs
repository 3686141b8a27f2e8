use super::{Clock, ClockEvent, ClockId, ClockNotifier, ErrorParams, NANOS_PER_SEC};
use crossbeam_channel::Receiver;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// Source of monotonic nanoseconds for a root clock.
pub trait TimeSource: Send + Sync {
    fn now_nanos(&self) -> i64;
}

/// Process-local monotonic time, starting at zero.
pub struct MonotonicTimeSource {
    epoch: Instant,
}

impl MonotonicTimeSource {
    pub fn new() -> Self {
        MonotonicTimeSource { epoch: Instant::now() }
    }
}

impl Default for MonotonicTimeSource {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSource for MonotonicTimeSource {
    fn now_nanos(&self) -> i64 {
        self.epoch.elapsed().as_nanos() as i64
    }
}

/// Hand-driven time, for deterministic tests and simulations.
pub struct ManualTimeSource {
    nanos: AtomicI64,
}

impl ManualTimeSource {
    pub fn new(start_nanos: i64) -> Self {
        ManualTimeSource { nanos: AtomicI64::new(start_nanos) }
    }

    pub fn advance(&self, nanos: i64) {
        self.nanos.fetch_add(nanos, Ordering::SeqCst);
    }

    pub fn set(&self, nanos: i64) {
        self.nanos.store(nanos, Ordering::SeqCst);
    }
}

impl TimeSource for ManualTimeSource {
    fn now_nanos(&self) -> i64 {
        self.nanos.load(Ordering::SeqCst)
    }
}

/// Root of a clock hierarchy.
pub struct SystemClock {
    id: ClockId,
    tick_rate: u64,
    source: Arc<dyn TimeSource>,
    precision_ns: f64,
    max_freq_error_ppm: f64,
    notifier: ClockNotifier,
}

impl SystemClock {
    pub const DEFAULT_PRECISION_NS: f64 = 1000.0;
    pub const DEFAULT_MAX_FREQ_ERROR_PPM: f64 = 500.0;

    pub fn new(tick_rate: u64) -> Self {
        Self::with_source(tick_rate, Arc::new(MonotonicTimeSource::new()))
    }

    pub fn with_source(tick_rate: u64, source: Arc<dyn TimeSource>) -> Self {
        SystemClock {
            id: ClockId::next(),
            tick_rate: tick_rate.max(1),
            source,
            precision_ns: Self::DEFAULT_PRECISION_NS,
            max_freq_error_ppm: Self::DEFAULT_MAX_FREQ_ERROR_PPM,
            notifier: ClockNotifier::default(),
        }
    }

    pub fn with_error_characteristics(mut self, precision_ns: f64, max_freq_error_ppm: f64) -> Self {
        self.precision_ns = precision_ns;
        self.max_freq_error_ppm = max_freq_error_ppm;
        self
    }

    pub fn precision_ns(&self) -> f64 {
        self.precision_ns
    }
}

impl Clock for SystemClock {
    fn id(&self) -> ClockId {
        self.id
    }

    fn tick_rate(&self) -> u64 {
        self.tick_rate
    }

    fn speed(&self) -> f64 {
        1.0
    }

    fn parent(&self) -> Option<Arc<dyn Clock>> {
        None
    }

    fn to_parent_ticks(&self, ticks: f64) -> f64 {
        ticks
    }

    fn from_parent_ticks(&self, parent_ticks: f64) -> f64 {
        parent_ticks
    }

    fn error_params(&self) -> ErrorParams {
        ErrorParams { static_error: self.precision_ns, error_rate: 0.0, error_ticks_from: 0.0 }
    }

    fn own_availability(&self) -> bool {
        true
    }

    fn subscribe(&self) -> Receiver<ClockEvent> {
        // A root never changes; the receiver simply stays quiet.
        self.notifier.subscribe()
    }

    fn max_freq_error_ppm(&self) -> f64 {
        self.max_freq_error_ppm
    }

    fn precise_ticks(&self) -> f64 {
        self.source.now_nanos() as f64 * self.tick_rate as f64 / NANOS_PER_SEC
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_source_drives_ticks() {
        let src = Arc::new(ManualTimeSource::new(0));
        let clock = SystemClock::with_source(1000, src.clone());
        assert_eq!(clock.ticks(), 0);
        src.advance(1_500_000_000);
        assert_eq!(clock.ticks(), 1500);
        assert!((clock.time() - 1.5).abs() < 1e-12);
        assert_eq!(clock.nanos(), 1_500_000_000);
    }

    #[test]
    fn test_monotonic_clock_never_goes_back() {
        let clock = SystemClock::new(1_000_000_000);
        let mut last = clock.ticks();
        for _ in 0..1000 {
            let now = clock.ticks();
            assert!(now >= last);
            last = now;
        }
    }

    #[test]
    fn test_root_reports_error_characteristics() {
        let clock = SystemClock::new(1_000_000).with_error_characteristics(250.0, 100.0);
        assert_eq!(clock.error_params().static_error, 250.0);
        assert_eq!(clock.max_freq_error_ppm(), 100.0);
        assert!(clock.is_available());
        assert!(clock.parent().is_none());
    }
}
