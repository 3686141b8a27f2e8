use super::{Clock, ClockEvent, ClockId, ClockNotifier, Correlation, ErrorParams, Timebase};
use crossbeam_channel::Receiver;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Locally adjustable estimate of a remote clock.
///
/// Starts as a free-running copy of its parent. The adjust methods are the
/// only way the WallClock algorithm corrects it; each one re-anchors the
/// correlation on the parent's current reading first, so only the offset
/// being applied shows up as a change.
pub struct TunableClock {
    id: ClockId,
    parent: Arc<dyn Clock>,
    state: RwLock<Timebase>,
    slew_ppm: RwLock<f64>,
    adjustments: AtomicU64,
    notifier: ClockNotifier,
}

impl TunableClock {
    pub fn new(parent: Arc<dyn Clock>, tick_rate: u64, start_ticks: i64) -> Self {
        let correlation = Correlation::new(parent.precise_ticks(), start_ticks as f64);
        TunableClock {
            id: ClockId::next(),
            parent,
            state: RwLock::new(Timebase::new(tick_rate.max(1), correlation)),
            slew_ppm: RwLock::new(0.0),
            adjustments: AtomicU64::new(0),
            notifier: ClockNotifier::default(),
        }
    }

    pub fn parent_clock(&self) -> &Arc<dyn Clock> {
        &self.parent
    }

    fn snapshot(&self) -> Timebase {
        match self.state.read() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn update<F: FnOnce(&mut Timebase)>(&self, f: F) {
        match self.state.write() {
            Ok(mut s) => f(&mut s),
            Err(poisoned) => f(&mut poisoned.into_inner()),
        }
    }

    pub fn correlation(&self) -> Correlation {
        self.snapshot().correlation
    }

    pub fn slew_ppm(&self) -> f64 {
        self.slew_ppm.read().map(|s| *s).unwrap_or(0.0)
    }

    /// Number of adjust operations applied so far.
    pub fn adjustment_count(&self) -> u64 {
        self.adjustments.load(Ordering::SeqCst)
    }

    /// Re-anchors the correlation on the parent's current reading.
    pub fn rebase(&self) {
        let parent_now = self.parent.precise_ticks();
        let parent_rate = self.parent.tick_rate();
        self.update(|s| s.correlation = s.rebased_on_parent(parent_rate, parent_now));
    }

    pub fn adjust_ticks(&self, offset_ticks: f64) {
        let parent_now = self.parent.precise_ticks();
        let parent_rate = self.parent.tick_rate();
        self.update(|s| {
            let mut c = s.rebased_on_parent(parent_rate, parent_now);
            c.ticks += offset_ticks;
            s.correlation = c;
        });
        self.adjustments.fetch_add(1, Ordering::SeqCst);
        self.notifier.notify(ClockEvent::Adjusted);
    }

    pub fn adjust_time_nanos(&self, offset_nanos: f64) {
        self.adjust_ticks(self.nanos_to_ticks(offset_nanos));
    }

    /// Applies an offset and replaces the error parameters in one publish.
    /// The error starts accumulating from the adjusted reading.
    pub fn adjust_time_nanos_with_error(&self, offset_nanos: f64, static_error: f64, error_rate: f64) {
        let parent_now = self.parent.precise_ticks();
        let parent_rate = self.parent.tick_rate();
        let offset_ticks = self.nanos_to_ticks(offset_nanos);
        self.update(|s| {
            let mut c = s.rebased_on_parent(parent_rate, parent_now);
            c.ticks += offset_ticks;
            s.correlation = c;
            s.error = ErrorParams { static_error, error_rate, error_ticks_from: c.ticks };
        });
        self.adjustments.fetch_add(1, Ordering::SeqCst);
        self.notifier.notify(ClockEvent::Adjusted);
    }

    pub fn set_speed(&self, speed: f64) {
        let slew = self.slew_ppm();
        self.apply_rate(speed, slew);
        self.notifier.notify(ClockEvent::SpeedChanged);
    }

    /// Frequency trim on top of the nominal speed.
    pub fn set_slew_ppm(&self, slew_ppm: f64) {
        let nominal = self.speed();
        self.apply_rate(nominal, slew_ppm);
        if let Ok(mut s) = self.slew_ppm.write() {
            *s = slew_ppm;
        }
        self.notifier.notify(ClockEvent::SpeedChanged);
    }

    fn apply_rate(&self, nominal_speed: f64, slew_ppm: f64) {
        let parent_now = self.parent.precise_ticks();
        let parent_rate = self.parent.tick_rate();
        self.update(|s| {
            s.correlation = s.rebased_on_parent(parent_rate, parent_now);
            s.speed = nominal_speed * (1.0 + slew_ppm / 1_000_000.0);
        });
    }

    pub fn set_available(&self, available: bool) {
        let mut changed = false;
        self.update(|s| {
            changed = s.available != available;
            s.available = available;
        });
        if changed {
            self.notifier.notify(ClockEvent::AvailabilityChanged(available));
        }
    }
}

impl Clock for TunableClock {
    fn id(&self) -> ClockId {
        self.id
    }

    fn tick_rate(&self) -> u64 {
        self.snapshot().tick_rate
    }

    /// Nominal speed, without slew.
    fn speed(&self) -> f64 {
        self.snapshot().speed / (1.0 + self.slew_ppm() / 1_000_000.0)
    }

    fn parent(&self) -> Option<Arc<dyn Clock>> {
        Some(self.parent.clone())
    }

    fn to_parent_ticks(&self, ticks: f64) -> f64 {
        self.snapshot().to_parent(self.parent.tick_rate(), ticks)
    }

    fn from_parent_ticks(&self, parent_ticks: f64) -> f64 {
        self.snapshot().from_parent(self.parent.tick_rate(), parent_ticks)
    }

    fn error_params(&self) -> ErrorParams {
        self.snapshot().error
    }

    fn own_availability(&self) -> bool {
        self.snapshot().available
    }

    fn subscribe(&self) -> Receiver<ClockEvent> {
        self.notifier.subscribe()
    }

    fn effective_speed(&self) -> f64 {
        self.snapshot().speed * self.parent.effective_speed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualTimeSource, SystemClock};

    fn setup() -> (Arc<ManualTimeSource>, Arc<SystemClock>, TunableClock) {
        let src = Arc::new(ManualTimeSource::new(1_000_000_000));
        let root = Arc::new(SystemClock::with_source(1_000_000_000, src.clone()));
        let clock = TunableClock::new(root.clone(), 1_000_000_000, 0);
        (src, root, clock)
    }

    #[test]
    fn test_starts_at_given_ticks_and_follows_parent() {
        let (src, _root, clock) = setup();
        assert_eq!(clock.ticks(), 0);
        src.advance(250_000_000);
        assert_eq!(clock.ticks(), 250_000_000);
    }

    #[test]
    fn test_adjust_time_nanos_shifts_reading() {
        let (src, _root, clock) = setup();
        src.advance(1_000_000);
        let before = clock.nanos();
        clock.adjust_time_nanos(5_000_000.0);
        assert_eq!(clock.nanos(), before + 5_000_000);
        assert_eq!(clock.adjustment_count(), 1);
    }

    #[test]
    fn test_adjust_with_error_resets_dispersion_origin() {
        let (src, root, clock) = setup();
        clock.adjust_time_nanos_with_error(-2_000_000.0, 3000.0, 20.0);

        let now = clock.precise_ticks();
        let root_disp = root.error_params().static_error;
        assert!((clock.dispersion_at_ticks(now) - (3000.0 + root_disp)).abs() < 1e-6);

        src.advance(1_000_000_000);
        let later = clock.precise_ticks();
        // 20 ppm over one second
        assert!((clock.dispersion_at_ticks(later) - (3000.0 + 20_000.0 + root_disp)).abs() < 1e-3);
    }

    #[test]
    fn test_speed_change_is_continuous() {
        let (src, _root, clock) = setup();
        src.advance(1_000_000_000);
        let before = clock.ticks();
        clock.set_speed(2.0);
        assert_eq!(clock.ticks(), before);
        src.advance(1_000_000);
        assert_eq!(clock.ticks(), before + 2_000_000);
        assert!((clock.speed() - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_slew_trims_frequency() {
        let (src, _root, clock) = setup();
        clock.set_slew_ppm(100.0);
        let start = clock.ticks();
        src.advance(1_000_000_000);
        assert_eq!(clock.ticks() - start, 1_000_100_000);
        assert!((clock.speed() - 1.0).abs() < 1e-12);
        assert!((clock.effective_speed() - 1.0001).abs() < 1e-12);
    }

    #[test]
    fn test_adjust_notifies() {
        let (_src, _root, clock) = setup();
        let rx = clock.subscribe();
        clock.adjust_ticks(10.0);
        assert_eq!(rx.try_recv(), Ok(ClockEvent::Adjusted));
    }
}
