use super::{check_no_cycle, Clock, ClockEvent, ClockId, ClockNotifier, Correlation, ErrorParams, Timebase};
use crate::error::ClockError;
use crossbeam_channel::Receiver;
use std::sync::{Arc, RwLock};

/// A clock whose ticks follow its parent through a correlation and a speed.
///
/// `ticks = correlation.ticks + speed * tick_rate / parent.tick_rate * (parent_ticks - correlation.parent_ticks)`
///
/// Mutations publish a whole new [`Timebase`] under a short write lock, so
/// readers always see a consistent correlation and speed pair.
pub struct CorrelatedClock {
    id: ClockId,
    parent: RwLock<Arc<dyn Clock>>,
    state: RwLock<Timebase>,
    notifier: ClockNotifier,
}

impl CorrelatedClock {
    pub fn new(parent: Arc<dyn Clock>, tick_rate: u64, correlation: Correlation) -> Self {
        CorrelatedClock {
            id: ClockId::next(),
            parent: RwLock::new(parent),
            state: RwLock::new(Timebase::new(tick_rate.max(1), correlation)),
            notifier: ClockNotifier::default(),
        }
    }

    fn snapshot(&self) -> Timebase {
        match self.state.read() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    fn parent_clock(&self) -> Arc<dyn Clock> {
        match self.parent.read() {
            Ok(p) => p.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
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

    pub fn set_correlation(&self, correlation: Correlation) {
        self.update(|s| s.correlation = correlation);
        self.notifier.notify(ClockEvent::CorrelationChanged);
    }

    /// Applies a new speed from the current instant on; the reading does not jump.
    pub fn set_speed(&self, speed: f64) {
        let parent = self.parent_clock();
        let parent_now = parent.precise_ticks();
        let parent_rate = parent.tick_rate();
        self.update(|s| {
            s.correlation = s.rebased_on_parent(parent_rate, parent_now);
            s.speed = speed;
        });
        self.notifier.notify(ClockEvent::SpeedChanged);
    }

    /// Replaces correlation and speed in one publish.
    pub fn set_correlation_and_speed(&self, correlation: Correlation, speed: f64) {
        self.update(|s| {
            s.correlation = correlation;
            s.speed = speed;
        });
        self.notifier.notify(ClockEvent::CorrelationChanged);
    }

    /// Changes the tick rate keeping the current instant's time continuous.
    pub fn set_tick_rate(&self, tick_rate: u64) {
        let parent = self.parent_clock();
        let parent_now = parent.precise_ticks();
        let parent_rate = parent.tick_rate();
        let tick_rate = tick_rate.max(1);
        self.update(|s| {
            let anchor = s.rebased_on_parent(parent_rate, parent_now);
            let scale = tick_rate as f64 / s.tick_rate as f64;
            s.correlation = Correlation::new(anchor.parent_ticks, anchor.ticks * scale);
            s.tick_rate = tick_rate;
        });
        self.notifier.notify(ClockEvent::TickRateChanged);
    }

    /// Re-expresses the correlation at `ticks` without changing the mapping.
    pub fn rebase_correlation_at_ticks(&self, ticks: f64) {
        let parent_rate = self.parent_clock().tick_rate();
        self.update(|s| {
            if s.speed != 0.0 {
                s.correlation = s.rebased_at(parent_rate, ticks);
            }
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

    /// Sets error parameters, accumulating from the current tick.
    pub fn set_error(&self, static_error: f64, error_rate: f64) {
        let from = self.precise_ticks();
        self.update(|s| {
            s.error = ErrorParams { static_error, error_rate, error_ticks_from: from };
        });
    }

    pub fn set_parent(&self, parent: Arc<dyn Clock>) -> Result<(), ClockError> {
        check_no_cycle(self.id, &parent)?;
        match self.parent.write() {
            Ok(mut p) => *p = parent,
            Err(poisoned) => *poisoned.into_inner() = parent,
        }
        self.notifier.notify(ClockEvent::ParentChanged);
        Ok(())
    }
}

impl Clock for CorrelatedClock {
    fn id(&self) -> ClockId {
        self.id
    }

    fn tick_rate(&self) -> u64 {
        self.snapshot().tick_rate
    }

    fn speed(&self) -> f64 {
        self.snapshot().speed
    }

    fn parent(&self) -> Option<Arc<dyn Clock>> {
        Some(self.parent_clock())
    }

    fn to_parent_ticks(&self, ticks: f64) -> f64 {
        let rate = self.parent_clock().tick_rate();
        self.snapshot().to_parent(rate, ticks)
    }

    fn from_parent_ticks(&self, parent_ticks: f64) -> f64 {
        let rate = self.parent_clock().tick_rate();
        self.snapshot().from_parent(rate, parent_ticks)
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
}
