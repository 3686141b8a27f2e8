//! Hierarchical tick-based clocks.
//!
//! Every clock counts ticks at its own tick rate. A root clock reads a time
//! source directly; every other clock derives its ticks from its parent
//! through a [`Correlation`] and a speed multiplier. All variants share the
//! capability set on [`Clock`]: conversions, dispersion bookkeeping and
//! common-ancestor lookup. A variant only supplies its own tick mapping.
//!
//! Children hold a shared handle on their parent; parents never reference
//! children. Re-parenting refuses to create a cycle and ancestor walks are
//! additionally bounded by [`MAX_CLOCK_DEPTH`].

mod correlated;
mod system;
mod tunable;

pub use correlated::CorrelatedClock;
pub use system::{ManualTimeSource, MonotonicTimeSource, SystemClock, TimeSource};
pub use tunable::TunableClock;

use crate::error::ClockError;
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub const NANOS_PER_SEC: f64 = 1_000_000_000.0;
pub const MAX_CLOCK_DEPTH: usize = 64;
const EVENT_QUEUE_DEPTH: usize = 32;

static NEXT_CLOCK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClockId(u64);

impl ClockId {
    pub(crate) fn next() -> Self {
        ClockId(NEXT_CLOCK_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Fixes one instant's mapping between a clock and its parent.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Correlation {
    pub parent_ticks: f64,
    pub ticks: f64,
}

impl Correlation {
    pub fn new(parent_ticks: f64, ticks: f64) -> Self {
        Correlation { parent_ticks, ticks }
    }
}

/// Error parameters of a single clock, excluding its ancestors.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct ErrorParams {
    /// Nanoseconds.
    pub static_error: f64,
    /// Parts per million.
    pub error_rate: f64,
    /// Own tick value from which `error_rate` accumulates.
    pub error_ticks_from: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ClockEvent {
    CorrelationChanged,
    SpeedChanged,
    TickRateChanged,
    AvailabilityChanged(bool),
    Adjusted,
    ParentChanged,
}

/// Listener list for clock change events, delivered over bounded channels.
#[derive(Default)]
pub struct ClockNotifier {
    subscribers: Mutex<Vec<Sender<ClockEvent>>>,
}

impl ClockNotifier {
    pub fn subscribe(&self) -> Receiver<ClockEvent> {
        let (tx, rx) = bounded(EVENT_QUEUE_DEPTH);
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.push(tx);
        }
        rx
    }

    pub fn notify(&self, event: ClockEvent) {
        if let Ok(mut subs) = self.subscribers.lock() {
            // A full queue means the subscriber has not caught up; it will see the
            // latest state on its next read anyway.
            subs.retain(|tx| !matches!(tx.try_send(event), Err(TrySendError::Disconnected(_))));
        }
    }
}

/// Shared capability set of all clocks.
pub trait Clock: Send + Sync {
    fn id(&self) -> ClockId;

    /// Ticks per second.
    fn tick_rate(&self) -> u64;

    fn speed(&self) -> f64;

    fn parent(&self) -> Option<Arc<dyn Clock>>;

    /// Maps own ticks onto the parent's tick count. Identity for a root clock.
    fn to_parent_ticks(&self, ticks: f64) -> f64;

    fn from_parent_ticks(&self, parent_ticks: f64) -> f64;

    fn error_params(&self) -> ErrorParams;

    /// Availability flag of this clock alone.
    fn own_availability(&self) -> bool;

    fn subscribe(&self) -> Receiver<ClockEvent>;

    /// Maximum frequency error of the underlying oscillator, in ppm.
    fn max_freq_error_ppm(&self) -> f64 {
        self.parent().map_or(0.0, |p| p.max_freq_error_ppm())
    }

    /// Unrounded current tick value. Root clocks override this.
    fn precise_ticks(&self) -> f64 {
        match self.parent() {
            Some(p) => self.from_parent_ticks(p.precise_ticks()),
            None => 0.0,
        }
    }

    fn ticks(&self) -> i64 {
        self.precise_ticks().round() as i64
    }

    /// Current time in seconds.
    fn time(&self) -> f64 {
        self.ticks_to_time(self.precise_ticks())
    }

    fn nanos(&self) -> i64 {
        self.ticks_to_nanos(self.precise_ticks()).round() as i64
    }

    fn ticks_to_nanos(&self, ticks: f64) -> f64 {
        ticks * NANOS_PER_SEC / self.tick_rate() as f64
    }

    fn nanos_to_ticks(&self, nanos: f64) -> f64 {
        nanos * self.tick_rate() as f64 / NANOS_PER_SEC
    }

    fn ticks_to_time(&self, ticks: f64) -> f64 {
        ticks / self.tick_rate() as f64
    }

    fn time_to_ticks(&self, secs: f64) -> f64 {
        secs * self.tick_rate() as f64
    }

    fn is_available(&self) -> bool {
        self.own_availability() && self.parent().map_or(true, |p| p.is_available())
    }

    /// Speed relative to the root clock.
    fn effective_speed(&self) -> f64 {
        self.speed() * self.parent().map_or(1.0, |p| p.effective_speed())
    }

    /// Dispersion in nanoseconds when this clock reads `ticks`.
    fn dispersion_at_ticks(&self, ticks: f64) -> f64 {
        let err = self.error_params();
        let elapsed_ns = self.ticks_to_nanos(ticks - err.error_ticks_from).max(0.0);
        let own = err.static_error + err.error_rate * elapsed_ns / 1_000_000.0;

        match self.parent() {
            Some(p) => {
                let parent_ticks = self.to_parent_ticks(ticks);
                let parent_ticks = if parent_ticks.is_finite() { parent_ticks } else { p.precise_ticks() };
                own + p.dispersion_at_ticks(parent_ticks)
            }
            None => own,
        }
    }

    /// Dispersion in nanoseconds when this clock reads `nanos`.
    fn dispersion_at_time(&self, nanos: f64) -> f64 {
        self.dispersion_at_ticks(self.nanos_to_ticks(nanos))
    }

    /// Converts a tick value of this clock into the tick value `other` shows
    /// at the same instant, via their nearest common ancestor.
    fn to_other_clock(&self, other: &dyn Clock, ticks: f64) -> Result<f64, ClockError> {
        let mine = ancestors(self.parent())?;
        let theirs = ancestors(other.parent())?;

        let my_ids: Vec<ClockId> = std::iter::once(self.id()).chain(mine.iter().map(|c| c.id())).collect();
        let their_ids: Vec<ClockId> = std::iter::once(other.id()).chain(theirs.iter().map(|c| c.id())).collect();

        let (up, down) = my_ids
            .iter()
            .enumerate()
            .find_map(|(i, id)| their_ids.iter().position(|t| t == id).map(|j| (i, j)))
            .ok_or(ClockError::NoCommonAncestor)?;

        let mut t = ticks;
        for step in 0..up {
            t = if step == 0 { self.to_parent_ticks(t) } else { mine[step - 1].to_parent_ticks(t) };
        }
        for step in (0..down).rev() {
            t = if step == 0 { other.from_parent_ticks(t) } else { theirs[step - 1].from_parent_ticks(t) };
        }

        if t.is_finite() {
            Ok(t)
        } else {
            Err(ClockError::NonInvertible)
        }
    }
}

/// Walks a parent chain upwards, nearest first.
pub fn ancestors(start: Option<Arc<dyn Clock>>) -> Result<Vec<Arc<dyn Clock>>, ClockError> {
    let mut chain = Vec::new();
    let mut next = start;
    while let Some(clock) = next {
        if chain.len() >= MAX_CLOCK_DEPTH {
            return Err(ClockError::CycleDetected);
        }
        next = clock.parent();
        chain.push(clock);
    }
    Ok(chain)
}

/// Rejects a re-parenting that would put `child` among its own ancestors.
pub(crate) fn check_no_cycle(child: ClockId, new_parent: &Arc<dyn Clock>) -> Result<(), ClockError> {
    if new_parent.id() == child {
        return Err(ClockError::CycleDetected);
    }
    for ancestor in ancestors(new_parent.parent())? {
        if ancestor.id() == child {
            return Err(ClockError::CycleDetected);
        }
    }
    Ok(())
}

/// Mapping state shared by the correlated and tunable clocks.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Timebase {
    pub tick_rate: u64,
    pub speed: f64,
    pub correlation: Correlation,
    pub error: ErrorParams,
    pub available: bool,
}

impl Timebase {
    pub fn new(tick_rate: u64, correlation: Correlation) -> Self {
        Timebase {
            tick_rate,
            speed: 1.0,
            correlation,
            error: ErrorParams::default(),
            available: true,
        }
    }

    pub fn from_parent(&self, parent_rate: u64, parent_ticks: f64) -> f64 {
        self.correlation.ticks
            + (parent_ticks - self.correlation.parent_ticks) * self.tick_rate as f64 * self.speed / parent_rate as f64
    }

    pub fn to_parent(&self, parent_rate: u64, ticks: f64) -> f64 {
        if self.speed == 0.0 {
            return f64::NAN;
        }
        self.correlation.parent_ticks
            + (ticks - self.correlation.ticks) * parent_rate as f64 / (self.tick_rate as f64 * self.speed)
    }

    /// Equivalent correlation anchored at `ticks`, so the mapping is unchanged.
    pub fn rebased_at(&self, parent_rate: u64, ticks: f64) -> Correlation {
        Correlation::new(self.to_parent(parent_rate, ticks), ticks)
    }

    /// Re-anchors on the current parent reading. Works at zero speed too.
    pub fn rebased_on_parent(&self, parent_rate: u64, parent_ticks: f64) -> Correlation {
        Correlation::new(parent_ticks, self.from_parent(parent_rate, parent_ticks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manual_root(rate: u64) -> (Arc<ManualTimeSource>, Arc<SystemClock>) {
        let source = Arc::new(ManualTimeSource::new(0));
        let root = Arc::new(SystemClock::with_source(rate, source.clone()));
        (source, root)
    }

    #[test]
    fn test_common_ancestor_conversion() {
        let (_src, root) = manual_root(1_000_000_000);
        let a = Arc::new(CorrelatedClock::new(root.clone(), 1000, Correlation::new(0.0, 0.0)));
        let b = Arc::new(CorrelatedClock::new(root.clone(), 90_000, Correlation::new(1_000_000_000.0, 500.0)));

        // a at 2000 ticks = 2s of root; b at 2s = 500 + 90000
        let t = a.to_other_clock(b.as_ref(), 2000.0).unwrap();
        assert!((t - 90_500.0).abs() < 1e-6);

        let back = b.to_other_clock(a.as_ref(), t).unwrap();
        assert!((back - 2000.0).abs() < 1e-6);
    }

    #[test]
    fn test_conversion_to_ancestor_and_descendant() {
        let (_src, root) = manual_root(1000);
        let child = Arc::new(CorrelatedClock::new(root.clone(), 1000, Correlation::new(100.0, 0.0)));
        let grandchild = Arc::new(CorrelatedClock::new(child.clone(), 10, Correlation::new(0.0, 0.0)));

        let on_root = grandchild.to_other_clock(root.as_ref(), 5.0).unwrap();
        assert!((on_root - 600.0).abs() < 1e-9);

        let down = root.to_other_clock(grandchild.as_ref(), 600.0).unwrap();
        assert!((down - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_no_common_ancestor() {
        let (_s1, root1) = manual_root(1000);
        let (_s2, root2) = manual_root(1000);
        let a = CorrelatedClock::new(root1, 1000, Correlation::default());
        let b = CorrelatedClock::new(root2, 1000, Correlation::default());
        assert_eq!(a.to_other_clock(&b, 10.0), Err(ClockError::NoCommonAncestor));
    }

    #[test]
    fn test_zero_speed_is_not_invertible() {
        let (_src, root) = manual_root(1000);
        let a = Arc::new(CorrelatedClock::new(root.clone(), 1000, Correlation::default()));
        a.set_speed(0.0);
        assert_eq!(a.to_other_clock(root.as_ref(), 10.0), Err(ClockError::NonInvertible));
    }

    #[test]
    fn test_dispersion_sums_up_the_chain() {
        let (src, root) = manual_root(1_000_000_000);
        let child = Arc::new(CorrelatedClock::new(root.clone(), 1_000_000_000, Correlation::default()));
        child.set_error(1000.0, 10.0);

        // 1 second later: child 1000 + 10ppm * 1e9ns / 1e6 = 11000, root precision added.
        src.advance(1_000_000_000);
        let now = child.precise_ticks();
        let expected = 1000.0 + 10_000.0 + root.error_params().static_error;
        assert!((child.dispersion_at_ticks(now) - expected).abs() < 1e-6);
    }

    #[test]
    fn test_dispersion_is_non_decreasing() {
        let (_src, root) = manual_root(1_000_000_000);
        let child = Arc::new(CorrelatedClock::new(root.clone(), 1_000_000_000, Correlation::default()));
        child.set_error(500.0, 50.0);
        let grand = CorrelatedClock::new(child.clone(), 1000, Correlation::default());
        grand.set_error(10.0, 5.0);

        let mut last = 0.0;
        for i in 0..50 {
            let d = grand.dispersion_at_time(i as f64 * 1e8);
            assert!(d >= last, "dispersion decreased at step {}", i);
            last = d;
        }
    }

    #[test]
    fn test_effective_speed_and_availability_propagate() {
        let (_src, root) = manual_root(1000);
        let a = Arc::new(CorrelatedClock::new(root.clone(), 1000, Correlation::default()));
        let b = CorrelatedClock::new(a.clone(), 1000, Correlation::default());
        a.set_speed(2.0);
        b.set_speed(0.5);
        assert!((b.effective_speed() - 1.0).abs() < 1e-12);

        assert!(b.is_available());
        a.set_available(false);
        assert!(!b.is_available());
    }

    #[test]
    fn test_reparent_cycle_rejected() {
        let (_src, root) = manual_root(1000);
        let a = Arc::new(CorrelatedClock::new(root.clone(), 1000, Correlation::default()));
        let b = Arc::new(CorrelatedClock::new(a.clone(), 1000, Correlation::default()));
        assert_eq!(a.set_parent(b.clone()), Err(ClockError::CycleDetected));
        assert!(b.set_parent(root.clone()).is_ok());
    }

    #[test]
    fn test_notifier_prunes_dropped_subscribers() {
        let notifier = ClockNotifier::default();
        let keep = notifier.subscribe();
        drop(notifier.subscribe());
        notifier.notify(ClockEvent::Adjusted);
        assert_eq!(keep.try_recv(), Ok(ClockEvent::Adjusted));
        assert_eq!(notifier.subscribers.lock().unwrap().len(), 1);
    }
}
