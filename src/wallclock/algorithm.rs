use super::candidate::Candidate;
use crate::clock::{Clock, TunableClock};
use log::{debug, info};
use std::sync::Arc;
use std::time::Duration;

/// Decides which candidates correct the WallClock and how often to ask.
/// `now` arguments are root clock nanoseconds.
pub trait WcAlgorithm: Send {
    /// Adopts or ignores an eligible candidate. Returns the offset applied.
    fn process(&mut self, candidate: &Candidate) -> Option<i64>;

    fn best_candidate(&self) -> Option<Candidate>;

    fn current_dispersion(&self, now: f64) -> Option<f64> {
        self.best_candidate().map(|c| c.dispersion_at(now))
    }

    fn next_request_wait(&self, now: f64) -> Duration;
}

/// Request spacing: fast while unsynchronised, slowing as dispersion falls.
#[derive(Debug, Clone, Copy)]
pub struct RequestPacing {
    pub min_wait: Duration,
    pub max_wait: Duration,
    pub target_dispersion_ns: f64,
}

impl RequestPacing {
    pub fn wait_for(&self, dispersion: Option<f64>) -> Duration {
        match dispersion {
            None => self.min_wait,
            Some(d) if d <= self.target_dispersion_ns => self.max_wait,
            Some(d) => {
                let secs = self.max_wait.as_secs_f64() * self.target_dispersion_ns / d;
                Duration::from_secs_f64(secs).clamp(self.min_wait, self.max_wait)
            }
        }
    }
}

pub struct LowestDispersionAlgorithm {
    wallclock: Arc<TunableClock>,
    best: Option<Candidate>,
    pacing: RequestPacing,
}

impl LowestDispersionAlgorithm {
    pub fn new(wallclock: Arc<TunableClock>, pacing: RequestPacing) -> Self {
        LowestDispersionAlgorithm { wallclock, best: None, pacing }
    }

    /// How far the WallClock's reading of the candidate's T4 instant has
    /// moved since it was measured, in nanoseconds.
    fn adjusted_since(&self, candidate: &Candidate) -> f64 {
        let parent = self.wallclock.parent_clock();
        let t4_parent = parent.nanos_to_ticks(candidate.measured_at);
        let reads_now = self.wallclock.ticks_to_nanos(self.wallclock.from_parent_ticks(t4_parent));
        reads_now - candidate.t4 as f64
    }
}

impl WcAlgorithm for LowestDispersionAlgorithm {
    fn process(&mut self, candidate: &Candidate) -> Option<i64> {
        let at = candidate.measured_at;
        if let Some(best) = &self.best {
            if candidate.supersedes(best) {
                debug!("[WC] Follow-up replaces provisional measurement (T3 {} -> {})", best.t3, candidate.t3);
            } else if candidate.dispersion_at(at) >= best.dispersion_at(at) {
                debug!("[WC] Candidate dispersion {:.0}ns not better than best; ignored", candidate.dispersion_at(at));
                return None;
            }
        }

        let parent = self.wallclock.parent_clock();
        let now = parent.ticks_to_nanos(parent.precise_ticks());
        let correction = candidate.offset as f64 - self.adjusted_since(candidate);

        self.wallclock.adjust_time_nanos_with_error(
            correction,
            candidate.dispersion_at(now),
            candidate.error_rate_ppm(),
        );

        if self.best.is_none() {
            info!("[WC] First candidate adopted: offset {}ns, RTT {}ns", candidate.offset, candidate.rtt);
        } else {
            debug!("[WC] Adopted candidate: offset {}ns, RTT {}ns, dispersion {:.0}ns",
                candidate.offset, candidate.rtt, candidate.dispersion_at(at));
        }
        self.best = Some(*candidate);
        Some(candidate.offset)
    }

    fn best_candidate(&self) -> Option<Candidate> {
        self.best
    }

    fn next_request_wait(&self, now: f64) -> Duration {
        self.pacing.wait_for(self.current_dispersion(now))
    }
}
