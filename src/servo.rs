use log::debug;

/// What the controller should do with the player this cycle.
#[derive(Debug, Clone, Copy, PartialEq, serde::Serialize)]
pub enum ServoAction {
    Hold,
    /// Back to nominal after rate adaptation converged.
    RestoreRate(f64),
    AdaptRate(f64),
    /// Jump to this media time, then play at nominal rate. The controller
    /// keeps the jump inside the media's duration.
    Seek(f64),
}

/// Two-threshold playback servo with hysteresis.
///
/// Small errors are ignored, medium ones are closed by running the player a
/// fixed step faster or slower, and large ones are fixed with a seek.
pub struct PlaybackServo {
    resync_threshold: f64,
    rate_threshold: f64,
    step: f64,
    adapting: bool,
}

impl PlaybackServo {
    /// Thresholds in seconds; `step` is a fraction of the nominal rate.
    pub fn new(resync_threshold: f64, rate_threshold: f64, step: f64) -> Self {
        PlaybackServo {
            resync_threshold: resync_threshold.abs(),
            // A rate threshold below the resync threshold would make the adapt band empty.
            rate_threshold: rate_threshold.abs().max(resync_threshold.abs()),
            step: step.abs(),
            adapting: false,
        }
    }

    pub fn is_adapting(&self) -> bool {
        self.adapting
    }

    pub fn reset(&mut self) {
        self.adapting = false;
    }

    /// `jitter` is actual minus expected position, in seconds.
    /// A jitter past the rate threshold seeks to `expected`, the position the
    /// timeline says the player should be at, not to where the player is.
    pub fn sample(&mut self, jitter: f64, expected: f64, nominal_rate: f64) -> ServoAction {
        let magnitude = jitter.abs();

        let action = if magnitude >= self.rate_threshold {
            self.adapting = false;
            ServoAction::Seek(expected)
        } else if magnitude >= self.resync_threshold {
            // Ahead of the timeline: slow down. Behind: speed up.
            let delta = nominal_rate * self.step;
            self.adapting = true;
            if jitter > 0.0 {
                ServoAction::AdaptRate(nominal_rate - delta)
            } else {
                ServoAction::AdaptRate(nominal_rate + delta)
            }
        } else if self.adapting {
            self.adapting = false;
            ServoAction::RestoreRate(nominal_rate)
        } else {
            ServoAction::Hold
        };

        debug!(
            "[Resync] Servo: jitter={:.3}s expected={:.3}s nominal={:.2} -> {:?}",
            jitter, expected, nominal_rate, action
        );
        action
    }
}
