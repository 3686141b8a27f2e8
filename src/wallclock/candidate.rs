use super::message::{WcMessage, WcMessageType};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateQuality {
    Response,
    ResponseWithFollowUp,
    /// Carries the precise transmit time announced by an earlier response.
    FollowUp,
}

/// Local clock characteristics folded into every measurement.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalClockParams {
    pub precision_ns: f64,
    pub max_freq_error_ppm: f64,
}

/// One round-trip measurement. Times are WallClock nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub t1: i64,
    pub t2: i64,
    pub t3: i64,
    pub t4: i64,
    /// Remote minus local.
    pub offset: i64,
    pub rtt: i64,
    pub remote_precision_ns: f64,
    pub remote_max_freq_error_ppm: f64,
    pub local: LocalClockParams,
    pub quality: CandidateQuality,
    /// Root clock nanoseconds when T4 was taken; dispersion ages from here.
    pub measured_at: f64,
}

impl Candidate {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        t1: i64,
        t2: i64,
        t3: i64,
        t4: i64,
        remote_precision_ns: f64,
        remote_max_freq_error_ppm: f64,
        local: LocalClockParams,
        quality: CandidateQuality,
        measured_at: f64,
    ) -> Self {
        Candidate {
            t1,
            t2,
            t3,
            t4,
            offset: ((t2 - t1) + (t3 - t4)) / 2,
            rtt: (t4 - t1) - (t3 - t2),
            remote_precision_ns,
            remote_max_freq_error_ppm,
            local,
            quality,
            measured_at,
        }
    }

    /// Returns None for requests.
    pub fn from_message(msg: &WcMessage, t4: i64, local: LocalClockParams, measured_at: f64) -> Option<Self> {
        let quality = match msg.message_type {
            WcMessageType::Request => return None,
            WcMessageType::Response => CandidateQuality::Response,
            WcMessageType::ResponseWithFollowUp => CandidateQuality::ResponseWithFollowUp,
            WcMessageType::FollowUp => CandidateQuality::FollowUp,
        };
        Some(Candidate::new(
            msg.originate.to_nanos(),
            msg.receive.to_nanos(),
            msg.transmit.to_nanos(),
            t4,
            msg.precision_nanos(),
            msg.max_freq_error_ppm(),
            local,
            quality,
            measured_at,
        ))
    }

    /// True if this is the follow-up to `provisional`: same exchange, precise T3.
    pub fn supersedes(&self, provisional: &Candidate) -> bool {
        self.quality == CandidateQuality::FollowUp
            && provisional.quality == CandidateQuality::ResponseWithFollowUp
            && self.t1 == provisional.t1
            && self.t4 == provisional.t4
    }

    /// Dispersion at the moment of measurement, in nanoseconds.
    pub fn base_dispersion(&self) -> f64 {
        self.remote_precision_ns + self.local.precision_ns + self.rtt.max(0) as f64 / 2.0
    }

    /// Combined drift bound, in ppm.
    pub fn error_rate_ppm(&self) -> f64 {
        self.remote_max_freq_error_ppm + self.local.max_freq_error_ppm
    }

    /// Dispersion at root clock time `now` (nanoseconds).
    pub fn dispersion_at(&self, now: f64) -> f64 {
        let elapsed = (now - self.measured_at).max(0.0);
        self.base_dispersion() + self.error_rate_ppm() * elapsed / 1_000_000.0
    }

    /// Root clock time at which dispersion grows to `target`, if it ever does.
    pub fn expiration_time(&self, target: f64) -> Option<f64> {
        let base = self.base_dispersion();
        if target <= base {
            return Some(self.measured_at);
        }
        let rate = self.error_rate_ppm();
        if rate <= 0.0 {
            return None;
        }
        Some(self.measured_at + (target - base) * 1_000_000.0 / rate)
    }
}
