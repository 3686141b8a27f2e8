use super::candidate::Candidate;
use log::debug;

/// One predicate in the candidate filter chain.
#[cfg_attr(test, mockall::automock)]
pub trait CandidateFilter: Send {
    fn name(&self) -> &'static str;

    /// True if the candidate may proceed.
    fn check(&self, candidate: &Candidate) -> bool;

    /// Called once a candidate has passed every filter in the chain.
    fn on_accepted(&mut self, _candidate: &Candidate) {}
}

/// Rejects measurements whose round trip took too long to be trusted.
pub struct RttThresholdFilter {
    threshold_ns: i64,
}

impl RttThresholdFilter {
    pub fn new(threshold_ns: i64) -> Self {
        RttThresholdFilter { threshold_ns }
    }
}

impl CandidateFilter for RttThresholdFilter {
    fn name(&self) -> &'static str {
        "rtt-threshold"
    }

    fn check(&self, candidate: &Candidate) -> bool {
        let ok = candidate.rtt <= self.threshold_ns;
        if !ok {
            debug!("[WC] RTT {}ns over threshold {}ns", candidate.rtt, self.threshold_ns);
        }
        ok
    }
}

/// Passes only candidates that improve on the best one seen so far, both
/// evaluated at the new candidate's measurement time. A follow-up to the
/// current best always passes, since it replaces that measurement.
#[derive(Default)]
pub struct LowestDispersionFilter {
    best: Option<Candidate>,
}

impl LowestDispersionFilter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CandidateFilter for LowestDispersionFilter {
    fn name(&self) -> &'static str {
        "lowest-dispersion"
    }

    fn check(&self, candidate: &Candidate) -> bool {
        match &self.best {
            None => true,
            Some(best) if candidate.supersedes(best) => true,
            Some(best) => {
                let now = candidate.measured_at;
                candidate.dispersion_at(now) < best.dispersion_at(now)
            }
        }
    }

    fn on_accepted(&mut self, candidate: &Candidate) {
        self.best = Some(*candidate);
    }
}

/// Per-filter drop counter.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FilterStats {
    pub name: String,
    pub dropped: u64,
}

/// Ordered filters. A candidate is eligible only if every filter passes it;
/// the first rejecting filter is charged with the drop.
pub struct FilterChain {
    filters: Vec<Box<dyn CandidateFilter>>,
    dropped: Vec<u64>,
}

impl FilterChain {
    pub fn new(filters: Vec<Box<dyn CandidateFilter>>) -> Self {
        let dropped = vec![0; filters.len()];
        FilterChain { filters, dropped }
    }

    /// The standard chain: RTT threshold, then lowest dispersion.
    pub fn standard(rtt_threshold_ns: i64) -> Self {
        let filters: Vec<Box<dyn CandidateFilter>> = vec![
            Box::new(RttThresholdFilter::new(rtt_threshold_ns)),
            Box::new(LowestDispersionFilter::new()),
        ];
        Self::new(filters)
    }

    pub fn evaluate(&mut self, candidate: &Candidate) -> bool {
        for (i, filter) in self.filters.iter().enumerate() {
            if !filter.check(candidate) {
                self.dropped[i] += 1;
                return false;
            }
        }
        for filter in self.filters.iter_mut() {
            filter.on_accepted(candidate);
        }
        true
    }

    pub fn stats(&self) -> Vec<FilterStats> {
        self.filters
            .iter()
            .zip(&self.dropped)
            .map(|(f, d)| FilterStats { name: f.name().to_string(), dropped: *d })
            .collect()
    }

    pub fn total_dropped(&self) -> u64 {
        self.dropped.iter().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallclock::candidate::{CandidateQuality, LocalClockParams};

    const LOCAL: LocalClockParams = LocalClockParams { precision_ns: 100.0, max_freq_error_ppm: 0.0 };

    fn with_rtt(rtt: i64, measured_at: f64) -> Candidate {
        Candidate::new(0, 0, 0, rtt, 100.0, 0.0, LOCAL, CandidateQuality::Response, measured_at)
    }

    #[test]
    fn test_rtt_over_threshold_always_rejected() {
        let mut chain = FilterChain::standard(1_000_000);
        // Even as the very first candidate, when lowest-dispersion would pass it.
        assert!(!chain.evaluate(&with_rtt(1_000_001, 0.0)));
        assert!(!chain.evaluate(&with_rtt(50_000_000, 1.0)));
        assert!(chain.evaluate(&with_rtt(1_000_000, 2.0)));
        assert_eq!(chain.stats()[0].dropped, 2);
        assert_eq!(chain.stats()[1].dropped, 0);
    }

    #[test]
    fn test_lowest_dispersion_requires_strict_improvement() {
        let mut chain = FilterChain::standard(i64::MAX);
        assert!(chain.evaluate(&with_rtt(1000, 0.0)));
        assert!(!chain.evaluate(&with_rtt(1000, 1.0)));
        assert!(!chain.evaluate(&with_rtt(5000, 2.0)));
        assert!(chain.evaluate(&with_rtt(800, 3.0)));
        assert_eq!(chain.stats()[1].dropped, 2);
        assert_eq!(chain.total_dropped(), 2);
    }

    #[test]
    fn test_rejected_candidate_does_not_become_best() {
        let make = |rtt: i64, remote_precision: f64, at: f64| {
            Candidate::new(0, 0, 0, rtt, remote_precision, 0.0, LOCAL, CandidateQuality::Response, at)
        };
        let mut chain = FilterChain::standard(2000);
        assert!(chain.evaluate(&make(1500, 5000.0, 0.0)));
        // Far lower dispersion, but over the RTT threshold: must not become the best.
        assert!(!chain.evaluate(&make(2500, 0.0, 1.0)));
        assert!(chain.evaluate(&make(1400, 5000.0, 2.0)));
    }

    #[test]
    fn test_followup_passes_despite_higher_dispersion() {
        let make = |quality, t3: i64| Candidate::new(-1000, 500, t3, 0, 100.0, 0.0, LOCAL, quality, 0.0);
        let mut chain = FilterChain::standard(i64::MAX);
        assert!(chain.evaluate(&make(CandidateQuality::ResponseWithFollowUp, 900)));
        // Earlier precise T3 means a longer round trip, but it is the same exchange.
        let followup = make(CandidateQuality::FollowUp, 600);
        assert!(followup.rtt > make(CandidateQuality::ResponseWithFollowUp, 900).rtt);
        assert!(chain.evaluate(&followup));
        // A plain response of the same shape still has to improve on it.
        assert!(!chain.evaluate(&make(CandidateQuality::Response, 600)));
    }

    #[test]
    fn test_on_accepted_only_after_full_pass() {
        let mut first = MockCandidateFilter::new();
        first.expect_check().returning(|_| true);
        first.expect_on_accepted().times(1).return_const(());
        first.expect_name().return_const("first");

        let mut second = MockCandidateFilter::new();
        let mut n = 0;
        second.expect_check().returning(move |_| {
            n += 1;
            n == 2
        });
        second.expect_on_accepted().times(1).return_const(());
        second.expect_name().return_const("second");

        let filters: Vec<Box<dyn CandidateFilter>> = vec![Box::new(first), Box::new(second)];
        let mut chain = FilterChain::new(filters);
        assert!(!chain.evaluate(&with_rtt(10, 0.0)));
        assert!(chain.evaluate(&with_rtt(10, 0.0)));
        assert_eq!(chain.stats()[1], FilterStats { name: "second".into(), dropped: 1 });
    }
}
