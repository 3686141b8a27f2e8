//! WallClock synchronisation engine.
//!
//! A [`WcProtocolClient`](client::WcProtocolClient) exchanges request/response
//! packets with the server and turns every valid response into a
//! [`Candidate`](candidate::Candidate). Candidates flow through a bounded
//! queue into a single [`CandidateSink`](sink::CandidateSink) worker, which
//! runs the filter chain and the algorithm and is the only code that adjusts
//! the local [`TunableClock`].

pub mod algorithm;
pub mod candidate;
pub mod client;
pub mod filter;
pub mod message;
pub mod sink;

use crate::clock::{Clock, TunableClock};
use crate::config::WallClockConfig;
use crate::traits::WcTransport;
use crate::worker::WorkerRegistry;
use algorithm::{LowestDispersionAlgorithm, RequestPacing};
use anyhow::Result;
use candidate::Candidate;
use client::{WcClientState, WcProtocolClient};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use filter::{FilterChain, FilterStats};
use log::info;
use sink::{CandidatePipeline, CandidateSink};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

const EVENT_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcEvent {
    StateChanged(WcClientState),
    /// The candidate worker has published the outcome of one more candidate.
    CandidateProcessed,
}

/// Fans engine events out to subscribers over bounded channels.
/// A subscriber that falls behind misses events rather than blocking the engine.
#[derive(Default)]
pub struct WcEvents {
    listeners: Mutex<Vec<Sender<WcEvent>>>,
}

impl WcEvents {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn subscribe(&self) -> Receiver<WcEvent> {
        let (tx, rx) = bounded(EVENT_QUEUE_DEPTH);
        if let Ok(mut l) = self.listeners.lock() {
            l.push(tx);
        }
        rx
    }

    pub(crate) fn notify(&self, event: WcEvent) {
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|tx| !matches!(tx.try_send(event), Err(TrySendError::Disconnected(_))));
        }
    }
}

/// Published by the candidate worker and the request loop.
#[derive(Debug, Clone, Default)]
pub struct WallClockStatus {
    pub state: WcClientState,
    pub candidates_received: u64,
    pub candidates_useful: u64,
    pub candidates_dropped: u64,
    pub candidates_ignored: u64,
    pub queue_overflows: u64,
    pub filter_drops: Vec<FilterStats>,
    pub best: Option<Candidate>,
    pub last_offset_ns: Option<i64>,
    /// Root clock nanoseconds.
    pub last_useful_at: Option<f64>,
    pub mean_useful_interval_ns: Option<f64>,
    pub next_request_wait: Duration,
    pub consecutive_failures: u32,
}

impl WallClockStatus {
    pub fn dropped_percent(&self) -> f64 {
        percent(self.candidates_dropped, self.candidates_received)
    }

    pub fn useful_percent(&self) -> f64 {
        percent(self.candidates_useful, self.candidates_received)
    }
}

fn percent(part: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        part as f64 * 100.0 / total as f64
    }
}

pub struct WallClockSynchroniser {
    wallclock: Arc<TunableClock>,
    client: WcProtocolClient,
    sink: CandidateSink,
    status: Arc<RwLock<WallClockStatus>>,
    events: Arc<WcEvents>,
}

impl WallClockSynchroniser {
    /// Standard chain (RTT threshold, lowest dispersion) and the
    /// lowest-dispersion algorithm, both configured from `config`.
    pub fn new(
        wallclock: Arc<TunableClock>,
        transport: Box<dyn WcTransport>,
        config: WallClockConfig,
        registry: Arc<WorkerRegistry>,
    ) -> Self {
        let pacing = RequestPacing {
            min_wait: config.min_request_wait(),
            max_wait: config.max_request_wait(),
            target_dispersion_ns: config.accuracy_target_ms * 1_000_000.0,
        };
        let pipeline = CandidatePipeline::new(
            FilterChain::standard(config.rtt_threshold_ns()),
            Box::new(LowestDispersionAlgorithm::new(wallclock.clone(), pacing)),
        );
        Self::with_pipeline(wallclock, transport, pipeline, config, registry)
    }

    pub fn with_pipeline(
        wallclock: Arc<TunableClock>,
        transport: Box<dyn WcTransport>,
        pipeline: CandidatePipeline,
        config: WallClockConfig,
        registry: Arc<WorkerRegistry>,
    ) -> Self {
        let status = Arc::new(RwLock::new(WallClockStatus {
            next_request_wait: config.min_request_wait(),
            ..WallClockStatus::default()
        }));
        let events = WcEvents::new();
        let reference = wallclock.parent_clock().clone();
        let sink = CandidateSink::new(
            pipeline,
            config.queue_capacity,
            reference,
            status.clone(),
            events.clone(),
            registry.clone(),
        );
        let client = WcProtocolClient::new(transport, wallclock.clone(), config, status.clone(), events.clone(), registry);
        WallClockSynchroniser { wallclock, client, sink, status, events }
    }

    pub fn wallclock(&self) -> &Arc<TunableClock> {
        &self.wallclock
    }

    /// Client state changes and candidate progress.
    pub fn subscribe(&self) -> Receiver<WcEvent> {
        self.events.subscribe()
    }

    pub fn start(&mut self) -> Result<()> {
        info!("[WC] Starting WallClock synchronisation");
        self.sink.start()?;
        self.client.start(self.sink.sender())
    }

    /// Stops sending requests. The best candidate and clock state remain.
    pub fn pause(&mut self, timeout: Duration) -> bool {
        self.client.stop(timeout)
    }

    pub fn stop(&mut self, timeout: Duration) -> bool {
        let client = self.client.stop(timeout);
        let sink = self.sink.stop(timeout);
        info!("[WC] WallClock synchronisation stopped");
        client && sink
    }

    pub fn is_running(&self) -> bool {
        self.client.is_running()
    }

    pub fn status(&self) -> WallClockStatus {
        match self.status.read() {
            Ok(s) => s.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn best_candidate(&self) -> Option<Candidate> {
        self.status().best
    }

    pub fn candidate_offset(&self) -> Option<i64> {
        self.status().last_offset_ns
    }

    /// Dispersion of the best candidate now, in nanoseconds.
    pub fn current_dispersion(&self) -> Option<f64> {
        let reference = self.wallclock.parent_clock();
        let now = reference.ticks_to_nanos(reference.precise_ticks());
        self.best_candidate().map(|c| c.dispersion_at(now))
    }

    /// Blocks until the current dispersion is below `threshold`.
    /// Gives up early once the client has reported a connection failure.
    pub fn wait_for_dispersion(&self, threshold: Duration, timeout: Duration) -> bool {
        let limit = threshold.as_nanos() as f64;
        let deadline = Instant::now() + timeout;
        // Subscribed before the first check so no update slips between them.
        let events = self.subscribe();
        loop {
            if self.current_dispersion().map_or(false, |d| d < limit) {
                return true;
            }
            if self.status().state == WcClientState::ConnectionFailure {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            // Any event, or the deadline, is a reason to look again.
            let _ = events.recv_timeout(deadline - now);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::message::{WcMessage, WcMessageType};
    use super::*;
    use crate::clock::SystemClock;

    /// Answers each request immediately from a clock running `offset` ahead.
    struct LoopbackServer {
        clock: Arc<SystemClock>,
        offset: i64,
        pending: Option<Vec<u8>>,
    }

    impl WcTransport for LoopbackServer {
        fn send(&mut self, packet: &[u8]) -> Result<()> {
            let req = WcMessage::parse(packet)?;
            let now = self.clock.nanos() + self.offset;
            let resp = WcMessage::response_to(&req, WcMessageType::Response, now, now, 1000.0, 10.0);
            self.pending = Some(resp.encode().to_vec());
            Ok(())
        }

        fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
            match self.pending.take() {
                Some(p) => Ok(Some(p)),
                None => {
                    std::thread::sleep(timeout.min(Duration::from_millis(5)));
                    Ok(None)
                }
            }
        }
    }

    fn engine(registry: &Arc<WorkerRegistry>) -> (Arc<SystemClock>, WallClockSynchroniser) {
        let root = Arc::new(SystemClock::new(1_000_000_000));
        let wc = Arc::new(TunableClock::new(root.clone(), 1_000_000_000, 0));
        let server = LoopbackServer { clock: root.clone(), offset: 3_000_000_000, pending: None };
        let config = WallClockConfig { min_request_wait_ms: 5, max_request_wait_ms: 20, ..WallClockConfig::default() };
        (root.clone(), WallClockSynchroniser::new(wc, Box::new(server), config, registry.clone()))
    }

    #[test]
    fn test_converges_on_server_clock() {
        let _ = env_logger::builder().is_test(true).try_init();
        let registry = WorkerRegistry::new();
        let (root, mut engine) = engine(&registry);
        engine.start().unwrap();
        assert_eq!(registry.active(), 2);

        assert!(engine.wait_for_dispersion(Duration::from_millis(5), Duration::from_secs(2)));
        let ahead = engine.wallclock().nanos() - root.nanos();
        assert!((ahead - 3_000_000_000).abs() < 5_000_000, "ahead by {}", ahead);

        let status = engine.status();
        assert!(status.candidates_useful >= 1);
        assert!(status.useful_percent() > 0.0);
        assert!(engine.candidate_offset().is_some());

        assert!(engine.stop(Duration::from_secs(1)));
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn test_pause_keeps_best_candidate() {
        let registry = WorkerRegistry::new();
        let (_root, mut engine) = engine(&registry);
        engine.start().unwrap();
        assert!(engine.wait_for_dispersion(Duration::from_millis(5), Duration::from_secs(2)));

        assert!(engine.pause(Duration::from_secs(1)));
        assert!(!engine.is_running());
        assert_eq!(registry.active(), 1);
        assert!(engine.best_candidate().is_some());
        assert!(engine.current_dispersion().is_some());
        engine.stop(Duration::from_secs(1));
    }

    #[test]
    fn test_wait_times_out_without_server() {
        let registry = WorkerRegistry::new();
        let root = Arc::new(SystemClock::new(1_000_000_000));
        let wc = Arc::new(TunableClock::new(root, 1_000_000_000, 0));
        let engine = WallClockSynchroniser::new(wc, Box::new(crate::traits::MockWcTransport::new()), WallClockConfig::default(), registry);
        // Never started.
        assert!(!engine.wait_for_dispersion(Duration::from_millis(5), Duration::from_millis(30)));
        assert_eq!(engine.current_dispersion(), None);
    }

    #[test]
    fn test_wait_ends_as_soon_as_server_is_given_up() {
        let _ = env_logger::builder().is_test(true).try_init();
        let registry = WorkerRegistry::new();
        let root = Arc::new(SystemClock::new(1_000_000_000));
        let wc = Arc::new(TunableClock::new(root, 1_000_000_000, 0));
        let mut transport = crate::traits::MockWcTransport::new();
        transport.expect_send().returning(|_| Err(anyhow::anyhow!("host unreachable")));
        let config = WallClockConfig {
            max_failed_attempts: 2,
            min_request_wait_ms: 1,
            max_backoff_ms: 2,
            ..WallClockConfig::default()
        };
        let mut engine = WallClockSynchroniser::new(wc.clone(), Box::new(transport), config, registry.clone());
        let events = engine.subscribe();
        engine.start().unwrap();

        let started = Instant::now();
        assert!(!engine.wait_for_dispersion(Duration::from_millis(5), Duration::from_secs(30)));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(engine.status().state, WcClientState::ConnectionFailure);
        assert!(events.try_iter().any(|e| e == WcEvent::StateChanged(WcClientState::ConnectionFailure)));
        assert!(!wc.is_available());

        assert!(engine.stop(Duration::from_secs(1)));
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn test_percentages() {
        let status = WallClockStatus { candidates_received: 8, candidates_useful: 2, candidates_dropped: 6, ..Default::default() };
        assert_eq!(status.useful_percent(), 25.0);
        assert_eq!(status.dropped_percent(), 75.0);
        assert_eq!(WallClockStatus::default().useful_percent(), 0.0);
    }
}
