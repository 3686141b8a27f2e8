use super::candidate::{Candidate, LocalClockParams};
use super::message::{WcMessage, WcMessageType};
use super::sink::CandidateSender;
use super::{WallClockStatus, WcEvent, WcEvents};
use crate::clock::{Clock, TunableClock};
use crate::config::WallClockConfig;
use crate::traits::WcTransport;
use crate::worker::{StopSignal, Worker, WorkerRegistry};
use anyhow::Result;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum WcClientState {
    #[default]
    Idle,
    Sending,
    WaitingResponse,
    Backoff,
    ConnectionFailure,
    Stopped,
}

/// Reads the WallClock and its root at one instant.
/// Returns (WallClock nanoseconds, root nanoseconds).
fn stamp(wallclock: &TunableClock) -> (i64, f64) {
    let parent = wallclock.parent_clock();
    let parent_ticks = parent.precise_ticks();
    let wc_ticks = wallclock.from_parent_ticks(parent_ticks);
    (wallclock.ticks_to_nanos(wc_ticks).round() as i64, parent.ticks_to_nanos(parent_ticks))
}

/// Returns true if the state changed.
fn set_state(status: &RwLock<WallClockStatus>, state: WcClientState) -> bool {
    match status.write() {
        Ok(mut s) if s.state != state => {
            s.state = state;
            true
        }
        _ => false,
    }
}

fn announce(status: &RwLock<WallClockStatus>, events: &WcEvents, state: WcClientState) {
    if set_state(status, state) {
        events.notify(WcEvent::StateChanged(state));
    }
}

/// One request/response attempt. Every valid response that arrives before
/// the deadline becomes a candidate, including late answers to earlier
/// requests. Returns true if the answer to this request arrived.
pub(crate) fn perform_exchange(
    transport: &mut dyn WcTransport,
    wallclock: &TunableClock,
    config: &WallClockConfig,
    sender: &CandidateSender,
    status: &RwLock<WallClockStatus>,
) -> Result<bool> {
    let local = LocalClockParams {
        precision_ns: config.local_precision_ns,
        max_freq_error_ppm: config.local_max_freq_error_ppm,
    };

    set_state(status, WcClientState::Sending);
    let (t1, _) = stamp(wallclock);
    let request = WcMessage::request(t1, local.precision_ns, local.max_freq_error_ppm);
    transport.send(&request.encode())?;

    set_state(status, WcClientState::WaitingResponse);
    let deadline = Instant::now() + config.response_timeout();
    let mut answered = false;
    // T4 of a response that promised a follow-up; the follow-up reuses it.
    let mut followup_stamp: Option<(i64, f64)> = None;

    loop {
        let now = Instant::now();
        if now >= deadline {
            return Ok(answered);
        }
        let Some(packet) = transport.recv(deadline - now)? else {
            return Ok(answered);
        };
        let (t4, measured_at) = stamp(wallclock);

        let msg = match WcMessage::parse(&packet) {
            Ok(m) => m,
            Err(e) => {
                debug!("[WC] Dropping packet: {}", e);
                continue;
            }
        };
        if !msg.message_type.is_response() {
            continue;
        }

        let ours = msg.originate == request.originate;
        let (t4, measured_at) = match (msg.message_type, ours, followup_stamp) {
            (WcMessageType::FollowUp, true, Some(s)) => s,
            (WcMessageType::FollowUp, _, _) => {
                debug!("[WC] Follow-up without matching response; ignored");
                continue;
            }
            _ => (t4, measured_at),
        };

        if let Some(candidate) = Candidate::from_message(&msg, t4, local, measured_at) {
            sender.submit(candidate);
        }

        if ours {
            answered = true;
            match msg.message_type {
                WcMessageType::ResponseWithFollowUp => followup_stamp = Some((t4, measured_at)),
                _ => return Ok(true),
            }
        }
    }
}

fn backoff(config: &WallClockConfig, failures: u32) -> Duration {
    let base = config.min_request_wait().max(Duration::from_millis(1));
    let factor = 1u32.checked_shl(failures.min(16)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(config.max_backoff().max(base))
}

fn request_loop(
    stop: StopSignal,
    transport: Arc<Mutex<Box<dyn WcTransport>>>,
    wallclock: Arc<TunableClock>,
    config: WallClockConfig,
    sender: CandidateSender,
    status: Arc<RwLock<WallClockStatus>>,
    events: Arc<WcEvents>,
) {
    let budget = config.max_failed_attempts.max(1);
    let mut failures = 0u32;

    while !stop.is_stopped() {
        let result = match transport.lock() {
            Ok(mut t) => perform_exchange(&mut **t, &wallclock, &config, &sender, &status),
            Err(poisoned) => {
                let mut t = poisoned.into_inner();
                perform_exchange(&mut **t, &wallclock, &config, &sender, &status)
            }
        };

        match result {
            Ok(true) => {
                if failures > 0 {
                    info!("[WC] Server responding again after {} failed attempts", failures);
                }
                failures = 0;
            }
            Ok(false) => {
                failures += 1;
                debug!("[WC] No response within {:?} ({}/{})", config.response_timeout(), failures, budget);
            }
            Err(e) => {
                failures += 1;
                warn!("[WC] Transport error: {:#} ({}/{})", e, failures, budget);
            }
        }

        if let Ok(mut s) = status.write() {
            s.consecutive_failures = failures;
        }

        if failures >= budget {
            error!("[WC] No usable response after {} attempts; giving up", failures);
            // Free-running from here on; nothing built on it can be trusted.
            wallclock.set_available(false);
            announce(&status, &events, WcClientState::ConnectionFailure);
            return;
        }

        let wait = if failures > 0 {
            announce(&status, &events, WcClientState::Backoff);
            backoff(&config, failures)
        } else {
            announce(&status, &events, WcClientState::Idle);
            status.read().map(|s| s.next_request_wait).unwrap_or(config.min_request_wait())
        };

        if stop.sleep(wait) {
            break;
        }
    }
    announce(&status, &events, WcClientState::Stopped);
}

/// Owns the request/response loop against one WallClock server.
pub struct WcProtocolClient {
    transport: Arc<Mutex<Box<dyn WcTransport>>>,
    wallclock: Arc<TunableClock>,
    config: WallClockConfig,
    status: Arc<RwLock<WallClockStatus>>,
    events: Arc<WcEvents>,
    registry: Arc<WorkerRegistry>,
    worker: Option<Worker>,
}

impl WcProtocolClient {
    pub fn new(
        transport: Box<dyn WcTransport>,
        wallclock: Arc<TunableClock>,
        config: WallClockConfig,
        status: Arc<RwLock<WallClockStatus>>,
        events: Arc<WcEvents>,
        registry: Arc<WorkerRegistry>,
    ) -> Self {
        WcProtocolClient {
            transport: Arc::new(Mutex::new(transport)),
            wallclock,
            config,
            status,
            events,
            registry,
            worker: None,
        }
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map_or(false, |w| !w.is_finished())
    }

    pub fn start(&mut self, sender: CandidateSender) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        if let Ok(mut s) = self.status.write() {
            s.consecutive_failures = 0;
        }
        self.wallclock.set_available(true);
        announce(&self.status, &self.events, WcClientState::Idle);
        let transport = self.transport.clone();
        let wallclock = self.wallclock.clone();
        let config = self.config.clone();
        let status = self.status.clone();
        let events = self.events.clone();
        self.worker = Some(Worker::spawn("wc-requests", &self.registry, move |stop| {
            request_loop(stop, transport, wallclock, config, sender, status, events)
        })?);
        Ok(())
    }

    pub fn stop(&mut self, timeout: Duration) -> bool {
        let stopped = match self.worker.take() {
            Some(mut w) => w.stop(timeout),
            None => true,
        };
        if self.status.read().map_or(false, |s| s.state != WcClientState::ConnectionFailure) {
            announce(&self.status, &self.events, WcClientState::Stopped);
        }
        stopped
    }
}

impl Drop for WcProtocolClient {
    fn drop(&mut self) {
        self.stop(crate::worker::DEFAULT_STOP_TIMEOUT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualTimeSource, SystemClock};
    use crate::traits::MockWcTransport;
    use crossbeam_channel::{bounded, Receiver};

    const OFFSET: i64 = 7_000_000_000;

    fn setup() -> (Arc<ManualTimeSource>, Arc<TunableClock>) {
        let src = Arc::new(ManualTimeSource::new(2_000_000_000));
        let root = Arc::new(SystemClock::with_source(1_000_000_000, src.clone()));
        (src, Arc::new(TunableClock::new(root, 1_000_000_000, 0)))
    }

    fn channel() -> (CandidateSender, Receiver<Candidate>, Arc<RwLock<WallClockStatus>>) {
        let status = Arc::new(RwLock::new(WallClockStatus::default()));
        let (tx, rx) = bounded(16);
        (CandidateSender::new(tx, status.clone()), rx, status)
    }

    fn reply(request: &[u8], kind: WcMessageType, t2: i64, t3: i64) -> Vec<u8> {
        let req = WcMessage::parse(request).unwrap();
        WcMessage::response_to(&req, kind, t2, t3, 1000.0, 50.0).encode().to_vec()
    }

    #[test]
    fn test_exchange_builds_candidate() {
        let (_src, wc) = setup();
        let (sender, rx, status) = channel();
        let sent = Arc::new(Mutex::new(Vec::new()));

        let mut transport = MockWcTransport::new();
        let s = sent.clone();
        transport.expect_send().times(1).returning(move |p| {
            *s.lock().unwrap() = p.to_vec();
            Ok(())
        });
        let s = sent.clone();
        transport.expect_recv().times(1).returning(move |_| {
            Ok(Some(reply(&s.lock().unwrap(), WcMessageType::Response, OFFSET, OFFSET)))
        });

        let answered = perform_exchange(&mut transport, &wc, &WallClockConfig::default(), &sender, &status).unwrap();
        assert!(answered);
        let c = rx.try_recv().unwrap();
        // Manual time does not move: T1 == T4 == 0
        assert_eq!(c.offset, OFFSET);
        assert_eq!(c.rtt, 0);
        assert_eq!(c.measured_at, 2_000_000_000.0);
    }

    #[test]
    fn test_malformed_and_stale_packets() {
        let (_src, wc) = setup();
        let (sender, rx, status) = channel();
        let sent = Arc::new(Mutex::new(Vec::new()));

        let mut transport = MockWcTransport::new();
        let s = sent.clone();
        transport.expect_send().returning(move |p| {
            *s.lock().unwrap() = p.to_vec();
            Ok(())
        });
        let mut seq = mockall::Sequence::new();
        transport.expect_recv().times(1).in_sequence(&mut seq).returning(|_| Ok(Some(vec![0u8; 12])));
        transport.expect_recv().times(1).in_sequence(&mut seq).returning(|_| {
            // Late answer to an earlier request: still a measurement, but not ours.
            let old = WcMessage::request(1, 1000.0, 50.0);
            Ok(Some(WcMessage::response_to(&old, WcMessageType::Response, 10, 11, 1000.0, 50.0).encode().to_vec()))
        });
        let s = sent.clone();
        transport.expect_recv().times(1).in_sequence(&mut seq).returning(move |_| {
            Ok(Some(reply(&s.lock().unwrap(), WcMessageType::Response, 100, 100)))
        });

        assert!(perform_exchange(&mut transport, &wc, &WallClockConfig::default(), &sender, &status).unwrap());
        assert_eq!(rx.len(), 2);
    }

    #[test]
    fn test_timeout_reports_unanswered() {
        let (_src, wc) = setup();
        let (sender, rx, status) = channel();
        let mut transport = MockWcTransport::new();
        transport.expect_send().returning(|_| Ok(()));
        transport.expect_recv().returning(|_| Ok(None));

        assert!(!perform_exchange(&mut transport, &wc, &WallClockConfig::default(), &sender, &status).unwrap());
        assert!(rx.is_empty());
    }

    #[test]
    fn test_followup_reuses_response_arrival_time() {
        let (src, wc) = setup();
        let (sender, rx, status) = channel();
        let sent = Arc::new(Mutex::new(Vec::new()));
        let source = src.clone();

        let mut transport = MockWcTransport::new();
        let s = sent.clone();
        transport.expect_send().returning(move |p| {
            *s.lock().unwrap() = p.to_vec();
            Ok(())
        });
        let mut seq = mockall::Sequence::new();
        let s = sent.clone();
        transport.expect_recv().times(1).in_sequence(&mut seq).returning(move |_| {
            Ok(Some(reply(&s.lock().unwrap(), WcMessageType::ResponseWithFollowUp, 500, 900)))
        });
        let s = sent.clone();
        transport.expect_recv().times(1).in_sequence(&mut seq).returning(move |_| {
            // The follow-up arrives much later; its own arrival time must not be used.
            source.advance(1_000_000);
            Ok(Some(reply(&s.lock().unwrap(), WcMessageType::FollowUp, 500, 600)))
        });

        assert!(perform_exchange(&mut transport, &wc, &WallClockConfig::default(), &sender, &status).unwrap());
        let first = rx.try_recv().unwrap();
        let follow = rx.try_recv().unwrap();
        assert_eq!(first.t4, follow.t4);
        assert_eq!(follow.t3, 600);
        assert!(follow.rtt < 1_000_000);
    }

    #[test]
    fn test_failure_budget_ends_in_connection_failure() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (_src, wc) = setup();
        let (sender, _rx, status) = channel();
        let registry = WorkerRegistry::new();

        let mut transport = MockWcTransport::new();
        transport.expect_send().returning(|_| Err(anyhow::anyhow!("network unreachable")));

        let config = WallClockConfig {
            max_failed_attempts: 3,
            min_request_wait_ms: 1,
            max_backoff_ms: 4,
            ..WallClockConfig::default()
        };
        let events = WcEvents::new();
        let changes = events.subscribe();
        let mut client = WcProtocolClient::new(Box::new(transport), wc.clone(), config, status.clone(), events, registry.clone());
        client.start(sender).unwrap();
        assert!(wc.is_available());

        let deadline = Instant::now() + Duration::from_secs(2);
        let mut seen = Vec::new();
        while Instant::now() < deadline {
            if let Ok(WcEvent::StateChanged(state)) = changes.recv_timeout(Duration::from_millis(50)) {
                seen.push(state);
                if state == WcClientState::ConnectionFailure {
                    break;
                }
            }
        }
        assert_eq!(seen.last(), Some(&WcClientState::ConnectionFailure));
        assert!(seen.contains(&WcClientState::Backoff));
        assert_eq!(status.read().unwrap().state, WcClientState::ConnectionFailure);
        assert_eq!(status.read().unwrap().consecutive_failures, 3);
        // Anything derived from the WallClock now reports unavailable.
        assert!(!wc.is_available());
        assert!(client.stop(Duration::from_secs(1)));
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let config = WallClockConfig { min_request_wait_ms: 100, max_backoff_ms: 500, ..WallClockConfig::default() };
        assert_eq!(backoff(&config, 1), Duration::from_millis(200));
        assert_eq!(backoff(&config, 2), Duration::from_millis(400));
        assert_eq!(backoff(&config, 3), Duration::from_millis(500));
        assert_eq!(backoff(&config, 40), Duration::from_millis(500));
    }
}
