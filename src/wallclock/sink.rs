//! Single-consumer candidate pipeline.
//!
//! Transports submit candidates into a bounded queue; one worker drains it
//! and runs the filter chain and algorithm strictly in order. The worker is
//! the only writer of best-candidate state, and it publishes a snapshot into
//! the shared [`WallClockStatus`] after every step.

use super::algorithm::WcAlgorithm;
use super::candidate::Candidate;
use super::filter::FilterChain;
use super::{WallClockStatus, WcEvent, WcEvents};
use crate::clock::Clock;
use crate::worker::{Worker, WorkerRegistry};
use anyhow::Result;
use crossbeam_channel::{bounded, select, Receiver, Sender, TrySendError};
use log::{debug, warn};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

const IDLE_REFRESH: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Filtered,
    Ignored,
    Adopted(i64),
}

pub struct CandidatePipeline {
    filters: FilterChain,
    algorithm: Box<dyn WcAlgorithm>,
    received: u64,
    useful: u64,
    ignored: u64,
    last_useful_at: Option<f64>,
    useful_interval_sum: f64,
    useful_intervals: u64,
    last_offset: Option<i64>,
}

impl CandidatePipeline {
    pub fn new(filters: FilterChain, algorithm: Box<dyn WcAlgorithm>) -> Self {
        CandidatePipeline {
            filters,
            algorithm,
            received: 0,
            useful: 0,
            ignored: 0,
            last_useful_at: None,
            useful_interval_sum: 0.0,
            useful_intervals: 0,
            last_offset: None,
        }
    }

    pub fn process(&mut self, candidate: &Candidate) -> Outcome {
        self.received += 1;
        if !self.filters.evaluate(candidate) {
            return Outcome::Filtered;
        }
        match self.algorithm.process(candidate) {
            Some(offset) => {
                self.useful += 1;
                if let Some(prev) = self.last_useful_at {
                    self.useful_interval_sum += candidate.measured_at - prev;
                    self.useful_intervals += 1;
                }
                self.last_useful_at = Some(candidate.measured_at);
                self.last_offset = Some(offset);
                Outcome::Adopted(offset)
            }
            None => {
                self.ignored += 1;
                Outcome::Ignored
            }
        }
    }

    pub fn publish(&self, status: &mut WallClockStatus, now: f64) {
        status.candidates_received = self.received;
        status.candidates_useful = self.useful;
        status.candidates_dropped = self.filters.total_dropped();
        status.candidates_ignored = self.ignored;
        status.filter_drops = self.filters.stats();
        status.best = self.algorithm.best_candidate();
        status.last_offset_ns = self.last_offset;
        status.last_useful_at = self.last_useful_at;
        status.mean_useful_interval_ns = if self.useful_intervals > 0 {
            Some(self.useful_interval_sum / self.useful_intervals as f64)
        } else {
            None
        };
        status.next_request_wait = self.algorithm.next_request_wait(now);
    }
}

/// Producer handle onto the candidate queue.
#[derive(Clone)]
pub struct CandidateSender {
    tx: Sender<Candidate>,
    status: Arc<RwLock<WallClockStatus>>,
}

impl CandidateSender {
    pub(crate) fn new(tx: Sender<Candidate>, status: Arc<RwLock<WallClockStatus>>) -> Self {
        CandidateSender { tx, status }
    }

    /// Queues a candidate without blocking. A full queue drops it.
    pub fn submit(&self, candidate: Candidate) -> bool {
        match self.tx.try_send(candidate) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("[WC] Candidate queue full; dropping measurement");
                if let Ok(mut s) = self.status.write() {
                    s.queue_overflows += 1;
                }
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

pub struct CandidateSink {
    tx: Sender<Candidate>,
    rx: Receiver<Candidate>,
    pipeline: Arc<Mutex<CandidatePipeline>>,
    reference: Arc<dyn Clock>,
    status: Arc<RwLock<WallClockStatus>>,
    events: Arc<WcEvents>,
    registry: Arc<WorkerRegistry>,
    worker: Option<Worker>,
}

impl CandidateSink {
    pub fn new(
        pipeline: CandidatePipeline,
        capacity: usize,
        reference: Arc<dyn Clock>,
        status: Arc<RwLock<WallClockStatus>>,
        events: Arc<WcEvents>,
        registry: Arc<WorkerRegistry>,
    ) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        CandidateSink {
            tx,
            rx,
            pipeline: Arc::new(Mutex::new(pipeline)),
            reference,
            status,
            events,
            registry,
            worker: None,
        }
    }

    pub fn sender(&self) -> CandidateSender {
        CandidateSender::new(self.tx.clone(), self.status.clone())
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map_or(false, |w| !w.is_finished())
    }

    pub fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let rx = self.rx.clone();
        let pipeline = self.pipeline.clone();
        let reference = self.reference.clone();
        let status = self.status.clone();
        let events = self.events.clone();

        let worker = Worker::spawn("wc-candidates", &self.registry, move |stop| {
            let mut pipeline = match pipeline.lock() {
                Ok(p) => p,
                Err(poisoned) => poisoned.into_inner(),
            };
            let publish = |pipeline: &CandidatePipeline| {
                let now = reference.ticks_to_nanos(reference.precise_ticks());
                if let Ok(mut s) = status.write() {
                    pipeline.publish(&mut s, now);
                }
            };

            loop {
                select! {
                    recv(rx) -> msg => match msg {
                        Ok(candidate) => {
                            let outcome = pipeline.process(&candidate);
                            debug!("[WC] Candidate offset={}ns rtt={}ns -> {:?}", candidate.offset, candidate.rtt, outcome);
                            publish(&*pipeline);
                            events.notify(WcEvent::CandidateProcessed);
                        }
                        Err(_) => break,
                    },
                    recv(stop.receiver()) -> _ => break,
                    default(IDLE_REFRESH) => publish(&*pipeline),
                }
            }
        })?;
        self.worker = Some(worker);
        Ok(())
    }

    /// Stops the worker with a bounded wait and discards queued candidates.
    pub fn stop(&mut self, timeout: Duration) -> bool {
        let stopped = match self.worker.take() {
            Some(mut w) => w.stop(timeout),
            None => true,
        };
        let drained = self.rx.try_iter().count();
        if drained > 0 {
            debug!("[WC] Discarded {} queued candidates on stop", drained);
        }
        stopped
    }
}

impl Drop for CandidateSink {
    fn drop(&mut self) {
        self.stop(crate::worker::DEFAULT_STOP_TIMEOUT);
    }
}
