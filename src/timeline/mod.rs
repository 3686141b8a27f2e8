//! Timeline Synchronisation engine.
//!
//! Maintains a [`CorrelatedClock`] whose parent is the synchronised
//! WallClock and rebases it on every control timestamp, so between updates
//! the clock keeps projecting the TV's content position forward.

pub mod client;
pub mod message;

use crate::cii::TimelineOption;
use crate::clock::{Clock, CorrelatedClock, Correlation};
use crate::config::TimelineConfig;
use crate::traits::TsTransport;
use crate::worker::WorkerRegistry;
use anyhow::Result;
use client::{TsClient, TsClientEvent, TsClientState};
use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use log::{debug, info, warn};
use message::{ControlTimestamp, SetupMessage};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

const STATE_QUEUE_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TsState {
    #[default]
    Initialised,
    Connected,
    TimelineSetup,
    Synced,
    ConnectionFailure,
    Stopped,
    TimelineUnavailable,
}

/// State shared between the engine handle and the client's I/O thread.
struct TimelineShared {
    timeline: Arc<CorrelatedClock>,
    wallclock: Arc<dyn Clock>,
    offset_ns: f64,
    state: RwLock<TsState>,
    listeners: Mutex<Vec<Sender<TsState>>>,
    last: RwLock<Option<ControlTimestamp>>,
    applied: AtomicU64,
}

impl TimelineShared {
    fn state(&self) -> TsState {
        self.state.read().map(|s| *s).unwrap_or(TsState::Stopped)
    }

    fn set_state(&self, state: TsState) {
        match self.state.write() {
            Ok(mut s) if *s != state => *s = state,
            _ => return,
        }
        info!("[TS] State -> {:?}", state);
        if let Ok(mut listeners) = self.listeners.lock() {
            listeners.retain(|tx| !matches!(tx.try_send(state), Err(TrySendError::Disconnected(_))));
        }
    }

    fn apply(&self, ct: &ControlTimestamp) {
        if let Ok(mut last) = self.last.write() {
            *last = Some(*ct);
        }
        match ct.content_time {
            None => {
                debug!("[TS] Timeline unavailable at wallClockTime={}", ct.wall_clock_time);
                self.timeline.set_available(false);
                self.set_state(TsState::TimelineUnavailable);
            }
            Some(content) => {
                let wall = ct.wall_clock_time as f64 + self.offset_ns;
                let parent_ticks = self.wallclock.nanos_to_ticks(wall);
                self.timeline
                    .set_correlation_and_speed(Correlation::new(parent_ticks, content as f64), ct.speed());
                self.timeline.set_available(true);
                if self.applied.fetch_add(1, Ordering::Relaxed) == 0 {
                    info!("[TS] First control timestamp: contentTime={} wallClockTime={}", content, ct.wall_clock_time);
                }
                self.set_state(TsState::Synced);
            }
        }
    }

    fn on_client_event(&self, event: TsClientEvent) {
        match event {
            TsClientEvent::ControlTimestamp(ct) => self.apply(&ct),
            TsClientEvent::StateChanged(state) => match state {
                TsClientState::Connected => self.set_state(TsState::Connected),
                TsClientState::TimelineSetup => self.set_state(TsState::TimelineSetup),
                TsClientState::ConnectionFailure => {
                    warn!("[TS] Connection failure; timeline marked unavailable");
                    self.timeline.set_available(false);
                    self.set_state(TsState::ConnectionFailure);
                }
                TsClientState::Stopped => self.set_state(TsState::Stopped),
                TsClientState::Initialised | TsClientState::Connecting | TsClientState::Running => {}
            },
        }
    }
}

pub struct TimelineSynchroniser {
    shared: Arc<TimelineShared>,
    client: TsClient,
    selector: String,
}

impl TimelineSynchroniser {
    /// `wallclock` becomes the parent of the managed timeline clock.
    pub fn new(
        wallclock: Arc<dyn Clock>,
        transport: Box<dyn TsTransport>,
        content_id_stem: &str,
        timeline: &TimelineOption,
        config: TimelineConfig,
        registry: Arc<WorkerRegistry>,
    ) -> Self {
        let clock = Arc::new(CorrelatedClock::new(wallclock.clone(), timeline.tick_rate(), Correlation::default()));
        clock.set_available(false);
        let shared = Arc::new(TimelineShared {
            timeline: clock,
            wallclock,
            offset_ns: config.wallclock_offset_ns(),
            state: RwLock::new(TsState::Initialised),
            listeners: Mutex::new(Vec::new()),
            last: RwLock::new(None),
            applied: AtomicU64::new(0),
        });
        let setup = SetupMessage::new(content_id_stem, &timeline.timeline_selector);
        let client = TsClient::new(transport, setup, config, registry);
        TimelineSynchroniser { shared, client, selector: timeline.timeline_selector.clone() }
    }

    /// The synchronisation timeline. Unavailable until the first control timestamp.
    pub fn timeline(&self) -> Arc<CorrelatedClock> {
        self.shared.timeline.clone()
    }

    pub fn timeline_selector(&self) -> &str {
        &self.selector
    }

    pub fn state(&self) -> TsState {
        self.shared.state()
    }

    pub fn is_synced(&self) -> bool {
        self.state() == TsState::Synced
    }

    pub fn last_control_timestamp(&self) -> Option<ControlTimestamp> {
        self.shared.last.read().ok().and_then(|l| *l)
    }

    pub fn control_timestamps_applied(&self) -> u64 {
        self.shared.applied.load(Ordering::Relaxed)
    }

    /// State transitions, delivered over a bounded channel.
    pub fn subscribe(&self) -> Receiver<TsState> {
        let (tx, rx) = bounded(STATE_QUEUE_DEPTH);
        if let Ok(mut l) = self.shared.listeners.lock() {
            l.push(tx);
        }
        rx
    }

    /// Applies one control timestamp to the managed timeline.
    pub fn apply_control_timestamp(&self, ct: &ControlTimestamp) {
        self.shared.apply(ct);
    }

    pub fn start(&mut self) -> Result<()> {
        let shared = self.shared.clone();
        self.client.start(Box::new(move |event| shared.on_client_event(event)))
    }

    pub fn stop(&mut self, timeout: Duration) -> bool {
        let stopped = self.client.stop(timeout);
        self.shared.timeline.set_available(false);
        self.shared.set_state(TsState::Stopped);
        stopped
    }
}
