//! Synchronisation session - composition root
//!
//! One [`Synchroniser`] is one session with one TV: a WallClock engine, a
//! Timeline Sync engine and a resync controller per registered media object.
//! Everything the session needs is passed in explicitly; there is no global
//! state, so several sessions can run side by side.
//!
//! `enable` starts the engines bottom-up and `disable` tears them down in
//! reverse dependency order, each step waiting (bounded) for its workers.

use anyhow::Result;
use crossbeam_channel::{select, tick, Receiver};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use crate::cii::{ContentInfo, ContentInfoChanges, TimelineOption};
use crate::clock::{Clock, CorrelatedClock, Correlation, SystemClock, TunableClock};
use crate::config::SystemConfig;
use crate::controller::{ResyncController, ResyncListener, ResyncReport};
use crate::error::{ResyncError, SynchroniserError};
use crate::status::{MediaObjectStatus, SynchroniserStatus};
use crate::timeline::{TimelineSynchroniser, TsState};
use crate::traits::{MediaPlayer, TransportFactory};
use crate::wallclock::client::WcClientState;
use crate::wallclock::{WallClockSynchroniser, WcEvent};
use crate::worker::{StopSignal, Worker, WorkerRegistry};

const WALLCLOCK_TICK_RATE: u64 = 1_000_000_000;
const DEFAULT_MEDIA_TICK_RATE: u64 = 1000;

// ============================================================================
// PUBLIC TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SynchroniserState {
    #[default]
    Initialised,
    SyncEnabled,
    SyncDisabled,
    SyncTimelineUnavailable,
    SyncTimelineAvailable,
    SyncTimelinePaused,
    SyncAccuracyExceedThreshold,
}

/// Periodic view of how well the session tracks the TV.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AccuracyReport {
    /// Seconds on the sync timeline.
    pub timeline_time: Option<f64>,
    /// Total dispersion of the sync timeline, in seconds.
    pub sync_error_secs: Option<f64>,
    pub wallclock_dispersion_ns: Option<f64>,
    pub available: bool,
}

/// Session callbacks. Every method defaults to a no-op.
pub trait SynchroniserDelegate: Send + Sync {
    fn on_state_change(&self, _state: SynchroniserState) {}
    fn on_resync_report(&self, _object_id: &str, _report: &ResyncReport) {}
    fn on_resync_error(&self, _object_id: &str, _error: &ResyncError) {}
    fn on_accuracy_report(&self, _report: &AccuracyReport) {}
    fn on_content_info(&self, _info: &ContentInfo, _changes: &ContentInfoChanges) {}
    fn on_content_id_changed(&self, _content_id: &str) {}
    /// The WallClock server stopped answering and the client gave up.
    /// The session stays unavailable until it is disabled and enabled again.
    fn on_wallclock_failure(&self) {}
}

pub struct NoopDelegate;

impl SynchroniserDelegate for NoopDelegate {}

/// A player registered with the session.
#[derive(Clone)]
pub struct MediaObject {
    pub id: String,
    pub player: Arc<dyn MediaPlayer>,
    /// Maps sync-timeline ticks to ticks of the player's own timeline.
    pub correlation: Correlation,
    pub media_tick_rate: u64,
    /// Higher first when controllers are attached.
    pub priority: u32,
}

impl MediaObject {
    pub fn new(id: &str, player: Arc<dyn MediaPlayer>, correlation: Correlation) -> Self {
        MediaObject {
            id: id.to_string(),
            player,
            correlation,
            media_tick_rate: DEFAULT_MEDIA_TICK_RATE,
            priority: 0,
        }
    }
}

pub struct SynchroniserOptions {
    pub cii_endpoint: String,
    pub app2app_endpoint: String,
    pub timeline: TimelineOption,
    pub content_id_stem: String,
    /// Overrides the WallClock URL learned from Content-Info.
    pub wc_endpoint: Option<String>,
    /// Overrides the Timeline Sync URL learned from Content-Info.
    pub ts_endpoint: Option<String>,
    pub media_objects: Vec<MediaObject>,
    pub delegate: Option<Arc<dyn SynchroniserDelegate>>,
}

impl SynchroniserOptions {
    pub fn new(cii_endpoint: &str, app2app_endpoint: &str, timeline: TimelineOption) -> Self {
        SynchroniserOptions {
            cii_endpoint: cii_endpoint.to_string(),
            app2app_endpoint: app2app_endpoint.to_string(),
            timeline,
            content_id_stem: String::new(),
            wc_endpoint: None,
            ts_endpoint: None,
            media_objects: Vec::new(),
            delegate: None,
        }
    }
}

// ============================================================================
// SHARED SESSION STATE
// ============================================================================

/// Forwards controller callbacks to the session delegate.
struct DelegateListener(Arc<dyn SynchroniserDelegate>);

impl ResyncListener for DelegateListener {
    fn on_report(&self, object_id: &str, report: &ResyncReport) {
        self.0.on_resync_report(object_id, report);
    }

    fn on_error(&self, object_id: &str, error: &ResyncError) {
        self.0.on_resync_error(object_id, error);
    }
}

struct SessionShared {
    config: SystemConfig,
    delegate: Arc<dyn SynchroniserDelegate>,
    registry: Arc<WorkerRegistry>,
    state: RwLock<SynchroniserState>,
    content: RwLock<ContentInfo>,
    media_objects: Mutex<Vec<MediaObject>>,
    controllers: Mutex<Vec<ResyncController>>,
    threshold: RwLock<Duration>,
    wallclock: RwLock<Option<Arc<TunableClock>>>,
    timeline: RwLock<Option<Arc<CorrelatedClock>>>,
    /// Set on the first Synced of an enable cycle; from then on new media
    /// objects attach as soon as they are added.
    timeline_seen: AtomicBool,
    last_accuracy: RwLock<Option<AccuracyReport>>,
}

fn read<T: Clone>(lock: &RwLock<T>) -> T {
    match lock.read() {
        Ok(v) => v.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

fn write<T>(lock: &RwLock<T>, value: T) {
    match lock.write() {
        Ok(mut v) => *v = value,
        Err(poisoned) => *poisoned.into_inner() = value,
    }
}

impl SessionShared {
    fn state(&self) -> SynchroniserState {
        read(&self.state)
    }

    fn set_state(&self, state: SynchroniserState) {
        match self.state.write() {
            Ok(mut s) if *s != state => *s = state,
            _ => return,
        }
        info!("[Sync] State -> {:?}", state);
        self.delegate.on_state_change(state);
    }

    fn attach(&self, object: &MediaObject, timeline: &Arc<CorrelatedClock>) -> Option<ResyncController> {
        let sync: Arc<dyn Clock> = timeline.clone();
        let mut controller = ResyncController::new(
            &object.id,
            object.player.clone(),
            Some(sync),
            object.correlation,
            object.media_tick_rate,
            self.config.resync.clone(),
            Arc::new(DelegateListener(self.delegate.clone())),
            self.registry.clone(),
        );
        match controller.start() {
            Ok(()) => Some(controller),
            Err(e) => {
                error!("[Sync] Could not start resync for {}: {:#}", object.id, e);
                None
            }
        }
    }

    /// Creates a controller for every registered object that has none yet.
    fn attach_controllers(&self) {
        let Some(timeline) = read(&self.timeline) else { return };
        let mut objects = match self.media_objects.lock() {
            Ok(o) => o.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        };
        objects.sort_by(|a, b| b.priority.cmp(&a.priority));

        let Ok(mut controllers) = self.controllers.lock() else { return };
        for object in &objects {
            if controllers.iter().any(|c| c.object_id() == object.id) {
                continue;
            }
            if let Some(c) = self.attach(object, &timeline) {
                info!("[Sync] Resync attached for {}", object.id);
                controllers.push(c);
            }
        }
    }

    fn stop_controllers(&self, timeout: Duration) -> bool {
        let drained: Vec<ResyncController> = match self.controllers.lock() {
            Ok(mut c) => c.drain(..).collect(),
            Err(poisoned) => poisoned.into_inner().drain(..).collect(),
        };
        drained.into_iter().fold(true, |ok, mut c| c.stop(timeout) && ok)
    }

    fn on_timeline_state(&self, state: TsState) {
        debug!("[Sync] Timeline state {:?}", state);
        match state {
            TsState::Synced => {
                self.timeline_seen.store(true, Ordering::SeqCst);
                self.attach_controllers();
                if read(&self.timeline).map_or(false, |t| t.is_available()) {
                    self.set_state(SynchroniserState::SyncTimelineAvailable);
                    self.refresh_state(self.sync_error());
                } else {
                    // Timestamps still arrive but the WallClock under them is gone.
                    self.set_state(SynchroniserState::SyncTimelineUnavailable);
                }
            }
            TsState::TimelineUnavailable | TsState::ConnectionFailure => {
                self.set_state(SynchroniserState::SyncTimelineUnavailable);
            }
            _ => {}
        }
    }

    /// The WallClock underneath the sync timeline is no longer maintained.
    fn on_wallclock_failure(&self) {
        error!("[Sync] WallClock server lost; sync timeline unavailable until re-enabled");
        self.set_state(SynchroniserState::SyncTimelineUnavailable);
        self.delegate.on_wallclock_failure();
    }

    /// Total dispersion of the sync timeline, in seconds.
    fn sync_error(&self) -> Option<f64> {
        let timeline = read(&self.timeline)?;
        if !timeline.is_available() {
            return None;
        }
        Some(timeline.dispersion_at_ticks(timeline.precise_ticks()) / 1_000_000_000.0)
    }

    /// Re-evaluates paused and accuracy states once the timeline is up.
    fn refresh_state(&self, sync_error: Option<f64>) {
        use SynchroniserState::*;
        if !matches!(self.state(), SyncTimelineAvailable | SyncTimelinePaused | SyncAccuracyExceedThreshold) {
            return;
        }
        let Some(timeline) = read(&self.timeline) else { return };
        let threshold = read(&self.threshold).as_secs_f64();

        let next = if timeline.speed() == 0.0 {
            SyncTimelinePaused
        } else if sync_error.map_or(false, |e| e > threshold) {
            SyncAccuracyExceedThreshold
        } else {
            SyncTimelineAvailable
        };
        if next == SyncAccuracyExceedThreshold && self.state() != next {
            warn!("[Sync] Sync error {:.3}ms exceeds {:.3}ms", sync_error.unwrap_or(0.0) * 1e3, threshold * 1e3);
        }
        self.set_state(next);
    }

    fn report_accuracy(&self) {
        let Some(timeline) = read(&self.timeline) else { return };
        let available = timeline.is_available();
        let sync_error = self.sync_error();
        let report = AccuracyReport {
            timeline_time: if available { Some(timeline.time()) } else { None },
            sync_error_secs: sync_error,
            wallclock_dispersion_ns: read(&self.wallclock).map(|wc| wc.dispersion_at_ticks(wc.precise_ticks())),
            available,
        };
        debug!("[Sync] Accuracy: {:?}", report);
        self.delegate.on_accuracy_report(&report);
        write(&self.last_accuracy, Some(report));
        self.refresh_state(sync_error);
    }
}

fn supervise(
    stop: StopSignal,
    shared: Arc<SessionShared>,
    timeline_states: Receiver<TsState>,
    wallclock_events: Receiver<WcEvent>,
) {
    let ticker = tick(shared.config.session.accuracy_report_interval());
    loop {
        select! {
            recv(timeline_states) -> state => match state {
                Ok(state) => shared.on_timeline_state(state),
                Err(_) => break,
            },
            recv(wallclock_events) -> event => match event {
                Ok(WcEvent::StateChanged(WcClientState::ConnectionFailure)) => shared.on_wallclock_failure(),
                Ok(_) => {}
                Err(_) => break,
            },
            recv(ticker) -> _ => shared.report_accuracy(),
            recv(stop.receiver()) -> _ => break,
        }
    }
}

// ============================================================================
// SYNCHRONISER
// ============================================================================

pub struct Synchroniser {
    cii_endpoint: String,
    app2app_endpoint: String,
    timeline_option: TimelineOption,
    content_id_stem: String,
    wc_endpoint: Option<String>,
    ts_endpoint: Option<String>,
    transports: Arc<dyn TransportFactory>,
    root: Arc<dyn Clock>,
    shared: Arc<SessionShared>,
    wallclock: Option<WallClockSynchroniser>,
    timeline: Option<TimelineSynchroniser>,
    supervisor: Option<Worker>,
}

impl Synchroniser {
    pub fn new(options: SynchroniserOptions, config: SystemConfig, transports: Arc<dyn TransportFactory>) -> Self {
        let root = Arc::new(
            SystemClock::new(WALLCLOCK_TICK_RATE)
                .with_error_characteristics(config.wallclock.local_precision_ns, config.wallclock.local_max_freq_error_ppm),
        );
        Self::with_root_clock(options, config, transports, root)
    }

    /// Uses `root` as the local reference every session clock descends from.
    pub fn with_root_clock(
        options: SynchroniserOptions,
        config: SystemConfig,
        transports: Arc<dyn TransportFactory>,
        root: Arc<dyn Clock>,
    ) -> Self {
        info!("=== Synchroniser ===");
        info!("CII: {}  App2App: {}", options.cii_endpoint, options.app2app_endpoint);
        info!("Timeline: {} ({} ticks/s)", options.timeline.timeline_selector, options.timeline.tick_rate());
        info!(
            "Resync thresholds: {:.3}s / {:.3}s",
            config.resync.resync_jitter_threshold, config.resync.rate_adaptation_jitter_threshold
        );

        let delegate = options.delegate.unwrap_or_else(|| Arc::new(NoopDelegate));
        let shared = Arc::new(SessionShared {
            config,
            delegate,
            registry: WorkerRegistry::new(),
            state: RwLock::new(SynchroniserState::Initialised),
            content: RwLock::new(ContentInfo::default()),
            media_objects: Mutex::new(options.media_objects),
            controllers: Mutex::new(Vec::new()),
            threshold: RwLock::new(Duration::ZERO),
            wallclock: RwLock::new(None),
            timeline: RwLock::new(None),
            timeline_seen: AtomicBool::new(false),
            last_accuracy: RwLock::new(None),
        });

        Synchroniser {
            cii_endpoint: options.cii_endpoint,
            app2app_endpoint: options.app2app_endpoint,
            timeline_option: options.timeline,
            content_id_stem: options.content_id_stem,
            wc_endpoint: options.wc_endpoint,
            ts_endpoint: options.ts_endpoint,
            transports,
            root,
            shared,
            wallclock: None,
            timeline: None,
            supervisor: None,
        }
    }

    // ========================================================================
    // PUBLIC API
    // ========================================================================

    pub fn state(&self) -> SynchroniserState {
        self.shared.state()
    }

    pub fn is_enabled(&self) -> bool {
        self.wallclock.is_some()
    }

    pub fn cii_endpoint(&self) -> &str {
        &self.cii_endpoint
    }

    pub fn app2app_endpoint(&self) -> &str {
        &self.app2app_endpoint
    }

    pub fn content_id(&self) -> Option<String> {
        read(&self.shared.content).content_id
    }

    pub fn content_info(&self) -> ContentInfo {
        read(&self.shared.content)
    }

    /// Current sync timeline uncertainty in seconds. None while unavailable.
    pub fn current_sync_error(&self) -> Option<f64> {
        self.shared.sync_error()
    }

    pub fn last_accuracy_report(&self) -> Option<AccuracyReport> {
        read(&self.shared.last_accuracy)
    }

    pub fn wallclock(&self) -> Option<Arc<TunableClock>> {
        read(&self.shared.wallclock)
    }

    pub fn sync_timeline(&self) -> Option<Arc<CorrelatedClock>> {
        read(&self.shared.timeline)
    }

    /// Worker threads alive for this session. Zero after `disable`.
    pub fn active_workers(&self) -> usize {
        self.shared.registry.active()
    }

    pub fn media_object_ids(&self) -> Vec<String> {
        self.shared.media_objects.lock().map(|o| o.iter().map(|m| m.id.clone()).collect()).unwrap_or_default()
    }

    /// Registers a player. Attached right away once the sync timeline has
    /// been set up in this session.
    pub fn add_media_object(&self, object: MediaObject) {
        info!("[Sync] Media object added: {}", object.id);
        if let Ok(mut objects) = self.shared.media_objects.lock() {
            objects.retain(|o| o.id != object.id);
            objects.push(object);
        }
        if self.shared.timeline_seen.load(Ordering::SeqCst) {
            self.shared.attach_controllers();
        }
    }

    pub fn remove_media_object(&self, id: &str) -> bool {
        let removed = match self.shared.media_objects.lock() {
            Ok(mut objects) => {
                let before = objects.len();
                objects.retain(|o| o.id != id);
                objects.len() != before
            }
            Err(_) => false,
        };
        let controller = self
            .shared
            .controllers
            .lock()
            .ok()
            .and_then(|mut c| c.iter().position(|x| x.object_id() == id).map(|i| c.remove(i)));
        if let Some(mut c) = controller {
            c.stop(self.shared.config.session.stop_timeout());
        }
        if removed {
            info!("[Sync] Media object removed: {}", id);
        }
        removed
    }

    /// Merges a Content-Info update and reports what changed.
    pub fn on_content_info(&self, update: &ContentInfo) -> ContentInfoChanges {
        let (merged, changes) = match self.shared.content.write() {
            Ok(mut content) => {
                let changes = content.merge(update);
                (content.clone(), changes)
            }
            Err(poisoned) => {
                let mut content = poisoned.into_inner();
                let changes = content.merge(update);
                (content.clone(), changes)
            }
        };
        if !changes.any() {
            return changes;
        }
        debug!("[Sync] Content-Info changes: {:?}", changes);
        self.shared.delegate.on_content_info(&merged, &changes);
        if changes.content_id {
            if let Some(id) = &merged.content_id {
                info!("[Sync] Content id -> {}", id);
                self.shared.delegate.on_content_id_changed(id);
            }
        }
        if self.is_enabled() && (changes.wc_url || changes.ts_url) {
            warn!("[Sync] Endpoints changed while enabled; takes effect on next enable");
        }
        changes
    }

    /// Starts synchronisation. Blocks until the WallClock dispersion drops
    /// below `threshold` (bounded by the configured sync timeout), then
    /// starts the Timeline Sync engine. Resync controllers are attached when
    /// the first control timestamp arrives.
    pub fn enable(&mut self, threshold: Duration) -> Result<()> {
        if self.is_enabled() {
            return Err(SynchroniserError::AlreadyEnabled.into());
        }
        let content = read(&self.shared.content);
        let wc_url = self
            .wc_endpoint
            .clone()
            .or(content.wc_url.clone())
            .ok_or(SynchroniserError::MissingEndpoint("wallclock"))?;
        let ts_url = self
            .ts_endpoint
            .clone()
            .or(content.ts_url.clone())
            .ok_or(SynchroniserError::MissingEndpoint("timeline"))?;
        let stem = if self.content_id_stem.is_empty() {
            content.content_id.clone().unwrap_or_default()
        } else {
            self.content_id_stem.clone()
        };

        info!("[Sync] Enabling: wc={} ts={} threshold={:?}", wc_url, ts_url, threshold);
        write(&self.shared.threshold, threshold);

        let wallclock = Arc::new(TunableClock::new(self.root.clone(), WALLCLOCK_TICK_RATE, 0));
        let transport = self.transports.wallclock_transport(&wc_url).map_err(|e| transport_error(&wc_url, e))?;
        let mut wc = WallClockSynchroniser::new(
            wallclock.clone(),
            transport,
            self.shared.config.wallclock.clone(),
            self.shared.registry.clone(),
        );
        wc.start()?;
        write(&self.shared.wallclock, Some(wallclock.clone()));
        self.wallclock = Some(wc);
        self.shared.set_state(SynchroniserState::SyncEnabled);

        if let Err(e) = self.start_timeline(wallclock, threshold, &ts_url, &stem) {
            self.disable();
            return Err(e);
        }
        Ok(())
    }

    fn start_timeline(&mut self, wallclock: Arc<TunableClock>, threshold: Duration, ts_url: &str, stem: &str) -> Result<()> {
        let waited = self.shared.config.session.wallclock_sync_timeout();
        let Some(wc) = self.wallclock.as_ref() else {
            return Err(SynchroniserError::WallClockNotSynced { threshold, waited }.into());
        };
        if !wc.wait_for_dispersion(threshold, waited) {
            return Err(SynchroniserError::WallClockNotSynced { threshold, waited }.into());
        }
        let wc_events = wc.subscribe();
        let wc_failed = wc.status().state == WcClientState::ConnectionFailure;
        info!("[Sync] WallClock synchronised; starting Timeline Sync");

        let transport = self.transports.timeline_transport(ts_url).map_err(|e| transport_error(ts_url, e))?;
        let mut ts = TimelineSynchroniser::new(
            wallclock,
            transport,
            stem,
            &self.timeline_option,
            self.shared.config.timeline.clone(),
            self.shared.registry.clone(),
        );
        let states = ts.subscribe();
        write(&self.shared.timeline, Some(ts.timeline()));

        let shared = self.shared.clone();
        self.supervisor = Some(Worker::spawn("sync-supervisor", &self.shared.registry, move |stop| {
            supervise(stop, shared, states, wc_events)
        })?);
        if wc_failed {
            self.shared.on_wallclock_failure();
        }
        ts.start()?;
        self.timeline = Some(ts);
        Ok(())
    }

    /// Stops everything this session started, in reverse dependency order.
    /// Returns false if any worker missed its stop deadline.
    pub fn disable(&mut self) -> bool {
        let timeout = self.shared.config.session.stop_timeout();
        let mut clean = true;

        if let Some(mut s) = self.supervisor.take() {
            clean &= s.stop(timeout);
        }
        clean &= self.shared.stop_controllers(timeout);
        if let Some(mut ts) = self.timeline.take() {
            clean &= ts.stop(timeout);
        }
        if let Some(mut wc) = self.wallclock.take() {
            clean &= wc.stop(timeout);
        }
        write(&self.shared.timeline, None);
        write(&self.shared.wallclock, None);
        self.shared.timeline_seen.store(false, Ordering::SeqCst);

        if !clean {
            warn!("[Sync] Some workers did not stop within {:?}", timeout);
        }
        self.shared.set_state(SynchroniserState::SyncDisabled);
        clean
    }

    pub fn status(&self) -> SynchroniserStatus {
        let mut status = SynchroniserStatus {
            state: self.state(),
            content_id: self.content_id(),
            timeline_selector: self.timeline_option.timeline_selector.clone(),
            active_workers: self.active_workers(),
            updated_ts: SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0),
            sync_error_secs: self.current_sync_error(),
            ..SynchroniserStatus::default()
        };

        if let Some(wc) = &self.wallclock {
            let s = wc.status();
            status.wc_state = s.state;
            status.wc_dispersion_ns = wc.current_dispersion();
            status.wc_offset_ns = s.last_offset_ns;
            status.wc_candidates_received = s.candidates_received;
            status.wc_candidates_useful = s.candidates_useful;
            status.wc_candidates_dropped = s.candidates_dropped;
            status.wc_useful_percent = s.useful_percent();
        }
        if let Some(ts) = &self.timeline {
            let timeline = ts.timeline();
            status.ts_state = ts.state();
            status.timeline_available = timeline.is_available();
            status.timeline_time = if status.timeline_available { Some(timeline.time()) } else { None };
            status.control_timestamps = ts.control_timestamps_applied();
        }
        if let Ok(controllers) = self.shared.controllers.lock() {
            status.media_objects = controllers
                .iter()
                .map(|c| MediaObjectStatus {
                    id: c.object_id().to_string(),
                    state: c.state(),
                    jitter: c.last_report().and_then(|r| r.jitter),
                })
                .collect();
        }
        status
    }
}

fn transport_error(endpoint: &str, e: anyhow::Error) -> SynchroniserError {
    SynchroniserError::Transport(format!("{}: {:#}", endpoint, e))
}

impl Drop for Synchroniser {
    fn drop(&mut self) {
        if self.is_enabled() {
            self.disable();
        }
    }
}
