//! Resync controller - keeps one media player on its expected timeline position
//!
//! Each controller owns a media-object timeline: a [`CorrelatedClock`] child
//! of the session's sync timeline, mapped through the object's registered
//! correlation. Every cycle compares the player's reported position with
//! that timeline and lets the [`PlaybackServo`] pick an action.
//!
//! Cycles run on a ticker and on every change notification from the sync
//! timeline. Both paths go through `resync_once`, which holds the servo lock
//! for the whole decision, so at most one decision runs at a time.

use anyhow::Result;
use crossbeam_channel::{select, tick};
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use crate::clock::{Clock, CorrelatedClock, Correlation};
use crate::config::ResyncConfig;
use crate::error::ResyncError;
use crate::servo::{PlaybackServo, ServoAction};
use crate::traits::MediaPlayer;
use crate::worker::{Worker, WorkerRegistry};

// Rates closer than this are treated as equal.
const RATE_EPSILON: f64 = 1e-9;

// ============================================================================
// DATA STRUCTURES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ResyncState {
    #[default]
    Initialised,
    Running,
    Synchronising,
    Paused,
    Stopped,
    SyncTimelineUnavailable,
}

/// Outcome of one resync cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ResyncReport {
    pub state: ResyncState,
    /// Seconds on the media-object timeline.
    pub expected: Option<f64>,
    pub actual: Option<f64>,
    /// Actual minus expected, in seconds.
    pub jitter: Option<f64>,
    pub action: Option<ServoAction>,
    pub error: Option<ResyncError>,
}

impl ResyncReport {
    fn failed(state: ResyncState, error: ResyncError) -> Self {
        ResyncReport { state, expected: None, actual: None, jitter: None, action: None, error: Some(error) }
    }
}

/// Observer for one or more controllers. Every method defaults to a no-op.
pub trait ResyncListener: Send + Sync {
    fn on_state_change(&self, _object_id: &str, _state: ResyncState) {}
    fn on_report(&self, _object_id: &str, _report: &ResyncReport) {}
    fn on_error(&self, _object_id: &str, _error: &ResyncError) {}
}

pub struct NoopResyncListener;

impl ResyncListener for NoopResyncListener {}

struct ControllerCore {
    object_id: String,
    player: Arc<dyn MediaPlayer>,
    sync_timeline: Option<Arc<dyn Clock>>,
    media_timeline: Option<Arc<CorrelatedClock>>,
    config: ResyncConfig,
    servo: Mutex<PlaybackServo>,
    state: RwLock<ResyncState>,
    halted: AtomicBool,
    listener: Arc<dyn ResyncListener>,
    last_report: RwLock<Option<ResyncReport>>,
}

/// Resync controller for one media object.
pub struct ResyncController {
    core: Arc<ControllerCore>,
    registry: Arc<WorkerRegistry>,
    worker: Option<Worker>,
}

// ============================================================================
// IMPLEMENTATION
// ============================================================================

impl ControllerCore {
    fn state(&self) -> ResyncState {
        self.state.read().map(|s| *s).unwrap_or(ResyncState::Stopped)
    }

    fn set_state(&self, state: ResyncState) {
        match self.state.write() {
            Ok(mut s) if *s != state => *s = state,
            _ => return,
        }
        debug!("[Resync] {}: state -> {:?}", self.object_id, state);
        self.listener.on_state_change(&self.object_id, state);
    }

    fn apply_rate(&self, rate: f64) -> Result<(), ResyncError> {
        if (self.player.rate() - rate).abs() > RATE_EPSILON {
            info!("[Resync] {}: rate {:.3} -> {:.3}", self.object_id, self.player.rate(), rate);
            self.player.set_rate(rate)?;
        }
        Ok(())
    }

    /// Keeps a seek inside the media: never before zero, never past the end
    /// when the player knows its duration.
    fn seek_target(&self, expected: f64) -> f64 {
        match self.player.duration() {
            Some(duration) if duration.is_finite() && duration >= 0.0 => expected.clamp(0.0, duration),
            _ => expected.max(0.0),
        }
    }

    fn execute(&self, action: ServoAction, nominal: f64) -> Result<(), ResyncError> {
        match action {
            ServoAction::Hold | ServoAction::RestoreRate(_) => self.apply_rate(nominal),
            ServoAction::AdaptRate(rate) => self.apply_rate(rate),
            ServoAction::Seek(expected) => {
                let target = self.seek_target(expected);
                info!("[Resync] {}: seeking to {:.3}s", self.object_id, target);
                self.player.seek_to_time(target)?;
                self.apply_rate(nominal)
            }
        }
    }

    fn finish(&self, report: ResyncReport) -> ResyncReport {
        if let Some(e) = &report.error {
            if e.is_fatal() {
                error!("[Resync] {}: {} (code {}); controller halted", self.object_id, e, e.code());
            } else {
                warn!("[Resync] {}: {} (code {})", self.object_id, e, e.code());
            }
            self.listener.on_error(&self.object_id, e);
        }
        self.listener.on_report(&self.object_id, &report);
        if let Ok(mut last) = self.last_report.write() {
            *last = Some(report.clone());
        }
        report
    }

    fn halt(&self) -> ResyncReport {
        self.halted.store(true, Ordering::SeqCst);
        self.set_state(ResyncState::Stopped);
        self.finish(ResyncReport::failed(ResyncState::Stopped, ResyncError::NoSyncTimeline))
    }

    fn resync_once(&self) -> ResyncReport {
        let mut servo = match self.servo.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };

        let (sync, media) = match (&self.sync_timeline, &self.media_timeline) {
            (Some(s), Some(m)) if !self.halted.load(Ordering::SeqCst) => (s, m),
            _ => return self.halt(),
        };

        if !media.is_available() {
            servo.reset();
            self.set_state(ResyncState::SyncTimelineUnavailable);
            return self.finish(ResyncReport::failed(
                ResyncState::SyncTimelineUnavailable,
                ResyncError::SyncTimelineUnavailable,
            ));
        }

        let speed = sync.speed();
        if speed == 0.0 {
            if self.player.is_playing() {
                info!("[Resync] {}: sync timeline paused", self.object_id);
                self.player.pause();
            }
            servo.reset();
            self.set_state(ResyncState::Paused);
            return self.finish(ResyncReport {
                state: ResyncState::Paused,
                expected: Some(media.time()),
                actual: Some(self.player.current_time()),
                jitter: None,
                action: None,
                error: None,
            });
        }
        if !self.player.is_playing() {
            info!("[Resync] {}: starting playback", self.object_id);
            self.player.play();
        }

        let nominal = self.config.nominal_rate * speed;
        let expected = media.time();
        let actual = self.player.current_time();
        let jitter = actual - expected;
        let action = servo.sample(jitter, expected, nominal);

        let state = match action {
            ServoAction::AdaptRate(_) | ServoAction::Seek(_) => ResyncState::Synchronising,
            ServoAction::Hold | ServoAction::RestoreRate(_) => ResyncState::Running,
        };
        let error = self.execute(action, nominal).err();
        if error.is_some() {
            // Retry from scratch next cycle.
            servo.reset();
        }
        self.set_state(state);

        self.finish(ResyncReport {
            state,
            expected: Some(expected),
            actual: Some(actual),
            jitter: Some(jitter),
            action: Some(action),
            error,
        })
    }
}

impl ResyncController {
    /// `correlation` maps sync-timeline ticks to ticks of the media object's
    /// own timeline, which runs at `media_tick_rate`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        object_id: &str,
        player: Arc<dyn MediaPlayer>,
        sync_timeline: Option<Arc<dyn Clock>>,
        correlation: Correlation,
        media_tick_rate: u64,
        config: ResyncConfig,
        listener: Arc<dyn ResyncListener>,
        registry: Arc<WorkerRegistry>,
    ) -> Self {
        let media_timeline = sync_timeline
            .as_ref()
            .map(|sync| Arc::new(CorrelatedClock::new(sync.clone(), media_tick_rate, correlation)));
        let servo = PlaybackServo::new(
            config.resync_jitter_threshold,
            config.rate_adaptation_jitter_threshold,
            config.rate_adaptation_step,
        );

        info!(
            "[Resync] {}: controller created (thresholds {:.3}s / {:.3}s, step {:.2}, interval {}ms)",
            object_id,
            config.resync_jitter_threshold,
            config.rate_adaptation_jitter_threshold,
            config.rate_adaptation_step,
            config.sync_interval_ms
        );

        ResyncController {
            core: Arc::new(ControllerCore {
                object_id: object_id.to_string(),
                player,
                sync_timeline,
                media_timeline,
                config,
                servo: Mutex::new(servo),
                state: RwLock::new(ResyncState::Initialised),
                halted: AtomicBool::new(false),
                listener,
                last_report: RwLock::new(None),
            }),
            registry,
            worker: None,
        }
    }

    // ========================================================================
    // PUBLIC API
    // ========================================================================

    pub fn object_id(&self) -> &str {
        &self.core.object_id
    }

    pub fn state(&self) -> ResyncState {
        self.core.state()
    }

    pub fn is_halted(&self) -> bool {
        self.core.halted.load(Ordering::SeqCst)
    }

    pub fn media_timeline(&self) -> Option<Arc<CorrelatedClock>> {
        self.core.media_timeline.clone()
    }

    pub fn last_report(&self) -> Option<ResyncReport> {
        self.core.last_report.read().ok().and_then(|r| r.clone())
    }

    /// Replaces the sync-timeline to media-timeline mapping.
    pub fn set_correlation(&self, correlation: Correlation) {
        if let Some(media) = &self.core.media_timeline {
            media.set_correlation(correlation);
        }
    }

    /// One resync decision, serialized with the timer path.
    pub fn resync_once(&self) -> ResyncReport {
        self.core.resync_once()
    }

    /// Fails with [`ResyncError::NoSyncTimeline`] if no sync timeline was
    /// given; the controller is then halted for good.
    pub fn start(&mut self) -> Result<()> {
        if self.worker.as_ref().map_or(false, |w| !w.is_finished()) {
            return Ok(());
        }
        let sync = match (&self.core.sync_timeline, self.is_halted()) {
            (Some(sync), false) => sync.clone(),
            _ => {
                self.core.halt();
                return Err(ResyncError::NoSyncTimeline.into());
            }
        };

        self.core.set_state(ResyncState::Running);
        let core = self.core.clone();
        let name = format!("resync-{}", self.core.object_id);
        self.worker = Some(Worker::spawn(&name, &self.registry, move |stop| {
            let changes = sync.subscribe();
            let ticker = tick(core.config.sync_interval());
            core.resync_once();
            loop {
                select! {
                    recv(changes) -> event => {
                        if event.is_err() {
                            break;
                        }
                        // Coalesce a burst of notifications into one decision.
                        while changes.try_recv().is_ok() {}
                        core.resync_once();
                    }
                    recv(ticker) -> _ => {
                        core.resync_once();
                    }
                    recv(stop.receiver()) -> _ => break,
                }
                if core.halted.load(Ordering::SeqCst) {
                    break;
                }
            }
        })?);
        Ok(())
    }

    pub fn stop(&mut self, timeout: Duration) -> bool {
        let stopped = match self.worker.take() {
            Some(mut w) => w.stop(timeout),
            None => true,
        };
        self.core.set_state(ResyncState::Stopped);
        stopped
    }
}

impl Drop for ResyncController {
    fn drop(&mut self) {
        self.stop(crate::worker::DEFAULT_STOP_TIMEOUT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualTimeSource, SystemClock};
    use crate::error::PlayerError;
    use crate::traits::MockMediaPlayer;
    use std::time::Instant;

    #[derive(Default)]
    struct Recorder {
        states: Mutex<Vec<ResyncState>>,
        errors: Mutex<Vec<ResyncError>>,
        reports: Mutex<Vec<ResyncReport>>,
    }

    impl ResyncListener for Recorder {
        fn on_state_change(&self, _id: &str, state: ResyncState) {
            self.states.lock().unwrap().push(state);
        }
        fn on_report(&self, _id: &str, report: &ResyncReport) {
            self.reports.lock().unwrap().push(report.clone());
        }
        fn on_error(&self, _id: &str, error: &ResyncError) {
            self.errors.lock().unwrap().push(error.clone());
        }
    }

    /// Sync timeline at 1 kHz reading 10.0s at the current instant.
    fn sync_timeline() -> (Arc<ManualTimeSource>, Arc<CorrelatedClock>) {
        let src = Arc::new(ManualTimeSource::new(0));
        let root = Arc::new(SystemClock::with_source(1_000_000_000, src.clone()));
        let sync = Arc::new(CorrelatedClock::new(root, 1000, Correlation::new(0.0, 10_000.0)));
        (src, sync)
    }

    fn player_at(position: f64) -> MockMediaPlayer {
        let mut p = MockMediaPlayer::new();
        p.expect_current_time().return_const(position);
        p.expect_rate().return_const(1.0);
        p.expect_is_playing().return_const(true);
        p.expect_duration().return_const(None::<f64>);
        p
    }

    fn controller(player: MockMediaPlayer, sync: Option<Arc<dyn Clock>>, listener: Arc<Recorder>) -> ResyncController {
        ResyncController::new(
            "video-1",
            Arc::new(player),
            sync,
            Correlation::new(0.0, 0.0),
            1000,
            ResyncConfig::default(),
            listener,
            WorkerRegistry::new(),
        )
    }

    #[test]
    fn test_small_jitter_no_action() {
        let (_src, sync) = sync_timeline();
        let mut player = player_at(10.02);
        player.expect_seek_to_time().never();
        player.expect_set_rate().never();

        let c = controller(player, Some(sync), Arc::new(Recorder::default()));
        let report = c.resync_once();
        assert_eq!(report.action, Some(ServoAction::Hold));
        assert_eq!(c.state(), ResyncState::Running);
        assert!((report.jitter.unwrap() - 0.02).abs() < 1e-9);
    }

    #[test]
    fn test_medium_jitter_adapts_rate() {
        let (_src, sync) = sync_timeline();
        let mut player = player_at(10.3);
        player.expect_seek_to_time().never();
        player.expect_set_rate().withf(|r| (*r - 0.5).abs() < 1e-9).times(1).returning(|_| Ok(()));

        let c = controller(player, Some(sync), Arc::new(Recorder::default()));
        c.resync_once();
        assert_eq!(c.state(), ResyncState::Synchronising);
    }

    #[test]
    fn test_large_jitter_seeks_to_expected_position() {
        let (_src, sync) = sync_timeline();
        let mut player = player_at(15.0);
        player.expect_seek_to_time().withf(|t| (*t - 10.0).abs() < 1e-9).times(1).returning(|_| Ok(()));
        player.expect_set_rate().never();

        let c = controller(player, Some(sync), Arc::new(Recorder::default()));
        assert!(matches!(c.resync_once().action, Some(ServoAction::Seek(_))));
    }

    #[test]
    fn test_seek_is_clamped_to_media_duration() {
        let (_src, sync) = sync_timeline();
        let mut player = MockMediaPlayer::new();
        player.expect_current_time().return_const(2.0);
        player.expect_rate().return_const(1.0);
        player.expect_is_playing().return_const(true);
        player.expect_duration().return_const(Some(8.0));
        let mut seq = mockall::Sequence::new();
        player.expect_seek_to_time().withf(|t| *t == 8.0).times(1).in_sequence(&mut seq).returning(|_| Ok(()));
        player.expect_seek_to_time().withf(|t| *t == 0.0).times(1).in_sequence(&mut seq).returning(|_| Ok(()));
        let c = controller(player, Some(sync.clone()), Arc::new(Recorder::default()));

        // Timeline at 10s is past the end of 8s media.
        let report = c.resync_once();
        assert_eq!(report.action, Some(ServoAction::Seek(10.0)));
        assert_eq!(report.error, None);

        // Before the media starts.
        sync.set_correlation(Correlation::new(0.0, -5_000.0));
        assert_eq!(c.resync_once().action, Some(ServoAction::Seek(-5.0)));
    }

    #[test]
    fn test_failed_seek_reports_player_failure() {
        let (_src, sync) = sync_timeline();
        let listener = Arc::new(Recorder::default());
        let mut player = player_at(15.0);
        player.expect_seek_to_time().returning(|_| Err(PlayerError::Other("decoder busy".into())));
        player.expect_set_rate().never();
        let c = controller(player, Some(sync), listener.clone());

        let report = c.resync_once();
        assert_eq!(report.error, Some(ResyncError::PlayerFailure("decoder busy".into())));
        assert_eq!(report.error.as_ref().map(|e| e.code()), Some(6));
        assert!(!c.is_halted());
    }

    #[test]
    fn test_missing_sync_timeline_is_fatal() {
        let listener = Arc::new(Recorder::default());
        let mut c = controller(MockMediaPlayer::new(), None, listener.clone());
        let err = c.start().unwrap_err();
        assert_eq!(err.downcast_ref::<ResyncError>(), Some(&ResyncError::NoSyncTimeline));
        assert!(c.is_halted());
        assert_eq!(c.state(), ResyncState::Stopped);
        assert_eq!(listener.errors.lock().unwrap()[0].code(), 1);
        // Still halted on a manual cycle.
        assert_eq!(c.resync_once().error, Some(ResyncError::NoSyncTimeline));
    }

    #[test]
    fn test_unavailable_timeline_recovers() {
        let (_src, sync) = sync_timeline();
        let listener = Arc::new(Recorder::default());
        let mut player = player_at(10.0);
        player.expect_set_rate().never();
        let c = controller(player, Some(sync.clone()), listener.clone());

        sync.set_available(false);
        assert_eq!(c.resync_once().error, Some(ResyncError::SyncTimelineUnavailable));
        assert_eq!(c.state(), ResyncState::SyncTimelineUnavailable);
        assert!(!c.is_halted());

        sync.set_available(true);
        assert_eq!(c.resync_once().error, None);
        assert_eq!(c.state(), ResyncState::Running);
        assert_eq!(
            *listener.states.lock().unwrap(),
            vec![ResyncState::SyncTimelineUnavailable, ResyncState::Running]
        );
    }

    #[test]
    fn test_zero_speed_pauses_player() {
        let (_src, sync) = sync_timeline();
        let mut player = player_at(10.0);
        player.expect_pause().times(1).return_const(());
        let c = controller(player, Some(sync.clone()), Arc::new(Recorder::default()));
        sync.set_speed(0.0);
        assert_eq!(c.resync_once().state, ResyncState::Paused);
        assert_eq!(c.state(), ResyncState::Paused);
    }

    #[test]
    fn test_nominal_rate_follows_timeline_speed() {
        let (_src, sync) = sync_timeline();
        let mut player = player_at(10.0);
        player.expect_set_rate().withf(|r| (*r - 2.0).abs() < 1e-9).times(1).returning(|_| Ok(()));
        let c = controller(player, Some(sync.clone()), Arc::new(Recorder::default()));
        sync.set_speed(2.0);
        assert_eq!(c.resync_once().action, Some(ServoAction::Hold));
    }

    #[test]
    fn test_rejected_rate_is_reported_and_recoverable() {
        let (_src, sync) = sync_timeline();
        let listener = Arc::new(Recorder::default());
        let mut player = player_at(10.3);
        player.expect_set_rate().returning(|r| Err(PlayerError::RateRejected(format!("{}", r))));
        let c = controller(player, Some(sync), listener.clone());

        let report = c.resync_once();
        assert_eq!(report.error.as_ref().map(|e| e.code()), Some(5));
        assert!(!c.is_halted());
        assert_eq!(listener.errors.lock().unwrap().len(), 1);
        // Next cycle tries again.
        c.resync_once();
        assert_eq!(listener.errors.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_timeline_change_triggers_resync() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (_src, sync) = sync_timeline();
        let listener = Arc::new(Recorder::default());
        let mut player = player_at(10.0);
        player.expect_set_rate().returning(|_| Ok(()));
        player.expect_seek_to_time().returning(|_| Ok(()));

        let registry = WorkerRegistry::new();
        let config = ResyncConfig { sync_interval_ms: 60_000, ..ResyncConfig::default() };
        let mut c = ResyncController::new(
            "audio",
            Arc::new(player),
            Some(sync.clone()),
            Correlation::new(0.0, 0.0),
            1000,
            config,
            listener.clone(),
            registry.clone(),
        );
        c.start().unwrap();
        assert_eq!(registry.active(), 1);

        let wait_for = |n: usize| {
            let deadline = Instant::now() + Duration::from_secs(2);
            while listener.reports.lock().unwrap().len() < n && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(2));
            }
        };
        wait_for(1);
        // The TV jumped 20s ahead.
        sync.set_correlation(Correlation::new(0.0, 30_000.0));
        wait_for(2);
        let reports = listener.reports.lock().unwrap().clone();
        assert_eq!(reports[1].action, Some(ServoAction::Seek(30.0)));

        assert!(c.stop(Duration::from_secs(1)));
        assert_eq!(c.state(), ResyncState::Stopped);
        assert_eq!(registry.active(), 0);
    }
}
