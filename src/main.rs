use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use synckit::cii::{ContentInfo, ContentInfoChanges, TimelineOption};
use synckit::clock::{Clock, Correlation, SystemClock};
use synckit::config::SystemConfig;
use synckit::controller::ResyncReport;
use synckit::error::{PlayerError, ResyncError};
use synckit::net::NetworkTransports;
use synckit::synchroniser::{
    AccuracyReport, MediaObject, Synchroniser, SynchroniserDelegate, SynchroniserOptions, SynchroniserState,
};
use synckit::traits::MediaPlayer;

#[derive(Parser, Debug)]
#[command(author, version, about = "Follow a DVB-CSS TV's timeline from the command line", long_about = None)]
struct Args {
    /// WallClock server, e.g. udp://192.168.1.20:6677
    #[arg(long)]
    wc_url: String,

    /// Timeline Sync server, e.g. ws://192.168.1.20:7681/ts
    #[arg(long)]
    ts_url: String,

    #[arg(long, default_value = "")]
    content_id_stem: String,

    #[arg(long, default_value = "urn:dvb:css:timeline:pts")]
    timeline_selector: String,

    #[arg(long, default_value_t = 1)]
    units_per_tick: u64,

    #[arg(long, default_value_t = 90000)]
    units_per_second: u64,

    /// WallClock dispersion required before Timeline Sync starts
    #[arg(long, default_value_t = 10.0)]
    threshold_ms: f64,

    /// JSON configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Drive a simulated player so resync decisions can be observed
    #[arg(long, default_value_t = false)]
    virtual_player: bool,
}

/// Logs everything the session reports.
struct LoggingDelegate;

impl SynchroniserDelegate for LoggingDelegate {
    fn on_state_change(&self, state: SynchroniserState) {
        info!("Session state: {:?}", state);
    }

    fn on_resync_report(&self, object_id: &str, report: &ResyncReport) {
        if report.action.is_some() {
            info!("[{}] {:?} jitter={:?} action={:?}", object_id, report.state, report.jitter, report.action);
        }
    }

    fn on_resync_error(&self, object_id: &str, error: &ResyncError) {
        warn!("[{}] Resync error {}: {}", object_id, error.code(), error);
    }

    fn on_accuracy_report(&self, report: &AccuracyReport) {
        match (report.timeline_time, report.sync_error_secs) {
            (Some(t), Some(e)) => info!("Timeline {:.3}s  sync error {:.3}ms", t, e * 1e3),
            _ => info!("Timeline unavailable"),
        }
    }

    fn on_content_info(&self, _info: &ContentInfo, changes: &ContentInfoChanges) {
        info!("Content-Info changed: {:?}", changes);
    }

    fn on_wallclock_failure(&self) {
        error!("WallClock server is not answering; restart to resynchronise");
    }
}

/// A player that only keeps time. Position advances with its own rate.
struct VirtualPlayer {
    clock: SystemClock,
    state: Mutex<(f64, f64, f64, bool)>, // (position at anchor, anchor secs, rate, playing)
}

impl VirtualPlayer {
    fn new() -> Self {
        VirtualPlayer { clock: SystemClock::new(1_000_000_000), state: Mutex::new((0.0, 0.0, 1.0, false)) }
    }

    fn now(&self) -> f64 {
        self.clock.time()
    }

    fn update<F: FnOnce(&mut (f64, f64, f64, bool))>(&self, f: F) {
        let now = self.now();
        let mut s = match self.state.lock() {
            Ok(s) => s,
            Err(poisoned) => poisoned.into_inner(),
        };
        if s.3 {
            s.0 += (now - s.1) * s.2;
        }
        s.1 = now;
        f(&mut *s);
    }

    fn snapshot(&self) -> (f64, f64, f64, bool) {
        match self.state.lock() {
            Ok(s) => *s,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }
}

impl MediaPlayer for VirtualPlayer {
    fn current_time(&self) -> f64 {
        let (pos, anchor, rate, playing) = self.snapshot();
        if playing {
            pos + (self.now() - anchor) * rate
        } else {
            pos
        }
    }

    fn rate(&self) -> f64 {
        self.snapshot().2
    }

    fn duration(&self) -> Option<f64> {
        None
    }

    fn is_playing(&self) -> bool {
        self.snapshot().3
    }

    fn seek_to_time(&self, secs: f64) -> Result<(), PlayerError> {
        self.update(|s| s.0 = secs);
        Ok(())
    }

    fn set_rate(&self, rate: f64) -> Result<(), PlayerError> {
        if rate <= 0.0 {
            return Err(PlayerError::RateRejected(rate.to_string()));
        }
        self.update(|s| s.2 = rate);
        Ok(())
    }

    fn play(&self) {
        self.update(|s| s.3 = true);
    }

    fn pause(&self) {
        self.update(|s| s.3 = false);
    }
}

fn main() -> Result<()> {
    env_logger::builder().format_timestamp_millis().filter_level(log::LevelFilter::Info).parse_default_env().init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => SystemConfig::load(path)?,
        None => SystemConfig::default(),
    };

    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();

    ctrlc::set_handler(move || {
        info!("Ctrl+C received. Shutting down...");
        r.store(false, Ordering::SeqCst);
    })?;

    let timeline = TimelineOption::new(&args.timeline_selector, args.units_per_tick, args.units_per_second);
    let mut options = SynchroniserOptions::new("", "", timeline);
    options.content_id_stem = args.content_id_stem.clone();
    options.wc_endpoint = Some(args.wc_url.clone());
    options.ts_endpoint = Some(args.ts_url.clone());
    options.delegate = Some(Arc::new(LoggingDelegate));
    if args.virtual_player {
        // Media time equals timeline time.
        options.media_objects.push(MediaObject::new("virtual", Arc::new(VirtualPlayer::new()), Correlation::default()));
    }

    let transports = NetworkTransports::new(config.timeline.connect_timeout());
    let mut sync = Synchroniser::new(options, config, Arc::new(transports));

    let threshold = Duration::from_secs_f64(args.threshold_ms.max(0.0) / 1000.0);
    if let Err(e) = sync.enable(threshold) {
        error!("Could not enable synchronisation: {:#}", e);
        return Err(e);
    }

    let mut last_log = Instant::now();
    while running.load(Ordering::SeqCst) {
        if last_log.elapsed() >= Duration::from_secs(10) {
            match serde_json::to_string(&sync.status()) {
                Ok(json) => info!("Status: {}", json),
                Err(e) => warn!("Could not serialize status: {}", e),
            }
            last_log = Instant::now();
        }
        thread::sleep(Duration::from_millis(100));
    }

    if !sync.disable() {
        warn!("Some workers did not stop cleanly");
    }
    info!("Exiting.");
    Ok(())
}
