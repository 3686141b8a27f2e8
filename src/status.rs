use crate::controller::ResyncState;
use crate::synchroniser::SynchroniserState;
use crate::timeline::TsState;
use crate::wallclock::client::WcClientState;
use serde::{Deserialize, Serialize};

/// Per media object resync status.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct MediaObjectStatus {
    pub id: String,
    pub state: ResyncState,
    /// Last measured jitter (seconds). None before the first cycle.
    pub jitter: Option<f64>,
}

/// Session status snapshot
///
/// Everything a monitor needs to show how well the companion is tracking
/// the TV: WallClock quality, timeline state and each media object's resync
/// state. Serializable so it can be logged or exported as JSON.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct SynchroniserStatus {
    // ========================================================================
    // Session
    // ========================================================================
    pub state: SynchroniserState,

    pub content_id: Option<String>,

    pub timeline_selector: String,

    /// Worker threads still alive for this session
    pub active_workers: usize,

    /// Unix timestamp of this snapshot
    pub updated_ts: u64,

    // ========================================================================
    // WallClock
    // ========================================================================
    pub wc_state: WcClientState,

    /// Current best-candidate dispersion (nanoseconds)
    pub wc_dispersion_ns: Option<f64>,

    /// Offset applied by the last adopted candidate (nanoseconds)
    pub wc_offset_ns: Option<i64>,

    pub wc_candidates_received: u64,
    pub wc_candidates_useful: u64,
    pub wc_candidates_dropped: u64,
    pub wc_useful_percent: f64,

    // ========================================================================
    // Timeline
    // ========================================================================
    pub ts_state: TsState,

    pub timeline_available: bool,

    /// Current position on the sync timeline (seconds)
    pub timeline_time: Option<f64>,

    pub control_timestamps: u64,

    /// Total uncertainty of the sync timeline (seconds)
    pub sync_error_secs: Option<f64>,

    // ========================================================================
    // Media objects
    // ========================================================================
    pub media_objects: Vec<MediaObjectStatus>,
}

impl Default for SynchroniserStatus {
    fn default() -> Self {
        SynchroniserStatus {
            state: SynchroniserState::Initialised,
            content_id: None,
            timeline_selector: String::new(),
            active_workers: 0,
            updated_ts: 0,

            wc_state: WcClientState::Idle,
            wc_dispersion_ns: None,
            wc_offset_ns: None,
            wc_candidates_received: 0,
            wc_candidates_useful: 0,
            wc_candidates_dropped: 0,
            wc_useful_percent: 0.0,

            ts_state: TsState::Initialised,
            timeline_available: false,
            timeline_time: None,
            control_timestamps: 0,
            sync_error_secs: None,

            media_objects: Vec::new(),
        }
    }
}
