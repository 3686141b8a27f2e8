use std::time::Duration;
use thiserror::Error;

/// Failures of the clock model.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ClockError {
    #[error("clocks share no common ancestor")]
    NoCommonAncestor,
    #[error("clock hierarchy contains a cycle")]
    CycleDetected,
    #[error("tick conversion is undefined while a clock in the path has zero speed")]
    NonInvertible,
}

/// A WallClock packet that could not be decoded.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MessageError {
    #[error("wrong packet size: expected {expected} bytes, got {actual}")]
    WrongSize { expected: usize, actual: usize },
    #[error("unsupported protocol version {0}")]
    UnsupportedVersion(u8),
    #[error("unknown message type {0}")]
    UnknownMessageType(u8),
}

/// Failures reported by a media player implementation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlayerError {
    #[error("media is not seekable")]
    NotSeekable,
    #[error("seek target is outside the loaded range")]
    RangeNotLoaded,
    #[error("player rejected rate {0}")]
    RateRejected(String),
    #[error("player error: {0}")]
    Other(String),
}

/// Errors surfaced by a resync controller to its listener.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResyncError {
    #[error("no sync timeline configured")]
    NoSyncTimeline,
    #[error("sync timeline unavailable")]
    SyncTimelineUnavailable,
    #[error("media not seekable")]
    MediaNotSeekable,
    #[error("seek range not loaded")]
    SeekRangeNotLoaded,
    #[error("player rejected rate change: {0}")]
    PlayerRateRejected(String),
    #[error("player failure: {0}")]
    PlayerFailure(String),
}

impl ResyncError {
    /// Stable numeric code, as exposed to delegates.
    pub fn code(&self) -> u32 {
        match self {
            ResyncError::NoSyncTimeline => 1,
            ResyncError::SyncTimelineUnavailable => 2,
            ResyncError::MediaNotSeekable => 3,
            ResyncError::SeekRangeNotLoaded => 4,
            ResyncError::PlayerRateRejected(_) => 5,
            ResyncError::PlayerFailure(_) => 6,
        }
    }

    /// Only a missing sync timeline halts a controller.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ResyncError::NoSyncTimeline)
    }
}

impl From<PlayerError> for ResyncError {
    fn from(e: PlayerError) -> Self {
        match e {
            PlayerError::NotSeekable => ResyncError::MediaNotSeekable,
            PlayerError::RangeNotLoaded => ResyncError::SeekRangeNotLoaded,
            PlayerError::RateRejected(r) => ResyncError::PlayerRateRejected(r),
            PlayerError::Other(msg) => ResyncError::PlayerFailure(msg),
        }
    }
}

#[derive(Debug, Error)]
pub enum SynchroniserError {
    #[error("synchronisation is already enabled")]
    AlreadyEnabled,
    #[error("no {0} endpoint known; supply one or deliver content info first")]
    MissingEndpoint(&'static str),
    #[error("wallclock dispersion did not fall below {threshold:?} within {waited:?}")]
    WallClockNotSynced { threshold: Duration, waited: Duration },
    #[error("transport error: {0}")]
    Transport(String),
}
