use crate::error::PlayerError;
use anyhow::Result;
use std::time::Duration;

/// Datagram transport to a WallClock server.
#[cfg_attr(test, mockall::automock)]
pub trait WcTransport: Send {
    fn send(&mut self, packet: &[u8]) -> Result<()>;

    /// Receive one datagram. Returns Ok(None) on timeout.
    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;
}

/// Message-oriented connection to a Timeline Sync server.
#[cfg_attr(test, mockall::automock)]
pub trait TsTransport: Send {
    fn connect(&mut self) -> Result<()>;

    fn send_text(&mut self, text: &str) -> Result<()>;

    /// Receive one text message. Returns Ok(None) on timeout.
    /// An error means the connection is gone.
    fn recv_text(&mut self, timeout: Duration) -> Result<Option<String>>;

    /// Close the connection. Default impl does nothing.
    fn close(&mut self) {}
}

/// Builds transports for the endpoints a session learns about.
pub trait TransportFactory: Send + Sync {
    fn wallclock_transport(&self, endpoint: &str) -> Result<Box<dyn WcTransport>>;
    fn timeline_transport(&self, endpoint: &str) -> Result<Box<dyn TsTransport>>;
}

/// A media player driven by a resync controller. Times are in seconds.
#[cfg_attr(test, mockall::automock)]
pub trait MediaPlayer: Send + Sync {
    fn current_time(&self) -> f64;
    fn rate(&self) -> f64;
    fn duration(&self) -> Option<f64>;
    fn is_playing(&self) -> bool;
    fn seek_to_time(&self, time: f64) -> std::result::Result<(), PlayerError>;
    fn set_rate(&self, rate: f64) -> std::result::Result<(), PlayerError>;
    fn play(&self);
    fn pause(&self);
}
