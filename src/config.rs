use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemConfig {
    pub wallclock: WallClockConfig,
    pub timeline: TimelineConfig,
    pub resync: ResyncConfig,
    pub session: SessionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WallClockConfig {
    pub local_precision_ns: f64,
    pub local_max_freq_error_ppm: f64,
    pub rtt_threshold_ms: u64,
    pub response_timeout_ms: u64,
    pub min_request_wait_ms: u64,
    pub max_request_wait_ms: u64,
    pub accuracy_target_ms: f64,     // dispersion at which requests slow to the max wait
    pub max_failed_attempts: u32,    // consecutive failures before ConnectionFailure
    pub max_backoff_ms: u64,
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimelineConfig {
    pub max_reconnect_attempts: u32, // 0 = reconnect only on explicit restart
    pub reconnect_backoff_ms: u64,
    pub receive_timeout_ms: u64,
    pub connect_timeout_ms: u64,     // TCP connect and WebSocket handshake
    pub wallclock_offset_ms: f64,    // added to every wallClockTime before correlating
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResyncConfig {
    pub sync_interval_ms: u64,
    pub resync_jitter_threshold: f64,           // seconds
    pub rate_adaptation_jitter_threshold: f64,  // seconds
    pub rate_adaptation_step: f64,
    pub nominal_rate: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub accuracy_report_interval_ms: u64,
    pub wallclock_sync_timeout_ms: u64,
    pub stop_timeout_ms: u64,
}

impl Default for WallClockConfig {
    fn default() -> Self {
        WallClockConfig {
            local_precision_ns: 1000.0,
            local_max_freq_error_ppm: 500.0,
            rtt_threshold_ms: 1000,
            response_timeout_ms: 1000,
            min_request_wait_ms: 100,
            max_request_wait_ms: 2000,
            accuracy_target_ms: 10.0,
            max_failed_attempts: 10,
            max_backoff_ms: 5000,
            queue_capacity: 64,
        }
    }
}

impl Default for TimelineConfig {
    fn default() -> Self {
        TimelineConfig {
            max_reconnect_attempts: 5,
            reconnect_backoff_ms: 1000,
            receive_timeout_ms: 250,
            connect_timeout_ms: 2000,
            wallclock_offset_ms: 0.0,
        }
    }
}

impl Default for ResyncConfig {
    fn default() -> Self {
        ResyncConfig {
            sync_interval_ms: 1000,
            resync_jitter_threshold: 0.1,
            rate_adaptation_jitter_threshold: 0.5,
            rate_adaptation_step: 0.5,
            nominal_rate: 1.0,
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            accuracy_report_interval_ms: 2000,
            wallclock_sync_timeout_ms: 10_000,
            stop_timeout_ms: 2000,
        }
    }
}

impl SystemConfig {
    /// Loads a JSON config file. Missing fields keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: SystemConfig = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }
}

impl WallClockConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn min_request_wait(&self) -> Duration {
        Duration::from_millis(self.min_request_wait_ms)
    }

    pub fn max_request_wait(&self) -> Duration {
        Duration::from_millis(self.max_request_wait_ms.max(self.min_request_wait_ms))
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn rtt_threshold_ns(&self) -> i64 {
        self.rtt_threshold_ms as i64 * 1_000_000
    }
}

impl TimelineConfig {
    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms.max(1))
    }

    pub fn wallclock_offset_ns(&self) -> f64 {
        self.wallclock_offset_ms * 1_000_000.0
    }
}

impl ResyncConfig {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_millis(self.sync_interval_ms.max(1))
    }
}

impl SessionConfig {
    pub fn accuracy_report_interval(&self) -> Duration {
        Duration::from_millis(self.accuracy_report_interval_ms.max(1))
    }

    pub fn wallclock_sync_timeout(&self) -> Duration {
        Duration::from_millis(self.wallclock_sync_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }
}
