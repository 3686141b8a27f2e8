use super::message::{ControlTimestamp, SetupMessage};
use crate::config::TimelineConfig;
use crate::traits::TsTransport;
use crate::worker::{StopSignal, Worker, WorkerRegistry};
use anyhow::Result;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TsClientState {
    #[default]
    Initialised,
    Connecting,
    Connected,
    TimelineSetup,
    Running,
    ConnectionFailure,
    Stopped,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TsClientEvent {
    StateChanged(TsClientState),
    ControlTimestamp(ControlTimestamp),
}

/// Runs on the client's I/O thread.
pub type TsEventHandler = Box<dyn FnMut(TsClientEvent) + Send>;

enum SessionEnd {
    Stopped,
    /// `established` is true once the setup message went out.
    Lost { established: bool },
}

struct Session<'a> {
    state: &'a RwLock<TsClientState>,
    handler: &'a mut TsEventHandler,
}

impl Session<'_> {
    fn emit_state(&mut self, state: TsClientState) {
        if let Ok(mut s) = self.state.write() {
            if *s == state {
                return;
            }
            *s = state;
        }
        debug!("[TS] Client state {:?}", state);
        (self.handler)(TsClientEvent::StateChanged(state));
    }

    fn run(
        &mut self,
        transport: &mut dyn TsTransport,
        setup: &str,
        config: &TimelineConfig,
        stop: &StopSignal,
    ) -> SessionEnd {
        self.emit_state(TsClientState::Connecting);
        if let Err(e) = transport.connect() {
            warn!("[TS] Connect failed: {:#}", e);
            return SessionEnd::Lost { established: false };
        }
        self.emit_state(TsClientState::Connected);

        if let Err(e) = transport.send_text(setup) {
            warn!("[TS] Setup failed: {:#}", e);
            transport.close();
            return SessionEnd::Lost { established: false };
        }
        self.emit_state(TsClientState::TimelineSetup);

        loop {
            if stop.is_stopped() {
                transport.close();
                return SessionEnd::Stopped;
            }
            match transport.recv_text(config.receive_timeout()) {
                Ok(None) => {}
                Ok(Some(text)) => match ControlTimestamp::parse(&text) {
                    Ok(ct) => {
                        self.emit_state(TsClientState::Running);
                        (self.handler)(TsClientEvent::ControlTimestamp(ct));
                    }
                    Err(e) => debug!("[TS] Dropping malformed message: {}", e),
                },
                Err(e) => {
                    warn!("[TS] Connection lost: {:#}", e);
                    transport.close();
                    return SessionEnd::Lost { established: true };
                }
            }
        }
    }
}

fn connection_loop(
    stop: StopSignal,
    transport: Arc<Mutex<Box<dyn TsTransport>>>,
    setup: String,
    config: TimelineConfig,
    state: Arc<RwLock<TsClientState>>,
    mut handler: TsEventHandler,
) {
    let mut session = Session { state: &state, handler: &mut handler };
    let mut failures = 0u32;

    loop {
        let end = match transport.lock() {
            Ok(mut t) => session.run(&mut **t, &setup, &config, &stop),
            Err(poisoned) => {
                let mut t = poisoned.into_inner();
                session.run(&mut **t, &setup, &config, &stop)
            }
        };

        match end {
            SessionEnd::Stopped => break,
            SessionEnd::Lost { established } => {
                if established {
                    failures = 0;
                }
                failures += 1;
                session.emit_state(TsClientState::ConnectionFailure);
                if failures > config.max_reconnect_attempts {
                    error!("[TS] Giving up after {} reconnect attempts", config.max_reconnect_attempts);
                    return;
                }
                info!(
                    "[TS] Reconnecting in {:?} (attempt {}/{})",
                    config.reconnect_backoff(),
                    failures,
                    config.max_reconnect_attempts
                );
                if stop.sleep(config.reconnect_backoff()) {
                    break;
                }
            }
        }
    }
    session.emit_state(TsClientState::Stopped);
}

/// Timeline Synchronisation protocol client.
///
/// Connects, sends the setup message and streams control timestamps to the
/// handler. Lost connections are retried a bounded number of times; the
/// budget is restored whenever a session gets as far as timeline setup.
pub struct TsClient {
    transport: Arc<Mutex<Box<dyn TsTransport>>>,
    setup: SetupMessage,
    config: TimelineConfig,
    state: Arc<RwLock<TsClientState>>,
    registry: Arc<WorkerRegistry>,
    worker: Option<Worker>,
}

impl TsClient {
    pub fn new(
        transport: Box<dyn TsTransport>,
        setup: SetupMessage,
        config: TimelineConfig,
        registry: Arc<WorkerRegistry>,
    ) -> Self {
        TsClient {
            transport: Arc::new(Mutex::new(transport)),
            setup,
            config,
            state: Arc::new(RwLock::new(TsClientState::Initialised)),
            registry,
            worker: None,
        }
    }

    pub fn state(&self) -> TsClientState {
        self.state.read().map(|s| *s).unwrap_or(TsClientState::Stopped)
    }

    pub fn setup(&self) -> &SetupMessage {
        &self.setup
    }

    pub fn is_running(&self) -> bool {
        self.worker.as_ref().map_or(false, |w| !w.is_finished())
    }

    pub fn start(&mut self, handler: TsEventHandler) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }
        let setup = self.setup.to_json()?;
        info!(
            "[TS] Starting client: contentIdStem={:?} timelineSelector={:?}",
            self.setup.content_id_stem, self.setup.timeline_selector
        );
        let transport = self.transport.clone();
        let config = self.config.clone();
        let state = self.state.clone();
        self.worker = Some(Worker::spawn("ts-client", &self.registry, move |stop| {
            connection_loop(stop, transport, setup, config, state, handler)
        })?);
        Ok(())
    }

    pub fn stop(&mut self, timeout: Duration) -> bool {
        match self.worker.take() {
            Some(mut w) => w.stop(timeout),
            None => true,
        }
    }
}

impl Drop for TsClient {
    fn drop(&mut self) {
        self.stop(crate::worker::DEFAULT_STOP_TIMEOUT);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::MockTsTransport;
    use crossbeam_channel::{unbounded, Receiver};
    use std::time::Instant;

    fn config(attempts: u32) -> TimelineConfig {
        TimelineConfig {
            max_reconnect_attempts: attempts,
            reconnect_backoff_ms: 1,
            receive_timeout_ms: 5,
            ..TimelineConfig::default()
        }
    }

    fn collect() -> (TsEventHandler, Receiver<TsClientEvent>) {
        let (tx, rx) = unbounded();
        (Box::new(move |e| {
            let _ = tx.send(e);
        }), rx)
    }

    fn wait_until<F: Fn() -> bool>(f: F) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !f() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn test_setup_then_streams_timestamps() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut transport = MockTsTransport::new();
        transport.expect_connect().times(1).returning(|| Ok(()));
        transport
            .expect_send_text()
            .withf(|t| t.contains("\"contentIdStem\":\"dvb://a\""))
            .times(1)
            .returning(|_| Ok(()));
        let mut n = 0;
        transport.expect_recv_text().returning(move |_| {
            n += 1;
            Ok(match n {
                1 => Some("garbage".to_string()),
                2 => Some(r#"{"contentTime":"100","wallClockTime":"2000","timelineSpeedMultiplier":1}"#.to_string()),
                _ => {
                    std::thread::sleep(Duration::from_millis(1));
                    None
                }
            })
        });
        transport.expect_close().return_const(());

        let registry = WorkerRegistry::new();
        let mut client = TsClient::new(Box::new(transport), SetupMessage::new("dvb://a", "urn:x"), config(1), registry.clone());
        let (handler, rx) = collect();
        client.start(handler).unwrap();

        wait_until(|| client.state() == TsClientState::Running);
        assert!(client.stop(Duration::from_secs(1)));
        assert_eq!(registry.active(), 0);

        let events: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            events[..4],
            [
                TsClientEvent::StateChanged(TsClientState::Connecting),
                TsClientEvent::StateChanged(TsClientState::Connected),
                TsClientEvent::StateChanged(TsClientState::TimelineSetup),
                TsClientEvent::StateChanged(TsClientState::Running),
            ]
        );
        assert_eq!(events[4], TsClientEvent::ControlTimestamp(ControlTimestamp::new(100, 2000, 1.0)));
        assert_eq!(events.last(), Some(&TsClientEvent::StateChanged(TsClientState::Stopped)));
    }

    #[test]
    fn test_reconnect_budget_is_bounded() {
        let mut transport = MockTsTransport::new();
        // One initial attempt plus two reconnects.
        transport.expect_connect().times(3).returning(|| Err(anyhow::anyhow!("refused")));

        let registry = WorkerRegistry::new();
        let mut client = TsClient::new(Box::new(transport), SetupMessage::new("s", "t"), config(2), registry.clone());
        let (handler, _rx) = collect();
        client.start(handler).unwrap();

        wait_until(|| !client.is_running());
        assert_eq!(client.state(), TsClientState::ConnectionFailure);
        assert!(client.stop(Duration::from_secs(1)));
        assert_eq!(registry.active(), 0);
    }

    #[test]
    fn test_budget_restored_after_successful_setup() {
        let mut transport = MockTsTransport::new();
        let mut connects = 0;
        transport.expect_connect().returning(move || {
            connects += 1;
            // Every other attempt succeeds, then the connection drops.
            if connects % 2 == 0 && connects <= 6 {
                Ok(())
            } else {
                Err(anyhow::anyhow!("refused"))
            }
        });
        transport.expect_send_text().returning(|_| Ok(()));
        transport.expect_recv_text().returning(|_| Err(anyhow::anyhow!("reset")));
        transport.expect_close().return_const(());

        let registry = WorkerRegistry::new();
        let mut client = TsClient::new(Box::new(transport), SetupMessage::new("s", "t"), config(2), registry);
        let (handler, rx) = collect();
        client.start(handler).unwrap();
        wait_until(|| !client.is_running());

        // Without the reset a budget of two would end after the first session.
        let setups = rx
            .try_iter()
            .filter(|e| *e == TsClientEvent::StateChanged(TsClientState::TimelineSetup))
            .count();
        assert_eq!(setups, 3);
    }
}
