use anyhow::{anyhow, Context, Result};
use log::{debug, info, warn};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::time::Duration;
use tungstenite::stream::MaybeTlsStream;
use tungstenite::{Message, WebSocket};

use crate::traits::{TransportFactory, TsTransport, WcTransport};

/// Largest WallClock datagram we expect. Real packets are 32 bytes.
const MAX_DATAGRAM: usize = 1500;
const MIN_READ_TIMEOUT: Duration = Duration::from_millis(1);
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Resolves `udp://host:port` or plain `host:port`.
pub fn parse_udp_endpoint(endpoint: &str) -> Result<SocketAddr> {
    let hostport = endpoint.strip_prefix("udp://").unwrap_or(endpoint).trim_end_matches('/');
    hostport
        .to_socket_addrs()
        .with_context(|| format!("Invalid WallClock endpoint '{}'", endpoint))?
        .next()
        .ok_or_else(|| anyhow!("WallClock endpoint '{}' resolved to no address", endpoint))
}

/// Accepts `ws://` URLs only; secure transport is out of scope.
pub fn validate_ws_endpoint(endpoint: &str) -> Result<()> {
    match endpoint.strip_prefix("ws://") {
        Some(rest) if !rest.is_empty() => Ok(()),
        _ => Err(anyhow!("Unsupported Timeline Sync endpoint '{}': expected ws://host[:port]/path", endpoint)),
    }
}

/// Socket address of a `ws://host[:port]/path` URL. The port defaults to 80.
pub fn ws_socket_addr(endpoint: &str) -> Result<SocketAddr> {
    validate_ws_endpoint(endpoint)?;
    let rest = &endpoint["ws://".len()..];
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    let has_port = match authority.rfind(']') {
        Some(i) => authority[i..].contains(':'),
        None => authority.contains(':'),
    };
    let hostport = if has_port { authority.to_string() } else { format!("{}:80", authority) };
    hostport
        .to_socket_addrs()
        .with_context(|| format!("Invalid Timeline Sync endpoint '{}'", endpoint))?
        .next()
        .ok_or_else(|| anyhow!("Timeline Sync endpoint '{}' resolved to no address", endpoint))
}

fn is_timeout(e: &std::io::Error) -> bool {
    matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut)
}

// ============================================================================
// WALLCLOCK (UDP)
// ============================================================================

pub struct UdpTransport {
    socket: UdpSocket,
    server: SocketAddr,
    buf: Vec<u8>,
}

impl UdpTransport {
    pub fn connect(endpoint: &str) -> Result<Self> {
        let server = parse_udp_endpoint(endpoint)?;
        let socket = Socket::new(Domain::for_address(server), Type::DGRAM, Some(Protocol::UDP))?;

        let local: SocketAddr = match server {
            SocketAddr::V4(_) => "0.0.0.0:0".parse()?,
            SocketAddr::V6(_) => "[::]:0".parse()?,
        };
        socket.bind(&local.into())?;
        socket.connect(&server.into())?;

        let socket: UdpSocket = socket.into();
        info!("[WC] UDP transport {} -> {}", socket.local_addr()?, server);
        Ok(UdpTransport { socket, server, buf: vec![0u8; MAX_DATAGRAM] })
    }

    pub fn server(&self) -> SocketAddr {
        self.server
    }
}

impl WcTransport for UdpTransport {
    fn send(&mut self, packet: &[u8]) -> Result<()> {
        let sent = self.socket.send(packet)?;
        if sent != packet.len() {
            return Err(anyhow!("Short UDP send: {} of {} bytes", sent, packet.len()));
        }
        Ok(())
    }

    fn recv(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>> {
        self.socket.set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))?;
        match self.socket.recv(&mut self.buf) {
            Ok(size) => Ok(Some(self.buf[..size].to_vec())),
            Err(ref e) if is_timeout(e) => Ok(None),
            // ICMP port unreachable surfaces here on a connected socket.
            Err(ref e) if e.kind() == std::io::ErrorKind::ConnectionRefused => {
                debug!("[WC] Server {} refused datagram", self.server);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}

// ============================================================================
// TIMELINE SYNC (WEBSOCKET)
// ============================================================================

pub struct WebSocketTransport {
    url: String,
    connect_timeout: Duration,
    socket: Option<WebSocket<MaybeTlsStream<TcpStream>>>,
}

impl WebSocketTransport {
    pub fn new(url: &str) -> Result<Self> {
        Self::with_connect_timeout(url, DEFAULT_CONNECT_TIMEOUT)
    }

    /// `connect_timeout` bounds the TCP connect and, separately, each read
    /// and write of the opening handshake.
    pub fn with_connect_timeout(url: &str, connect_timeout: Duration) -> Result<Self> {
        validate_ws_endpoint(url)?;
        Ok(WebSocketTransport { url: url.to_string(), connect_timeout, socket: None })
    }

    fn socket(&mut self) -> Result<&mut WebSocket<MaybeTlsStream<TcpStream>>> {
        self.socket.as_mut().ok_or_else(|| anyhow!("WebSocket {} is not connected", self.url))
    }
}

impl TsTransport for WebSocketTransport {
    fn connect(&mut self) -> Result<()> {
        self.close();
        let addr = ws_socket_addr(&self.url)?;
        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .with_context(|| format!("Connecting to {} ({:?} timeout)", self.url, self.connect_timeout))?;
        stream.set_read_timeout(Some(self.connect_timeout))?;
        stream.set_write_timeout(Some(self.connect_timeout))?;
        stream.set_nodelay(true)?;

        let (socket, response) = tungstenite::client(self.url.as_str(), MaybeTlsStream::Plain(stream))
            .map_err(|e| anyhow!("WebSocket handshake with {} failed: {}", self.url, e))?;
        info!("[TS] Connected to {} (HTTP {})", self.url, response.status());
        self.socket = Some(socket);
        Ok(())
    }

    fn send_text(&mut self, text: &str) -> Result<()> {
        self.socket()?.send(Message::Text(text.to_string()))?;
        Ok(())
    }

    fn recv_text(&mut self, timeout: Duration) -> Result<Option<String>> {
        let socket = self.socket()?;
        if let MaybeTlsStream::Plain(stream) = socket.get_ref() {
            stream.set_read_timeout(Some(timeout.max(MIN_READ_TIMEOUT)))?;
        }
        match socket.read() {
            Ok(Message::Text(text)) => Ok(Some(text)),
            Ok(Message::Binary(data)) => {
                debug!("[TS] Ignoring {} byte binary frame", data.len());
                Ok(None)
            }
            Ok(Message::Close(frame)) => Err(anyhow!("Server closed the connection: {:?}", frame)),
            Ok(_) => Ok(None),
            Err(tungstenite::Error::Io(ref e)) if is_timeout(e) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn close(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            if let Err(e) = socket.close(None).and_then(|_| socket.flush()) {
                debug!("[TS] Close handshake for {} incomplete: {}", self.url, e);
            }
        }
    }
}

// ============================================================================
// FACTORY
// ============================================================================

/// Opens real sockets for the endpoints a session learns about.
pub struct NetworkTransports {
    connect_timeout: Duration,
}

impl NetworkTransports {
    pub fn new(connect_timeout: Duration) -> Self {
        NetworkTransports { connect_timeout }
    }
}

impl Default for NetworkTransports {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl TransportFactory for NetworkTransports {
    fn wallclock_transport(&self, endpoint: &str) -> Result<Box<dyn WcTransport>> {
        Ok(Box::new(UdpTransport::connect(endpoint)?))
    }

    fn timeline_transport(&self, endpoint: &str) -> Result<Box<dyn TsTransport>> {
        if endpoint.starts_with("wss://") {
            warn!("[TS] Secure WebSocket endpoints are not supported: {}", endpoint);
        }
        Ok(Box::new(WebSocketTransport::with_connect_timeout(endpoint, self.connect_timeout)?))
    }
}
