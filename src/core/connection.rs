/// Backend transports and connectors
///
/// A `Connector` establishes one `Transport` per backend session. The pool
/// only needs a liveness check, a way to push command bytes and a close hook,
/// so the MySQL wire codec stays outside this crate.
use std::fmt;
use std::io;
use std::net::Shutdown;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::BackendEndpointConfig;
use crate::error::{PoolError, PoolResult};

/// One established connection to a backend
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Non-blocking liveness check
    fn is_alive(&self) -> bool;

    /// Write a complete command payload
    async fn send(&self, payload: Bytes) -> io::Result<()>;

    /// Tear the connection down; may be slow, never called on a query task
    async fn close(&self);
}

/// Factory for transports to one kind of backend
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, endpoint: &BackendEndpointConfig) -> PoolResult<Box<dyn Transport>>;
}

/// Plain TCP connector with connect timeout, TCP_NODELAY and keepalive
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    keepalive: Option<Duration>,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            keepalive: Some(Duration::from_secs(60)),
        }
    }

    pub fn with_keepalive(mut self, keepalive: Option<Duration>) -> Self {
        self.keepalive = keepalive;
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    fn configure_stream(&self, stream: &TcpStream) -> io::Result<()> {
        stream.set_nodelay(true)?;
        if let Some(idle) = self.keepalive {
            SockRef::from(stream).set_tcp_keepalive(&TcpKeepalive::new().with_time(idle))?;
        }
        Ok(())
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, endpoint: &BackendEndpointConfig) -> PoolResult<Box<dyn Transport>> {
        let address = endpoint.address();
        debug!("Connecting to backend {}", address);

        match timeout(self.connect_timeout, TcpStream::connect(address.as_str())).await {
            Ok(Ok(stream)) => {
                if let Err(e) = self.configure_stream(&stream) {
                    warn!("Failed to configure backend stream {}: {}", address, e);
                }
                debug!("Connected to backend {}", address);
                Ok(Box::new(TcpTransport::new(stream)))
            }
            Ok(Err(e)) => Err(PoolError::connect(endpoint.name(), e.to_string())),
            Err(_) => Err(PoolError::connect(
                endpoint.name(),
                format!("connect timed out after {:?}", self.connect_timeout),
            )),
        }
    }
}

/// Transport over a raw TCP stream
#[derive(Debug)]
pub struct TcpTransport {
    stream: TcpStream,
    closed: AtomicBool,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn is_alive(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        // An idle backend never speaks first: readable data or EOF both mean
        // the connection can no longer be handed to a new command.
        let mut peek = [0u8; 1];
        match self.stream.try_read(&mut peek) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            _ => false,
        }
    }

    async fn send(&self, payload: Bytes) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "transport closed"));
        }
        let mut written = 0;
        while written < payload.len() {
            self.stream.writable().await?;
            match self.stream.try_write(&payload[written..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = SockRef::from(&self.stream).shutdown(Shutdown::Both) {
            debug!("Shutdown of backend stream failed: {}", e);
        }
    }
}
