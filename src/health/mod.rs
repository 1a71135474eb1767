/// Health checking for backend endpoints
///
/// A failed check marks the endpoint's pool as down so the group selector
/// stops handing it out; a later successful check brings it back.
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::BackendEndpointConfig;
use crate::pool::PoolService;

/// First payload byte of a MySQL initial handshake (protocol v10)
const HANDSHAKE_V10: u8 = 0x0a;
/// First payload byte of a MySQL error packet
const ERR_PACKET: u8 = 0xff;

/// Health status of a backend
#[derive(Debug, Clone, PartialEq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy { reason: String },
    Timeout,
    Unknown,
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "Healthy"),
            HealthStatus::Unhealthy { reason } => write!(f, "Unhealthy: {}", reason),
            HealthStatus::Timeout => write!(f, "Timeout"),
            HealthStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

impl HealthStatus {
    /// Check if the status represents a healthy backend
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    fn unhealthy<S: Into<String>>(reason: S) -> Self {
        HealthStatus::Unhealthy {
            reason: reason.into(),
        }
    }
}

/// Health checker trait
#[async_trait]
pub trait HealthChecker: Send + Sync {
    /// Perform health check on an endpoint
    async fn check_health(&self, endpoint: &BackendEndpointConfig) -> HealthStatus;

    /// Get the check interval for this health checker
    fn check_interval(&self) -> Duration;

    /// Get the timeout for health checks
    fn check_timeout(&self) -> Duration;
}

/// Connects and waits for the server greeting. A MySQL server speaks first,
/// so a v10 handshake means it accepts clients; an error packet (too many
/// connections, blocked host) means it does not.
pub struct TcpHealthChecker {
    check_interval: Duration,
    check_timeout: Duration,
}

impl TcpHealthChecker {
    pub fn new(check_interval: Duration, check_timeout: Duration) -> Self {
        Self {
            check_interval,
            check_timeout,
        }
    }

    async fn read_greeting(stream: &mut TcpStream) -> HealthStatus {
        // 3-byte payload length, 1-byte sequence id, then the payload
        let mut header = [0u8; 5];
        if let Err(e) = stream.read_exact(&mut header).await {
            return HealthStatus::unhealthy(format!("No server greeting: {}", e));
        }
        match header[4] {
            HANDSHAKE_V10 => HealthStatus::Healthy,
            ERR_PACKET => {
                let len = u32::from_le_bytes([header[0], header[1], header[2], 0]) as usize;
                // Error code (2 bytes) precedes the message; payload byte 0 already read
                let mut rest = vec![0u8; len.saturating_sub(1).min(512)];
                let message = match stream.read_exact(&mut rest).await {
                    Ok(_) if rest.len() > 2 => String::from_utf8_lossy(&rest[2..]).into_owned(),
                    _ => "error packet".to_string(),
                };
                HealthStatus::unhealthy(format!("Server refused clients: {}", message))
            }
            other => HealthStatus::unhealthy(format!("Unexpected greeting byte 0x{:02x}", other)),
        }
    }
}

impl Default for TcpHealthChecker {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_secs(3))
    }
}

#[async_trait]
impl HealthChecker for TcpHealthChecker {
    async fn check_health(&self, endpoint: &BackendEndpointConfig) -> HealthStatus {
        let mut stream = match TcpStream::connect(endpoint.address()).await {
            Ok(stream) => stream,
            Err(e) => return HealthStatus::unhealthy(format!("Connection failed: {}", e)),
        };
        Self::read_greeting(&mut stream).await
    }

    fn check_interval(&self) -> Duration {
        self.check_interval
    }

    fn check_timeout(&self) -> Duration {
        self.check_timeout
    }
}

/// Generic health check manager
pub struct HealthCheckManager {
    checker: Box<dyn HealthChecker>,
}

impl HealthCheckManager {
    pub fn new(checker: Box<dyn HealthChecker>) -> Self {
        Self { checker }
    }

    /// Check one pool's endpoint with timeout and update its alive flag
    pub async fn check_pool(&self, pool: &PoolService) -> HealthStatus {
        let check_timeout = self.checker.check_timeout();

        let status = match timeout(check_timeout, self.checker.check_health(pool.config())).await {
            Ok(status) => status,
            Err(_) => HealthStatus::Timeout,
        };

        pool.set_alive(status.is_healthy());
        status
    }

    /// Run continuous health checking for a set of pools, checking them concurrently
    pub async fn run_health_checks(&self, pools: Vec<Arc<PoolService>>) {
        let mut interval = tokio::time::interval(self.checker.check_interval());

        loop {
            interval.tick().await;

            let statuses = join_all(pools.iter().map(|pool| self.check_pool(pool))).await;
            for (pool, status) in pools.iter().zip(statuses) {
                match status {
                    HealthStatus::Healthy => {
                        debug!("Backend {} is healthy", pool.name());
                    }
                    HealthStatus::Unhealthy { reason } => {
                        warn!("Backend {} is unhealthy: {}", pool.name(), reason);
                    }
                    HealthStatus::Timeout => {
                        warn!("Health check timeout for backend {}", pool.name());
                    }
                    HealthStatus::Unknown => {
                        warn!("Unknown health status for backend {}", pool.name());
                    }
                }
            }
        }
    }
}
