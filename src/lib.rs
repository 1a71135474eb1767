pub mod config;
pub mod error;
/// Tablero - sharding core for a MySQL-compatible proxy
///
/// Two subsystems make up the core:
/// 1. Routing: maps route key values found in a statement to physical
///    (backend group, database, table) locations through pluggable algorithms
/// 2. Pooling: per-endpoint session pools with bounded elastic growth,
///    claim-before-close retirement and background housekeeping
pub mod core;
pub mod health;
pub mod pool;
pub mod routing;
pub mod utils;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::info;

use crate::config::Config;
use crate::core::{
    BackendGroupManager, BackendGroupSelector, BackendSession, Connector, ResultCallback,
    TcpConnector,
};
use crate::error::{RouteError, TableroError, TableroResult};
use crate::health::{HealthCheckManager, HealthChecker};
use crate::pool::{MaintenanceService, PoolService, PoolStats};
use crate::routing::{RouteInfo, RouteKeyData, RouteResolver, RouteTargets};

/// A borrowed session together with the pool it must go back to
#[derive(Debug)]
pub struct SessionLease {
    pool: Arc<PoolService>,
    session: Arc<BackendSession>,
}

impl SessionLease {
    pub fn session(&self) -> &Arc<BackendSession> {
        &self.session
    }

    pub fn pool(&self) -> &Arc<PoolService> {
        &self.pool
    }

    /// Return the session for reuse
    pub fn release(self) -> bool {
        self.pool.requite_session(&self.session)
    }

    /// Close the session instead of returning it
    pub fn discard(self, reason: &str) -> bool {
        self.pool.close_session(&self.session, reason)
    }
}

/// Routing engine plus backend pools for one proxy instance
pub struct Tablero {
    config: Config,
    resolver: RouteResolver,
    groups: BackendGroupManager,
    maintenance: Arc<MaintenanceService>,
    health_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Tablero {
    /// Validate `config`, load every rule and build one pool per endpoint
    pub fn new(config: Config, connector: Arc<dyn Connector>) -> TableroResult<Self> {
        config.validate()?;
        let resolver = RouteResolver::from_config(&config)?;
        let maintenance = MaintenanceService::new();
        let groups = BackendGroupManager::from_config(
            &config.backend_groups,
            &config.pool,
            connector,
            Arc::clone(&maintenance),
        );

        Ok(Self {
            config,
            resolver,
            groups,
            maintenance,
            health_task: parking_lot::Mutex::new(None),
            running: AtomicBool::new(false),
        })
    }

    /// Build with plain TCP transports
    pub fn with_tcp(config: Config) -> TableroResult<Self> {
        let connector = TcpConnector::new(config.pool.connect_timeout());
        Self::new(config, Arc::new(connector))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn resolver(&self) -> &RouteResolver {
        &self.resolver
    }

    pub fn groups(&self) -> &BackendGroupManager {
        &self.groups
    }

    pub fn maintenance(&self) -> &Arc<MaintenanceService> {
        &self.maintenance
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Start maintenance and every pool; false if already running
    pub fn start(&self) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.maintenance.start();
        let pools = self.groups.start_all();
        info!(
            "Tablero started: {} pools, {} routes, {} tables",
            pools,
            self.config.routes.len(),
            self.config.tables.len()
        );
        true
    }

    /// Stop health checks and every pool; false if not running
    pub fn stop(&self) -> bool {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        if let Some(task) = self.health_task.lock().take() {
            task.abort();
        }
        // The closer stays up to finish the sessions queued here and serves a
        // later restart; it ends with the last pool sharing it
        self.groups.stop_all();
        info!("Tablero stopped");
        true
    }

    /// Periodically health check every pool with `checker`
    pub fn spawn_health_checks(&self, checker: Box<dyn HealthChecker>) {
        let manager = HealthCheckManager::new(checker);
        let pools = self.groups.pools();
        let task = tokio::spawn(async move { manager.run_health_checks(pools).await });
        if let Some(previous) = self.health_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Resolve a statement on `table` for the extracted key values
    pub fn route(&self, table: &str, keys: &RouteKeyData) -> TableroResult<RouteTargets> {
        Ok(self.resolver.resolve_table(table, keys)?)
    }

    /// Shards covering `[start, end]` on `table`'s primary route key
    pub fn route_range(&self, table: &str, start: &str, end: &str) -> TableroResult<Vec<RouteInfo>> {
        let rule = self
            .resolver
            .table(table)
            .map(|t| t.route.clone())
            .ok_or_else(|| RouteError::UnknownRule(format!("(no rule for table {})", table)))?;
        Ok(self.resolver.resolve_range(table, &rule, start, end)?)
    }

    /// Borrow a session from `group`; `master` selects the write side
    pub async fn acquire(
        &self,
        group: &str,
        master: bool,
        callback: ResultCallback,
    ) -> TableroResult<SessionLease> {
        let pool = self
            .groups
            .select(group, master)
            .ok_or_else(|| TableroError::group_unavailable(group))?;
        let session = pool.get_session(callback).await?;
        Ok(SessionLease { pool, session })
    }

    /// Counters for every pool, keyed by endpoint name
    pub fn pool_stats(&self) -> Vec<(String, PoolStats)> {
        let mut stats: Vec<(String, PoolStats)> = self
            .groups
            .pools()
            .iter()
            .map(|pool| (pool.name().to_string(), pool.stats()))
            .collect();
        stats.sort_by(|a, b| a.0.cmp(&b.0));
        stats
    }
}
