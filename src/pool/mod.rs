/// Per-endpoint backend session pools
///
/// A `PoolService` owns the sessions to one MySQL-speaking endpoint. Query
/// tasks borrow and return sessions through the bag; growth is driven by
/// low-supply signals consumed by a small set of creation workers, and a
/// periodic sweep retires idle, stuck and aged sessions.
pub mod bag;
pub mod housekeeping;
pub mod maintenance;

pub use bag::SessionBag;
pub use housekeeping::SweepReport;
pub use maintenance::MaintenanceService;

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::{BackendEndpointConfig, PoolConfig};
use crate::core::connection::Connector;
use crate::core::session::{BackendSession, ResultCallback, SessionState};
use crate::error::{PoolError, PoolResult};

const RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Idle plus in-use; sessions already claimed for closing are left out
    pub total: usize,
    pub idle: usize,
    pub in_use: usize,
    pub waiting: usize,
    pub pending_creates: usize,
}

impl fmt::Display for PoolStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} idle={} in_use={} waiting={} pending={}",
            self.total, self.idle, self.in_use, self.waiting, self.pending_creates
        )
    }
}

/// Growth policy: never exceed `max_conn` counting in-flight creations, and
/// only grow for unmet demand or to restore the `min_conn` floor.
pub fn should_create_session(
    total: usize,
    pending: usize,
    waiting: usize,
    idle: usize,
    min_conn: usize,
    max_conn: usize,
) -> bool {
    total + pending < max_conn && (waiting > pending || idle < min_conn)
}

pub struct PoolService {
    name: String,
    config: BackendEndpointConfig,
    acquire_timeout: Duration,
    housekeeping_interval: Duration,
    bag: SessionBag,
    connector: Arc<dyn Connector>,
    maintenance: Arc<MaintenanceService>,
    running: AtomicBool,
    alive: AtomicBool,
    slave: AtomicBool,
    pending_creates: AtomicUsize,
    next_id: AtomicU64,
    /// Serializes the growth check with the pending increment
    create_gate: Mutex<()>,
    creators: Arc<Semaphore>,
    low_supply: Arc<tokio::sync::Mutex<mpsc::Receiver<usize>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolService {
    pub fn new(
        config: BackendEndpointConfig,
        pool: &PoolConfig,
        connector: Arc<dyn Connector>,
        maintenance: Arc<MaintenanceService>,
    ) -> Arc<Self> {
        let (low_supply_tx, low_supply_rx) = mpsc::channel(1);
        Arc::new(Self {
            name: config.name(),
            config,
            acquire_timeout: pool.acquire_timeout(),
            housekeeping_interval: pool.housekeeping_interval(),
            bag: SessionBag::new(low_supply_tx),
            connector,
            maintenance,
            running: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            slave: AtomicBool::new(false),
            pending_creates: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
            create_gate: Mutex::new(()),
            creators: Arc::new(Semaphore::new(pool.creator_workers.max(1))),
            low_supply: Arc::new(tokio::sync::Mutex::new(low_supply_rx)),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BackendEndpointConfig {
        &self.config
    }

    pub fn weight(&self) -> usize {
        self.config.weight
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    pub fn set_alive(&self, alive: bool) {
        if self.alive.swap(alive, Ordering::AcqRel) != alive {
            info!("Pool {} is now {}", self.name, if alive { "alive" } else { "down" });
        }
    }

    pub fn is_slave_node(&self) -> bool {
        self.slave.load(Ordering::Acquire)
    }

    pub fn set_slave_node(&self, slave: bool) {
        self.slave.store(slave, Ordering::Release);
    }

    /// Start creation workers and housekeeping; false if already running
    pub fn start(self: &Arc<Self>) -> bool {
        if self
            .running
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        {
            let mut tasks = self.tasks.lock();
            tasks.push(self.spawn_creator_dispatcher());
            tasks.push(
                self.maintenance
                    .schedule_housekeeping(Arc::downgrade(self), self.housekeeping_interval),
            );
        }
        info!(
            "Pool {} started (min_conn={}, max_conn={})",
            self.name, self.config.min_conn, self.config.max_conn
        );
        self.fill_pool();
        true
    }

    /// Close every session and stop background work; false if not running
    pub fn stop(&self) -> bool {
        if self
            .running
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        let sessions = self.bag.drain();
        let closing = sessions.len();
        for session in sessions {
            self.maintenance.close_later(session);
        }
        info!("Pool {} stopped, closing {} sessions", self.name, closing);
        true
    }

    /// Borrow a session with the configured acquisition timeout
    pub async fn get_session(&self, callback: ResultCallback) -> PoolResult<Arc<BackendSession>> {
        self.get_session_timeout(self.acquire_timeout, callback).await
    }

    /// Borrow a live, unexpired session and bind `callback` to it. Dead or
    /// aged sessions found on the way are closed and the borrow continues
    /// with whatever budget is left.
    pub async fn get_session_timeout(
        &self,
        timeout: Duration,
        callback: ResultCallback,
    ) -> PoolResult<Arc<BackendSession>> {
        if !self.is_running() {
            return Err(PoolError::NotRunning(self.name.clone()));
        }

        let started = Instant::now();
        let deadline = started + timeout;
        let max_age = self.config.max_age();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let Some(session) = self.bag.borrow(remaining).await else {
                warn!("Pool {} exhausted ({})", self.name, self.stats());
                return Err(PoolError::Exhausted {
                    endpoint: self.name.clone(),
                    waited: started.elapsed(),
                });
            };

            if !session.is_alive() {
                self.close_session(&session, "transport is not alive");
                continue;
            }
            if session.age(std::time::Instant::now()) > max_age {
                self.close_session(&session, "max age reached");
                continue;
            }

            if let Err(e) = session.bind(callback) {
                self.bag.requite(&session);
                return Err(e);
            }
            return Ok(session);
        }
    }

    /// Return a borrowed session; call exactly once per successful borrow
    pub fn requite_session(&self, session: &Arc<BackendSession>) -> bool {
        self.bag.requite(session)
    }

    /// Close a borrowed session instead of returning it
    pub fn close_session(&self, session: &Arc<BackendSession>, reason: &str) -> bool {
        self.close_if(SessionState::InUse, session, reason)
    }

    /// Claim `session` from `expected` and queue its close; false when
    /// another actor got there first
    pub(crate) fn close_if(
        &self,
        expected: SessionState,
        session: &Arc<BackendSession>,
        reason: &str,
    ) -> bool {
        if !self.bag.reserve(expected, session) {
            return false;
        }
        if self.bag.remove(session) {
            info!(
                "Pool {}({}) close session {} by {}",
                self.name,
                self.bag.size(),
                session,
                reason
            );
            self.maintenance.close_later(Arc::clone(session));
        }
        true
    }

    pub fn stats(&self) -> PoolStats {
        let mut stats = PoolStats {
            waiting: self.bag.waiting(),
            pending_creates: self.pending_creates.load(Ordering::Acquire),
            ..Default::default()
        };
        for session in self.bag.snapshot() {
            match session.state() {
                SessionState::Idle => stats.idle += 1,
                SessionState::InUse => stats.in_use += 1,
                SessionState::Removing | SessionState::Removed => {}
            }
        }
        stats.total = stats.idle + stats.in_use;
        stats
    }

    pub(crate) fn bag(&self) -> &SessionBag {
        &self.bag
    }

    fn should_create_another(&self) -> bool {
        should_create_session(
            self.bag.size(),
            self.pending_creates.load(Ordering::Acquire),
            self.bag.waiting(),
            self.bag.count(SessionState::Idle),
            self.config.min_conn,
            self.config.max_conn,
        )
    }

    fn begin_create(&self) -> bool {
        let _gate = self.create_gate.lock();
        if self.should_create_another() {
            self.pending_creates.fetch_add(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    fn spawn_creator_dispatcher(self: &Arc<Self>) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let signals = Arc::clone(&self.low_supply);
        tokio::spawn(async move {
            let mut signals = signals.lock_owned().await;
            while let Some(waiting) = signals.recv().await {
                let Some(pool) = pool.upgrade() else {
                    break;
                };
                pool.on_low_supply(waiting);
            }
        })
    }

    fn on_low_supply(self: &Arc<Self>, waiting: usize) {
        let pending = self.pending_creates.load(Ordering::Acquire);
        if pending > 0 {
            trace!("Pool {}: {} waiting, {} creations pending", self.name, waiting, pending);
            return;
        }
        debug!("Pool {}: {} waiting, requesting sessions", self.name, waiting);
        self.fill_pool();
    }

    /// Hand a creation run to a free worker; dropped when all are busy
    pub(crate) fn fill_pool(self: &Arc<Self>) {
        if !self.is_running() || !self.should_create_another() {
            return;
        }
        let permit = match Arc::clone(&self.creators).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                trace!("Pool {}: creation workers busy, request dropped", self.name);
                return;
            }
        };
        let pool = Arc::clone(self);
        tokio::spawn(async move {
            let _permit = permit;
            pool.create_sessions().await;
        });
    }

    async fn create_sessions(&self) {
        while self.is_running() && self.begin_create() {
            match self.create_session().await {
                Ok(session) => self.add_session(session),
                Err(e) => {
                    self.pending_creates.fetch_sub(1, Ordering::AcqRel);
                    warn!("Pool {} failed to create session: {}", self.name, e);
                    break;
                }
            }
        }
    }

    async fn create_session(&self) -> PoolResult<BackendSession> {
        let attempts = self.config.max_retry.max(1);
        let mut attempt = 1;
        loop {
            match self.connector.connect(&self.config).await {
                Ok(transport) => {
                    let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
                    let session = BackendSession::new(self.name.clone(), id, transport);
                    info!(
                        "Pool {}({}+{}) create session {}",
                        self.name,
                        self.bag.size(),
                        self.pending_creates.load(Ordering::Acquire),
                        session
                    );
                    return Ok(session);
                }
                Err(e) if attempt < attempts => {
                    debug!(
                        "Pool {} connect attempt {}/{} failed: {}",
                        self.name, attempt, attempts, e
                    );
                    tokio::time::sleep(RETRY_BACKOFF * attempt).await;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn add_session(&self, session: BackendSession) {
        let session = Arc::new(session);
        if self.is_running() {
            self.bag.add(session);
        } else {
            self.maintenance.close_later(session);
        }
        self.pending_creates.fetch_sub(1, Ordering::AcqRel);
    }
}

impl fmt::Debug for PoolService {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolService")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("alive", &self.is_alive())
            .field("slave", &self.is_slave_node())
            .field("stats", &self.stats())
            .finish()
    }
}

impl Drop for PoolService {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::core::session::testing::{session, MockTransport};
    use crate::core::session::CommandOutcome;
    use std::collections::HashSet;
    use tokio_test::assert_ok;

    fn noop() -> ResultCallback {
        Box::new(|_| {})
    }

    #[test]
    fn test_should_create_session_policy() {
        // Floor not met
        assert!(should_create_session(0, 0, 0, 0, 1, 10));
        // Demand exceeds in-flight creations
        assert!(should_create_session(3, 1, 2, 0, 1, 10));
        // In-flight creations already cover demand
        assert!(!should_create_session(3, 2, 2, 1, 1, 10));
        // Cap counts pending creations
        assert!(!should_create_session(8, 2, 5, 0, 1, 10));
        assert!(!should_create_session(10, 0, 5, 0, 1, 10));
    }

    #[tokio::test]
    async fn test_start_stop_idempotent() {
        let pool = pool_with(endpoint(1, 4), Arc::new(MockConnector::default()));
        assert!(pool.start());
        assert!(!pool.start());
        assert!(wait_for(|| pool.stats().idle == 1).await);

        assert!(pool.stop());
        assert!(!pool.stop());
        assert_eq!(pool.stats().total, 0);
        assert!(matches!(
            pool.get_session(noop()).await,
            Err(PoolError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_get_and_requite() {
        let pool = pool_with(endpoint(1, 4), Arc::new(MockConnector::default()));
        pool.start();

        let session = assert_ok!(pool.get_session(noop()).await);
        assert!(session.is_bound());
        assert_eq!(session.state(), SessionState::InUse);
        assert_eq!(pool.stats().in_use, 1);

        assert!(session.complete(CommandOutcome::Failed("cancelled".into())));
        assert!(pool.requite_session(&session));
        assert_eq!(session.state(), SessionState::Idle);
        pool.stop();
    }

    #[tokio::test]
    async fn test_zero_timeout_empty_pool_returns_immediately() {
        let connector = Arc::new(MockConnector {
            delay: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        let pool = pool_with(endpoint(0, 4), connector);
        pool.start();

        let started = std::time::Instant::now();
        let result = pool.get_session_timeout(Duration::ZERO, noop()).await;
        assert!(matches!(result, Err(PoolError::Exhausted { .. })));
        assert!(started.elapsed() < Duration::from_millis(100));
        pool.stop();
    }

    #[tokio::test]
    async fn test_demand_grows_pool_up_to_max() {
        let connector = Arc::new(MockConnector::default());
        let pool = pool_with(endpoint(0, 3), Arc::clone(&connector));
        pool.start();

        let mut held = Vec::new();
        for _ in 0..3 {
            held.push(assert_ok!(
                pool.get_session_timeout(Duration::from_secs(2), noop()).await
            ));
        }
        let ids: HashSet<u64> = held.iter().map(|s| s.id()).collect();
        assert_eq!(ids.len(), 3);

        // Cap reached: a fourth borrower times out and nothing new is created
        let result = pool
            .get_session_timeout(Duration::from_millis(100), noop())
            .await;
        assert!(matches!(result, Err(PoolError::Exhausted { .. })));
        assert_eq!(pool.stats().total, 3);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 3);

        for session in &held {
            pool.requite_session(session);
        }
        pool.stop();
    }

    #[tokio::test]
    async fn test_closed_session_cannot_be_requited() {
        let pool = pool_with(endpoint(1, 2), Arc::new(MockConnector::default()));
        pool.start();
        assert!(wait_for(|| pool.stats().idle == 1).await);

        let first = assert_ok!(pool.get_session(noop()).await);
        let first_id = first.id();
        pool.close_session(&first, "test");
        assert!(!pool.requite_session(&first));

        let second = assert_ok!(pool.get_session(noop()).await);
        assert_ne!(second.id(), first_id);
        pool.stop();
    }

    fn dead_session(id: u64) -> Arc<BackendSession> {
        let transport = MockTransport::new();
        transport.alive.store(false, Ordering::SeqCst);
        Arc::new(BackendSession::new("root@127.0.0.1:3306", id, Box::new(transport)))
    }

    #[tokio::test]
    async fn test_dead_session_closed_and_replaced_on_borrow() {
        let pool = pool_with(endpoint(0, 2), Arc::new(MockConnector::default()));
        pool.start();
        let dead = dead_session(100);
        pool.bag().add(Arc::clone(&dead));

        let session = assert_ok!(pool.get_session(noop()).await);
        assert_ne!(session.id(), 100);
        assert!(session.is_alive());
        assert_eq!(dead.state(), SessionState::Removed);
        assert_eq!(pool.stats().total, 1);
        pool.stop();
    }

    #[tokio::test]
    async fn test_aged_session_closed_and_replaced_on_borrow() {
        let mut config = endpoint(0, 2);
        config.conn_max_age_sec = 1;
        let pool = pool_with(config, Arc::new(MockConnector::default()));
        pool.start();
        let old = Arc::new(session(100).aged(Duration::from_secs(2)));
        pool.bag().add(Arc::clone(&old));

        let session = assert_ok!(pool.get_session(noop()).await);
        assert_ne!(session.id(), 100);
        assert_eq!(old.state(), SessionState::Removed);
        assert!(!old.is_bound());
        pool.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_after_dead_session_keeps_original_deadline() {
        let connector = Arc::new(MockConnector {
            delay: Some(Duration::from_secs(10)),
            ..Default::default()
        });
        let pool = pool_with(endpoint(0, 4), connector);
        pool.start();

        // A dead session shows up well into the wait; the retry after closing
        // it may only use what is left of the 200ms budget
        let delayed = Arc::clone(&pool);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(150)).await;
            delayed.bag().add(dead_session(100));
        });

        let started = Instant::now();
        let result = pool
            .get_session_timeout(Duration::from_millis(200), noop())
            .await;
        let elapsed = started.elapsed();
        match result {
            Err(PoolError::Exhausted { waited, .. }) => {
                assert!(waited >= Duration::from_millis(200), "waited {:?}", waited);
                assert!(waited < Duration::from_millis(250), "waited {:?}", waited);
            }
            other => panic!("unexpected result {:?}", other),
        }
        assert!(elapsed < Duration::from_millis(250));
        assert_eq!(pool.stats().total, 0);
        pool.stop();
    }

    #[tokio::test]
    async fn test_connect_failure_retries_then_gives_up() {
        let connector = Arc::new(MockConnector::default());
        connector.fail.store(true, Ordering::SeqCst);
        let pool = pool_with(endpoint(1, 2), Arc::clone(&connector));
        pool.start();

        assert!(wait_for(|| connector.connects.load(Ordering::SeqCst) >= 2).await);
        assert!(wait_for(|| pool.stats().pending_creates == 0).await);
        assert_eq!(pool.stats().total, 0);
        pool.stop();
    }

    #[tokio::test]
    async fn test_stats_leave_out_sessions_being_closed() {
        let pool = pool_with(endpoint(0, 4), Arc::new(MockConnector::default()));
        let sessions: Vec<_> = (1..=3).map(|id| Arc::new(session(id))).collect();
        for s in &sessions {
            pool.bag().add(Arc::clone(s));
        }
        assert!(sessions[0].compare_and_set(SessionState::Idle, SessionState::InUse));
        assert!(pool.bag().reserve(SessionState::Idle, &sessions[1]));

        let stats = pool.stats();
        assert_eq!(stats.idle, 1);
        assert_eq!(stats.in_use, 1);
        assert_eq!(stats.total, 2);
        assert_eq!(pool.bag().size(), 3);
    }

    #[tokio::test]
    async fn test_flags() {
        let pool = pool_with(endpoint(0, 1), Arc::new(MockConnector::default()));
        assert!(pool.is_alive());
        pool.set_alive(false);
        assert!(!pool.is_alive());
        assert!(!pool.is_slave_node());
        pool.set_slave_node(true);
        assert!(pool.is_slave_node());
        assert_eq!(pool.name(), "root@127.0.0.1:3306");
    }
}
