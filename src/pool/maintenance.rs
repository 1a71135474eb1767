/// Process-wide maintenance shared by every pool service
///
/// Owns the asynchronous session closer and drives each pool's periodic
/// housekeeping. Query tasks only ever enqueue a close; the TCP teardown
/// happens here.
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::PoolService;
use crate::core::session::BackendSession;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct MaintenanceService {
    closer_tx: mpsc::UnboundedSender<Arc<BackendSession>>,
    /// Held by the running closer; a stopped closer releases it for the next start
    closer_rx: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<Arc<BackendSession>>>>,
    closer: Mutex<Option<JoinHandle<()>>>,
    closed: Arc<AtomicU64>,
}

impl MaintenanceService {
    pub fn new() -> Arc<Self> {
        let (closer_tx, closer_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            closer_tx,
            closer_rx: Arc::new(tokio::sync::Mutex::new(closer_rx)),
            closer: Mutex::new(None),
            closed: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Spawn the closer task; false if one is already running.
    ///
    /// The closer runs until `stop` or until the service and every pool
    /// sharing it are dropped, in which case it drains the queue first.
    pub fn start(&self) -> bool {
        let mut closer = self.closer.lock();
        if closer.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return false;
        }
        let rx = Arc::clone(&self.closer_rx);
        let closed = Arc::clone(&self.closed);
        *closer = Some(tokio::spawn(async move {
            let mut rx = rx.lock().await;
            while let Some(session) = rx.recv().await {
                if tokio::time::timeout(CLOSE_TIMEOUT, session.close_transport())
                    .await
                    .is_err()
                {
                    warn!("Closing session {} timed out", session);
                }
                closed.fetch_add(1, Ordering::Relaxed);
                debug!("Closed session {}", session);
            }
        }));
        info!("Maintenance service started");
        true
    }

    /// Abort the closer; sessions queued meanwhile wait for the next `start`
    pub fn stop(&self) {
        if let Some(handle) = self.closer.lock().take() {
            handle.abort();
            info!("Maintenance service stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.closer
            .lock()
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Queue a session for transport teardown off the caller's task
    pub fn close_later(&self, session: Arc<BackendSession>) {
        if let Err(mpsc::error::SendError(session)) = self.closer_tx.send(session) {
            // Receiver gone: dropping the session still releases its socket
            debug!("Closer queue closed, dropping session {}", session);
        }
    }

    /// Transports closed so far
    pub fn closed_count(&self) -> u64 {
        self.closed.load(Ordering::Relaxed)
    }

    /// Run `tick` every `interval`, first after one full interval, until it
    /// returns false or the handle is aborted. A panicking tick is logged and
    /// the schedule carries on.
    pub fn schedule<F>(&self, name: String, interval: Duration, mut tick: F) -> JoinHandle<()>
    where
        F: FnMut() -> bool + Send + 'static,
    {
        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                match catch_unwind(AssertUnwindSafe(|| tick())) {
                    Ok(true) => {}
                    Ok(false) => break,
                    Err(_) => error!("Unexpected panic in {}", name),
                }
            }
        })
    }

    /// Sweep `pool` every `interval` until the pool is dropped
    pub fn schedule_housekeeping(&self, pool: Weak<PoolService>, interval: Duration) -> JoinHandle<()> {
        let name = match pool.upgrade() {
            Some(pool) => format!("housekeeping of {}", pool.name()),
            None => "housekeeping".to_string(),
        };
        self.schedule(name, interval, move || {
            let Some(pool) = pool.upgrade() else {
                return false;
            };
            let report = pool.sweep(Instant::now());
            if report.closed() > 0 {
                debug!("Housekeeping {}: {}", pool.name(), report);
            }
            true
        })
    }
}
