//! Pool behavior under concurrent borrowers, driven through the public API

use std::collections::HashSet;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tablero::config::{BackendEndpointConfig, PoolConfig};
use tablero::core::{BackendSession, CommandOutcome, Connector, SessionState, Transport};
use tablero::error::{PoolError, PoolResult};
use tablero::pool::{MaintenanceService, PoolService};

#[derive(Debug, Default)]
struct FakeTransport {
    alive: AtomicBool,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Transport for FakeTransport {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn send(&self, _payload: Bytes) -> io::Result<()> {
        Ok(())
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeConnector {
    connects: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _endpoint: &BackendEndpointConfig) -> PoolResult<Box<dyn Transport>> {
        tokio::time::sleep(Duration::from_millis(2)).await;
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeTransport {
            alive: AtomicBool::new(true),
            closed: Arc::clone(&self.closed),
        }))
    }
}

fn pool(min_conn: usize, max_conn: usize, connector: Arc<FakeConnector>) -> Arc<PoolService> {
    let mut endpoint = BackendEndpointConfig::new("127.0.0.1", 3306, "app");
    endpoint.min_conn = min_conn;
    endpoint.max_conn = max_conn;
    let settings = PoolConfig {
        acquire_timeout_ms: 2_000,
        housekeeping_interval_ms: 60_000,
        creator_workers: 4,
        connect_timeout_ms: 100,
    };
    let maintenance = MaintenanceService::new();
    maintenance.start();
    PoolService::new(endpoint, &settings, connector, maintenance)
}

async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..400 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_no_session_is_shared_between_borrowers() {
    let connector = Arc::new(FakeConnector::default());
    let pool = pool(0, 4, Arc::clone(&connector));
    assert!(pool.start());

    let held: Arc<Mutex<HashSet<u64>>> = Arc::new(Mutex::new(HashSet::new()));
    let overlaps = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..24 {
        let pool = Arc::clone(&pool);
        let held = Arc::clone(&held);
        let overlaps = Arc::clone(&overlaps);
        handles.push(tokio::spawn(async move {
            for _ in 0..20 {
                let session = pool.get_session(Box::new(|_| {})).await.unwrap();
                assert_eq!(session.state(), SessionState::InUse);
                if !held.lock().insert(session.id()) {
                    overlaps.fetch_add(1, Ordering::SeqCst);
                }
                tokio::task::yield_now().await;
                held.lock().remove(&session.id());
                assert!(pool.requite_session(&session));
            }
        }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    let stats = pool.stats();
    assert!(stats.total <= 4, "pool grew past max_conn: {}", stats);
    assert_eq!(stats.in_use, 0);
    assert!(connector.connects.load(Ordering::SeqCst) <= 4);
    pool.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pool_fills_to_min_and_grows_on_demand() {
    let connector = Arc::new(FakeConnector::default());
    let pool = pool(2, 3, Arc::clone(&connector));
    pool.start();
    assert!(eventually(|| pool.stats().idle == 2).await);

    let a = pool.get_session(Box::new(|_| {})).await.unwrap();
    let b = pool.get_session(Box::new(|_| {})).await.unwrap();
    // Third borrower waits and its demand triggers one more session
    let c = pool.get_session(Box::new(|_| {})).await.unwrap();
    assert_eq!(pool.stats().total, 3);

    let err = pool
        .get_session_timeout(Duration::from_millis(30), Box::new(|_| {}))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::Exhausted { .. }));

    for session in [&a, &b, &c] {
        assert!(pool.requite_session(session));
    }
    assert_eq!(pool.stats().idle, 3);
    assert_eq!(connector.connects.load(Ordering::SeqCst), 3);
    pool.stop();
}

#[tokio::test]
async fn test_callback_receives_outcome_once() {
    let pool = pool(1, 1, Arc::new(FakeConnector::default()));
    pool.start();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let session = pool
        .get_session(Box::new(move |outcome| sink.lock().push(outcome)))
        .await
        .unwrap();
    session.send(Bytes::from_static(b"\x03SELECT 1")).await.unwrap();
    assert!(session.complete(CommandOutcome::Completed(Bytes::from_static(b"ok"))));
    assert!(!session.complete(CommandOutcome::Failed("late".to_string())));
    assert_eq!(seen.lock().len(), 1);

    assert!(pool.requite_session(&session));
    assert!(!session.is_bound());
    pool.stop();
}

#[tokio::test]
async fn test_discarded_sessions_are_closed_and_replaced() {
    let connector = Arc::new(FakeConnector::default());
    let pool = pool(1, 2, Arc::clone(&connector));
    pool.start();

    let session: Arc<BackendSession> = pool.get_session(Box::new(|_| {})).await.unwrap();
    assert!(pool.close_session(&session, "protocol error"));
    assert!(!pool.close_session(&session, "again"));
    assert_eq!(session.state(), SessionState::Removed);

    assert!(eventually(|| connector.closed.load(Ordering::SeqCst) == 1).await);
    let replacement = pool.get_session(Box::new(|_| {})).await.unwrap();
    assert_ne!(replacement.id(), session.id());
    pool.requite_session(&replacement);
    pool.stop();
}

#[tokio::test]
async fn test_sweep_retires_expired_idle_sessions() {
    let connector = Arc::new(FakeConnector::default());
    let pool = pool(1, 3, Arc::clone(&connector));
    pool.start();

    let borrowed: Vec<_> = futures::future::join_all(
        (0..3).map(|_| pool.get_session(Box::new(|_| {}))),
    )
    .await
    .into_iter()
    .map(Result::unwrap)
    .collect();
    for session in &borrowed {
        pool.requite_session(session);
    }
    assert_eq!(pool.stats().idle, 3);

    // Far enough ahead that every idle session is past its idle timeout
    let later = Instant::now() + pool.config().idle_timeout() + Duration::from_secs(1);
    let report = pool.sweep(later);
    assert_eq!(report.idle_seen, 3);
    assert_eq!(report.idle_timeouts, 2);
    assert_eq!(pool.stats().total, 1);
    pool.stop();
}

#[tokio::test]
async fn test_stopped_pool_rejects_borrowers() {
    let pool = pool(1, 1, Arc::new(FakeConnector::default()));
    assert!(matches!(
        pool.get_session(Box::new(|_| {})).await,
        Err(PoolError::NotRunning(_))
    ));
    assert!(pool.start());
    assert!(pool.stop());
    assert!(!pool.stop());
    assert!(matches!(
        pool.get_session(Box::new(|_| {})).await,
        Err(PoolError::NotRunning(_))
    ));
}
