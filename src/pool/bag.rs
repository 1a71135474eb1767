/// Concurrent session bag with borrow-with-timeout
///
/// Sessions live in a shared list; every ownership change is a CAS on the
/// session's own state word, so borrowers, returners and the housekeeping
/// sweep never need to hold the list lock while deciding who wins.
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::core::session::{BackendSession, SessionState};

pub struct SessionBag {
    sessions: RwLock<Vec<Arc<BackendSession>>>,
    waiters: AtomicUsize,
    available: Notify,
    /// Demand signal carrying the current waiter count
    low_supply: mpsc::Sender<usize>,
}

impl SessionBag {
    pub fn new(low_supply: mpsc::Sender<usize>) -> Self {
        Self {
            sessions: RwLock::new(Vec::new()),
            waiters: AtomicUsize::new(0),
            available: Notify::new(),
            low_supply,
        }
    }

    /// Claim any idle session without waiting
    pub fn try_borrow(&self) -> Option<Arc<BackendSession>> {
        let sessions = self.sessions.read();
        for session in sessions.iter() {
            if session.compare_and_set(SessionState::Idle, SessionState::InUse) {
                session.touch();
                return Some(Arc::clone(session));
            }
        }
        None
    }

    /// Borrow an idle session, waiting up to `timeout` for one to be returned
    /// or created. Each miss raises a low-supply signal.
    pub async fn borrow(&self, timeout: Duration) -> Option<Arc<BackendSession>> {
        if let Some(session) = self.try_borrow() {
            return Some(session);
        }

        let deadline = Instant::now() + timeout;
        let waiting = self.waiters.fetch_add(1, Ordering::AcqRel) + 1;
        let _waiter = WaiterGuard(&self.waiters);

        loop {
            self.signal_low_supply(waiting);

            // Register interest before the re-check so a concurrent requite
            // cannot slip between them unnoticed
            let notified = self.available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(session) = self.try_borrow() {
                return Some(session);
            }
            if Instant::now() >= deadline {
                return None;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.try_borrow();
            }
        }
    }

    fn signal_low_supply(&self, waiting: usize) {
        match self.low_supply.try_send(waiting) {
            Ok(()) => trace!("Signalled low supply with {} waiting", waiting),
            // A signal is already queued; the creator reads the latest counts anyway
            Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Low supply listener is gone");
            }
        }
    }

    /// Return a borrowed session and wake one waiter
    pub fn requite(&self, session: &Arc<BackendSession>) -> bool {
        // Drop any callback the last command left behind
        session.unbind();
        session.touch();
        if !session.compare_and_set(SessionState::InUse, SessionState::Idle) {
            warn!(
                "Session {} returned in state {:?}, ignoring",
                session,
                session.state()
            );
            return false;
        }
        self.available.notify_one();
        true
    }

    /// Take a session out of circulation if it is still in `expected`
    pub fn reserve(&self, expected: SessionState, session: &BackendSession) -> bool {
        session.compare_and_set(expected, SessionState::Removing)
    }

    /// Drop a session from the bag; idempotent
    pub fn remove(&self, session: &Arc<BackendSession>) -> bool {
        let mut sessions = self.sessions.write();
        match sessions.iter().position(|s| Arc::ptr_eq(s, session)) {
            Some(index) => {
                sessions.remove(index);
                session.mark_removed();
                true
            }
            None => false,
        }
    }

    /// Admit a freshly created idle session
    pub fn add(&self, session: Arc<BackendSession>) {
        self.sessions.write().push(session);
        self.available.notify_one();
    }

    /// Point-in-time copy of every session
    pub fn snapshot(&self) -> Vec<Arc<BackendSession>> {
        self.sessions.read().clone()
    }

    /// Remove every session, handing them back for closing
    pub fn drain(&self) -> Vec<Arc<BackendSession>> {
        let drained: Vec<_> = std::mem::take(&mut *self.sessions.write());
        for session in &drained {
            session.mark_removed();
        }
        drained
    }

    pub fn size(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn count(&self, state: SessionState) -> usize {
        self.sessions
            .read()
            .iter()
            .filter(|s| s.state() == state)
            .count()
    }

    pub fn waiting(&self) -> usize {
        self.waiters.load(Ordering::Acquire)
    }
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::session::testing::session;
    use std::collections::HashSet;

    fn bag() -> (Arc<SessionBag>, mpsc::Receiver<usize>) {
        let (tx, rx) = mpsc::channel(1);
        (Arc::new(SessionBag::new(tx)), rx)
    }

    #[tokio::test]
    async fn test_borrow_requite_cycle() {
        let (bag, _rx) = bag();
        bag.add(Arc::new(session(1)));

        let borrowed = bag.borrow(Duration::from_millis(10)).await.unwrap();
        assert_eq!(borrowed.state(), SessionState::InUse);
        assert_eq!(bag.count(SessionState::Idle), 0);
        assert!(bag.try_borrow().is_none());

        assert!(bag.requite(&borrowed));
        assert!(!bag.requite(&borrowed));
        assert_eq!(bag.count(SessionState::Idle), 1);
    }

    #[tokio::test]
    async fn test_zero_timeout_on_empty_bag() {
        let (bag, mut rx) = bag();
        let started = std::time::Instant::now();
        assert!(bag.borrow(Duration::ZERO).await.is_none());
        assert!(started.elapsed() < Duration::from_millis(50));
        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(bag.waiting(), 0);
    }

    #[tokio::test]
    async fn test_waiter_woken_by_requite() {
        let (bag, _rx) = bag();
        bag.add(Arc::new(session(1)));
        let held = bag.try_borrow().unwrap();

        let waiter = {
            let bag = Arc::clone(&bag);
            tokio::spawn(async move { bag.borrow(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(bag.waiting(), 1);

        bag.requite(&held);
        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.id(), 1);
    }

    #[tokio::test]
    async fn test_waiter_woken_by_add() {
        let (bag, mut rx) = bag();
        let waiter = {
            let bag = Arc::clone(&bag);
            tokio::spawn(async move { bag.borrow(Duration::from_secs(5)).await })
        };
        assert_eq!(rx.recv().await, Some(1));
        bag.add(Arc::new(session(9)));
        assert_eq!(waiter.await.unwrap().unwrap().id(), 9);
    }

    #[tokio::test]
    async fn test_reserve_and_remove() {
        let (bag, _rx) = bag();
        let s = Arc::new(session(1));
        bag.add(Arc::clone(&s));

        assert!(!bag.reserve(SessionState::InUse, &s));
        assert!(bag.reserve(SessionState::Idle, &s));
        assert!(!bag.reserve(SessionState::Idle, &s));
        assert!(bag.try_borrow().is_none());

        assert!(bag.remove(&s));
        assert!(!bag.remove(&s));
        assert_eq!(s.state(), SessionState::Removed);
        assert_eq!(bag.size(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_borrowers_never_share() {
        let (bag, _rx) = bag();
        for id in 0..4 {
            bag.add(Arc::new(session(id)));
        }

        let mut handles = Vec::new();
        for _ in 0..16 {
            let bag = Arc::clone(&bag);
            handles.push(tokio::spawn(async move {
                let mut seen = Vec::new();
                for _ in 0..50 {
                    if let Some(s) = bag.borrow(Duration::from_secs(2)).await {
                        assert_eq!(s.state(), SessionState::InUse);
                        seen.push(s.id());
                        tokio::task::yield_now().await;
                        assert!(bag.requite(&s));
                    }
                }
                seen.len()
            }));
        }

        let mut total = 0;
        for handle in handles {
            total += handle.await.unwrap();
        }
        assert_eq!(total, 16 * 50);
        assert_eq!(bag.count(SessionState::Idle), 4);
        assert_eq!(bag.size(), 4);

        let ids: HashSet<u64> = bag.snapshot().iter().map(|s| s.id()).collect();
        assert_eq!(ids.len(), 4);
    }
}
