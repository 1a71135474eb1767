/// Backend session state and command completion
use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;

use crate::core::connection::Transport;
use crate::error::{PoolError, PoolResult};

/// Lifecycle of a session inside its pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Idle = 0,
    InUse = 1,
    /// Claimed for closure, still listed in the bag
    Removing = 2,
    Removed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Idle,
            1 => SessionState::InUse,
            2 => SessionState::Removing,
            _ => SessionState::Removed,
        }
    }
}

/// Outcome handed to the callback bound by the borrower
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOutcome {
    Completed(Bytes),
    Failed(String),
}

pub type ResultCallback = Box<dyn FnOnce(CommandOutcome) + Send + 'static>;

/// One pooled connection to a backend endpoint
pub struct BackendSession {
    id: u64,
    endpoint: String,
    state: AtomicU8,
    created_at: Instant,
    last_access: Mutex<Instant>,
    callback: Mutex<Option<ResultCallback>>,
    transport: Box<dyn Transport>,
}

impl BackendSession {
    pub fn new<S: Into<String>>(endpoint: S, id: u64, transport: Box<dyn Transport>) -> Self {
        let now = Instant::now();
        Self {
            id,
            endpoint: endpoint.into(),
            state: AtomicU8::new(SessionState::Idle as u8),
            created_at: now,
            last_access: Mutex::new(now),
            callback: Mutex::new(None),
            transport,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically move from `expected` to `new`; false if another actor won
    pub fn compare_and_set(&self, expected: SessionState, new: SessionState) -> bool {
        self.state
            .compare_exchange(
                expected as u8,
                new as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn mark_removed(&self) {
        self.state.store(SessionState::Removed as u8, Ordering::Release);
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_access(&self) -> Instant {
        *self.last_access.lock()
    }

    pub fn touch(&self) {
        *self.last_access.lock() = Instant::now();
    }

    #[cfg(test)]
    pub(crate) fn set_last_access(&self, at: Instant) {
        *self.last_access.lock() = at;
    }

    #[cfg(test)]
    pub(crate) fn aged(mut self, by: Duration) -> Self {
        self.created_at -= by;
        self
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_access())
    }

    pub fn is_alive(&self) -> bool {
        self.transport.is_alive()
    }

    /// Bind the completion callback of the command about to run
    pub fn bind(&self, callback: ResultCallback) -> PoolResult<()> {
        let mut slot = self.callback.lock();
        if slot.is_some() {
            return Err(PoolError::CallbackAlreadyBound(self.to_string()));
        }
        *slot = Some(callback);
        Ok(())
    }

    pub fn is_bound(&self) -> bool {
        self.callback.lock().is_some()
    }

    pub(crate) fn unbind(&self) -> Option<ResultCallback> {
        self.callback.lock().take()
    }

    /// Fire the bound callback once; false when nothing was bound
    pub fn complete(&self, outcome: CommandOutcome) -> bool {
        // Release the lock before running foreign code
        let callback = self.unbind();
        match callback {
            Some(callback) => {
                self.touch();
                callback(outcome);
                true
            }
            None => false,
        }
    }

    /// Forward a command to the backend
    pub async fn send(&self, payload: Bytes) -> PoolResult<()> {
        self.touch();
        self.transport
            .send(payload)
            .await
            .map_err(|_| PoolError::TransportClosed(self.to_string()))
    }

    pub(crate) async fn close_transport(&self) {
        self.transport.close().await;
    }
}

impl fmt::Display for BackendSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.endpoint, self.id)
    }
}

impl fmt::Debug for BackendSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackendSession")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("state", &self.state())
            .field("bound", &self.is_bound())
            .finish()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{session, MockTransport};
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    #[test]
    fn test_state_transitions() {
        let session = session(1);
        assert_eq!(session.state(), SessionState::Idle);
        assert!(session.compare_and_set(SessionState::Idle, SessionState::InUse));
        assert!(!session.compare_and_set(SessionState::Idle, SessionState::InUse));
        assert_eq!(session.state(), SessionState::InUse);
        session.mark_removed();
        assert_eq!(session.state(), SessionState::Removed);
        assert!(!session.compare_and_set(SessionState::InUse, SessionState::Idle));
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(session(7).to_string(), "root@127.0.0.1:3306#7");
    }

    #[test]
    fn test_callback_bound_once_and_fired_once() {
        let session = session(1);
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        session
            .bind(Box::new(move |outcome| {
                assert_eq!(outcome, CommandOutcome::Completed(Bytes::from_static(b"ok")));
                flag.store(true, Ordering::SeqCst);
            }))
            .unwrap();

        let second = session.bind(Box::new(|_| {}));
        assert!(matches!(second, Err(PoolError::CallbackAlreadyBound(_))));

        assert!(session.complete(CommandOutcome::Completed(Bytes::from_static(b"ok"))));
        assert!(fired.load(Ordering::SeqCst));
        assert!(!session.complete(CommandOutcome::Failed("late".into())));
        assert!(!session.is_bound());
    }

    #[tokio::test]
    async fn test_send_and_close() {
        let transport = MockTransport::new();
        let sent = Arc::clone(&transport.sent);
        let session = BackendSession::new("root@db:3306", 3, Box::new(transport));

        session.send(Bytes::from_static(b"SELECT 1")).await.unwrap();
        assert_eq!(sent.lock().len(), 1);

        session.close_transport().await;
        assert!(!session.is_alive());
        assert!(matches!(
            session.send(Bytes::from_static(b"SELECT 2")).await,
            Err(PoolError::TransportClosed(_))
        ));
    }
}
