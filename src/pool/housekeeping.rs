/// Periodic retirement of stuck, idle and aged sessions
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use super::PoolService;
use crate::core::session::{BackendSession, SessionState};

/// What one sweep saw and closed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub busy_seen: usize,
    pub idle_seen: usize,
    pub busy_timeouts: usize,
    pub idle_timeouts: usize,
    pub aged_out: usize,
}

impl SweepReport {
    pub fn closed(&self) -> usize {
        self.busy_timeouts + self.idle_timeouts + self.aged_out
    }
}

impl fmt::Display for SweepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "busy={} idle={} closed busy_timeout={} idle_timeout={} max_age={}",
            self.busy_seen, self.idle_seen, self.busy_timeouts, self.idle_timeouts, self.aged_out
        )
    }
}

impl PoolService {
    /// One housekeeping pass over a snapshot of the bag, evaluated at `now`.
    ///
    /// In-use sessions past the busy timeout are closed. Idle sessions beyond
    /// the first `min_conn` are closed once past the idle timeout. Anything
    /// still idle past `max_age` is closed. Every close goes through
    /// `reserve`, so a session a borrower grabbed meanwhile is left alone.
    /// Ends by asking for sessions to refill toward the floor.
    pub fn sweep(self: &Arc<Self>, now: Instant) -> SweepReport {
        let config = self.config();
        let busy_timeout = config.busy_timeout();
        let idle_timeout = config.idle_timeout();
        let min_conn = config.min_conn;

        let mut report = SweepReport::default();
        let mut idle_count = 0;
        for session in self.bag().snapshot() {
            match session.state() {
                SessionState::InUse => {
                    report.busy_seen += 1;
                    if session.idle_for(now) > busy_timeout
                        && self.close_if(SessionState::InUse, &session, "busy timeout")
                    {
                        report.busy_timeouts += 1;
                    } else {
                        self.check_age(&session, now, &mut report);
                    }
                }
                SessionState::Idle => {
                    report.idle_seen += 1;
                    idle_count += 1;
                    if idle_count > min_conn
                        && session.idle_for(now) > idle_timeout
                        && self.close_if(SessionState::Idle, &session, "idle timeout")
                    {
                        report.idle_timeouts += 1;
                    } else {
                        self.check_age(&session, now, &mut report);
                    }
                }
                SessionState::Removing | SessionState::Removed => {}
            }
        }

        self.fill_pool();
        report
    }

    // Only idle sessions can be claimed here; an aged session that is in use
    // is caught when it is next borrowed
    fn check_age(&self, session: &Arc<BackendSession>, now: Instant, report: &mut SweepReport) {
        if session.age(now) > self.config().max_age()
            && self.close_if(SessionState::Idle, session, "max age")
        {
            report.aged_out += 1;
        }
    }
}
