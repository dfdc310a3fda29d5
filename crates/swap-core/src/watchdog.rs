//! Stuck-state detection.
//!
//! The supervisor bounds a single attempt; this bounds the whole busy period
//! of a session (attempts, retry delays and reconciliation waits together).
//! A positive check produces a [`StuckSignal`] overlay. It never changes the
//! session state.

use crate::session::ActionSession;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StuckSignal {
    pub elapsed_ms: u64,
    pub flagged_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StuckDetector {
    max_loading_time: Duration,
}

impl StuckDetector {
    pub fn new(max_loading_time: Duration) -> Self {
        Self { max_loading_time }
    }

    pub fn max_loading_time(&self) -> Duration {
        self.max_loading_time
    }

    /// Return a signal when `session` has been busy for longer than the
    /// threshold and has not been flagged during this busy period yet.
    pub fn check(&self, session: &ActionSession, now: Instant) -> Option<StuckSignal> {
        if session.stuck.is_some() {
            return None;
        }
        let elapsed = session.busy_for(now)?;
        if elapsed <= self.max_loading_time {
            return None;
        }
        Some(StuckSignal {
            elapsed_ms: elapsed.as_millis() as u64,
            flagged_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{SessionEvent, SessionState};
    use crate::types::{ActionType, ProposalId};

    fn busy_session(t0: Instant) -> ActionSession {
        ActionSession::new(ProposalId::new("P5"), ActionType::Accept, None, 3, false, t0)
    }

    #[test]
    fn flags_after_threshold() {
        let t0 = Instant::now();
        let detector = StuckDetector::new(Duration::from_millis(45_000));
        let session = busy_session(t0);

        assert!(detector.check(&session, t0 + Duration::from_millis(45_000)).is_none());
        let signal = detector
            .check(&session, t0 + Duration::from_millis(46_000))
            .unwrap();
        assert_eq!(signal.elapsed_ms, 46_000);
        assert_eq!(session.state, SessionState::OptimisticallyApplied);
    }

    #[test]
    fn flags_once_per_busy_period() {
        let t0 = Instant::now();
        let detector = StuckDetector::new(Duration::from_secs(1));
        let mut session = busy_session(t0);
        session.stuck = detector.check(&session, t0 + Duration::from_secs(2));
        assert!(session.stuck.is_some());
        assert!(detector.check(&session, t0 + Duration::from_secs(3)).is_none());
    }

    #[test]
    fn confirming_and_terminal_sessions_are_never_stuck() {
        let t0 = Instant::now();
        let detector = StuckDetector::new(Duration::from_secs(1));
        let confirming =
            ActionSession::new(ProposalId::new("P5"), ActionType::Accept, None, 3, true, t0);
        assert!(detector.check(&confirming, t0 + Duration::from_secs(60)).is_none());

        let mut done = busy_session(t0);
        done.handle(SessionEvent::SubmissionSucceeded { await_push: false }, t0)
            .unwrap();
        assert!(detector.check(&done, t0 + Duration::from_secs(60)).is_none());
    }

    #[test]
    fn leaving_busy_clears_the_overlay() {
        let t0 = Instant::now();
        let detector = StuckDetector::new(Duration::from_secs(1));
        let mut session = busy_session(t0);
        session.stuck = detector.check(&session, t0 + Duration::from_secs(2));
        session
            .handle(SessionEvent::PushConflicted, t0 + Duration::from_secs(3))
            .unwrap();
        assert!(session.stuck.is_none());
    }
}
