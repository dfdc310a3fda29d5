//! Action session state machine.
//!
//! One [`ActionSession`] exists per proposal while the user acts on it. The
//! machine is driven only by typed [`SessionEvent`]s and performs no I/O:
//! callers (the coordinator) apply the returned [`StateChange`] to the view
//! model, timers and remote calls.
//!
//! ```text
//!            intent ──► Confirming ──confirm──► OptimisticallyApplied ◄──retry elapsed──┐
//!              │            │                      │        │                          │
//!              └────────────┼──(no confirmation)───┘        ├──failed, retryable──► RetryScheduled
//!                        cancel                             │
//!                           ▼                               ├──succeeded──► Succeeded
//!                       (discarded)                         │         └──► AwaitingReconciliation ──► Succeeded
//!                                                           └──failed, final──► TerminallyFailed ──retry──► Confirming
//! ```
//!
//! Push agreement or conflict can end any non-terminal state. Terminal states
//! ignore push and timer events.

use crate::classifier::{ErrorCategory, ErrorClassification};
use crate::error::{Result, SwapError};
use crate::types::{ActionType, ProposalId, ProposalStatus};
use crate::view::ViewSnapshot;
use crate::watchdog::StuckSignal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, Instant};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// SessionState
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Confirming,
    OptimisticallyApplied,
    AwaitingReconciliation,
    RetryScheduled,
    Succeeded,
    TerminallyFailed,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Confirming => "confirming",
            SessionState::OptimisticallyApplied => "optimistically_applied",
            SessionState::AwaitingReconciliation => "awaiting_reconciliation",
            SessionState::RetryScheduled => "retry_scheduled",
            SessionState::Succeeded => "succeeded",
            SessionState::TerminallyFailed => "terminally_failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Succeeded | SessionState::TerminallyFailed)
    }

    /// States in which the user is waiting on the system, not the other way round.
    pub fn is_busy(self) -> bool {
        matches!(
            self,
            SessionState::OptimisticallyApplied
                | SessionState::RetryScheduled
                | SessionState::AwaitingReconciliation
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// SessionEvent / StateChange
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Confirm,
    Cancel,
    SubmissionSucceeded { await_push: bool },
    SubmissionFailed(ErrorClassification),
    RetryElapsed,
    ReconciliationGraceElapsed,
    PushAgreed,
    PushConflicted,
    RetryRequested,
}

impl SessionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Confirm => "confirm",
            SessionEvent::Cancel => "cancel",
            SessionEvent::SubmissionSucceeded { .. } => "submission_succeeded",
            SessionEvent::SubmissionFailed(_) => "submission_failed",
            SessionEvent::RetryElapsed => "retry_elapsed",
            SessionEvent::ReconciliationGraceElapsed => "reconciliation_grace_elapsed",
            SessionEvent::PushAgreed => "push_agreed",
            SessionEvent::PushConflicted => "push_conflicted",
            SessionEvent::RetryRequested => "retry_requested",
        }
    }

    /// Events that originate outside the user (timers, remote, push). These
    /// are silently ignored by terminal sessions.
    fn is_external(&self) -> bool {
        !matches!(
            self,
            SessionEvent::Confirm | SessionEvent::Cancel | SessionEvent::RetryRequested
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateChange {
    Moved { from: SessionState, to: SessionState },
    /// The session ends without ever reaching the remote; drop it.
    Discarded,
    Unchanged,
}

impl StateChange {
    pub fn entered(self, state: SessionState) -> bool {
        matches!(self, StateChange::Moved { to, .. } if to == state)
    }
}

// ---------------------------------------------------------------------------
// ActionSession
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ActionSession {
    pub id: Uuid,
    pub proposal_id: ProposalId,
    pub action_type: ActionType,
    pub state: SessionState,
    /// 1-based attempt number within the current submission cycle.
    pub attempt: u32,
    pub max_attempts: u32,
    pub started_at: DateTime<Utc>,
    pub last_action_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    pub last_error: Option<ErrorClassification>,
    pub optimistic_snapshot: Option<ViewSnapshot>,
    /// Bumped each time a submission cycle starts; drivers carry the value
    /// they were started with so late settlements can be recognised.
    pub epoch: u64,
    pub auto_refreshes: u32,
    pub stuck: Option<StuckSignal>,
    #[serde(skip)]
    busy_since: Option<Instant>,
}

impl ActionSession {
    pub fn new(
        proposal_id: ProposalId,
        action_type: ActionType,
        rejection_reason: Option<String>,
        max_attempts: u32,
        requires_confirmation: bool,
        now: Instant,
    ) -> Self {
        let mut session = Self {
            id: Uuid::new_v4(),
            proposal_id,
            action_type,
            state: SessionState::Confirming,
            attempt: 1,
            max_attempts: max_attempts.max(1),
            started_at: Utc::now(),
            last_action_at: None,
            rejection_reason: match action_type {
                ActionType::Reject => rejection_reason,
                ActionType::Accept => None,
            },
            last_error: None,
            optimistic_snapshot: None,
            epoch: 0,
            auto_refreshes: 0,
            stuck: None,
            busy_since: None,
        };
        if !requires_confirmation {
            session.enter_submission(now);
        }
        session
    }

    pub fn expected_status(&self) -> ProposalStatus {
        self.action_type.expected_status()
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// How long the session has been continuously busy, if it is.
    pub fn busy_for(&self, now: Instant) -> Option<Duration> {
        self.busy_since.map(|since| now.saturating_duration_since(since))
    }

    // -----------------------------------------------------------------------
    // Transitions
    // -----------------------------------------------------------------------

    pub fn handle(&mut self, event: SessionEvent, now: Instant) -> Result<StateChange> {
        let from = self.state;

        if from.is_terminal() && event.is_external() {
            return Ok(StateChange::Unchanged);
        }

        let to = match (from, event) {
            (SessionState::Confirming, SessionEvent::Confirm) => {
                self.enter_submission(now);
                SessionState::OptimisticallyApplied
            }
            (SessionState::Confirming, SessionEvent::Cancel) => return Ok(StateChange::Discarded),

            (SessionState::OptimisticallyApplied, SessionEvent::SubmissionSucceeded { await_push }) => {
                if await_push {
                    SessionState::AwaitingReconciliation
                } else {
                    self.optimistic_snapshot = None;
                    SessionState::Succeeded
                }
            }
            (SessionState::OptimisticallyApplied, SessionEvent::SubmissionFailed(classification)) => {
                let retry = classification.is_retryable && self.attempt < self.max_attempts;
                self.last_error = Some(classification);
                if retry {
                    SessionState::RetryScheduled
                } else {
                    SessionState::TerminallyFailed
                }
            }
            (SessionState::RetryScheduled, SessionEvent::RetryElapsed) => {
                if self.attempt >= self.max_attempts {
                    return Err(self.invalid(
                        SessionState::OptimisticallyApplied,
                        format!("attempt {} already at the limit of {}", self.attempt, self.max_attempts),
                    ));
                }
                self.attempt += 1;
                self.last_action_at = Some(Utc::now());
                SessionState::OptimisticallyApplied
            }
            (SessionState::AwaitingReconciliation, SessionEvent::ReconciliationGraceElapsed) => {
                self.optimistic_snapshot = None;
                SessionState::Succeeded
            }

            (_, SessionEvent::PushAgreed) => {
                self.optimistic_snapshot = None;
                SessionState::Succeeded
            }
            (_, SessionEvent::PushConflicted) => {
                self.last_error = Some(ErrorCategory::Validation.into());
                SessionState::TerminallyFailed
            }

            (SessionState::TerminallyFailed, SessionEvent::RetryRequested) => {
                self.attempt = 1;
                self.last_error = None;
                self.optimistic_snapshot = None;
                self.started_at = Utc::now();
                SessionState::Confirming
            }

            (from, event) => {
                let reason = match event {
                    SessionEvent::Cancel if from.is_busy() => {
                        "a submission is in flight and cannot be cancelled".to_string()
                    }
                    other => format!("'{}' is not valid from {from}", other.name()),
                };
                return Err(self.invalid_event(reason));
            }
        };

        self.state = to;
        self.track_busy(now);
        Ok(StateChange::Moved { from, to })
    }

    fn enter_submission(&mut self, now: Instant) {
        self.state = SessionState::OptimisticallyApplied;
        self.epoch += 1;
        self.last_action_at = Some(Utc::now());
        self.track_busy(now);
    }

    fn track_busy(&mut self, now: Instant) {
        if self.state.is_busy() {
            self.busy_since.get_or_insert(now);
        } else {
            self.busy_since = None;
            self.stuck = None;
        }
    }

    fn invalid(&self, to: SessionState, reason: String) -> SwapError {
        SwapError::InvalidTransition {
            from: self.state.to_string(),
            to: to.to_string(),
            reason,
        }
    }

    fn invalid_event(&self, reason: String) -> SwapError {
        SwapError::InvalidTransition {
            from: self.state.to_string(),
            to: "?".to_string(),
            reason,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn session(action: ActionType, confirm: bool) -> ActionSession {
        ActionSession::new(ProposalId::new("P1"), action, None, 3, confirm, Instant::now())
    }

    fn network() -> ErrorClassification {
        ErrorCategory::Network.into()
    }

    #[test]
    fn intent_without_confirmation_goes_straight_to_submission() {
        let s = session(ActionType::Accept, false);
        assert_eq!(s.state, SessionState::OptimisticallyApplied);
        assert_eq!(s.epoch, 1);
        assert!(s.last_action_at.is_some());
        assert!(s.busy_for(Instant::now()).is_some());
    }

    #[test]
    fn confirm_then_succeed() {
        let now = Instant::now();
        let mut s = session(ActionType::Accept, true);
        assert_eq!(s.state, SessionState::Confirming);
        assert_eq!(s.epoch, 0);
        assert!(s.busy_for(now).is_none());

        s.handle(SessionEvent::Confirm, now).unwrap();
        assert_eq!(s.state, SessionState::OptimisticallyApplied);
        assert_eq!(s.epoch, 1);

        let change = s
            .handle(SessionEvent::SubmissionSucceeded { await_push: false }, now)
            .unwrap();
        assert!(change.entered(SessionState::Succeeded));
        assert!(s.optimistic_snapshot.is_none());
        assert!(s.busy_for(now).is_none());
    }

    #[test]
    fn cancel_only_from_confirming() {
        let now = Instant::now();
        let mut s = session(ActionType::Reject, true);
        assert_eq!(s.handle(SessionEvent::Cancel, now).unwrap(), StateChange::Discarded);

        let mut s = session(ActionType::Reject, false);
        let err = s.handle(SessionEvent::Cancel, now).unwrap_err();
        assert!(err.to_string().contains("cannot be cancelled"));
        assert_eq!(s.state, SessionState::OptimisticallyApplied);
    }

    #[test]
    fn retryable_failure_schedules_retry_until_budget_spent() {
        let now = Instant::now();
        let mut s = session(ActionType::Reject, false);

        s.handle(SessionEvent::SubmissionFailed(network()), now).unwrap();
        assert_eq!(s.state, SessionState::RetryScheduled);
        s.handle(SessionEvent::RetryElapsed, now).unwrap();
        assert_eq!(s.attempt, 2);

        s.handle(SessionEvent::SubmissionFailed(network()), now).unwrap();
        s.handle(SessionEvent::RetryElapsed, now).unwrap();
        assert_eq!(s.attempt, 3);

        s.handle(SessionEvent::SubmissionFailed(network()), now).unwrap();
        assert_eq!(s.state, SessionState::TerminallyFailed);
        assert_eq!(s.attempt, 3);
        assert_eq!(s.last_error.as_ref().unwrap().category, ErrorCategory::Network);
    }

    #[test]
    fn attempt_never_exceeds_max() {
        let now = Instant::now();
        let mut s = ActionSession::new(
            ProposalId::new("P1"),
            ActionType::Accept,
            None,
            2,
            false,
            now,
        );
        for _ in 0..10 {
            let _ = s.handle(SessionEvent::SubmissionFailed(network()), now);
            let _ = s.handle(SessionEvent::RetryElapsed, now);
            assert!(s.attempt <= s.max_attempts);
        }
        assert_eq!(s.state, SessionState::TerminallyFailed);
    }

    #[test]
    fn non_retryable_failure_is_terminal_immediately() {
        let now = Instant::now();
        let mut s = session(ActionType::Accept, false);
        s.handle(SessionEvent::SubmissionFailed(ErrorCategory::Permission.into()), now)
            .unwrap();
        assert_eq!(s.state, SessionState::TerminallyFailed);
        assert_eq!(s.attempt, 1);
    }

    #[test]
    fn push_ends_any_non_terminal_state() {
        let now = Instant::now();
        let mut s = session(ActionType::Accept, true);
        s.handle(SessionEvent::PushConflicted, now).unwrap();
        assert_eq!(s.state, SessionState::TerminallyFailed);
        assert_eq!(s.last_error.as_ref().unwrap().category, ErrorCategory::Validation);

        let mut s = session(ActionType::Accept, false);
        s.handle(SessionEvent::SubmissionFailed(network()), now).unwrap();
        s.handle(SessionEvent::PushAgreed, now).unwrap();
        assert_eq!(s.state, SessionState::Succeeded);
    }

    #[test]
    fn terminal_sessions_ignore_external_events() {
        let now = Instant::now();
        let mut s = session(ActionType::Accept, false);
        s.handle(SessionEvent::SubmissionSucceeded { await_push: false }, now)
            .unwrap();

        for event in [
            SessionEvent::PushConflicted,
            SessionEvent::PushAgreed,
            SessionEvent::RetryElapsed,
            SessionEvent::SubmissionFailed(network()),
            SessionEvent::ReconciliationGraceElapsed,
        ] {
            assert_eq!(s.handle(event, now).unwrap(), StateChange::Unchanged);
            assert_eq!(s.state, SessionState::Succeeded);
        }
        assert!(s.handle(SessionEvent::RetryRequested, now).is_err());
    }

    #[test]
    fn awaiting_reconciliation_resolves_on_grace_or_push() {
        let now = Instant::now();
        let mut s = session(ActionType::Accept, false);
        s.handle(SessionEvent::SubmissionSucceeded { await_push: true }, now)
            .unwrap();
        assert_eq!(s.state, SessionState::AwaitingReconciliation);
        assert!(s.busy_for(now).is_some());
        s.handle(SessionEvent::ReconciliationGraceElapsed, now).unwrap();
        assert_eq!(s.state, SessionState::Succeeded);
    }

    #[test]
    fn manual_retry_resets_attempts_and_requires_confirmation() {
        let now = Instant::now();
        let mut s = session(ActionType::Accept, false);
        s.handle(SessionEvent::SubmissionFailed(network()), now).unwrap();
        s.handle(SessionEvent::RetryElapsed, now).unwrap();
        s.handle(SessionEvent::SubmissionFailed(ErrorCategory::Permission.into()), now)
            .unwrap();
        assert_eq!(s.attempt, 2);

        s.handle(SessionEvent::RetryRequested, now).unwrap();
        assert_eq!(s.state, SessionState::Confirming);
        assert_eq!(s.attempt, 1);
        assert!(s.last_error.is_none());

        s.handle(SessionEvent::Confirm, now).unwrap();
        assert_eq!(s.epoch, 2);
    }

    #[test]
    fn busy_period_is_continuous_across_retries() {
        let t0 = Instant::now();
        let mut s = ActionSession::new(ProposalId::new("P1"), ActionType::Accept, None, 3, false, t0);
        let later = t0 + Duration::from_secs(5);
        s.handle(SessionEvent::SubmissionFailed(network()), later).unwrap();
        s.handle(SessionEvent::RetryElapsed, later).unwrap();
        let much_later = t0 + Duration::from_secs(30);
        assert_eq!(s.busy_for(much_later), Some(Duration::from_secs(30)));
    }

    #[test]
    fn reason_kept_only_for_reject() {
        let now = Instant::now();
        let r = ActionSession::new(
            ProposalId::new("P2"),
            ActionType::Reject,
            Some("price too low".into()),
            3,
            false,
            now,
        );
        assert_eq!(r.rejection_reason.as_deref(), Some("price too low"));
        let a = ActionSession::new(
            ProposalId::new("P2"),
            ActionType::Accept,
            Some("ignored".into()),
            3,
            false,
            now,
        );
        assert!(a.rejection_reason.is_none());
    }

    #[test]
    fn invalid_pairs_are_errors() {
        let now = Instant::now();
        let mut s = session(ActionType::Accept, true);
        assert!(s
            .handle(SessionEvent::SubmissionSucceeded { await_push: false }, now)
            .is_err());
        assert!(s.handle(SessionEvent::RetryElapsed, now).is_err());
        assert_eq!(s.state, SessionState::Confirming);
    }
}
