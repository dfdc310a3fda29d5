use crate::session::ActionSession;
use crate::types::{ProposalStatus, PushUpdate};
use crate::view::ProposalView;
use serde::Serialize;

/// What to do with one push update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Reconciliation {
    /// Older than what the view already shows; drop it.
    Stale,
    /// No active session to reconcile against; write the status as-is.
    WriteView,
    /// The remote reached the outcome the session is working toward.
    Agree,
    /// Carries no outcome and would only overwrite the tentative status.
    Ignore,
    /// The proposal was resolved some other way; the session has lost.
    Conflict,
}

impl Reconciliation {
    pub fn as_str(self) -> &'static str {
        match self {
            Reconciliation::Stale => "stale",
            Reconciliation::WriteView => "write_view",
            Reconciliation::Agree => "agree",
            Reconciliation::Ignore => "ignore",
            Reconciliation::Conflict => "conflict",
        }
    }
}

/// Decide how `update` relates to the current view entry and session.
pub fn reconcile(
    session: Option<&ActionSession>,
    current: Option<&ProposalView>,
    update: &PushUpdate,
) -> Reconciliation {
    if let Some(view) = current {
        if update.last_modified < view.last_modified {
            return Reconciliation::Stale;
        }
    }

    let Some(session) = session.filter(|s| !s.is_terminal()) else {
        return Reconciliation::WriteView;
    };

    if update.status == session.expected_status() {
        return Reconciliation::Agree;
    }

    if update.status == ProposalStatus::Pending {
        return if session.state.is_busy() {
            Reconciliation::Ignore
        } else {
            Reconciliation::WriteView
        };
    }

    Reconciliation::Conflict
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionEvent;
    use crate::types::{ActionType, ProposalId};
    use chrono::{Duration as ChronoDuration, Utc};
    use std::time::Instant;

    fn session(action: ActionType, confirm: bool) -> ActionSession {
        ActionSession::new(ProposalId::new("P4"), action, None, 3, confirm, Instant::now())
    }

    fn push(status: ProposalStatus) -> PushUpdate {
        PushUpdate::new("P4", status)
    }

    #[test]
    fn no_session_writes_view() {
        assert_eq!(
            reconcile(None, None, &push(ProposalStatus::Rejected)),
            Reconciliation::WriteView
        );
    }

    #[test]
    fn terminal_session_writes_view_without_reopening() {
        let mut s = session(ActionType::Accept, false);
        s.handle(SessionEvent::SubmissionSucceeded { await_push: false }, Instant::now())
            .unwrap();
        assert_eq!(
            reconcile(Some(&s), None, &push(ProposalStatus::Rejected)),
            Reconciliation::WriteView
        );
    }

    #[test]
    fn matching_outcome_agrees() {
        let s = session(ActionType::Accept, false);
        assert_eq!(
            reconcile(Some(&s), None, &push(ProposalStatus::Accepted)),
            Reconciliation::Agree
        );
        let s = session(ActionType::Reject, false);
        assert_eq!(
            reconcile(Some(&s), None, &push(ProposalStatus::Rejected)),
            Reconciliation::Agree
        );
    }

    #[test]
    fn other_resolution_or_expiry_conflicts() {
        let s = session(ActionType::Accept, false);
        assert_eq!(
            reconcile(Some(&s), None, &push(ProposalStatus::Rejected)),
            Reconciliation::Conflict
        );
        assert_eq!(
            reconcile(Some(&s), None, &push(ProposalStatus::Expired)),
            Reconciliation::Conflict
        );
    }

    #[test]
    fn pending_push_depends_on_tentative_change() {
        let busy = session(ActionType::Accept, false);
        assert_eq!(
            reconcile(Some(&busy), None, &push(ProposalStatus::Pending)),
            Reconciliation::Ignore
        );
        let confirming = session(ActionType::Accept, true);
        assert_eq!(
            reconcile(Some(&confirming), None, &push(ProposalStatus::Pending)),
            Reconciliation::WriteView
        );
    }

    #[test]
    fn older_update_is_stale() {
        let now = Utc::now();
        let view = ProposalView::new(ProposalStatus::Pending, now);
        let mut update = push(ProposalStatus::Rejected);
        update.last_modified = now - ChronoDuration::seconds(5);
        assert_eq!(reconcile(None, Some(&view), &update), Reconciliation::Stale);

        update.last_modified = now;
        assert_eq!(reconcile(None, Some(&view), &update), Reconciliation::WriteView);
    }
}
