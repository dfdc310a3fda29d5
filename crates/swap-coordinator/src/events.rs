use serde::Serialize;
use swap_core::classifier::ErrorClassification;
use swap_core::reconcile::Reconciliation;
use swap_core::session::SessionState;
use swap_core::view::ProposalView;
use swap_core::watchdog::StuckSignal;
use swap_core::{ActionType, ProposalId};
use uuid::Uuid;

/// Everything the presentation surface can observe, in the order the
/// coordinator produced it.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CoordinatorEvent {
    SessionStarted {
        proposal_id: ProposalId,
        session_id: Uuid,
        action: ActionType,
        state: SessionState,
    },
    StateChanged {
        proposal_id: ProposalId,
        from: SessionState,
        to: SessionState,
        attempt: u32,
        max_attempts: u32,
        /// User-facing message of the last classified failure, never the raw error.
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
    },
    SessionClosed {
        proposal_id: ProposalId,
        reason: CloseReason,
    },
    ViewChanged {
        proposal_id: ProposalId,
        previous: Option<ProposalView>,
        current: Option<ProposalView>,
    },
    RolledBack {
        proposal_id: ProposalId,
    },
    AttemptFailed {
        proposal_id: ProposalId,
        attempt: u32,
        max_attempts: u32,
        classification: ErrorClassification,
        will_retry: bool,
    },
    IntentIgnored {
        proposal_id: ProposalId,
        reason: String,
    },
    PushReconciled {
        proposal_id: ProposalId,
        outcome: Reconciliation,
    },
    RefreshStarted {
        proposal_id: ProposalId,
        automatic: bool,
    },
    RefreshFinished {
        proposal_id: ProposalId,
        success: bool,
        attempts: u32,
    },
    Stuck {
        proposal_id: ProposalId,
        signal: StuckSignal,
    },
    Succeeded {
        proposal_id: ProposalId,
        attempt: u32,
    },
    DirectSubmitFinished {
        proposal_id: ProposalId,
        action: ActionType,
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        classification: Option<ErrorClassification>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    Cancelled,
    Dismissed,
    Recovered,
    /// A direct submission resolved the proposal.
    Superseded,
}

impl CoordinatorEvent {
    pub fn proposal_id(&self) -> &ProposalId {
        match self {
            CoordinatorEvent::SessionStarted { proposal_id, .. }
            | CoordinatorEvent::StateChanged { proposal_id, .. }
            | CoordinatorEvent::SessionClosed { proposal_id, .. }
            | CoordinatorEvent::ViewChanged { proposal_id, .. }
            | CoordinatorEvent::RolledBack { proposal_id }
            | CoordinatorEvent::AttemptFailed { proposal_id, .. }
            | CoordinatorEvent::IntentIgnored { proposal_id, .. }
            | CoordinatorEvent::PushReconciled { proposal_id, .. }
            | CoordinatorEvent::RefreshStarted { proposal_id, .. }
            | CoordinatorEvent::RefreshFinished { proposal_id, .. }
            | CoordinatorEvent::Stuck { proposal_id, .. }
            | CoordinatorEvent::Succeeded { proposal_id, .. }
            | CoordinatorEvent::DirectSubmitFinished { proposal_id, .. } => proposal_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            CoordinatorEvent::SessionStarted { .. } => "session_started",
            CoordinatorEvent::StateChanged { .. } => "state_changed",
            CoordinatorEvent::SessionClosed { .. } => "session_closed",
            CoordinatorEvent::ViewChanged { .. } => "view_changed",
            CoordinatorEvent::RolledBack { .. } => "rolled_back",
            CoordinatorEvent::AttemptFailed { .. } => "attempt_failed",
            CoordinatorEvent::IntentIgnored { .. } => "intent_ignored",
            CoordinatorEvent::PushReconciled { .. } => "push_reconciled",
            CoordinatorEvent::RefreshStarted { .. } => "refresh_started",
            CoordinatorEvent::RefreshFinished { .. } => "refresh_finished",
            CoordinatorEvent::Stuck { .. } => "stuck",
            CoordinatorEvent::Succeeded { .. } => "succeeded",
            CoordinatorEvent::DirectSubmitFinished { .. } => "direct_submit_finished",
        }
    }
}
