use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// ProposalId
// ---------------------------------------------------------------------------

/// Opaque identifier of a swap proposal. The unit of session ownership.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProposalId(String);

impl ProposalId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProposalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProposalId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ProposalId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// ---------------------------------------------------------------------------
// ProposalStatus
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProposalStatus {
    Pending,
    Accepted,
    Rejected,
    Expired,
}

impl ProposalStatus {
    pub fn all() -> &'static [ProposalStatus] {
        &[
            ProposalStatus::Pending,
            ProposalStatus::Accepted,
            ProposalStatus::Rejected,
            ProposalStatus::Expired,
        ]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProposalStatus::Pending => "pending",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::Rejected => "rejected",
            ProposalStatus::Expired => "expired",
        }
    }

    /// True once the proposal can no longer be acted on.
    pub fn is_resolved(self) -> bool {
        !matches!(self, ProposalStatus::Pending)
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ProposalStatus {
    type Err = crate::error::SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ProposalStatus::Pending),
            "accepted" => Ok(ProposalStatus::Accepted),
            "rejected" => Ok(ProposalStatus::Rejected),
            "expired" => Ok(ProposalStatus::Expired),
            _ => Err(crate::error::SwapError::InvalidStatus(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// ActionType
// ---------------------------------------------------------------------------

/// What the user asked to do with a proposal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionType {
    Accept,
    Reject,
}

impl ActionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Accept => "accept",
            ActionType::Reject => "reject",
        }
    }

    /// The proposal status this action produces when it succeeds.
    pub fn expected_status(self) -> ProposalStatus {
        match self {
            ActionType::Accept => ProposalStatus::Accepted,
            ActionType::Reject => ProposalStatus::Rejected,
        }
    }

    pub fn operation(self) -> OperationKind {
        match self {
            ActionType::Accept => OperationKind::Accept,
            ActionType::Reject => OperationKind::Reject,
        }
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ActionType {
    type Err = crate::error::SwapError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "accept" => Ok(ActionType::Accept),
            "reject" => Ok(ActionType::Reject),
            _ => Err(crate::error::SwapError::InvalidAction(s.to_string())),
        }
    }
}

// ---------------------------------------------------------------------------
// OperationKind
// ---------------------------------------------------------------------------

/// Remote operations that carry their own timeout and retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Accept,
    Reject,
    Refresh,
}

impl OperationKind {
    pub fn as_str(self) -> &'static str {
        match self {
            OperationKind::Accept => "accept",
            OperationKind::Reject => "reject",
            OperationKind::Refresh => "refresh",
        }
    }

    /// Fetch-type operations get the smaller retry budget.
    pub fn is_fetch(self) -> bool {
        matches!(self, OperationKind::Refresh)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// PushUpdate
// ---------------------------------------------------------------------------

/// Authoritative status change delivered by the push channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PushUpdate {
    pub proposal_id: ProposalId,
    pub status: ProposalStatus,
    pub last_modified: DateTime<Utc>,
}

impl PushUpdate {
    pub fn new(proposal_id: impl Into<ProposalId>, status: ProposalStatus) -> Self {
        Self {
            proposal_id: proposal_id.into(),
            status,
            last_modified: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
