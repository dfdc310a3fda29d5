use crate::classifier::ErrorCategory;
use crate::types::ProposalId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SwapError {
    #[error("no session for proposal '{0}'")]
    SessionNotFound(ProposalId),

    #[error("an action is already in progress for proposal '{0}'")]
    SessionInFlight(ProposalId),

    #[error("duplicate action for proposal '{proposal}' ignored: retry in {remaining_ms}ms")]
    Debounced {
        proposal: ProposalId,
        remaining_ms: u64,
    },

    #[error("invalid transition from {from} to {to}: {reason}")]
    InvalidTransition {
        from: String,
        to: String,
        reason: String,
    },

    #[error("invalid proposal status: {0}")]
    InvalidStatus(String),

    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("invalid error category: {0}")]
    InvalidCategory(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, SwapError>;

// ---------------------------------------------------------------------------
// RemoteError
// ---------------------------------------------------------------------------

/// A raw failure reported by a remote collaborator.
///
/// `message` and `detail` are free text and are only ever shown to the
/// classifier. When the remote side knows what went wrong it can set `code`,
/// which the classifier trusts over the text.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct RemoteError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<ErrorCategory>,
}

impl RemoteError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
            code: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_code(mut self, code: ErrorCategory) -> Self {
        self.code = Some(code);
        self
    }

    /// The failure synthesized when an attempt loses the deadline race.
    pub fn timed_out(after_ms: u64) -> Self {
        Self::new(format!("operation timed out after {after_ms}ms")).with_code(ErrorCategory::Timeout)
    }
}
