use async_trait::async_trait;
use swap_core::connection::ConnectionHealth;
use swap_core::{ActionType, ProposalId, RemoteError};

/// The remote side of a proposal: the mutation endpoint and the refetch.
///
/// Failure is an `Err(RemoteError)`; this crate classifies it before any
/// decision is made. Implementations must not retry internally.
#[async_trait]
pub trait ProposalRemote: Send + Sync {
    async fn submit_accept(&self, id: &ProposalId) -> Result<(), RemoteError>;

    async fn submit_reject(&self, id: &ProposalId, reason: Option<&str>)
        -> Result<(), RemoteError>;

    /// Re-fetch authoritative state. The refreshed status reaches the
    /// coordinator through the push feed.
    async fn refresh_proposal(&self, id: &ProposalId) -> Result<(), RemoteError>;
}

/// Health and reconnect control of the push feed. Updates themselves arrive
/// on an `mpsc` channel handed to `Coordinator::spawn_push_listener`.
#[async_trait]
pub trait PushChannel: Send + Sync {
    async fn connection_health(&self) -> ConnectionHealth;

    async fn reconnect(&self) -> Result<(), RemoteError>;
}

/// Dispatch one submission for `action`.
pub(crate) async fn submit(
    remote: &dyn ProposalRemote,
    id: &ProposalId,
    action: ActionType,
    reason: Option<&str>,
) -> Result<(), RemoteError> {
    match action {
        ActionType::Accept => remote.submit_accept(id).await,
        ActionType::Reject => remote.submit_reject(id, reason).await,
    }
}
