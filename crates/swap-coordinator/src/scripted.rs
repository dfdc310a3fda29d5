//! In-memory collaborators driven by scripted outcomes.
//!
//! Every call to a [`ScriptedRemote`] is recorded, then answered by the next
//! [`Step`] queued for that proposal and operation. An exhausted (or absent)
//! script answers with an immediate success.

use crate::remote::{PushChannel, ProposalRemote};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use swap_core::connection::{ConnectionHealth, ConnectionStatus};
use swap_core::{OperationKind, ProposalId, RemoteError};
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, Clone)]
pub enum Step {
    Succeed { after: Duration },
    Fail { after: Duration, error: RemoteError },
    /// Never settles.
    Hang,
}

impl Step {
    pub fn ok_after(after: Duration) -> Self {
        Step::Succeed { after }
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Step::Fail {
            after: Duration::ZERO,
            error: RemoteError::new(message),
        }
    }

    pub fn fail_after(after: Duration, error: RemoteError) -> Self {
        Step::Fail { after, error }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RemoteCall {
    pub operation: OperationKind,
    pub proposal_id: ProposalId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Default)]
pub struct ScriptedRemote {
    scripts: Mutex<HashMap<(ProposalId, OperationKind), VecDeque<Step>>>,
    calls: Mutex<Vec<RemoteCall>>,
}

impl ScriptedRemote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(
        mut self,
        id: impl Into<ProposalId>,
        operation: OperationKind,
        steps: impl IntoIterator<Item = Step>,
    ) -> Self {
        self.scripts
            .get_mut()
            .entry((id.into(), operation))
            .or_default()
            .extend(steps);
        self
    }

    pub async fn push_steps(
        &self,
        id: impl Into<ProposalId>,
        operation: OperationKind,
        steps: impl IntoIterator<Item = Step>,
    ) {
        self.scripts
            .lock()
            .await
            .entry((id.into(), operation))
            .or_default()
            .extend(steps);
    }

    pub async fn calls(&self) -> Vec<RemoteCall> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self, id: &ProposalId, operation: OperationKind) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| &c.proposal_id == id && c.operation == operation)
            .count()
    }

    async fn play(
        &self,
        id: &ProposalId,
        operation: OperationKind,
        reason: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.calls.lock().await.push(RemoteCall {
            operation,
            proposal_id: id.clone(),
            reason: reason.map(str::to_string),
        });
        let step = self
            .scripts
            .lock()
            .await
            .get_mut(&(id.clone(), operation))
            .and_then(VecDeque::pop_front)
            .unwrap_or(Step::Succeed {
                after: Duration::ZERO,
            });
        debug!(proposal = %id, %operation, ?step, "scripted call");

        match step {
            Step::Succeed { after } => {
                tokio::time::sleep(after).await;
                Ok(())
            }
            Step::Fail { after, error } => {
                tokio::time::sleep(after).await;
                Err(error)
            }
            Step::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl ProposalRemote for ScriptedRemote {
    async fn submit_accept(&self, id: &ProposalId) -> Result<(), RemoteError> {
        self.play(id, OperationKind::Accept, None).await
    }

    async fn submit_reject(
        &self,
        id: &ProposalId,
        reason: Option<&str>,
    ) -> Result<(), RemoteError> {
        self.play(id, OperationKind::Reject, reason).await
    }

    async fn refresh_proposal(&self, id: &ProposalId) -> Result<(), RemoteError> {
        self.play(id, OperationKind::Refresh, None).await
    }
}

/// A push channel whose health is set by hand.
#[derive(Debug)]
pub struct ScriptedChannel {
    health: Mutex<ConnectionHealth>,
}

impl ScriptedChannel {
    pub fn new(health: ConnectionHealth) -> Self {
        Self {
            health: Mutex::new(health),
        }
    }

    pub async fn set_health(&self, health: ConnectionHealth) {
        *self.health.lock().await = health;
    }
}

#[async_trait]
impl PushChannel for ScriptedChannel {
    async fn connection_health(&self) -> ConnectionHealth {
        self.health.lock().await.clone()
    }

    async fn reconnect(&self) -> Result<(), RemoteError> {
        let mut health = self.health.lock().await;
        if !health.can_reconnect() {
            return Err(RemoteError::new(format!(
                "connection: reconnect budget of {} spent",
                health.max_reconnect_attempts
            )));
        }
        health.reconnect_attempts += 1;
        health.status = ConnectionStatus::Connected;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn plays_steps_in_order_then_succeeds() {
        let id = ProposalId::new("P2");
        let remote = ScriptedRemote::new().with_script(
            "P2",
            OperationKind::Reject,
            [Step::fail("Network request failed")],
        );
        assert!(remote.submit_reject(&id, Some("too low")).await.is_err());
        assert!(remote.submit_reject(&id, Some("too low")).await.is_ok());
        assert_eq!(remote.call_count(&id, OperationKind::Reject).await, 2);
        assert_eq!(remote.calls().await[0].reason.as_deref(), Some("too low"));
    }

    #[tokio::test(start_paused = true)]
    async fn succeed_waits_for_delay() {
        let id = ProposalId::new("P1");
        let remote = ScriptedRemote::new().with_script(
            "P1",
            OperationKind::Accept,
            [Step::ok_after(Duration::from_millis(500))],
        );
        let started = tokio::time::Instant::now();
        remote.submit_accept(&id).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn reconnect_respects_budget() {
        let channel = ScriptedChannel::new(ConnectionHealth::disconnected(4, 5));
        channel.reconnect().await.unwrap();
        assert_eq!(channel.connection_health().await.status, ConnectionStatus::Connected);

        channel
            .set_health(ConnectionHealth::disconnected(5, 5))
            .await;
        assert!(channel.reconnect().await.is_err());
    }
}
