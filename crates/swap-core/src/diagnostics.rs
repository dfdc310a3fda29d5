use crate::classifier::ErrorClassification;
use crate::connection::ConnectionHealth;
use crate::session::ActionSession;
use crate::types::ProposalId;
use crate::view::ProposalView;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;

/// Read-only picture of one proposal for troubleshooting.
#[derive(Debug, Clone, Serialize)]
pub struct DiagnosticSnapshot {
    pub proposal_id: ProposalId,
    pub session: Option<ActionSession>,
    pub classification: Option<ErrorClassification>,
    pub view: Option<ProposalView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub busy_for_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionHealth>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection_healthy: Option<bool>,
    pub generated_at: DateTime<Utc>,
}

impl DiagnosticSnapshot {
    pub fn capture(
        proposal_id: &ProposalId,
        session: Option<&ActionSession>,
        view: Option<&ProposalView>,
        connection: Option<ConnectionHealth>,
        healthy_latency_ms: u64,
        now: Instant,
    ) -> Self {
        Self {
            proposal_id: proposal_id.clone(),
            session: session.cloned(),
            classification: session.and_then(|s| s.last_error.clone()),
            view: view.cloned(),
            busy_for_ms: session
                .and_then(|s| s.busy_for(now))
                .map(|d| d.as_millis() as u64),
            connection_healthy: connection.as_ref().map(|c| c.is_healthy(healthy_latency_ms)),
            connection,
            generated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classifier::ErrorCategory;
    use crate::session::SessionEvent;
    use crate::types::ActionType;

    #[test]
    fn snapshot_carries_last_classification() {
        let now = Instant::now();
        let id = ProposalId::new("P9");
        let mut s = ActionSession::new(id.clone(), ActionType::Accept, None, 1, false, now);
        s.handle(SessionEvent::SubmissionFailed(ErrorCategory::Permission.into()), now)
            .unwrap();

        let snap = DiagnosticSnapshot::capture(
            &id,
            Some(&s),
            None,
            Some(ConnectionHealth::connected(50)),
            1000,
            now,
        );
        assert_eq!(snap.classification.unwrap().category, ErrorCategory::Permission);
        assert_eq!(snap.connection_healthy, Some(true));
        assert!(snap.busy_for_ms.is_none());
    }

    #[test]
    fn snapshot_serializes_without_session() {
        let id = ProposalId::new("P9");
        let snap = DiagnosticSnapshot::capture(&id, None, None, None, 1000, Instant::now());
        let json = serde_json::to_value(&snap).unwrap();
        assert_eq!(json["proposal_id"], "P9");
        assert!(json["session"].is_null());
        assert!(json.get("connection").is_none());
    }
}
