use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Connected,
    Connecting,
    Disconnected,
    Error,
}

/// Health of the push channel as reported by its owner. Read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionHealth {
    pub status: ConnectionStatus,
    pub latency_ms: u64,
    pub reconnect_attempts: u32,
    pub max_reconnect_attempts: u32,
}

impl ConnectionHealth {
    pub fn connected(latency_ms: u64) -> Self {
        Self {
            status: ConnectionStatus::Connected,
            latency_ms,
            reconnect_attempts: 0,
            max_reconnect_attempts: 5,
        }
    }

    pub fn disconnected(reconnect_attempts: u32, max_reconnect_attempts: u32) -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            latency_ms: 0,
            reconnect_attempts,
            max_reconnect_attempts,
        }
    }

    pub fn is_healthy(&self, latency_threshold_ms: u64) -> bool {
        self.status == ConnectionStatus::Connected && self.latency_ms < latency_threshold_ms
    }

    /// Whether a manual reconnect is still within the channel's budget.
    pub fn can_reconnect(&self) -> bool {
        self.status != ConnectionStatus::Connected
            && self.reconnect_attempts < self.max_reconnect_attempts
    }
}
