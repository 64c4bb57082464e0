use std::time::SystemTime;

use serde::{
    Deserialize,
    Serialize,
};

use crate::models::connect_id::ConnectId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Failed,
    Recovering,
}

/// Last observed health of one channel, as reported by the connection
/// health observer.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionHealth {
    pub connect_id: ConnectId,
    pub status: HealthStatus,
    pub last_check: SystemTime,
}

impl ConnectionHealth {
    pub fn now(connect_id: ConnectId, status: HealthStatus) -> Self {
        Self {
            connect_id,
            status,
            last_check: SystemTime::now(),
        }
    }

    /// Statuses that should trigger a recovery action in the session
    /// manager.
    pub fn needs_recovery(&self) -> bool {
        matches!(self.status, HealthStatus::Unhealthy | HealthStatus::Failed)
    }
}
