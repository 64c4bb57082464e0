use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{
    FuturesUnordered,
    StreamExt,
};
use log::{
    debug,
    info,
};
use seclink_commons::{
    ConnectId,
    ConnectionHealth,
    HealthStatus,
};
use seclink_session::SessionManager;
use tokio::sync::broadcast;
use tokio::time::{
    sleep,
    timeout,
};

use crate::types::MonitorConfig;

const HEALTH_CHANNEL_CAPACITY: usize = 64;

/// Source of the channels to watch. The session manager is the production
/// directory.
pub trait ChannelDirectory: Send + Sync {
    fn channel_ids(&self) -> Vec<ConnectId>;
}

impl ChannelDirectory for SessionManager {
    fn channel_ids(&self) -> Vec<ConnectId> {
        SessionManager::channel_ids(self)
    }
}

/// Probes one channel's liveness against the peer.
#[async_trait]
pub trait ConnectionProbe: Send + Sync {
    async fn probe(&self, connect_id: ConnectId) -> HealthStatus;
}

/// Sweeps every registered channel on an interval and publishes status
/// transitions. Subscribers see each transition once; the session manager
/// reacts to the degraded ones.
pub struct HealthMonitor {
    config: MonitorConfig,
    directory: Arc<dyn ChannelDirectory>,
    probe: Arc<dyn ConnectionProbe>,
    health_tx: broadcast::Sender<ConnectionHealth>,
}

impl HealthMonitor {
    pub fn new(
        directory: Arc<dyn ChannelDirectory>, probe: Arc<dyn ConnectionProbe>,
        config: MonitorConfig,
    ) -> Self {
        let (health_tx, _) = broadcast::channel(HEALTH_CHANNEL_CAPACITY);
        Self {
            config,
            directory,
            probe,
            health_tx,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionHealth> {
        self.health_tx.subscribe()
    }

    pub async fn run(self: Arc<Self>) {
        info!("starting connection health monitor");
        let mut last_status: HashMap<ConnectId, HealthStatus> = HashMap::new();

        loop {
            sleep(self.config.check_interval).await;

            let ids = self.directory.channel_ids();
            last_status.retain(|id, _| ids.contains(id));
            if ids.is_empty() {
                continue;
            }

            let mut checks: FuturesUnordered<_> = ids
                .into_iter()
                .map(|connect_id| {
                    let probe = self.probe.clone();
                    let probe_timeout = self.config.probe_timeout;
                    async move {
                        let status = match timeout(probe_timeout, probe.probe(connect_id)).await {
                            Ok(status) => status,
                            Err(_) => HealthStatus::Failed,
                        };
                        (connect_id, status)
                    }
                })
                .collect();

            while let Some((connect_id, status)) = checks.next().await {
                let previous = last_status.insert(connect_id, status);
                if previous == Some(status) {
                    continue;
                }
                debug!("channel {connect_id} health changed {previous:?} -> {status:?}");
                let _ = self
                    .health_tx
                    .send(ConnectionHealth::now(connect_id, status));
            }
        }
    }
}
