use std::sync::atomic::{
    AtomicU8,
    Ordering,
};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::models::connect_id::ConnectId;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connection lifecycle events published to whoever is listening (UI shells,
/// monitors, tests). Fire-and-forget: publishing never blocks and never
/// fails when nobody subscribed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    DataCenterConnecting(ConnectId),
    DataCenterConnected(ConnectId),
    ConnectionRecovering(ConnectId),
    ConnectionRestored(ConnectId),
    RestoreSecrecyChannel(ConnectId),
    ServerShutdown(ConnectId),
    RetriesExhausted(ConnectId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SystemState {
    Running,
    Recovering,
}

/// Process-wide event fan-out plus the current system state.
///
/// Subscribers must not be assumed to run on any particular thread; events
/// are delivered through broadcast channels and dropped when a receiver
/// lags.
#[derive(Clone)]
pub struct EventBus {
    network_tx: broadcast::Sender<NetworkEvent>,
    system_tx: broadcast::Sender<SystemState>,
    system_state: Arc<AtomicU8>,
}

const SYSTEM_RUNNING: u8 = 0;
const SYSTEM_RECOVERING: u8 = 1;

impl EventBus {
    pub fn new() -> Self {
        let (network_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (system_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            network_tx,
            system_tx,
            system_state: Arc::new(AtomicU8::new(SYSTEM_RUNNING)),
        }
    }

    pub fn publish_network(&self, event: NetworkEvent) {
        let _ = self.network_tx.send(event);
    }

    pub fn set_system_state(&self, state: SystemState) {
        let raw = match state {
            SystemState::Running => SYSTEM_RUNNING,
            SystemState::Recovering => SYSTEM_RECOVERING,
        };
        self.system_state.store(raw, Ordering::SeqCst);
        let _ = self.system_tx.send(state);
    }

    pub fn system_state(&self) -> SystemState {
        match self.system_state.load(Ordering::SeqCst) {
            SYSTEM_RECOVERING => SystemState::Recovering,
            _ => SystemState::Running,
        }
    }

    pub fn subscribe_network(&self) -> broadcast::Receiver<NetworkEvent> {
        self.network_tx.subscribe()
    }

    pub fn subscribe_system(&self) -> broadcast::Receiver<SystemState> {
        self.system_tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
