pub mod channel;

use std::sync::{
    Arc,
    Mutex as StdMutex,
    Weak,
};

use dashmap::DashMap;
use log::{
    debug,
    info,
    warn,
};
use seclink_commons::{
    AppInstance,
    ChannelState,
    ConnectId,
    ConnectionHealth,
    EventBus,
    HealthStatus,
    NetworkFailure,
    NetworkEvent,
    ServiceType,
};
use tokio::sync::broadcast;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::protocol::{
    ProtocolEventHandler,
    ProtocolSystemFactory,
    DEFAULT_ONE_TIME_PREKEYS,
};
use crate::recovery::{
    RecoveryClass,
    RecoveryDriver,
};
use crate::retry::{
    RetryOperation,
    RetryStrategy,
};
use crate::storage::{
    encoded_timestamp_now,
    ApplicationSecureStorage,
    MetadataProvider,
    SecureStateStorage,
};
use crate::transport::{
    RestoreOutcome,
    RpcTransport,
};

pub use channel::{
    Channel,
    ChannelLifecycle,
};

/// Owns the `ConnectId → Channel` mapping and the lifecycle operations on
/// it: initiate, establish, restore, clear. Health observations and ratchet
/// persistence feed back into this map.
pub struct SessionManager {
    channels: Arc<DashMap<ConnectId, Arc<Channel>>>,
    health: DashMap<ConnectId, ConnectionHealth>,
    app_instances: DashMap<ConnectId, AppInstance>,
    restore_gates: DashMap<ConnectId, Arc<Mutex<()>>>,
    factory: Arc<dyn ProtocolSystemFactory>,
    transport: Arc<dyn RpcTransport>,
    retry: Arc<dyn RetryStrategy>,
    state_storage: Arc<dyn SecureStateStorage>,
    app_storage: Arc<dyn ApplicationSecureStorage>,
    metadata: Arc<dyn MetadataProvider>,
    events: EventBus,
    hooks: Arc<RatchetPersistence>,
    shutdown: CancellationToken,
}

impl SessionManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        factory: Arc<dyn ProtocolSystemFactory>, transport: Arc<dyn RpcTransport>,
        retry: Arc<dyn RetryStrategy>, state_storage: Arc<dyn SecureStateStorage>,
        app_storage: Arc<dyn ApplicationSecureStorage>, metadata: Arc<dyn MetadataProvider>,
        events: EventBus, shutdown: CancellationToken,
    ) -> Arc<Self> {
        let channels: Arc<DashMap<ConnectId, Arc<Channel>>> = Arc::new(DashMap::new());
        let hooks = Arc::new(RatchetPersistence {
            channels: Arc::downgrade(&channels),
            storage: state_storage.clone(),
        });
        Arc::new(Self {
            channels,
            health: DashMap::new(),
            app_instances: DashMap::new(),
            restore_gates: DashMap::new(),
            factory,
            transport,
            retry,
            state_storage,
            app_storage,
            metadata,
            events,
            hooks,
            shutdown,
        })
    }

    /// Create and register a fresh protocol instance for `connect_id`.
    /// Idempotent: the first registration wins and later attempts leave the
    /// existing channel untouched.
    pub async fn initiate(
        &self, app_instance: AppInstance, connect_id: ConnectId,
    ) -> Result<(), NetworkFailure> {
        if self.channels.contains_key(&connect_id) {
            debug!("channel {connect_id} already registered; keeping the existing instance");
            return Ok(());
        }

        let protocol = self.factory.create(
            connect_id,
            DEFAULT_ONE_TIME_PREKEYS,
            self.hooks.clone() as Arc<dyn ProtocolEventHandler>,
        )?;
        let channel = Arc::new(Channel::new(connect_id, protocol));

        let registered = match self.channels.entry(connect_id) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(channel.clone());
                true
            }
        };
        if !registered {
            // Lost the race; the first registration wins.
            channel.dispose().await;
            return Ok(());
        }

        self.health.insert(
            connect_id,
            ConnectionHealth::now(connect_id, HealthStatus::Healthy),
        );
        self.metadata.set_app_info(
            app_instance.app_instance_id,
            app_instance.device_id,
            &app_instance.culture,
        );
        self.app_instances.insert(connect_id, app_instance);
        info!("channel {connect_id} initiated");
        Ok(())
    }

    /// Drive a peer key exchange for an initiated channel. On success the
    /// resulting state has been persisted and the channel is Established.
    pub async fn establish(&self, connect_id: ConnectId) -> Result<ChannelState, NetworkFailure> {
        let channel = self.channel(connect_id).ok_or_else(|| {
            NetworkFailure::DataCenterNotResponding("connection unavailable".to_string())
        })?;

        self.events
            .publish_network(NetworkEvent::DataCenterConnecting(connect_id));

        let handshake = channel.begin_handshake().await?;
        let peer_slot: Arc<StdMutex<Option<Vec<u8>>>> = Arc::new(StdMutex::new(None));
        let op: RetryOperation = {
            let transport = self.transport.clone();
            let peer_slot = peer_slot.clone();
            Arc::new(move || {
                let transport = transport.clone();
                let peer_slot = peer_slot.clone();
                let handshake = handshake.clone();
                Box::pin(async move {
                    let peer = transport.establish(connect_id, handshake).await?;
                    *peer_slot.lock().expect("handshake slot lock poisoned") = Some(peer);
                    Ok(())
                })
            })
        };
        self.retry
            .execute(
                op,
                ServiceType::EstablishSecrecyChannel.wire_name(),
                connect_id,
                ServiceType::EstablishSecrecyChannel.max_attempts(),
                self.shutdown.child_token(),
            )
            .await?;

        let peer_message = peer_slot
            .lock()
            .expect("handshake slot lock poisoned")
            .take()
            .ok_or_else(|| NetworkFailure::unexpected("handshake", "no peer message captured"))?;
        channel.complete_handshake(&peer_message).await?;

        let state = channel.snapshot_state().await?;
        self.persist_state(&state).await;
        channel.set_lifecycle(ChannelLifecycle::Established);
        self.health.insert(
            connect_id,
            ConnectionHealth::now(connect_id, HealthStatus::Healthy),
        );
        self.events
            .publish_network(NetworkEvent::DataCenterConnected(connect_id));
        info!("channel {connect_id} established");
        Ok(state)
    }

    /// Reconstruct a channel from persisted state and ask the peer to resume
    /// the session. `Ok(false)` means the peer declined and the caller
    /// should fall back to a fresh establishment.
    pub async fn restore(
        &self, state: ChannelState, app_instance: &AppInstance,
    ) -> Result<bool, NetworkFailure> {
        self.restore_inner(state, Some(app_instance.clone())).await
    }

    async fn restore_inner(
        &self, state: ChannelState, app_instance: Option<AppInstance>,
    ) -> Result<bool, NetworkFailure> {
        let connect_id = state.connect_id;
        let protocol = self
            .factory
            .from_state(&state, self.hooks.clone() as Arc<dyn ProtocolEventHandler>)?;
        let channel = Arc::new(Channel::new(connect_id, protocol));

        self.events
            .publish_network(NetworkEvent::RestoreSecrecyChannel(connect_id));
        match self.transport.restore(connect_id).await? {
            RestoreOutcome::SessionResumed { send_len, recv_len } => {
                channel.sync_with_remote(send_len, recv_len).await?;
                if let Some((_, old)) = self.channels.remove(&connect_id) {
                    old.dispose().await;
                }
                channel.set_lifecycle(ChannelLifecycle::Established);
                self.channels.insert(connect_id, channel.clone());
                self.health.insert(
                    connect_id,
                    ConnectionHealth::now(connect_id, HealthStatus::Healthy),
                );
                if let Some(instance) = app_instance {
                    self.metadata.set_app_info(
                        instance.app_instance_id,
                        instance.device_id,
                        &instance.culture,
                    );
                    self.app_instances.insert(connect_id, instance);
                }
                if let Ok(refreshed) = channel.snapshot_state().await {
                    self.persist_state(&refreshed).await;
                }
                info!("channel {connect_id} restored from persisted state");
                Ok(true)
            }
            RestoreOutcome::Declined { status } => {
                info!("peer declined restore of {connect_id}: {status}");
                channel.dispose().await;
                Ok(false)
            }
        }
    }

    /// Single-flight restore from persisted state. Concurrent callers for
    /// the same `connect_id` queue on a per-channel gate so a restore storm
    /// collapses into one attempt at a time.
    pub async fn try_restore(&self, connect_id: ConnectId) -> Result<bool, NetworkFailure> {
        let gate = self
            .restore_gates
            .entry(connect_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = gate.lock().await;

        let Some(bytes) = self.state_storage.load(&connect_id.state_key()).await? else {
            debug!("no persisted state for {connect_id}");
            return Ok(false);
        };
        let state = ChannelState::from_bytes(&bytes)?;
        let app_instance = self.app_instances.get(&connect_id).map(|e| e.value().clone());
        self.restore_inner(state, app_instance).await
    }

    /// Remove and dispose the channel plus every channel-scoped entry.
    pub async fn clear(&self, connect_id: ConnectId) {
        if let Some((_, channel)) = self.channels.remove(&connect_id) {
            channel.dispose().await;
        }
        self.health.remove(&connect_id);
        self.app_instances.remove(&connect_id);
        self.restore_gates.remove(&connect_id);
        info!("channel {connect_id} cleared");
    }

    /// Remove and dispose the cached channel only, keeping the health entry
    /// and the stashed app instance so a subsequent restore can re-register.
    pub async fn drop_channel(&self, connect_id: ConnectId) {
        if let Some((_, channel)) = self.channels.remove(&connect_id) {
            channel.dispose().await;
        }
    }

    pub fn is_healthy(&self, connect_id: ConnectId) -> bool {
        self.channels.contains_key(&connect_id)
            && self
                .health
                .get(&connect_id)
                .map(|entry| entry.status == HealthStatus::Healthy)
                .unwrap_or(false)
    }

    pub fn channel(&self, connect_id: ConnectId) -> Option<Arc<Channel>> {
        self.channels.get(&connect_id).map(|entry| entry.value().clone())
    }

    pub fn channel_ids(&self) -> Vec<ConnectId> {
        self.channels.iter().map(|entry| *entry.key()).collect()
    }

    pub fn app_instance(&self, connect_id: ConnectId) -> Option<AppInstance> {
        self.app_instances.get(&connect_id).map(|entry| entry.value().clone())
    }

    pub fn health_of(&self, connect_id: ConnectId) -> Option<ConnectionHealth> {
        self.health.get(&connect_id).map(|entry| entry.value().clone())
    }

    pub(crate) fn record_health(&self, health: ConnectionHealth) {
        self.health.insert(health.connect_id, health);
    }

    pub(crate) fn mark_recovering(&self, connect_id: ConnectId) {
        if let Some(channel) = self.channel(connect_id) {
            channel.set_lifecycle(ChannelLifecycle::Recovering);
        }
        self.health.insert(
            connect_id,
            ConnectionHealth::now(connect_id, HealthStatus::Recovering),
        );
    }

    pub(crate) fn mark_outage(&self, connect_id: ConnectId) {
        if let Some(channel) = self.channel(connect_id) {
            channel.set_lifecycle(ChannelLifecycle::Outage);
        }
        self.health.insert(
            connect_id,
            ConnectionHealth::now(connect_id, HealthStatus::Recovering),
        );
    }

    pub(crate) fn mark_healthy(&self, connect_id: ConnectId) {
        if let Some(channel) = self.channel(connect_id) {
            channel.set_lifecycle(ChannelLifecycle::Healthy);
        }
        self.health.insert(
            connect_id,
            ConnectionHealth::now(connect_id, HealthStatus::Healthy),
        );
    }

    /// Serialize and write channel state plus the establishment timestamp.
    /// Persistence failures are logged and never invalidate the local
    /// ratchet advance.
    pub(crate) async fn persist_state(&self, state: &ChannelState) {
        let connect_id = state.connect_id;
        match state.to_bytes() {
            Ok(bytes) => {
                if let Err(failure) = self
                    .state_storage
                    .save(&connect_id.state_key(), &bytes)
                    .await
                {
                    warn!("failed to persist state for {connect_id}: {failure}");
                }
            }
            Err(failure) => warn!("failed to serialize state for {connect_id}: {failure}"),
        }
        if let Err(failure) = self
            .app_storage
            .store(&connect_id.timestamp_key(), &encoded_timestamp_now())
            .await
        {
            warn!("failed to persist timestamp for {connect_id}: {failure}");
        }
    }

    /// Consume a health stream from the connection health observer. Failed
    /// and unhealthy transitions for registered channels trigger a throttled
    /// advanced recovery.
    pub fn attach_health_stream(
        self: Arc<Self>, mut stream: broadcast::Receiver<ConnectionHealth>,
        recovery: Arc<RecoveryDriver>,
    ) {
        let manager = self;
        let shutdown = manager.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let health = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    received = stream.recv() => match received {
                        Ok(health) => health,
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("health stream lagged by {missed} updates");
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                };

                let connect_id = health.connect_id;
                let needs_recovery = health.needs_recovery();
                manager.record_health(health);
                if needs_recovery && manager.channels.contains_key(&connect_id) {
                    info!("health observer reported {connect_id} degraded; scheduling recovery");
                    recovery.spawn_recovery(RecoveryClass::Advanced, connect_id);
                }
            }
        });
    }

    /// Dispose every channel. Used during shutdown; disposal failures are
    /// logged and the remaining channels are still released.
    pub async fn dispose_all(&self) {
        let ids = self.channel_ids();
        for connect_id in ids {
            if let Some((_, channel)) = self.channels.remove(&connect_id) {
                channel.dispose().await;
            }
        }
        self.health.clear();
        self.restore_gates.clear();
    }
}

/// Persists channel state after ratchet transitions. Holds the channel map
/// weakly: once the manager is gone the hooks become no-ops.
pub(crate) struct RatchetPersistence {
    channels: Weak<DashMap<ConnectId, Arc<Channel>>>,
    storage: Arc<dyn SecureStateStorage>,
}

impl RatchetPersistence {
    fn spawn_persist(&self, connect_id: ConnectId) {
        let Some(channels) = self.channels.upgrade() else {
            return;
        };
        let storage = self.storage.clone();
        tokio::spawn(async move {
            let Some(channel) = channels.get(&connect_id).map(|entry| entry.value().clone())
            else {
                return;
            };
            let snapshot = channel.snapshot_state().await;
            match snapshot.and_then(|state| state.to_bytes().map_err(NetworkFailure::from)) {
                Ok(bytes) => {
                    if let Err(failure) = storage.save(&connect_id.state_key(), &bytes).await {
                        warn!("ratchet persistence failed for {connect_id}: {failure}");
                    }
                }
                Err(failure) => {
                    warn!("ratchet snapshot failed for {connect_id}: {failure}");
                }
            }
        });
    }
}

impl ProtocolEventHandler for RatchetPersistence {
    fn on_dh_ratchet_performed(&self, connect_id: ConnectId, is_sending: bool, new_index: u64) {
        debug!(
            "DH ratchet on {connect_id} ({} chain, index {new_index})",
            if is_sending { "sending" } else { "receiving" }
        );
        self.spawn_persist(connect_id);
    }

    fn on_chain_synchronized(&self, connect_id: ConnectId, local_len: u64, remote_len: u64) {
        debug!("chains synchronized on {connect_id} (local {local_len}, remote {remote_len})");
        self.spawn_persist(connect_id);
    }

    fn on_message_processed(&self, connect_id: ConnectId, has_skipped_keys: bool) {
        if has_skipped_keys {
            warn!("message on {connect_id} consumed skipped keys");
        } else {
            debug!("message processed on {connect_id}");
        }
    }
}
