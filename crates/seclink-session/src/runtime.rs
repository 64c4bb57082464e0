use std::sync::Arc;
use std::time::Duration;

use log::warn;
use seclink_commons::EventBus;
use tokio_util::sync::CancellationToken;

use crate::pending::PendingRequestStore;
use crate::pipeline::inflight::InFlightRegistry;
use crate::pipeline::RequestPipeline;
use crate::protocol::ProtocolSystemFactory;
use crate::recovery::RecoveryDriver;
use crate::retry::RetryStrategy;
use crate::session::SessionManager;
use crate::storage::{
    ApplicationSecureStorage,
    MetadataProvider,
    SecureStateStorage,
};
use crate::transport::RpcTransport;

/// Aggregate bound on how long background work may hold up shutdown.
const SHUTDOWN_BUDGET: Duration = Duration::from_secs(5);

/// Wires the session manager, recovery driver and request pipeline around
/// one shared event bus and one shutdown token, and owns the bounded
/// teardown.
pub struct SessionRuntime {
    session: Arc<SessionManager>,
    recovery: Arc<RecoveryDriver>,
    pipeline: Arc<RequestPipeline>,
    events: EventBus,
    shutdown: CancellationToken,
}

impl SessionRuntime {
    pub fn new(
        factory: Arc<dyn ProtocolSystemFactory>, transport: Arc<dyn RpcTransport>,
        retry: Arc<dyn RetryStrategy>, state_storage: Arc<dyn SecureStateStorage>,
        app_storage: Arc<dyn ApplicationSecureStorage>, metadata: Arc<dyn MetadataProvider>,
        pending: Arc<dyn PendingRequestStore>,
    ) -> Self {
        let events = EventBus::new();
        let shutdown = CancellationToken::new();
        let inflight = Arc::new(InFlightRegistry::new());

        let session = SessionManager::new(
            factory,
            transport.clone(),
            retry.clone(),
            state_storage.clone(),
            app_storage,
            metadata,
            events.clone(),
            shutdown.clone(),
        );
        let recovery = RecoveryDriver::new(
            session.clone(),
            retry.clone(),
            pending.clone(),
            state_storage,
            events.clone(),
            inflight.clone(),
            shutdown.clone(),
        );
        let pipeline = RequestPipeline::new(
            session.clone(),
            recovery.clone(),
            transport,
            retry,
            pending,
            events.clone(),
            inflight,
            shutdown.clone(),
        );

        Self {
            session,
            recovery,
            pipeline,
            events,
            shutdown,
        }
    }

    pub fn session(&self) -> &Arc<SessionManager> {
        &self.session
    }

    pub fn recovery(&self) -> &Arc<RecoveryDriver> {
        &self.recovery
    }

    pub fn pipeline(&self) -> &Arc<RequestPipeline> {
        &self.pipeline
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel all background work and dispose every channel. Never blocks
    /// beyond the shutdown budget; channels that cannot be disposed in time
    /// are abandoned to the process exit.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        if tokio::time::timeout(SHUTDOWN_BUDGET, self.session.dispose_all())
            .await
            .is_err()
        {
            warn!("shutdown budget exceeded; abandoning remaining channel disposal");
        }
    }
}
