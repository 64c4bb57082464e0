pub mod backoff;
pub mod outage;

use std::sync::{
    Arc,
    Mutex as StdMutex,
    Weak,
};
use std::time::Duration;

use dashmap::DashMap;
use log::{
    debug,
    error,
    info,
    warn,
};
use seclink_commons::{
    ConnectId,
    EventBus,
    NetworkEvent,
    NetworkFailure,
    SystemState,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::pending::PendingRequestStore;
use crate::pipeline::inflight::InFlightRegistry;
use crate::retry::{
    RetryOperation,
    RetryStrategy,
};
use crate::session::SessionManager;
use crate::storage::SecureStateStorage;

pub use outage::OutageState;

/// Minimum spacing between background recoveries of the same channel for
/// the throttled classes.
pub const RECOVERY_THROTTLE: Duration = Duration::from_secs(10);

/// Hard ceiling on how long a caller may block waiting for recovery.
pub const OUTAGE_WAIT_CEILING: Duration = Duration::from_secs(30);

/// Attempt budget for the manual restore path of `force_fresh`.
const MANUAL_RESTORE_ATTEMPTS: u32 = 3;

/// What kind of recovery a failure classification asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryClass {
    /// Drop the cached channel and restore from persisted state.
    Advanced,
    /// Dispose, delete persisted state and re-establish from scratch.
    ProtocolResync,
    /// Same surgery as a resync, for irreconcilable protocol state.
    FreshEstablishment,
}

/// Coordinates the process-wide outage flag, the bounded recovery loop and
/// the targeted recovery classes. One instance per session stack; handles to
/// it are passed explicitly rather than living in ambient globals.
pub struct RecoveryDriver {
    weak_self: Weak<RecoveryDriver>,
    outage: OutageState,
    session: Arc<SessionManager>,
    retry: Arc<dyn RetryStrategy>,
    pending: Arc<dyn PendingRequestStore>,
    state_storage: Arc<dyn SecureStateStorage>,
    events: EventBus,
    inflight: Arc<InFlightRegistry>,
    recovery_cancel: StdMutex<Option<CancellationToken>>,
    last_recovery_attempts: DashMap<ConnectId, Instant>,
    shutdown: CancellationToken,
}

impl RecoveryDriver {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<SessionManager>, retry: Arc<dyn RetryStrategy>,
        pending: Arc<dyn PendingRequestStore>, state_storage: Arc<dyn SecureStateStorage>,
        events: EventBus, inflight: Arc<InFlightRegistry>, shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            outage: OutageState::new(),
            session,
            retry,
            pending,
            state_storage,
            events,
            inflight,
            recovery_cancel: StdMutex::new(None),
            last_recovery_attempts: DashMap::new(),
            shutdown,
        })
    }

    pub fn outage(&self) -> &OutageState {
        &self.outage
    }

    /// Flip the process into outage. Only the first caller acts: it swaps in
    /// a fresh recovery cancellation (cancelling any recovery already
    /// running), cancels every in-flight user request and launches the
    /// recovery loop.
    pub fn enter_outage(&self, reason: &str, connect_id: ConnectId) {
        if !self.outage.try_enter() {
            debug!("outage already active; ignoring entry for {connect_id}");
            return;
        }
        warn!("entering outage for {connect_id}: {reason}");

        self.events.set_system_state(SystemState::Recovering);
        self.events
            .publish_network(NetworkEvent::ServerShutdown(connect_id));
        self.events
            .publish_network(NetworkEvent::ConnectionRecovering(connect_id));
        self.session.mark_outage(connect_id);

        let token = self.replace_recovery_token();
        self.inflight.cancel_all();

        let Some(driver) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            driver.recovery_loop(connect_id, token).await;
        });
    }

    /// Clear the outage: completes the recovered signal, restores the
    /// system state and stops the recovery loop. Idempotent.
    pub fn exit_outage(&self, connect_id: ConnectId) {
        if !self.outage.exit() {
            return;
        }
        info!("outage cleared for {connect_id}");
        self.cancel_recovery_token();
        self.events.set_system_state(SystemState::Running);
        self.events
            .publish_network(NetworkEvent::ConnectionRestored(connect_id));
    }

    /// Standard epilogue of every successful recovery: clear the outage,
    /// reset retry bookkeeping and drain the pending store.
    pub async fn complete_recovery(&self, connect_id: ConnectId) {
        self.exit_outage(connect_id);
        self.retry.reset_connection_state();
        self.retry.mark_connection_healthy(connect_id);
        self.pending.retry_all().await;
    }

    fn replace_recovery_token(&self) -> CancellationToken {
        let mut guard = self
            .recovery_cancel
            .lock()
            .expect("recovery cancel lock poisoned");
        if let Some(previous) = guard.take() {
            previous.cancel();
        }
        let token = self.shutdown.child_token();
        *guard = Some(token.clone());
        token
    }

    fn cancel_recovery_token(&self) {
        let mut guard = self
            .recovery_cancel
            .lock()
            .expect("recovery cancel lock poisoned");
        if let Some(token) = guard.take() {
            token.cancel();
        }
    }

    /// Bounded restore loop run while an outage is active. Backs off with
    /// jittered exponential delays, stops on cancellation, success or an
    /// exhausted retry strategy (the outage then stays active until
    /// `force_fresh`).
    async fn recovery_loop(&self, connect_id: ConnectId, token: CancellationToken) {
        let mut attempt: u32 = 1;
        loop {
            if token.is_cancelled() {
                debug!("recovery loop for {connect_id} cancelled");
                return;
            }
            if self.retry.has_exhausted_operations() {
                warn!("recovery loop for {connect_id} stopping: retries exhausted");
                self.events
                    .publish_network(NetworkEvent::RetriesExhausted(connect_id));
                return;
            }

            let delay = backoff::backoff_delay(attempt);
            debug!("recovery attempt {attempt} for {connect_id} in {delay:?}");
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = token.cancelled() => return,
            }

            self.session.drop_channel(connect_id).await;
            match self.session.try_restore(connect_id).await {
                Ok(true) => {
                    info!("recovery loop restored {connect_id} on attempt {attempt}");
                    self.complete_recovery(connect_id).await;
                    return;
                }
                Ok(false) => {
                    debug!("restore attempt {attempt} for {connect_id} declined");
                }
                Err(failure) => {
                    error!("restore attempt {attempt} for {connect_id} failed: {failure}");
                }
            }
            self.session.mark_recovering(connect_id);
            attempt = attempt.saturating_add(1);
        }
    }

    /// Launch a background recovery of the given class. The desync and
    /// rotation classes are throttled per channel; a fresh establishment is
    /// never throttled.
    pub fn spawn_recovery(&self, class: RecoveryClass, connect_id: ConnectId) {
        let throttled = matches!(
            class,
            RecoveryClass::Advanced | RecoveryClass::ProtocolResync
        );
        if throttled && !self.throttle_allows(connect_id) {
            debug!("{class:?} recovery for {connect_id} suppressed by throttle");
            return;
        }

        let Some(driver) = self.weak_self.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            let result = match class {
                RecoveryClass::Advanced => driver.advanced_recovery(connect_id).await,
                RecoveryClass::ProtocolResync => driver.protocol_resync(connect_id, false).await,
                RecoveryClass::FreshEstablishment => driver.protocol_resync(connect_id, true).await,
            };
            if let Err(failure) = result {
                error!("{class:?} recovery for {connect_id} failed: {failure}");
            }
        });
    }

    fn throttle_allows(&self, connect_id: ConnectId) -> bool {
        let now = Instant::now();
        match self.last_recovery_attempts.entry(connect_id) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if now.duration_since(*occupied.get()) < RECOVERY_THROTTLE {
                    return false;
                }
                occupied.insert(now);
                true
            }
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                vacant.insert(now);
                true
            }
        }
    }

    /// Drop the cached channel and restore from persisted state. The ratchet
    /// in the persisted snapshot supersedes whatever drifted in memory.
    pub async fn advanced_recovery(&self, connect_id: ConnectId) -> Result<(), NetworkFailure> {
        info!("advanced recovery for {connect_id}");
        self.session.drop_channel(connect_id).await;
        match self.session.try_restore(connect_id).await? {
            true => {
                self.complete_recovery(connect_id).await;
                Ok(())
            }
            false => Err(NetworkFailure::DataCenterNotResponding(
                "restore declined".to_string(),
            )),
        }
    }

    /// Dispose the channel, delete its persisted state and establish a
    /// brand-new one. Used for chain-rotation mismatches and, as a full
    /// reset, for irreconcilable protocol state.
    pub async fn protocol_resync(
        &self, connect_id: ConnectId, full_reset: bool,
    ) -> Result<(), NetworkFailure> {
        if full_reset {
            warn!("full protocol reset for {connect_id}");
        } else {
            info!("protocol resync for {connect_id}");
        }

        let app_instance = self.session.app_instance(connect_id).ok_or_else(|| {
            NetworkFailure::DataCenterNotResponding("connection unavailable".to_string())
        })?;

        self.session.clear(connect_id).await;
        if let Err(failure) = self.state_storage.delete(&connect_id.state_key()).await {
            warn!("failed to delete stale state for {connect_id}: {failure}");
        }

        self.session.initiate(app_instance, connect_id).await?;
        self.session.establish(connect_id).await?;
        self.complete_recovery(connect_id).await;
        Ok(())
    }

    /// Caller-triggered reset after exhaustion. Clears the exhaustion
    /// ledger, tries one immediate restore bypassing the retry strategy,
    /// then a manual-retry restore, then a fresh establishment.
    pub async fn force_fresh(&self, connect_id: ConnectId) -> Result<(), NetworkFailure> {
        info!("manual recovery requested for {connect_id}");
        self.retry.clear_exhausted_operations();

        self.session.drop_channel(connect_id).await;
        match self.session.try_restore(connect_id).await {
            Ok(true) => {
                self.complete_recovery(connect_id).await;
                return Ok(());
            }
            Ok(false) => debug!("immediate restore for {connect_id} declined"),
            Err(failure) => debug!("immediate restore for {connect_id} failed: {failure}"),
        }

        let Some(driver) = self.weak_self.upgrade() else {
            return Err(NetworkFailure::ObjectDisposed(
                "recovery driver dropped".to_string(),
            ));
        };
        let op: RetryOperation = Arc::new(move || {
            let driver = driver.clone();
            Box::pin(async move { driver.advanced_recovery(connect_id).await })
        });
        match self
            .retry
            .execute_manual(
                op,
                "ForceFreshRestore",
                connect_id,
                MANUAL_RESTORE_ATTEMPTS,
                self.shutdown.child_token(),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(failure) => {
                warn!("manual restore for {connect_id} failed ({failure}); establishing fresh");
                self.protocol_resync(connect_id, true).await
            }
        }
    }
}
