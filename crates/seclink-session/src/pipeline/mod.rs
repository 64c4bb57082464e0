pub mod inflight;
pub mod op_gate;

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::{
    Arc,
    Weak,
};

use futures::{
    FutureExt,
    StreamExt,
};
use log::{
    debug,
    info,
    warn,
};
use seclink_commons::{
    logical_operation_id,
    ConnectId,
    EventBus,
    FlowType,
    NetworkEvent,
    NetworkFailure,
    ServiceRequest,
    ServiceType,
    SystemState,
};
use tokio_util::sync::CancellationToken;

use crate::pending::{
    PendingRequestStore,
    ReplayFn,
};
use crate::recovery::{
    RecoveryClass,
    RecoveryDriver,
    OUTAGE_WAIT_CEILING,
};
use crate::retry::{
    RetryOperation,
    RetryStrategy,
};
use crate::session::{
    Channel,
    SessionManager,
};
use crate::transport::{
    RpcFlow,
    RpcTransport,
};

use inflight::{
    request_key,
    DebounceLedger,
    InFlightRegistry,
};
use op_gate::OperationGateMap;

/// Receives the decrypted response of a unary call.
pub type CompletionHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Receives each decrypted item of an inbound stream.
pub type StreamItemHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

#[derive(Clone)]
enum FlowHandler {
    Unary(CompletionHandler),
    Stream(StreamItemHandler),
}

#[derive(Debug, Clone, Copy)]
struct RequestPolicy {
    allow_duplicates: bool,
    wait_for_recovery: bool,
    /// Replays are driven by the pending-store drain, not by the user, so
    /// they skip the debounce ledger.
    bypass_debounce: bool,
}

/// Delivers one successful round-trip for a plaintext buffer against a named
/// service: duplicate suppression, debounce, outage gating, retry-wrapped
/// encrypt→send→decrypt with classification-driven recovery dispatch, and
/// replay registration on server shutdown.
pub struct RequestPipeline {
    weak_self: Weak<RequestPipeline>,
    session: Arc<SessionManager>,
    recovery: Arc<RecoveryDriver>,
    transport: Arc<dyn RpcTransport>,
    retry: Arc<dyn RetryStrategy>,
    pending: Arc<dyn PendingRequestStore>,
    events: EventBus,
    inflight: Arc<InFlightRegistry>,
    debounce: DebounceLedger,
    op_gates: OperationGateMap,
    shutdown: CancellationToken,
}

impl RequestPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: Arc<SessionManager>, recovery: Arc<RecoveryDriver>,
        transport: Arc<dyn RpcTransport>, retry: Arc<dyn RetryStrategy>,
        pending: Arc<dyn PendingRequestStore>, events: EventBus,
        inflight: Arc<InFlightRegistry>, shutdown: CancellationToken,
    ) -> Arc<Self> {
        Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            session,
            recovery,
            transport,
            retry,
            pending,
            events,
            inflight,
            debounce: DebounceLedger::new(),
            op_gates: OperationGateMap::new(),
            shutdown,
        })
    }

    /// One encrypted request, one decrypted response, delivered through
    /// `on_completed`.
    #[allow(clippy::too_many_arguments)]
    pub async fn execute_unary(
        &self, connect_id: ConnectId, service: ServiceType, plaintext: Vec<u8>,
        on_completed: CompletionHandler, allow_duplicates: bool, wait_for_recovery: bool,
        caller_token: CancellationToken,
    ) -> Result<(), NetworkFailure> {
        self.execute(
            connect_id,
            service,
            FlowType::SingleCall,
            plaintext,
            FlowHandler::Unary(on_completed),
            RequestPolicy {
                allow_duplicates,
                wait_for_recovery,
                bypass_debounce: false,
            },
            caller_token,
        )
        .await
    }

    /// One encrypted request answered by a stream of encrypted items, each
    /// delivered through `on_item` until cancellation or exhaustion.
    pub async fn execute_receive_stream(
        &self, connect_id: ConnectId, service: ServiceType, plaintext: Vec<u8>,
        on_item: StreamItemHandler, allow_duplicates: bool, caller_token: CancellationToken,
    ) -> Result<(), NetworkFailure> {
        self.execute(
            connect_id,
            service,
            FlowType::ReceiveStream,
            plaintext,
            FlowHandler::Stream(on_item),
            RequestPolicy {
                allow_duplicates,
                wait_for_recovery: false,
                bypass_debounce: false,
            },
            caller_token,
        )
        .await
    }

    /// Reserved. Always fails.
    pub async fn execute_send_stream(
        &self, _connect_id: ConnectId, _service: ServiceType,
    ) -> Result<(), NetworkFailure> {
        Err(NetworkFailure::InvalidRequestType(
            "not implemented".to_string(),
        ))
    }

    /// Reserved. Always fails.
    pub async fn execute_bidi_stream(
        &self, _connect_id: ConnectId, _service: ServiceType,
    ) -> Result<(), NetworkFailure> {
        Err(NetworkFailure::InvalidRequestType(
            "not implemented".to_string(),
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn execute<'a>(
        &'a self, connect_id: ConnectId, service: ServiceType, flow: FlowType,
        plaintext: Vec<u8>, handler: FlowHandler, policy: RequestPolicy,
        caller_token: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<(), NetworkFailure>> + Send + 'a>> {
        Box::pin(self.execute_inner(
            connect_id,
            service,
            flow,
            plaintext,
            handler,
            policy,
            caller_token,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute_inner(
        &self, connect_id: ConnectId, service: ServiceType, flow: FlowType, plaintext: Vec<u8>,
        handler: FlowHandler, policy: RequestPolicy, caller_token: CancellationToken,
    ) -> Result<(), NetworkFailure> {
        // Phase 1: state gate. User traffic is rejected while the system is
        // recovering unless the caller opted into waiting.
        if self.events.system_state() == SystemState::Recovering
            && service.is_user_initiated()
            && !policy.wait_for_recovery
        {
            return Err(NetworkFailure::DataCenterNotResponding(
                "recovering".to_string(),
            ));
        }

        // Phase 2: debounce, for non-waiting callers only. The window runs
        // from the last accepted attempt.
        if !policy.wait_for_recovery && !policy.bypass_debounce {
            let debounce_key = DebounceLedger::key(connect_id, service);
            if !self.debounce.check(&debounce_key) {
                return Err(NetworkFailure::InvalidRequestType(
                    "too frequent".to_string(),
                ));
            }
        }

        // Phase 3: duplicate suppression.
        let request_key = request_key(connect_id, service, &plaintext);
        let mut inflight_guard = None;
        let per_request_token = if service.allows_duplicates() || policy.allow_duplicates {
            CancellationToken::new()
        } else {
            match self.inflight.try_insert(&request_key) {
                Some(token) => {
                    inflight_guard = Some(InFlightGuard {
                        registry: self.inflight.clone(),
                        key: request_key.clone(),
                    });
                    token
                }
                None => {
                    return Err(NetworkFailure::InvalidRequestType("duplicate".to_string()))
                }
            }
        };
        let _inflight_guard = inflight_guard;

        // Phase 4: outage gate.
        if self.recovery.outage().is_active() {
            if policy.wait_for_recovery {
                self.recovery
                    .outage()
                    .wait_recovered(OUTAGE_WAIT_CEILING, &caller_token, &self.shutdown)
                    .await?;
            } else {
                return Err(NetworkFailure::DataCenterNotResponding(
                    "recovering".to_string(),
                ));
            }
        }

        // Phase 5: retry-wrapped attempt with one effective token composed
        // from caller, per-request and shutdown cancellation. The drop guard
        // releases the composition on every exit path.
        let composed = compose_tokens(&self.shutdown, [caller_token.clone(), per_request_token]);
        let _composed_guard = composed.clone().drop_guard();

        let pipeline = self.weak_self.upgrade().ok_or_else(|| {
            NetworkFailure::ObjectDisposed("request pipeline dropped".to_string())
        })?;
        let op: RetryOperation = {
            let token = composed.clone();
            Arc::new(move || {
                let pipeline = pipeline.clone();
                let plaintext = plaintext.clone();
                let handler = handler.clone();
                let token = token.clone();
                let caller_token = caller_token.clone();
                Box::pin(async move {
                    pipeline
                        .attempt_once(
                            connect_id,
                            service,
                            flow,
                            plaintext,
                            handler,
                            token,
                            caller_token,
                            policy.wait_for_recovery,
                        )
                        .await
                })
            })
        };

        AssertUnwindSafe(self.retry.execute(
            op,
            service.wire_name(),
            connect_id,
            service.max_attempts(),
            composed.clone(),
        ))
        .catch_unwind()
        .await
        .unwrap_or_else(|payload| {
            Err(NetworkFailure::unexpected("pipeline", panic_message(payload)))
        })
        // Phase 6: the in-flight entry and the token composition are
        // released by the guards.
    }

    /// One attempt: build the encrypted frame, serialize through the
    /// logical-operation gate, dispatch the flow and classify the result.
    #[allow(clippy::too_many_arguments)]
    async fn attempt_once(
        self: Arc<Self>, connect_id: ConnectId, service: ServiceType, flow: FlowType,
        plaintext: Vec<u8>, handler: FlowHandler, token: CancellationToken,
        caller_token: CancellationToken, wait_for_recovery: bool,
    ) -> Result<(), NetworkFailure> {
        if token.is_cancelled() {
            return Err(NetworkFailure::DataCenterNotResponding(
                "operation cancelled".to_string(),
            ));
        }

        let Some(channel) = self.session.channel(connect_id) else {
            self.events
                .publish_network(NetworkEvent::ServerShutdown(connect_id));
            return Err(NetworkFailure::DataCenterNotResponding(
                "connection unavailable".to_string(),
            ));
        };

        let op_id = logical_operation_id(service, connect_id, &plaintext);
        let envelope = match channel.produce_outbound(&plaintext).await {
            Ok(envelope) => envelope,
            Err(failure) if failure.is_server_shutdown() => {
                return self
                    .handle_server_shutdown(
                        connect_id,
                        service,
                        flow,
                        plaintext,
                        handler,
                        0,
                        wait_for_recovery,
                        caller_token,
                        failure,
                    )
                    .await;
            }
            Err(failure) => return Err(failure),
        };
        let original_req_id = envelope.req_id;
        debug!("built request {original_req_id} for {service} on {connect_id} (op {op_id})");
        let request = ServiceRequest::new(envelope.req_id, flow, service, envelope.cipher);

        let gate_key = format!("{connect_id}:op:{op_id}");
        let outcome = {
            let _gate = self.op_gates.acquire(&gate_key).await;
            self.dispatch_flow(&channel, request, &handler, &token).await
        };

        match outcome {
            Ok(()) => {
                if self.recovery.outage().is_active() {
                    info!("request succeeded during outage; clearing it for {connect_id}");
                    self.recovery.complete_recovery(connect_id).await;
                }
                self.session.mark_healthy(connect_id);
                Ok(())
            }
            Err(failure) if failure.is_server_shutdown() => {
                self.handle_server_shutdown(
                    connect_id,
                    service,
                    flow,
                    plaintext,
                    handler,
                    original_req_id,
                    wait_for_recovery,
                    caller_token,
                    failure,
                )
                .await
            }
            Err(failure) if failure.is_crypto_desync() => {
                warn!("crypto desync on {connect_id}: {failure}");
                self.recovery
                    .spawn_recovery(RecoveryClass::Advanced, connect_id);
                Err(failure)
            }
            Err(failure) if failure.is_chain_rotation_mismatch() => {
                warn!("chain rotation mismatch on {connect_id}: {failure}");
                self.recovery
                    .spawn_recovery(RecoveryClass::ProtocolResync, connect_id);
                Err(failure)
            }
            Err(failure) if failure.is_protocol_state_mismatch() => {
                warn!("protocol state mismatch on {connect_id}: {failure}");
                self.recovery
                    .spawn_recovery(RecoveryClass::FreshEstablishment, connect_id);
                Err(failure)
            }
            Err(failure) => Err(failure),
        }
    }

    /// Server-shutdown branch: register a replay closure that rebuilds the
    /// request from retained plaintext, enter the outage, then either wait
    /// for recovery (delivery happens through the replay) or surface the
    /// failure.
    #[allow(clippy::too_many_arguments)]
    async fn handle_server_shutdown(
        &self, connect_id: ConnectId, service: ServiceType, flow: FlowType, plaintext: Vec<u8>,
        handler: FlowHandler, original_req_id: u32, wait_for_recovery: bool,
        caller_token: CancellationToken, failure: NetworkFailure,
    ) -> Result<(), NetworkFailure> {
        warn!("server shutdown during {service} on {connect_id}: {failure}");

        if let Some(pipeline) = self.weak_self.upgrade() {
            let replay: ReplayFn = Arc::new(move || {
                let pipeline = pipeline.clone();
                let plaintext = plaintext.clone();
                let handler = handler.clone();
                Box::pin(async move {
                    debug!(
                        "rebuilding request {original_req_id} for {connect_id} from retained \
                         plaintext; a fresh request id will be assigned"
                    );
                    let result = pipeline
                        .execute(
                            connect_id,
                            service,
                            flow,
                            plaintext,
                            handler,
                            RequestPolicy {
                                allow_duplicates: true,
                                wait_for_recovery: false,
                                bypass_debounce: true,
                            },
                            CancellationToken::new(),
                        )
                        .await;
                    if let Err(replay_failure) = result {
                        warn!(
                            "replay of request {original_req_id} on {connect_id} failed: \
                             {replay_failure}"
                        );
                    }
                })
            });
            self.pending.register(original_req_id, replay);
        }

        self.recovery.enter_outage(&failure.to_string(), connect_id);

        if wait_for_recovery {
            self.recovery
                .outage()
                .wait_recovered(OUTAGE_WAIT_CEILING, &caller_token, &self.shutdown)
                .await?;
            info!("outage cleared; request {original_req_id} is delivered by its replay");
            Ok(())
        } else {
            Err(failure)
        }
    }

    async fn dispatch_flow(
        &self, channel: &Arc<Channel>, request: ServiceRequest, handler: &FlowHandler,
        token: &CancellationToken,
    ) -> Result<(), NetworkFailure> {
        let connect_id = channel.connect_id();
        let flow = self.transport.invoke(request).await?;
        match flow {
            RpcFlow::SingleCall(response) => match handler {
                FlowHandler::Unary(on_completed) => {
                    let cipher = tokio::select! {
                        _ = token.cancelled() => {
                            return Err(NetworkFailure::DataCenterNotResponding(
                                "operation cancelled".to_string(),
                            ));
                        }
                        result = response => result?,
                    };
                    let plaintext = channel.process_inbound(&cipher).await?;
                    on_completed(plaintext);
                    Ok(())
                }
                FlowHandler::Stream(_) => Err(NetworkFailure::InvalidRequestType(
                    "stream handler got a SingleCall flow".to_string(),
                )),
            },
            RpcFlow::InboundStream(mut stream) => match handler {
                FlowHandler::Stream(on_item) => {
                    loop {
                        let item = tokio::select! {
                            _ = token.cancelled() => {
                                debug!("inbound stream on {connect_id} cancelled");
                                break;
                            }
                            item = stream.next() => item,
                        };
                        let Some(item) = item else {
                            break;
                        };
                        // Per-item errors never kill the stream.
                        match item {
                            Err(item_failure) => {
                                warn!("stream item on {connect_id} failed; skipping: {item_failure}");
                            }
                            Ok(cipher) => match channel.process_inbound(&cipher).await {
                                Ok(plaintext) => on_item(plaintext),
                                Err(decrypt_failure) => warn!(
                                    "stream item on {connect_id} failed to decrypt; skipping: \
                                     {decrypt_failure}"
                                ),
                            },
                        }
                    }
                    Ok(())
                }
                FlowHandler::Unary(_) => Err(NetworkFailure::InvalidRequestType(
                    "unary handler got an InboundStream flow".to_string(),
                )),
            },
            RpcFlow::OutboundSink | RpcFlow::BidirectionalStream => Err(
                NetworkFailure::InvalidRequestType("not implemented".to_string()),
            ),
        }
    }
}

/// Link the caller and per-request tokens under a child of the shutdown
/// token. The forwarder tasks exit when either side fires, or when the
/// composed token is released by its drop guard.
fn compose_tokens<const N: usize>(
    shutdown: &CancellationToken, sources: [CancellationToken; N],
) -> CancellationToken {
    let composed = shutdown.child_token();
    for source in sources {
        let linked = composed.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = source.cancelled() => linked.cancel(),
                _ = linked.cancelled() => {}
            }
        });
    }
    composed
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

struct InFlightGuard {
    registry: Arc<InFlightRegistry>,
    key: String,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.key);
    }
}
