//! Shared fakes for the capability traits, used across the crate's tests.

use std::collections::VecDeque;
use std::sync::atomic::{
    AtomicUsize,
    Ordering,
};
use std::sync::{
    Arc,
    Mutex as StdMutex,
};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use seclink_commons::{
    AppInstance,
    ChannelState,
    ConnectId,
    FlowType,
    NetworkFailure,
    ServiceRequest,
};
use uuid::Uuid;
use zeroize::Zeroize;

use crate::pending::InMemoryPendingStore;
use crate::pipeline::CompletionHandler;
use crate::protocol::{
    CipherEnvelope,
    ProtocolEventHandler,
    ProtocolSystem,
    ProtocolSystemFactory,
};
use crate::retry::ExponentialRetryStrategy;
use crate::runtime::SessionRuntime;
use crate::storage::{
    InMemorySecureStorage,
    NullMetadataProvider,
};
use crate::transport::{
    RestoreOutcome,
    RpcFlow,
    RpcTransport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ErrKind {
    Shutdown,
    Desync,
    Rotation,
    StateMismatch,
    Timeout,
    NotResponding,
}

pub(crate) fn make_err(kind: ErrKind) -> NetworkFailure {
    match kind {
        ErrKind::Shutdown => NetworkFailure::ServerShutdown("server draining".to_string()),
        ErrKind::Desync => NetworkFailure::CryptoDesync("mac mismatch".to_string()),
        ErrKind::Rotation => {
            NetworkFailure::ChainRotationMismatch("unexpected epoch".to_string())
        }
        ErrKind::StateMismatch => {
            NetworkFailure::ProtocolStateMismatch("irreconcilable".to_string())
        }
        ErrKind::Timeout => NetworkFailure::Timeout("rpc".to_string()),
        ErrKind::NotResponding => {
            NetworkFailure::DataCenterNotResponding("no route".to_string())
        }
    }
}

/// Deterministic counter-based stand-in for the Double-Ratchet capability.
/// Outbound frames are `enc:<send_count><plaintext>`; inbound frames must
/// carry the `resp:` prefix and decrypt to whatever follows it.
pub(crate) struct FakeProtocol {
    connect_id: ConnectId,
    send_count: u64,
    recv_count: u64,
    peer_handshake: Vec<u8>,
    events: Arc<dyn ProtocolEventHandler>,
}

impl FakeProtocol {
    fn new(connect_id: ConnectId, events: Arc<dyn ProtocolEventHandler>) -> Self {
        Self {
            connect_id,
            send_count: 0,
            recv_count: 0,
            peer_handshake: Vec::new(),
            events,
        }
    }
}

impl ProtocolSystem for FakeProtocol {
    fn produce_outbound(&mut self, plaintext: &[u8]) -> Result<CipherEnvelope, NetworkFailure> {
        self.send_count += 1;
        let mut cipher = b"enc:".to_vec();
        cipher.extend_from_slice(&self.send_count.to_le_bytes());
        cipher.extend_from_slice(plaintext);
        self.events
            .on_dh_ratchet_performed(self.connect_id, true, self.send_count);
        Ok(CipherEnvelope {
            req_id: self.send_count as u32,
            cipher,
        })
    }

    fn process_inbound(&mut self, cipher: &[u8]) -> Result<Vec<u8>, NetworkFailure> {
        let Some(payload) = cipher.strip_prefix(b"resp:") else {
            return Err(NetworkFailure::CryptoDesync(
                "unrecognized frame".to_string(),
            ));
        };
        self.recv_count += 1;
        self.events.on_message_processed(self.connect_id, false);
        Ok(payload.to_vec())
    }

    fn begin_handshake(&mut self) -> Result<Vec<u8>, NetworkFailure> {
        Ok(format!("hs-{}", self.connect_id).into_bytes())
    }

    fn complete_handshake(&mut self, peer_message: &[u8]) -> Result<(), NetworkFailure> {
        self.peer_handshake = peer_message.to_vec();
        Ok(())
    }

    fn sync_with_remote(&mut self, send_len: u64, recv_len: u64) -> Result<(), NetworkFailure> {
        self.send_count = send_len;
        self.recv_count = recv_len;
        self.events
            .on_chain_synchronized(self.connect_id, send_len, recv_len);
        Ok(())
    }

    fn to_state(&self) -> Result<ChannelState, NetworkFailure> {
        let mut ratchet = self.send_count.to_le_bytes().to_vec();
        ratchet.extend_from_slice(&self.recv_count.to_le_bytes());
        Ok(ChannelState {
            connect_id: self.connect_id,
            identity_keys: b"identity-keys".to_vec(),
            ratchet,
            peer_handshake: self.peer_handshake.clone(),
        })
    }

    fn wipe(&mut self) {
        self.peer_handshake.zeroize();
        self.peer_handshake.clear();
        self.send_count = 0;
        self.recv_count = 0;
    }
}

#[derive(Default)]
pub(crate) struct FakeProtocolFactory {
    pub(crate) created: AtomicUsize,
    pub(crate) restored: AtomicUsize,
}

impl FakeProtocolFactory {
    pub(crate) fn new() -> Self {
        Self::default()
    }
}

impl ProtocolSystemFactory for FakeProtocolFactory {
    fn create(
        &self, connect_id: ConnectId, _one_time_prekeys: u32,
        events: Arc<dyn ProtocolEventHandler>,
    ) -> Result<Box<dyn ProtocolSystem>, NetworkFailure> {
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeProtocol::new(connect_id, events)))
    }

    fn from_state(
        &self, state: &ChannelState, events: Arc<dyn ProtocolEventHandler>,
    ) -> Result<Box<dyn ProtocolSystem>, NetworkFailure> {
        if state.ratchet.len() != 16 {
            return Err(NetworkFailure::ProtocolStateMismatch(
                "corrupt ratchet state".to_string(),
            ));
        }
        self.restored.fetch_add(1, Ordering::SeqCst);
        let mut protocol = FakeProtocol::new(state.connect_id, events);
        protocol.send_count = u64::from_le_bytes(state.ratchet[..8].try_into().unwrap());
        protocol.recv_count = u64::from_le_bytes(state.ratchet[8..].try_into().unwrap());
        protocol.peer_handshake = state.peer_handshake.clone();
        Ok(Box::new(protocol))
    }
}

/// Scripted transport behavior for one `invoke` call. With an empty script
/// the transport answers `resp:ok` to unary calls and an empty stream to
/// stream calls.
pub(crate) enum InvokeScript {
    Unary(Vec<u8>),
    UnaryDelayed(Duration, Vec<u8>),
    Stream(Vec<Result<Vec<u8>, ErrKind>>),
    InvokeErr(ErrKind),
    ResponseErr(ErrKind),
    WrongFlow,
}

#[derive(Default)]
pub(crate) struct FakeTransport {
    pub(crate) invokes: AtomicUsize,
    pub(crate) establishes: AtomicUsize,
    pub(crate) restores: AtomicUsize,
    pub(crate) max_concurrent_restores: AtomicUsize,
    active_restores: AtomicUsize,
    invoke_script: StdMutex<VecDeque<InvokeScript>>,
    establish_script: StdMutex<VecDeque<Result<Vec<u8>, ErrKind>>>,
    restore_script: StdMutex<VecDeque<Result<RestoreOutcome, ErrKind>>>,
    pub(crate) seen_requests: StdMutex<Vec<ServiceRequest>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn script_invoke(&self, script: InvokeScript) {
        self.invoke_script
            .lock()
            .unwrap()
            .push_back(script);
    }

    pub(crate) fn script_establish(&self, result: Result<Vec<u8>, ErrKind>) {
        self.establish_script.lock().unwrap().push_back(result);
    }

    pub(crate) fn script_restore(&self, result: Result<RestoreOutcome, ErrKind>) {
        self.restore_script.lock().unwrap().push_back(result);
    }

    pub(crate) fn seen_req_ids(&self) -> Vec<u32> {
        self.seen_requests
            .lock()
            .unwrap()
            .iter()
            .map(|request| request.req_id)
            .collect()
    }
}

#[async_trait]
impl RpcTransport for FakeTransport {
    async fn invoke(&self, request: ServiceRequest) -> Result<RpcFlow, NetworkFailure> {
        self.invokes.fetch_add(1, Ordering::SeqCst);
        let flow_type = request.flow_type;
        self.seen_requests.lock().unwrap().push(request);

        let script = self.invoke_script.lock().unwrap().pop_front();
        match script {
            None => match flow_type {
                FlowType::SingleCall => Ok(RpcFlow::SingleCall(Box::pin(async {
                    Ok(b"resp:ok".to_vec())
                }))),
                FlowType::ReceiveStream => Ok(RpcFlow::InboundStream(Box::pin(stream::iter(
                    Vec::<Result<Vec<u8>, NetworkFailure>>::new(),
                )))),
                FlowType::SendStream => Ok(RpcFlow::OutboundSink),
                FlowType::BidirectionalStream => Ok(RpcFlow::BidirectionalStream),
            },
            Some(InvokeScript::Unary(payload)) => {
                Ok(RpcFlow::SingleCall(Box::pin(async move { Ok(payload) })))
            }
            Some(InvokeScript::UnaryDelayed(delay, payload)) => {
                Ok(RpcFlow::SingleCall(Box::pin(async move {
                    tokio::time::sleep(delay).await;
                    Ok(payload)
                })))
            }
            Some(InvokeScript::Stream(items)) => {
                let items: Vec<Result<Vec<u8>, NetworkFailure>> = items
                    .into_iter()
                    .map(|item| item.map_err(make_err))
                    .collect();
                Ok(RpcFlow::InboundStream(Box::pin(stream::iter(items))))
            }
            Some(InvokeScript::InvokeErr(kind)) => Err(make_err(kind)),
            Some(InvokeScript::ResponseErr(kind)) => {
                Ok(RpcFlow::SingleCall(Box::pin(async move {
                    Err(make_err(kind))
                })))
            }
            Some(InvokeScript::WrongFlow) => Ok(RpcFlow::OutboundSink),
        }
    }

    async fn establish(
        &self, _connect_id: ConnectId, _handshake: Vec<u8>,
    ) -> Result<Vec<u8>, NetworkFailure> {
        self.establishes.fetch_add(1, Ordering::SeqCst);
        let scripted = self.establish_script.lock().unwrap().pop_front();
        match scripted {
            None => Ok(b"peer-handshake".to_vec()),
            Some(Ok(peer)) => Ok(peer),
            Some(Err(kind)) => Err(make_err(kind)),
        }
    }

    async fn restore(&self, _connect_id: ConnectId) -> Result<RestoreOutcome, NetworkFailure> {
        self.restores.fetch_add(1, Ordering::SeqCst);
        let active = self.active_restores.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_concurrent_restores
            .fetch_max(active, Ordering::SeqCst);
        // Widen the race window so overlapping callers would be visible.
        tokio::time::sleep(Duration::from_millis(10)).await;
        self.active_restores.fetch_sub(1, Ordering::SeqCst);

        let scripted = self.restore_script.lock().unwrap().pop_front();
        match scripted {
            None => Ok(RestoreOutcome::SessionResumed {
                send_len: 1,
                recv_len: 1,
            }),
            Some(Ok(outcome)) => Ok(outcome),
            Some(Err(kind)) => Err(make_err(kind)),
        }
    }
}

pub(crate) struct TestStack {
    pub(crate) runtime: SessionRuntime,
    pub(crate) transport: Arc<FakeTransport>,
    pub(crate) factory: Arc<FakeProtocolFactory>,
    pub(crate) storage: Arc<InMemorySecureStorage>,
    pub(crate) retry: Arc<ExponentialRetryStrategy>,
    pub(crate) pending: Arc<InMemoryPendingStore>,
}

pub(crate) fn build_stack() -> TestStack {
    let transport = Arc::new(FakeTransport::new());
    let factory = Arc::new(FakeProtocolFactory::new());
    let storage = Arc::new(InMemorySecureStorage::new());
    let retry = Arc::new(ExponentialRetryStrategy::new());
    let pending = Arc::new(InMemoryPendingStore::new());
    let runtime = SessionRuntime::new(
        factory.clone(),
        transport.clone(),
        retry.clone(),
        storage.clone(),
        storage.clone(),
        Arc::new(NullMetadataProvider),
        pending.clone(),
    );
    TestStack {
        runtime,
        transport,
        factory,
        storage,
        retry,
        pending,
    }
}

pub(crate) fn test_instance() -> AppInstance {
    AppInstance::new(Uuid::from_u128(0x11), Uuid::from_u128(0x22), "en-US")
}

pub(crate) async fn establish_channel(stack: &TestStack, raw: u32) -> ConnectId {
    let connect_id = ConnectId::from_raw(raw);
    stack
        .runtime
        .session()
        .initiate(test_instance(), connect_id)
        .await
        .expect("initiate");
    stack
        .runtime
        .session()
        .establish(connect_id)
        .await
        .expect("establish");
    connect_id
}

pub(crate) fn collector() -> (CompletionHandler, Arc<StdMutex<Vec<Vec<u8>>>>) {
    let collected: Arc<StdMutex<Vec<Vec<u8>>>> = Arc::new(StdMutex::new(Vec::new()));
    let sink = collected.clone();
    let handler: CompletionHandler = Arc::new(move |payload| {
        sink.lock().unwrap().push(payload);
    });
    (handler, collected)
}

/// Run the paused-clock scheduler until `predicate` holds or the budget of
/// virtual time runs out.
pub(crate) async fn settle_until(mut predicate: impl FnMut() -> bool) {
    for _ in 0..512 {
        if predicate() {
            return;
        }
        tokio::time::advance(Duration::from_millis(25)).await;
        tokio::task::yield_now().await;
    }
}

/// Event-handler stub for tests that drive a protocol instance directly.
pub(crate) struct NoopHooks;

impl ProtocolEventHandler for NoopHooks {
    fn on_dh_ratchet_performed(&self, _connect_id: ConnectId, _is_sending: bool, _new_index: u64) {}

    fn on_chain_synchronized(&self, _connect_id: ConnectId, _local_len: u64, _remote_len: u64) {}

    fn on_message_processed(&self, _connect_id: ConnectId, _has_skipped_keys: bool) {}
}
