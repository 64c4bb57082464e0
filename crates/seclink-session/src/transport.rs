use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use seclink_commons::{
    ConnectId,
    NetworkFailure,
    ServiceRequest,
};

/// Exchange shape returned by the transport for an invoked request. The
/// pipeline pattern-matches on the variant it expects and rejects everything
/// else explicitly; the outbound and bidirectional variants are reserved.
pub enum RpcFlow {
    SingleCall(BoxFuture<'static, Result<Vec<u8>, NetworkFailure>>),
    InboundStream(BoxStream<'static, Result<Vec<u8>, NetworkFailure>>),
    OutboundSink,
    BidirectionalStream,
}

impl RpcFlow {
    pub fn variant_name(&self) -> &'static str {
        match self {
            RpcFlow::SingleCall(_) => "SingleCall",
            RpcFlow::InboundStream(_) => "InboundStream",
            RpcFlow::OutboundSink => "OutboundSink",
            RpcFlow::BidirectionalStream => "BidirectionalStream",
        }
    }
}

impl std::fmt::Debug for RpcFlow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.variant_name())
    }
}

/// Server answer to a session-restore request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// The peer still holds the session; both chain lengths are reported so
    /// the local ratchet can fast-forward.
    SessionResumed { send_len: u64, recv_len: u64 },
    /// Any other server status. The caller falls back to a fresh
    /// establishment.
    Declined { status: String },
}

/// RPC substrate the session stack runs over. Implementations are expected
/// to be unreliable; classification of their failures drives the recovery
/// controller.
#[async_trait]
pub trait RpcTransport: Send + Sync {
    async fn invoke(&self, request: ServiceRequest) -> Result<RpcFlow, NetworkFailure>;

    /// Run the handshake round of a fresh key exchange; returns the peer
    /// handshake message.
    async fn establish(
        &self, connect_id: ConnectId, handshake: Vec<u8>,
    ) -> Result<Vec<u8>, NetworkFailure>;

    /// Ask the peer to resume a previously established session.
    async fn restore(&self, connect_id: ConnectId) -> Result<RestoreOutcome, NetworkFailure>;
}
