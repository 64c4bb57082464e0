use std::io;

use thiserror::Error;

/// Failure classes surfaced by every fallible operation in the session
/// stack. The pipeline and the recovery controller dispatch on these
/// variants, so classification happens at construction time rather than by
/// string matching downstream.
#[derive(Debug, Error)]
pub enum NetworkFailure {
    #[error("Data center not responding: {0}")]
    DataCenterNotResponding(String),

    #[error("Invalid request type: {0}")]
    InvalidRequestType(String),

    #[error("Server shutting down: {0}")]
    ServerShutdown(String),

    #[error("Cryptographic state desynchronized: {0}")]
    CryptoDesync(String),

    #[error("Ratchet chain rotation mismatch: {0}")]
    ChainRotationMismatch(String),

    #[error("Irreconcilable protocol state: {0}")]
    ProtocolStateMismatch(String),

    #[error("Object disposed: {0}")]
    ObjectDisposed(String),

    #[error("Secure storage error: {0}")]
    Storage(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Unexpected error: {0}")]
    Other(#[from] anyhow::Error),
}

impl NetworkFailure {
    /// Transport-level unavailability or an explicit shutdown signal from
    /// the peer. Triggers outage entry and pending-request registration.
    pub fn is_server_shutdown(&self) -> bool {
        matches!(self, NetworkFailure::ServerShutdown(_))
    }

    /// MAC/nonce/counter mismatch indicating ratchet state drift. Triggers
    /// throttled advanced recovery.
    pub fn is_crypto_desync(&self) -> bool {
        matches!(self, NetworkFailure::CryptoDesync(_))
    }

    /// Peer reported an unexpected ratchet epoch. Triggers throttled
    /// protocol resync.
    pub fn is_chain_rotation_mismatch(&self) -> bool {
        matches!(self, NetworkFailure::ChainRotationMismatch(_))
    }

    /// Irreconcilable state. Triggers fresh protocol establishment.
    pub fn is_protocol_state_mismatch(&self) -> bool {
        matches!(self, NetworkFailure::ProtocolStateMismatch(_))
    }

    /// Whether the standard retry strategy should re-attempt the operation.
    /// Classes with a dedicated recovery path and caller errors are final.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            NetworkFailure::DataCenterNotResponding(_)
                | NetworkFailure::Protocol(_)
                | NetworkFailure::Timeout(_)
                | NetworkFailure::Io(_)
                | NetworkFailure::Other(_)
        )
    }

    /// Wrapper for unclassified pipeline failures.
    pub fn unexpected(context: &str, detail: impl std::fmt::Display) -> Self {
        NetworkFailure::DataCenterNotResponding(format!("unexpected {context}: {detail}"))
    }
}
