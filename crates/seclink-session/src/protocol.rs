use std::sync::Arc;

use seclink_commons::{
    ChannelState,
    ConnectId,
    NetworkFailure,
};

/// Number of one-time prekeys a freshly initiated protocol instance is
/// provisioned with.
pub const DEFAULT_ONE_TIME_PREKEYS: u32 = 5;

/// One encrypted outbound frame. `req_id` identifies the ratchet slot the
/// frame was built against; a frame is only valid until the ratchet advances
/// past that slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipherEnvelope {
    pub req_id: u32,
    pub cipher: Vec<u8>,
}

/// Opaque Double-Ratchet–style capability. One instance per channel; the
/// session manager owns it exclusively and serializes access through the
/// channel lock.
///
/// Every successful `produce_outbound` or `process_inbound` advances the
/// ratchet and invalidates ciphertext built against earlier slots, which is
/// why recovery replays always rebuild from plaintext.
pub trait ProtocolSystem: Send {
    fn produce_outbound(&mut self, plaintext: &[u8]) -> Result<CipherEnvelope, NetworkFailure>;

    fn process_inbound(&mut self, cipher: &[u8]) -> Result<Vec<u8>, NetworkFailure>;

    /// Start a fresh key exchange; returns the local handshake message to
    /// send to the peer.
    fn begin_handshake(&mut self) -> Result<Vec<u8>, NetworkFailure>;

    /// Finish the exchange with the peer's handshake message.
    fn complete_handshake(&mut self, peer_message: &[u8]) -> Result<(), NetworkFailure>;

    /// Fast-forward both chains to the lengths the peer reported when a
    /// persisted session was resumed.
    fn sync_with_remote(&mut self, send_len: u64, recv_len: u64) -> Result<(), NetworkFailure>;

    /// Snapshot the full state for persistence.
    fn to_state(&self) -> Result<ChannelState, NetworkFailure>;

    /// Destroy all key material. Must be safe to call more than once.
    fn wipe(&mut self);
}

/// Narrow hooks the protocol calls after state transitions. The session
/// manager implements these to re-persist channel state; implementations
/// must not block.
pub trait ProtocolEventHandler: Send + Sync {
    fn on_dh_ratchet_performed(&self, connect_id: ConnectId, is_sending: bool, new_index: u64);

    fn on_chain_synchronized(&self, connect_id: ConnectId, local_len: u64, remote_len: u64);

    fn on_message_processed(&self, connect_id: ConnectId, has_skipped_keys: bool);
}

/// Constructor capability for protocol instances.
pub trait ProtocolSystemFactory: Send + Sync {
    fn create(
        &self, connect_id: ConnectId, one_time_prekeys: u32,
        events: Arc<dyn ProtocolEventHandler>,
    ) -> Result<Box<dyn ProtocolSystem>, NetworkFailure>;

    fn from_state(
        &self, state: &ChannelState, events: Arc<dyn ProtocolEventHandler>,
    ) -> Result<Box<dyn ProtocolSystem>, NetworkFailure>;
}
