use serde::{
    Deserialize,
    Serialize,
};

use crate::models::connect_id::ConnectId;

/// Serialized form of a live channel: identity-keys state, ratchet state and
/// the peer handshake message. Rewritten after every DH ratchet and every
/// chain synchronization, always under the key `connect_id.to_string()`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    pub connect_id: ConnectId,
    pub identity_keys: Vec<u8>,
    pub ratchet: Vec<u8>,
    pub peer_handshake: Vec<u8>,
}

impl ChannelState {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
