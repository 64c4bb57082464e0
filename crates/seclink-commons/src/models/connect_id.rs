use std::fmt;

use serde::{
    Deserialize,
    Serialize,
};
use sha2::{
    Digest,
    Sha256,
};
use uuid::Uuid;

use crate::models::service::ServiceType;

/// Smallest value a derived 32-bit identifier may take. Values below this
/// are reserved for fixed protocol identifiers.
pub const DERIVED_ID_FLOOR: u32 = 10;

/// Kind of key exchange a channel was created for. Part of the
/// [`ConnectId`] derivation input, so the same device pair gets distinct
/// channel identifiers per exchange kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExchangeType {
    DataCenterEphemeral,
    ServerStreaming,
}

impl ExchangeType {
    pub const fn tag(&self) -> &'static str {
        match self {
            ExchangeType::DataCenterEphemeral => "data_center_ephemeral",
            ExchangeType::ServerStreaming => "server_streaming",
        }
    }
}

/// Stable 32-bit channel identifier, derived deterministically from the
/// application instance, the device and the exchange type. Canonical key for
/// every channel-scoped structure, including the persisted state entry
/// (`connect_id.to_string()`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectId(u32);

impl ConnectId {
    /// Derive the identifier from canonical hyphenated GUID text plus the
    /// exchange tag, hashed into the 32-bit space.
    pub fn derive(app_instance_id: Uuid, device_id: Uuid, exchange: ExchangeType) -> Self {
        let canonical = format!(
            "{}:{}:{}",
            app_instance_id.hyphenated(),
            device_id.hyphenated(),
            exchange.tag()
        );
        let digest = Sha256::digest(canonical.as_bytes());
        ConnectId(u32::from_be_bytes([
            digest[0], digest[1], digest[2], digest[3],
        ]))
    }

    pub const fn from_raw(raw: u32) -> Self {
        ConnectId(raw)
    }

    pub const fn raw(&self) -> u32 {
        self.0
    }

    /// Key under which the serialized channel state is persisted.
    pub fn state_key(&self) -> String {
        self.0.to_string()
    }

    /// Key under which the establishment timestamp is persisted.
    pub fn timestamp_key(&self) -> String {
        format!("{}_timestamp", self.0)
    }
}

impl fmt::Display for ConnectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of the local application installation a channel belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppInstance {
    pub app_instance_id: Uuid,
    pub device_id: Uuid,
    pub culture: String,
}

impl AppInstance {
    pub fn new(app_instance_id: Uuid, device_id: Uuid, culture: impl Into<String>) -> Self {
        Self {
            app_instance_id,
            device_id,
            culture: culture.into(),
        }
    }

    pub fn connect_id(&self, exchange: ExchangeType) -> ConnectId {
        ConnectId::derive(self.app_instance_id, self.device_id, exchange)
    }
}

/// Derived 32-bit value used for single-flight gating of semantically
/// equivalent operations. Authentication operations share one identifier per
/// service regardless of payload, so the two steps of an auth exchange never
/// race against the same ratchet slot. All other services mix in a content
/// hash of the plaintext.
///
/// The result always lands in `[DERIVED_ID_FLOOR, u32::MAX - DERIVED_ID_FLOOR)`.
pub fn logical_operation_id(
    service: ServiceType, connect_id: ConnectId, plaintext: &[u8],
) -> u32 {
    let semantic = if service.is_auth_operation() {
        format!("semantic:{}:{}", service.wire_name(), connect_id)
    } else {
        format!(
            "semantic:{}:{}:{}",
            service.wire_name(),
            connect_id,
            hex::encode(Sha256::digest(plaintext))
        )
    };
    let digest = Sha256::digest(semantic.as_bytes());
    let raw = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    (raw % (u32::MAX - DERIVED_ID_FLOOR)).max(DERIVED_ID_FLOOR)
}
