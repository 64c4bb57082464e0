use std::time::{
    SystemTime,
    UNIX_EPOCH,
};

use async_trait::async_trait;
use dashmap::DashMap;
use seclink_commons::NetworkFailure;
use uuid::Uuid;
use zeroize::Zeroize;

/// Encrypted-at-rest storage for channel state. Keys are
/// `connect_id.to_string()`; values are serialized [`ChannelState`] bytes.
///
/// [`ChannelState`]: seclink_commons::ChannelState
#[async_trait]
pub trait SecureStateStorage: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, NetworkFailure>;

    async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), NetworkFailure>;

    async fn delete(&self, key: &str) -> Result<(), NetworkFailure>;
}

/// Application-level secure storage for small auxiliary records, such as the
/// `"{connect_id}_timestamp"` establishment marker.
#[async_trait]
pub trait ApplicationSecureStorage: Send + Sync {
    async fn store(&self, key: &str, bytes: &[u8]) -> Result<(), NetworkFailure>;
}

/// Receives the local identity so outgoing RPC metadata can carry it.
pub trait MetadataProvider: Send + Sync {
    fn set_app_info(&self, app_instance_id: Uuid, device_id: Uuid, culture: &str);
}

/// Current wall-clock time as little-endian milliseconds, the format of the
/// persisted establishment timestamp.
pub fn encoded_timestamp_now() -> [u8; 8] {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0);
    millis.to_le_bytes()
}

/// Map-backed storage used by tests and by hosts without a platform
/// keystore. Deleted values are wiped before the memory is released.
#[derive(Default)]
pub struct InMemorySecureStorage {
    entries: DashMap<String, Vec<u8>>,
}

impl InMemorySecureStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl SecureStateStorage for InMemorySecureStorage {
    async fn load(&self, key: &str) -> Result<Option<Vec<u8>>, NetworkFailure> {
        Ok(self.entries.get(key).map(|entry| entry.value().clone()))
    }

    async fn save(&self, key: &str, bytes: &[u8]) -> Result<(), NetworkFailure> {
        if let Some(mut previous) = self.entries.insert(key.to_string(), bytes.to_vec()) {
            previous.zeroize();
        }
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), NetworkFailure> {
        if let Some((_, mut value)) = self.entries.remove(key) {
            value.zeroize();
        }
        Ok(())
    }
}

#[async_trait]
impl ApplicationSecureStorage for InMemorySecureStorage {
    async fn store(&self, key: &str, bytes: &[u8]) -> Result<(), NetworkFailure> {
        SecureStateStorage::save(self, key, bytes).await
    }
}

/// Metadata sink for hosts that do not attach identity metadata to RPCs.
pub struct NullMetadataProvider;

impl MetadataProvider for NullMetadataProvider {
    fn set_app_info(&self, _app_instance_id: Uuid, _device_id: Uuid, _culture: &str) {}
}
