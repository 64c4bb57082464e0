use std::time::Duration;

use dashmap::DashMap;
use seclink_commons::{
    ConnectId,
    ServiceType,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Minimum spacing between successive non-waiting attempts of the same
/// `(connect_id, service)` pair.
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(500);

/// How many hex characters of the plaintext fingerprint go into a request
/// key.
const FINGERPRINT_LEN: usize = 16;

/// Key identifying one in-flight request. Authentication steps collapse to
/// a fixed key per service so retries of the same auth step are always
/// deduplicated; everything else is fingerprinted by payload.
pub fn request_key(connect_id: ConnectId, service: ServiceType, plaintext: &[u8]) -> String {
    if service.is_auth_operation() {
        return format!("{connect_id}_{service}_auth_operation");
    }
    let fingerprint = hex::encode(plaintext);
    let fingerprint = &fingerprint[..fingerprint.len().min(FINGERPRINT_LEN)];
    format!("{connect_id}_{service}_{fingerprint}")
}

/// Registry of in-flight requests: one cancellation token per request key.
/// Entering an outage cancels every token; completing a request removes its
/// entry.
#[derive(Default)]
pub struct InFlightRegistry {
    entries: DashMap<String, CancellationToken>,
}

impl InFlightRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a fresh token for `key`, or `None` when the key is already in
    /// flight.
    pub fn try_insert(&self, key: &str) -> Option<CancellationToken> {
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => None,
            dashmap::mapref::entry::Entry::Vacant(vacant) => {
                let token = CancellationToken::new();
                vacant.insert(token.clone());
                Some(token)
            }
        }
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }

    pub fn cancel_all(&self) {
        for entry in self.entries.iter() {
            entry.value().cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-`(connect_id, service)` last-attempt ledger backing the debounce
/// phase. The window is exclusive of the first attempt: an attempt exactly
/// one window after the last accepted one passes. Rejected attempts do not
/// refresh the timestamp.
#[derive(Default)]
pub struct DebounceLedger {
    last_attempts: DashMap<String, Instant>,
}

impl DebounceLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(connect_id: ConnectId, service: ServiceType) -> String {
        format!("{connect_id}_{service}")
    }

    /// True when the attempt is allowed; records the attempt time only then.
    pub fn check(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.last_attempts.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occupied) => {
                if now.duration_since(*occupied.get()) < DEBOUNCE_WINDOW {
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
}
