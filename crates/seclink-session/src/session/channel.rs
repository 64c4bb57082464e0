use std::sync::atomic::{
    AtomicBool,
    Ordering,
};
use std::sync::Mutex as StdMutex;

use log::debug;
use seclink_commons::{
    ChannelState,
    ConnectId,
    NetworkFailure,
};
use tokio::sync::Mutex;

use crate::protocol::{
    CipherEnvelope,
    ProtocolSystem,
};

/// Where a channel is in its life. Disposed is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLifecycle {
    Initiated,
    Established,
    Healthy,
    Recovering,
    Outage,
    Disposed,
}

/// A live secure session with one peer. Owns exactly one protocol instance;
/// every cryptographic operation goes through the internal lock so ratchet
/// steps never interleave.
pub struct Channel {
    connect_id: ConnectId,
    protocol: Mutex<Box<dyn ProtocolSystem>>,
    lifecycle: StdMutex<ChannelLifecycle>,
    disposed: AtomicBool,
}

impl Channel {
    pub fn new(connect_id: ConnectId, protocol: Box<dyn ProtocolSystem>) -> Self {
        Self {
            connect_id,
            protocol: Mutex::new(protocol),
            lifecycle: StdMutex::new(ChannelLifecycle::Initiated),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn connect_id(&self) -> ConnectId {
        self.connect_id
    }

    pub fn lifecycle(&self) -> ChannelLifecycle {
        *self.lifecycle.lock().expect("channel lifecycle lock poisoned")
    }

    /// Lifecycle transitions are ignored once the channel is disposed.
    pub fn set_lifecycle(&self, next: ChannelLifecycle) {
        let mut current = self.lifecycle.lock().expect("channel lifecycle lock poisoned");
        if *current == ChannelLifecycle::Disposed {
            return;
        }
        *current = next;
    }

    fn ensure_live(&self) -> Result<(), NetworkFailure> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(NetworkFailure::ObjectDisposed(format!(
                "channel {} is disposed",
                self.connect_id
            )));
        }
        Ok(())
    }

    pub async fn produce_outbound(&self, plaintext: &[u8]) -> Result<CipherEnvelope, NetworkFailure> {
        self.ensure_live()?;
        self.protocol.lock().await.produce_outbound(plaintext)
    }

    pub async fn process_inbound(&self, cipher: &[u8]) -> Result<Vec<u8>, NetworkFailure> {
        self.ensure_live()?;
        self.protocol.lock().await.process_inbound(cipher)
    }

    pub async fn begin_handshake(&self) -> Result<Vec<u8>, NetworkFailure> {
        self.ensure_live()?;
        self.protocol.lock().await.begin_handshake()
    }

    pub async fn complete_handshake(&self, peer_message: &[u8]) -> Result<(), NetworkFailure> {
        self.ensure_live()?;
        self.protocol.lock().await.complete_handshake(peer_message)
    }

    pub async fn sync_with_remote(&self, send_len: u64, recv_len: u64) -> Result<(), NetworkFailure> {
        self.ensure_live()?;
        self.protocol.lock().await.sync_with_remote(send_len, recv_len)
    }

    pub async fn snapshot_state(&self) -> Result<ChannelState, NetworkFailure> {
        self.ensure_live()?;
        self.protocol.lock().await.to_state()
    }

    /// Wipe key material and mark the channel disposed. Idempotent; later
    /// cryptographic calls fail with `ObjectDisposed`.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.protocol.lock().await.wipe();
        self.set_lifecycle_disposed();
        debug!("channel {} disposed", self.connect_id);
    }

    fn set_lifecycle_disposed(&self) {
        let mut current = self.lifecycle.lock().expect("channel lifecycle lock poisoned");
        *current = ChannelLifecycle::Disposed;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }
}
