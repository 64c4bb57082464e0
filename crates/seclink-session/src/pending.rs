use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use async_trait::async_trait;
use futures::future::BoxFuture;
use log::{
    debug,
    info,
};
use tokio::sync::Mutex;

/// Replay closure for one pending request. Captures the original plaintext
/// and completion callback, never ciphertext, so the ratchet may advance
/// freely between registration and replay.
pub type ReplayFn = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Store of requests interrupted by a server shutdown, drained after
/// recovery.
#[async_trait]
pub trait PendingRequestStore: Send + Sync {
    fn register(&self, request_id: u32, replay: ReplayFn);

    /// Re-execute every registered request. Replays run serially; a replay
    /// that fails against a still-degraded server re-registers itself
    /// through the pipeline.
    async fn retry_all(&self);

    fn pending_count(&self) -> usize;
}

#[derive(Default)]
pub struct InMemoryPendingStore {
    entries: StdMutex<Vec<(u32, ReplayFn)>>,
    replay_gate: Mutex<()>,
}

impl InMemoryPendingStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PendingRequestStore for InMemoryPendingStore {
    fn register(&self, request_id: u32, replay: ReplayFn) {
        debug!("registering pending request {request_id}");
        self.entries
            .lock()
            .expect("pending store lock poisoned")
            .push((request_id, replay));
    }

    async fn retry_all(&self) {
        let _gate = self.replay_gate.lock().await;
        let drained: Vec<(u32, ReplayFn)> = {
            let mut entries = self.entries.lock().expect("pending store lock poisoned");
            std::mem::take(&mut *entries)
        };
        if drained.is_empty() {
            return;
        }

        info!("replaying {} pending request(s)", drained.len());
        for (request_id, replay) in drained {
            debug!("replaying pending request {request_id}");
            replay().await;
        }
    }

    fn pending_count(&self) -> usize {
        self.entries
            .lock()
            .expect("pending store lock poisoned")
            .len()
    }
}
