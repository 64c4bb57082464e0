use std::sync::atomic::{
    AtomicU8,
    Ordering,
};
use std::sync::Mutex as StdMutex;
use std::time::Duration;

use seclink_commons::NetworkFailure;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

const OUTAGE_CLEAR: u8 = 0;
const OUTAGE_ACTIVE: u8 = 1;

/// Process-wide outage flag plus the one-shot recovered signal all waiters
/// subscribe to. A fresh signal is allocated on every outage entry so
/// waiters from an earlier outage can never observe a later recovery.
pub struct OutageState {
    flag: AtomicU8,
    signal: StdMutex<Option<broadcast::Sender<()>>>,
}

impl OutageState {
    pub fn new() -> Self {
        Self {
            flag: AtomicU8::new(OUTAGE_CLEAR),
            signal: StdMutex::new(None),
        }
    }

    pub fn is_active(&self) -> bool {
        self.flag.load(Ordering::SeqCst) == OUTAGE_ACTIVE
    }

    /// Returns true for the caller that actually flipped the flag.
    pub(crate) fn try_enter(&self) -> bool {
        if self
            .flag
            .compare_exchange(OUTAGE_CLEAR, OUTAGE_ACTIVE, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        let (sender, _) = broadcast::channel(8);
        *self.signal.lock().expect("outage signal lock poisoned") = Some(sender);
        true
    }

    /// Returns true for the caller that actually cleared the flag. The
    /// recovered signal fires before the sender is released.
    pub(crate) fn exit(&self) -> bool {
        if self
            .flag
            .compare_exchange(OUTAGE_ACTIVE, OUTAGE_CLEAR, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        if let Some(sender) = self.signal.lock().expect("outage signal lock poisoned").take() {
            let _ = sender.send(());
        }
        true
    }

    fn subscribe_recovered(&self) -> Option<broadcast::Receiver<()>> {
        self.signal
            .lock()
            .expect("outage signal lock poisoned")
            .as_ref()
            .map(|sender| sender.subscribe())
    }

    /// Block until the current outage clears. Honors a hard ceiling, the
    /// process shutdown token and the caller token; the three exits are
    /// distinguishable by variant and message.
    pub async fn wait_recovered(
        &self, ceiling: Duration, caller: &CancellationToken, shutdown: &CancellationToken,
    ) -> Result<(), NetworkFailure> {
        // Subscribe first so an exit between the flag check and the wait is
        // never missed.
        let Some(mut recovered) = self.subscribe_recovered() else {
            return Ok(());
        };
        if !self.is_active() {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(ceiling) => Err(NetworkFailure::ObjectDisposed(
                "timed out waiting for recovery".to_string(),
            )),
            _ = shutdown.cancelled() => Err(NetworkFailure::ObjectDisposed(
                "shutdown during outage wait".to_string(),
            )),
            _ = caller.cancelled() => Err(NetworkFailure::DataCenterNotResponding(
                "cancelled during outage wait".to_string(),
            )),
            // Both a delivered signal and a dropped sender mean the outage
            // owner has moved on; either way the wait is over.
            _ = recovered.recv() => Ok(()),
        }
    }
}

impl Default for OutageState {
    fn default() -> Self {
        Self::new()
    }
}
