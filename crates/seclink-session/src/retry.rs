use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;
use log::{
    debug,
    warn,
};
use seclink_commons::{
    ConnectId,
    NetworkFailure,
};
use tokio_util::sync::CancellationToken;

use crate::recovery::backoff::backoff_delay;

/// One attempt of a retryable operation. The closure is invoked fresh per
/// attempt so every attempt rebuilds its own state (including ciphertext).
pub type RetryOperation =
    Arc<dyn Fn() -> BoxFuture<'static, Result<(), NetworkFailure>> + Send + Sync>;

/// Bounded-retry capability wrapped around every RPC-bearing operation.
///
/// An operation that burns its whole attempt budget is recorded in the
/// exhaustion ledger; automatic recovery stops while any operation is
/// exhausted and only a manual `force_fresh` clears the ledger.
#[async_trait]
pub trait RetryStrategy: Send + Sync {
    async fn execute(
        &self, op: RetryOperation, op_name: &str, connect_id: ConnectId, max_attempts: u32,
        token: CancellationToken,
    ) -> Result<(), NetworkFailure>;

    /// Like [`execute`](RetryStrategy::execute) but runs even when the
    /// operation is marked exhausted. Used by manual recovery.
    async fn execute_manual(
        &self, op: RetryOperation, op_name: &str, connect_id: ConnectId, max_attempts: u32,
        token: CancellationToken,
    ) -> Result<(), NetworkFailure>;

    fn reset_connection_state(&self);

    fn mark_connection_healthy(&self, connect_id: ConnectId);

    fn has_exhausted_operations(&self) -> bool;

    fn clear_exhausted_operations(&self);
}

/// Production retry strategy: bounded attempts with the shared jittered
/// exponential backoff schedule, a per-operation exhaustion ledger, and
/// cancel-aware sleeps.
#[derive(Default)]
pub struct ExponentialRetryStrategy {
    exhausted: DashMap<String, u32>,
}

impl ExponentialRetryStrategy {
    pub fn new() -> Self {
        Self::default()
    }

    fn ledger_key(connect_id: ConnectId, op_name: &str) -> String {
        format!("{connect_id}:{op_name}")
    }

    async fn run(
        &self, op: RetryOperation, op_name: &str, connect_id: ConnectId, max_attempts: u32,
        token: CancellationToken, bypass_ledger: bool,
    ) -> Result<(), NetworkFailure> {
        let key = Self::ledger_key(connect_id, op_name);
        if !bypass_ledger && self.exhausted.contains_key(&key) {
            return Err(NetworkFailure::DataCenterNotResponding(format!(
                "retries exhausted for {op_name}"
            )));
        }

        let max_attempts = max_attempts.max(1);
        let mut attempt: u32 = 1;
        loop {
            if token.is_cancelled() {
                return Err(NetworkFailure::DataCenterNotResponding(
                    "operation cancelled".to_string(),
                ));
            }

            match op().await {
                Ok(()) => {
                    self.exhausted.remove(&key);
                    return Ok(());
                }
                Err(failure) if !failure.is_retriable() => return Err(failure),
                Err(failure) if attempt >= max_attempts => {
                    warn!(
                        "{op_name} for {connect_id} exhausted after {attempt} attempts: {failure}"
                    );
                    self.exhausted.insert(key, attempt);
                    return Err(failure);
                }
                Err(failure) => {
                    let delay = backoff_delay(attempt);
                    debug!(
                        "{op_name} attempt {attempt}/{max_attempts} for {connect_id} failed \
                         ({failure}); retrying in {delay:?}"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(delay) => {}
                        _ = token.cancelled() => {
                            return Err(NetworkFailure::DataCenterNotResponding(
                                "operation cancelled".to_string(),
                            ));
                        }
                    }
                }
            }
            attempt += 1;
        }
    }
}

#[async_trait]
impl RetryStrategy for ExponentialRetryStrategy {
    async fn execute(
        &self, op: RetryOperation, op_name: &str, connect_id: ConnectId, max_attempts: u32,
        token: CancellationToken,
    ) -> Result<(), NetworkFailure> {
        self.run(op, op_name, connect_id, max_attempts, token, false)
            .await
    }

    async fn execute_manual(
        &self, op: RetryOperation, op_name: &str, connect_id: ConnectId, max_attempts: u32,
        token: CancellationToken,
    ) -> Result<(), NetworkFailure> {
        self.run(op, op_name, connect_id, max_attempts, token, true)
            .await
    }

    fn reset_connection_state(&self) {
        self.exhausted.clear();
    }

    fn mark_connection_healthy(&self, connect_id: ConnectId) {
        let prefix = format!("{connect_id}:");
        self.exhausted.retain(|key, _| !key.starts_with(&prefix));
    }

    fn has_exhausted_operations(&self) -> bool {
        !self.exhausted.is_empty()
    }

    fn clear_exhausted_operations(&self) {
        self.exhausted.clear();
    }
}
