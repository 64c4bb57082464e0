pub mod pending;
pub mod pipeline;
pub mod protocol;
pub mod recovery;
pub mod retry;
pub mod runtime;
pub mod session;
pub mod storage;
pub mod transport;

#[cfg(test)]
pub(crate) mod testkit;
#[cfg(test)]
mod tests;

pub use pending::{
    InMemoryPendingStore,
    PendingRequestStore,
    ReplayFn,
};
pub use pipeline::{
    CompletionHandler,
    RequestPipeline,
    StreamItemHandler,
};
pub use protocol::{
    CipherEnvelope,
    ProtocolEventHandler,
    ProtocolSystem,
    ProtocolSystemFactory,
    DEFAULT_ONE_TIME_PREKEYS,
};
pub use recovery::{
    OutageState,
    RecoveryClass,
    RecoveryDriver,
    OUTAGE_WAIT_CEILING,
    RECOVERY_THROTTLE,
};
pub use retry::{
    ExponentialRetryStrategy,
    RetryOperation,
    RetryStrategy,
};
pub use runtime::SessionRuntime;
pub use session::{
    Channel,
    ChannelLifecycle,
    SessionManager,
};
pub use storage::{
    ApplicationSecureStorage,
    InMemorySecureStorage,
    MetadataProvider,
    NullMetadataProvider,
    SecureStateStorage,
};
pub use transport::{
    RestoreOutcome,
    RpcFlow,
    RpcTransport,
};
