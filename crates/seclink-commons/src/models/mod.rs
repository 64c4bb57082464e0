pub mod channel_state;
pub mod connect_id;
pub mod events;
pub mod health;
pub mod service;

pub use channel_state::ChannelState;
pub use connect_id::{
    logical_operation_id,
    AppInstance,
    ConnectId,
    ExchangeType,
};
pub use events::{
    EventBus,
    NetworkEvent,
    SystemState,
};
pub use health::{
    ConnectionHealth,
    HealthStatus,
};
pub use service::{
    FlowType,
    RequestMetadata,
    ServiceRequest,
    ServiceType,
};
