use std::fmt;

use serde::{
    Deserialize,
    Serialize,
};

/// Wire-level service catalog consumed by the data-center peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServiceType {
    EstablishSecrecyChannel,
    RestoreSecrecyChannel,
    RegisterAppDevice,
    InitiateVerification,
    ValidatePhoneNumber,
    VerifyOtp,
    OpaqueRegistrationInit,
    OpaqueRegistrationComplete,
    OpaqueSignInInit,
    OpaqueSignInComplete,
}

impl ServiceType {
    pub const fn wire_name(&self) -> &'static str {
        match self {
            ServiceType::EstablishSecrecyChannel => "EstablishSecrecyChannel",
            ServiceType::RestoreSecrecyChannel => "RestoreSecrecyChannel",
            ServiceType::RegisterAppDevice => "RegisterAppDevice",
            ServiceType::InitiateVerification => "InitiateVerification",
            ServiceType::ValidatePhoneNumber => "ValidatePhoneNumber",
            ServiceType::VerifyOtp => "VerifyOtp",
            ServiceType::OpaqueRegistrationInit => "OpaqueRegistrationInit",
            ServiceType::OpaqueRegistrationComplete => "OpaqueRegistrationComplete",
            ServiceType::OpaqueSignInInit => "OpaqueSignInInit",
            ServiceType::OpaqueSignInComplete => "OpaqueSignInComplete",
        }
    }

    /// Services allowed to run while the system is recovering.
    pub const fn is_recovery(&self) -> bool {
        matches!(
            self,
            ServiceType::EstablishSecrecyChannel
                | ServiceType::RestoreSecrecyChannel
                | ServiceType::RegisterAppDevice
        )
    }

    /// User-initiated services, gated off while an outage is active.
    pub const fn is_user_initiated(&self) -> bool {
        !self.is_recovery()
    }

    /// Services where concurrent identical payloads are expected and the
    /// duplicate suppression is skipped by default.
    pub const fn allows_duplicates(&self) -> bool {
        matches!(
            self,
            ServiceType::InitiateVerification | ServiceType::ValidatePhoneNumber
        )
    }

    /// Authentication steps collapse to a fixed request key per service so
    /// retries of the same auth step never race each other.
    pub const fn is_auth_operation(&self) -> bool {
        matches!(
            self,
            ServiceType::OpaqueSignInInit | ServiceType::OpaqueSignInComplete
        )
    }

    /// Attempt budget handed to the retry strategy. Channel establishment
    /// gets a larger budget than regular traffic.
    pub const fn max_attempts(&self) -> u32 {
        match self {
            ServiceType::EstablishSecrecyChannel => 15,
            _ => 10,
        }
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// Shape of the RPC exchange a request expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FlowType {
    SingleCall,
    ReceiveStream,
    SendStream,
    BidirectionalStream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub key: String,
    pub value: String,
}

/// One encrypted frame handed to the RPC transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceRequest {
    pub req_id: u32,
    pub flow_type: FlowType,
    pub service_type: ServiceType,
    pub cipher_payload: Vec<u8>,
    #[serde(default)]
    pub metadata: Vec<RequestMetadata>,
}

impl ServiceRequest {
    pub fn new(
        req_id: u32, flow_type: FlowType, service_type: ServiceType, cipher_payload: Vec<u8>,
    ) -> Self {
        Self {
            req_id,
            flow_type,
            service_type,
            cipher_payload,
            metadata: Vec::new(),
        }
    }
}
