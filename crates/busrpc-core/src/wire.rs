//! Envelopes exchanged between clients and servers.
//!
//! Timestamps and expiries are nanoseconds since the Unix epoch.

use crate::codec::{AnyPayload, Message, TypeRegistry};
use crate::error::{ErrorCode, RpcError};
use serde::{Deserialize, Serialize};

/// Error as it travels on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireError {
    pub code: ErrorCode,
    pub message: String,
}

impl From<&RpcError> for WireError {
    fn from(err: &RpcError) -> Self {
        let message = match err {
            RpcError::Status { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self {
            code: err.code(),
            message,
        }
    }
}

impl From<WireError> for RpcError {
    fn from(err: WireError) -> Self {
        RpcError::Status {
            code: err.code,
            message: err.message,
        }
    }
}

/// A unary (or fan-out) call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub request_id: String,
    pub client_id: String,
    pub sent_at: i64,
    pub expiry: i64,
    pub multi: bool,
    pub raw_request: Vec<u8>,
    pub request: Option<AnyPayload>,
}

impl Message for Request {
    const TYPE_NAME: &'static str = "busrpc.Request";
}

/// Answer to a [`Request`], addressed to the calling client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_id: String,
    pub server_id: String,
    pub sent_at: i64,
    pub raw_response: Vec<u8>,
    pub response: Option<AnyPayload>,
    pub error: Option<WireError>,
}

impl Message for Response {
    const TYPE_NAME: &'static str = "busrpc.Response";
}

/// A server's bid to execute a request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClaimRequest {
    pub request_id: String,
    pub server_id: String,
    pub affinity: f32,
}

impl Message for ClaimRequest {
    const TYPE_NAME: &'static str = "busrpc.ClaimRequest";
}

/// The selector's verdict, broadcast to every claimant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub request_id: String,
    pub server_id: String,
}

impl Message for ClaimResponse {
    const TYPE_NAME: &'static str = "busrpc.ClaimResponse";
}

/// Opens a stream; `node_id` names the namespace the opener listens on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamOpen {
    pub node_id: String,
}

/// One data frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamMessage {
    pub raw_message: Vec<u8>,
    pub message: Option<AnyPayload>,
}

/// Terminates a stream, optionally with the cause.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamClose {
    pub error: Option<WireError>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum StreamBody {
    Open(StreamOpen),
    Message(StreamMessage),
    Ack,
    Close(StreamClose),
}

/// Frame of a multiplexed stream. `request_id` correlates an open with its
/// ack and a data frame with its ack.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamEnvelope {
    pub stream_id: String,
    pub request_id: String,
    pub sent_at: i64,
    pub expiry: i64,
    pub body: StreamBody,
}

impl Message for StreamEnvelope {
    const TYPE_NAME: &'static str = "busrpc.StreamEnvelope";
}

impl StreamEnvelope {
    /// The open payload, if this is an open frame.
    pub fn open(&self) -> Option<&StreamOpen> {
        match &self.body {
            StreamBody::Open(open) => Some(open),
            _ => None,
        }
    }

    /// Whether this frame acknowledges another.
    pub fn is_ack(&self) -> bool {
        matches!(self.body, StreamBody::Ack)
    }
}

/// Registry preloaded with every envelope type above.
pub fn protocol_registry() -> TypeRegistry {
    let mut registry = TypeRegistry::new();
    registry
        .register::<Request>()
        .register::<Response>()
        .register::<ClaimRequest>()
        .register::<ClaimResponse>()
        .register::<StreamEnvelope>();
    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::serialize;

    #[test]
    fn test_wire_error_keeps_status_message() {
        let err = RpcError::new(ErrorCode::NotFound, "missing");
        let wire = WireError::from(&err);
        assert_eq!(wire.message, "missing");
        assert_eq!(RpcError::from(wire), err);
    }

    #[test]
    fn test_wire_error_from_builtin() {
        let wire = WireError::from(&RpcError::Canceled);
        assert_eq!(wire.code, ErrorCode::Canceled);
        assert_eq!(wire.message, "canceled");
    }

    #[test]
    fn test_protocol_registry_decodes_envelopes() {
        let registry = protocol_registry();
        assert_eq!(registry.len(), 5);

        let claim = ClaimResponse {
            request_id: "REQ_abcdefghijkl".into(),
            server_id: "SRV_abcdefghijkl".into(),
        };
        let decoded = registry.deserialize(&serialize(&claim).unwrap()).unwrap();
        assert_eq!(decoded.downcast_ref::<ClaimResponse>(), Some(&claim));
    }
}
