//! Envelopes travelling over the in-memory bus on the channels a call uses.

use busrpc_core::bus::{publish, subscribe};
use busrpc_core::channel;
use busrpc_core::codec::{self, downcast};
use busrpc_core::prelude::*;
use busrpc_core::time::expiry_after;
use busrpc_core::wire::{
    protocol_registry, ClaimRequest, Request, Response, StreamBody, StreamEnvelope, StreamOpen,
    WireError,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Join {
    room: String,
}

impl Message for Join {
    const TYPE_NAME: &'static str = "rooms.Join";
}

#[test]
fn test_request_info_channels() {
    let sd = ServiceDefinition::new("Rooms", "SRV_1").with_method("Join", true, false, false);
    let info = sd.get_info("Join", &topic(&["eu-west", "", "lobby"]));

    assert_eq!(info.rpc_channel(), "Rooms|Join|euu+002dwest|lobby|REQ");
    assert_eq!(info.claim_response_channel(), "Rooms|Join|euu+002dwest|lobby|RCLAIM");
    assert_eq!(info.stream_server_channel(), "Rooms|Join|euu+002dwest|lobby|STR");
    assert_eq!(channel::response_channel("Rooms", "CLI_1"), "Rooms|CLI_1|RES");
    assert_eq!(channel::claim_request_channel("Rooms", "CLI_1"), "Rooms|CLI_1|CLAIM");
}

#[tokio::test]
async fn test_request_reaches_rpc_channel_subscriber() {
    let bus = InMemoryBus::new();
    let sd = ServiceDefinition::new("Rooms", "SRV_1").with_method("Join", false, false, true);
    let info = sd.get_info("Join", &[]);
    let mut requests = subscribe::<Request>(&bus, &info.rpc_channel(), 4).await.unwrap();

    let (raw, _) = codec::serialize_payload(&Join { room: "a".into() }).unwrap();
    let req = Request {
        request_id: "REQ_1".into(),
        client_id: "CLI_1".into(),
        sent_at: 0,
        expiry: expiry_after(Duration::from_secs(1)),
        multi: false,
        raw_request: raw,
        request: None,
    };
    publish(&bus, &info.rpc_channel(), &req).await.unwrap();

    let got = requests.recv().await.unwrap();
    assert_eq!(got, req);
    let join: Join = codec::deserialize_payload(&got.raw_request, got.request.as_ref()).unwrap();
    assert_eq!(join.room, "a");
}

#[tokio::test]
async fn test_registry_decodes_mixed_feed() {
    let bus = InMemoryBus::new();
    let mut raw = bus.subscribe("mixed", 8).await.unwrap();
    let registry = protocol_registry();

    let claim = ClaimRequest {
        request_id: "REQ_1".into(),
        server_id: "SRV_1".into(),
        affinity: 0.5,
    };
    let open = StreamEnvelope {
        stream_id: "STR_1".into(),
        request_id: "REQ_2".into(),
        sent_at: 0,
        expiry: 0,
        body: StreamBody::Open(StreamOpen {
            node_id: "CLI_1".into(),
        }),
    };
    publish(&bus, "mixed", &claim).await.unwrap();
    publish(&bus, "mixed", &open).await.unwrap();
    publish(&bus, "mixed", &Join { room: "x".into() }).await.unwrap();

    let first = registry.deserialize(&raw.recv().await.unwrap()).unwrap();
    assert_eq!(first.type_name(), "busrpc.ClaimRequest");
    assert_eq!(downcast::<ClaimRequest>(first), Some(claim));

    let second = registry.deserialize(&raw.recv().await.unwrap()).unwrap();
    let envelope = second.downcast_ref::<StreamEnvelope>().unwrap();
    assert_eq!(envelope.open().map(|o| o.node_id.as_str()), Some("CLI_1"));

    let third = raw.recv().await.unwrap();
    assert!(registry.deserialize(&third).is_err());
}

#[test]
fn test_remote_error_keeps_code_and_message() {
    let local = RpcError::new(ErrorCode::NotFound, "no such room");
    let res = Response {
        request_id: "REQ_1".into(),
        server_id: "SRV_1".into(),
        sent_at: 0,
        raw_response: Vec::new(),
        response: None,
        error: Some(WireError::from(&local)),
    };
    let bytes = codec::serialize(&res).unwrap();
    let back: Response = codec::deserialize_as(&bytes).unwrap();

    let remote: RpcError = back.error.unwrap().into();
    assert_eq!(remote.code(), ErrorCode::NotFound);
    assert_eq!(remote, local);

    let timeout: RpcError = WireError::from(&RpcError::RequestTimeout).into();
    assert_eq!(timeout.code(), ErrorCode::DeadlineExceeded);
}
