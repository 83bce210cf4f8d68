//! # busrpc
//!
//! RPC over any publish/subscribe bus. Clients publish requests on
//! well-known channels, any number of servers race to claim them, and the
//! client picks exactly one winner, weighted by each server's affinity for
//! the request. Responses and stream frames come back on per-client
//! channels.
//!
//! ## Quick Start
//!
//! ```rust
//! use busrpc::prelude::*;
//! use std::sync::Arc;
//!
//! #[derive(Debug, serde::Serialize, serde::Deserialize)]
//! struct Greeting(String);
//!
//! impl Message for Greeting {
//!     const TYPE_NAME: &'static str = "hello.Greeting";
//! }
//!
//! fn service(id: String) -> ServiceDefinition {
//!     ServiceDefinition::new("Hello", id).with_method("Greet", false, false, true)
//! }
//!
//! #[tokio::main]
//! async fn main() -> RpcResult<()> {
//!     let bus = InMemoryBus::new();
//!     let ids = Arc::new(IdGenerator::new());
//!
//!     let server = RpcServer::new(service(ids.server_id()), Arc::new(bus.clone()), ServerConfig::default(), ids.clone());
//!     server
//!         .register_handler(
//!             "Greet",
//!             &[],
//!             |g: Greeting| async move { Ok::<_, RpcError>(Greeting(format!("hello, {}", g.0))) },
//!             None,
//!         )
//!         .await?;
//!
//!     let client = RpcClient::new(service(String::new()), ids.client_id(), Arc::new(bus), ClientConfig::default(), ids).await?;
//!     let reply: Greeting = client
//!         .request_single("Greet", &[], &Greeting("bus".into()), RequestOptions::new())
//!         .await?;
//!     assert_eq!(reply.0, "hello, bus");
//!
//!     client.close().await;
//!     server.close(false).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`busrpc_core`] - bus contract, channel naming, codec, wire envelopes,
//!   identifiers, configuration and the stream transport
//! - [`busrpc_server`] - handler registry, claim protocol, unary and stream
//!   handlers
//! - [`busrpc_client`] - calls, server selection, client streams
//!
//! ## Channels
//!
//! | Channel | Carries |
//! |---------|---------|
//! | `{service}\|{method}\|{topic..}\|REQ` | requests, server notifications |
//! | `{service}\|{method}\|{topic..}\|RCLAIM` | claim verdicts |
//! | `{service}\|{method}\|{topic..}\|STR` | client to server stream frames |
//! | `{service}\|{client}\|RES` | responses |
//! | `{service}\|{client}\|CLAIM` | claims addressed to a client |
//! | `{service}\|{client}\|STR` | server to client stream frames |

pub use busrpc_client as client;
pub use busrpc_core as core;
pub use busrpc_server as server;

/// Prelude module for convenient imports.
///
/// ```rust
/// use busrpc::prelude::*;
/// ```
pub mod prelude {
    pub use busrpc_core::prelude::*;

    pub use busrpc_client::{MultiResponse, Notifications, RpcClient};
    pub use busrpc_server::{AffinityFn, RpcServer, StreamAffinityFn};
}
