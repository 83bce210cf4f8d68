//! # busrpc core
//!
//! Building blocks shared by the busrpc server and client: the message bus
//! contract, channel naming, wire envelopes and their codec, identifiers,
//! configuration and the ack-gated stream transport.
//!
//! Nothing in this crate spawns tasks; the server and client crates drive
//! these pieces from their own run loops.

pub mod bus;
pub mod channel;
pub mod codec;
pub mod config;
pub mod drain;
pub mod error;
pub mod ids;
pub mod info;
pub mod prelude;
pub mod stream;
pub mod time;
pub mod wire;

pub use bus::{InMemoryBus, MessageBus, RawSubscription, Subscription};
pub use codec::{AnyPayload, DynMessage, Message, TypeRegistry};
pub use config::{ClientConfig, RequestOptions, SelectionConfig, ServerConfig};
pub use drain::{ActivityCounter, ActivityGuard};
pub use error::{ErrorCode, RpcError, RpcResult};
pub use ids::IdGenerator;
pub use info::{MethodInfo, RequestInfo, ServiceDefinition};
pub use stream::{Stream, StreamAdapter, StreamCore};
